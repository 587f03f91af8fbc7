//! Wallet daemon config normalization.
//!
//! The wallet keeps one JSON file per coin under `settings/`, named
//! `config-<TICKER>.json`. Each must have RPC enabled, credentials, and a port.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::conf::template::{Manifest, TemplateCache, TemplateKind};
use crate::reconcile::{
    generate_credential, json_canonical, json_text, load_json_object, write_if_changed, Result,
};

const CONFIG_PREFIX: &str = "config-";
const CONFIG_SUFFIX: &str = ".json";
/// The wallet's own master settings file, not a coin.
const MASTER_CONFIG: &str = "master";

/// Directory holding the daemon configs inside a wallet data dir.
pub fn settings_dir(wallet_data_dir: &Path) -> PathBuf {
    wallet_data_dir.join("settings")
}

pub fn daemon_config_path(settings_dir: &Path, ticker: &str) -> PathBuf {
    settings_dir.join(format!("{}{}{}", CONFIG_PREFIX, ticker, CONFIG_SUFFIX))
}

/// Tickers that have a daemon config, sorted.
pub fn list_tickers(settings_dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(settings_dir) else {
        return Vec::new();
    };

    let mut tickers: Vec<String> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let ticker = name
                .strip_prefix(CONFIG_PREFIX)?
                .strip_suffix(CONFIG_SUFFIX)?
                .to_string();
            (!ticker.is_empty() && ticker != MASTER_CONFIG).then_some(ticker)
        })
        .collect();
    tickers.sort();
    tickers
}

/// RPC settings read from one daemon config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonRpc {
    pub user: Option<String>,
    pub password: Option<String>,
    pub port: Option<String>,
}

impl DaemonRpc {
    pub fn from_config(config: &Map<String, Value>) -> Self {
        Self {
            user: json_text(config.get("rpcUsername")),
            password: json_text(config.get("rpcPassword")),
            port: json_text(config.get("rpcPort")),
        }
    }
}

/// Read a coin's daemon config, if it exists and parses.
pub fn read_daemon_rpc(settings_dir: &Path, ticker: &str) -> Option<DaemonRpc> {
    load_json_object(&daemon_config_path(settings_dir, ticker)).map(|c| DaemonRpc::from_config(&c))
}

/// The `rpcport` a coin's wallet template declares.
pub async fn template_rpc_port(
    templates: &TemplateCache,
    manifest: &Manifest,
    ticker: &str,
) -> Option<String> {
    let entry = manifest.latest_for(ticker)?;
    if entry.wallet_conf.is_empty() {
        return None;
    }
    match templates
        .get_template(&TemplateKind::Wallet(entry.wallet_conf.clone()))
        .await
    {
        Ok(doc) => doc.get("global", "rpcport").map(str::to_string),
        Err(e) => {
            log::warn!("No wallet template for {}: {}", ticker, e);
            None
        }
    }
}

/// Normalizes every daemon config in a wallet data dir.
pub struct WalletReconciler {
    settings_dir: PathBuf,
}

impl WalletReconciler {
    pub fn new(wallet_data_dir: &Path) -> Self {
        Self {
            settings_dir: settings_dir(wallet_data_dir),
        }
    }

    pub fn settings_dir(&self) -> &Path {
        &self.settings_dir
    }

    pub async fn reconcile(&self, templates: &TemplateCache) -> Result<bool> {
        let tickers = list_tickers(&self.settings_dir);
        if tickers.is_empty() {
            log::debug!("No wallet daemon configs in {:?}", self.settings_dir);
            return Ok(false);
        }

        let mut manifest: Option<Manifest> = None;
        let mut changed = false;

        for ticker in tickers {
            let path = daemon_config_path(&self.settings_dir, &ticker);
            let local = load_json_object(&path);
            let mut candidate = local.clone().unwrap_or_default();

            candidate.insert("rpcEnabled".into(), Value::Bool(true));
            for key in ["rpcUsername", "rpcPassword"] {
                if json_text(candidate.get(key)).is_none() {
                    candidate.insert(key.into(), Value::String(generate_credential()));
                }
            }

            if json_text(candidate.get("rpcPort")).is_none() {
                if manifest.is_none() {
                    match templates.get_manifest().await {
                        Ok(m) => manifest = Some(m),
                        Err(e) => log::warn!("Manifest unavailable: {}", e),
                    }
                }
                let port = match &manifest {
                    Some(m) => template_rpc_port(templates, m, &ticker).await,
                    None => None,
                };
                match port.and_then(|p| p.parse::<u64>().ok()) {
                    Some(port) => {
                        candidate.insert("rpcPort".into(), Value::from(port));
                    }
                    None => log::warn!("No RPC port known for {}; will retry", ticker),
                }
            }

            let before = json_canonical(local.as_ref())?;
            let after = json_canonical(Some(&candidate))?;
            changed |= write_if_changed(&path, &before, &after)?;
        }

        Ok(changed)
    }
}
