//! `xbridge.conf` and `app-meta.json` reconciliation.
//!
//! The `[BLOCK]` section and `app-meta.json` always carry the node's own RPC
//! credentials. Every other coin section is built from that coin's XBridge
//! template and filled with the credentials of its wallet daemon config.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::conf::template::{Manifest, TemplateCache, TemplateKind};
use crate::conf::{ConfigDocument, Section, GLOBAL};
use crate::defaults;
use crate::reconcile::wallet::{self, DaemonRpc};
use crate::reconcile::{
    apply_template, apply_template_section, json_canonical, load_document, load_json_object,
    read_credentials, write_if_changed, Credentials, ReconcileError, Result, SharedCredentials,
};
use crate::registry::{Registry, NODE_TICKER};

pub const XBRIDGE_CONF: &str = "xbridge.conf";
pub const APP_META: &str = "app-meta.json";
const MAIN_SECTION: &str = "Main";

/// Which of the two files a pass rewrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TradingDeskChanges {
    pub xbridge: bool,
    pub app_meta: bool,
}

impl TradingDeskChanges {
    pub fn any(&self) -> bool {
        self.xbridge || self.app_meta
    }
}

/// A coin ready to be written into `xbridge.conf`.
struct CoinSection {
    ticker: String,
    template: Section,
    rpc: DaemonRpc,
}

pub struct TradingDeskReconciler {
    xbridge_path: PathBuf,
    app_meta_path: PathBuf,
    wallet_settings_dir: PathBuf,
    template: TemplateKind,
    credentials: SharedCredentials,
}

impl TradingDeskReconciler {
    pub fn new(
        registry: &Registry,
        node_data_dir: &Path,
        trading_desk_data_dir: &Path,
        wallet_data_dir: &Path,
        credentials: SharedCredentials,
    ) -> Self {
        Self {
            xbridge_path: node_data_dir.join(XBRIDGE_CONF),
            app_meta_path: trading_desk_data_dir.join(APP_META),
            wallet_settings_dir: wallet::settings_dir(wallet_data_dir),
            template: TemplateKind::XBridge(registry.node_template_file.clone()),
            credentials,
        }
    }

    pub fn xbridge_path(&self) -> &Path {
        &self.xbridge_path
    }

    pub fn app_meta_path(&self) -> &Path {
        &self.app_meta_path
    }

    pub async fn reconcile(&self, templates: &TemplateCache) -> Result<TradingDeskChanges> {
        let node =
            read_credentials(&self.credentials).ok_or(ReconcileError::MissingNodeCredentials)?;
        let base = templates.get_template(&self.template).await?;
        let coins = self.resolve_coins(templates).await;

        let xbridge = self.reconcile_xbridge(&base, &node, &coins)?;
        let app_meta = self.reconcile_app_meta(&node)?;

        Ok(TradingDeskChanges { xbridge, app_meta })
    }

    /// Gather template and credentials for every wallet coin except the node's.
    ///
    /// Coins whose manifest entry or template is unavailable are skipped and
    /// their existing sections left as they are.
    async fn resolve_coins(&self, templates: &TemplateCache) -> Vec<CoinSection> {
        let tickers: Vec<String> = wallet::list_tickers(&self.wallet_settings_dir)
            .into_iter()
            .filter(|t| !t.eq_ignore_ascii_case(NODE_TICKER))
            .collect();
        if tickers.is_empty() {
            return Vec::new();
        }

        let manifest = match templates.get_manifest().await {
            Ok(manifest) => manifest,
            Err(e) => {
                log::warn!("Manifest unavailable, skipping wallet coins: {}", e);
                return Vec::new();
            }
        };

        let mut coins = Vec::new();
        for ticker in tickers {
            match self.resolve_coin(templates, &manifest, &ticker).await {
                Some(coin) => coins.push(coin),
                None => log::warn!("Skipping {} in {}; will retry", ticker, XBRIDGE_CONF),
            }
        }
        coins
    }

    async fn resolve_coin(
        &self,
        templates: &TemplateCache,
        manifest: &Manifest,
        ticker: &str,
    ) -> Option<CoinSection> {
        let mut rpc = wallet::read_daemon_rpc(&self.wallet_settings_dir, ticker)?;
        let entry = manifest.latest_for(ticker)?;

        let doc = match templates
            .get_template(&TemplateKind::XBridge(entry.xbridge_conf.clone()))
            .await
        {
            Ok(doc) => doc,
            Err(e) => {
                log::warn!("No XBridge template for {}: {}", ticker, e);
                return None;
            }
        };
        let template = doc
            .section(ticker)
            .or_else(|| doc.sections().find(|(n, _)| *n != GLOBAL).map(|(_, s)| s))
            .cloned()
            .unwrap_or_default();

        if rpc.port.is_none() {
            rpc.port = wallet::template_rpc_port(templates, manifest, ticker).await;
        }

        Some(CoinSection {
            ticker: ticker.to_string(),
            template,
            rpc,
        })
    }

    fn reconcile_xbridge(
        &self,
        base: &ConfigDocument,
        node: &Credentials,
        coins: &[CoinSection],
    ) -> Result<bool> {
        let local = load_document(&self.xbridge_path);
        let mut candidate = local.clone();

        apply_template(&mut candidate, base);

        set_rpc(
            candidate.section_mut(NODE_TICKER),
            Some(node.user.as_str()),
            Some(node.password.as_str()),
            Some(node.port.as_str()),
        );

        for coin in coins {
            let section = candidate.section_mut(&coin.ticker);
            apply_template_section(section, &coin.template);
            set_rpc(
                section,
                coin.rpc.user.as_deref(),
                coin.rpc.password.as_deref(),
                coin.rpc.port.as_deref(),
            );
        }

        let wallets = candidate
            .section_names()
            .filter(|n| *n != GLOBAL && *n != MAIN_SECTION)
            .collect::<Vec<_>>()
            .join(",");
        candidate.set(MAIN_SECTION, "ExchangeWallets", wallets);

        Ok(write_if_changed(
            &self.xbridge_path,
            &local.serialize(),
            &candidate.serialize(),
        )?)
    }

    fn reconcile_app_meta(&self, node: &Credentials) -> Result<bool> {
        let local = load_json_object(&self.app_meta_path);
        let mut candidate = local.clone().unwrap_or_default();

        candidate.insert("user".into(), Value::String(node.user.clone()));
        candidate.insert("password".into(), Value::String(node.password.clone()));
        candidate.insert("port".into(), Value::String(node.port.clone()));

        let before = json_canonical(local.as_ref())?;
        let after = json_canonical(Some(&candidate))?;
        Ok(write_if_changed(&self.app_meta_path, &before, &after)?)
    }
}

fn set_rpc(section: &mut Section, user: Option<&str>, password: Option<&str>, port: Option<&str>) {
    section.set("Ip", defaults::LOOPBACK);
    if let Some(user) = user {
        section.set("Username", user);
    }
    if let Some(password) = password {
        section.set("Password", password);
    }
    if let Some(port) = port {
        section.set("Port", port);
    }
}
