//! Configuration reconciliation.
//!
//! Each reconciler loads a program's local config, applies an ordered set of
//! rules on a copy, and writes only when the canonical serialized form
//! changed. Returns `Ok(true)` when a file was rewritten.
//!
//! - `node`: `blocknet.conf`, publishes the node's RPC credentials
//! - `trading_desk`: `xbridge.conf` and `app-meta.json`
//! - `wallet`: the wallet's per-coin daemon configs

pub mod node;
pub mod trading_desk;
pub mod wallet;

pub use node::NodeReconciler;
pub use trading_desk::{TradingDeskChanges, TradingDeskReconciler};
pub use wallet::WalletReconciler;

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use fs4::fs_std::FileExt;
use rand::{distributions::Alphanumeric, Rng};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::conf::template::TemplateError;
use crate::conf::{ConfValue, ConfigDocument, Section};
use crate::defaults;

/// Errors that abort one reconciliation pass. Local files are untouched.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Node RPC credentials are not known yet")]
    MissingNodeCredentials,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

/// RPC credentials of one program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    pub port: String,
}

/// Slot the node reconciler publishes to and its consumers read from.
pub type SharedCredentials = Arc<RwLock<Option<Credentials>>>;

pub fn read_credentials(slot: &SharedCredentials) -> Option<Credentials> {
    slot.read().unwrap_or_else(|e| e.into_inner()).clone()
}

pub fn publish_credentials(slot: &SharedCredentials, credentials: Credentials) {
    *slot.write().unwrap_or_else(|e| e.into_inner()) = Some(credentials);
}

pub fn clear_credentials(slot: &SharedCredentials) {
    *slot.write().unwrap_or_else(|e| e.into_inner()) = None;
}

/// Keys generated locally and never taken from a template.
pub const CREDENTIAL_KEYS: &[&str] = &["rpcuser", "rpcpassword"];

/// Keys pinned to the loopback address.
pub const LOOPBACK_KEYS: &[&str] = &["rpcbind", "rpcallowip"];

/// Random alphanumeric credential.
pub fn generate_credential() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(defaults::CREDENTIAL_LEN)
        .map(char::from)
        .collect()
}

fn is_floor_key(key: &str) -> bool {
    defaults::RPC_FLOORS.iter().any(|(k, _)| *k == key)
}

/// Create every template section missing locally.
pub fn ensure_sections(local: &mut ConfigDocument, template: &ConfigDocument) {
    for name in template.section_names() {
        local.section_mut(name);
    }
}

/// Fill absent or empty credential keys; existing values are kept.
pub fn ensure_credentials(section: &mut Section) {
    for key in CREDENTIAL_KEYS {
        let present = section.get_str(key).is_some_and(|v| !v.is_empty());
        if !present {
            section.set(key, generate_credential());
        }
    }
}

/// Copy template values into `local`.
///
/// Credential keys are skipped, loopback keys are pinned, floor keys already
/// present locally are left for [`raise_floors`], and multi-valued keys are
/// merged.
pub fn apply_template_section(local: &mut Section, template: &Section) {
    for (key, value) in template.iter() {
        if CREDENTIAL_KEYS.contains(&key) {
            continue;
        }
        if LOOPBACK_KEYS.contains(&key) {
            local.set(key, defaults::LOOPBACK);
            continue;
        }
        if is_floor_key(key) && local.contains_key(key) {
            continue;
        }
        match value {
            ConfValue::Multi(values) => {
                for v in values {
                    local.push_unique(key, v);
                }
            }
            ConfValue::Single(v) => {
                if local.get_str(key) != Some(v.as_str()) {
                    local.set(key, v.clone());
                }
            }
        }
    }
}

/// Apply every template section to the matching local section.
pub fn apply_template(local: &mut ConfigDocument, template: &ConfigDocument) {
    ensure_sections(local, template);
    for (name, section) in template.sections() {
        apply_template_section(local.section_mut(name), section);
    }
}

/// Pin loopback keys that exist locally, whatever their origin.
pub fn pin_loopback(section: &mut Section) {
    for key in LOOPBACK_KEYS {
        if section.contains_key(key) {
            section.set(key, defaults::LOOPBACK);
        }
    }
}

/// Raise RPC tuning keys to their minimums. Higher values are kept.
pub fn raise_floors(section: &mut Section) {
    for (key, floor) in defaults::RPC_FLOORS {
        let current = section.get_str(key).and_then(|v| v.trim().parse::<u64>().ok());
        match current {
            Some(value) if value >= *floor => {}
            _ => section.set(key, floor.to_string()),
        }
    }
}

/// Add the required peers to `addnode`, skipping ones already listed.
pub fn merge_seeds(section: &mut Section, seeds: &[String]) {
    for seed in seeds {
        section.push_unique("addnode", seed);
    }
}

/// Load an INI document; missing or unreadable files yield an empty one.
pub fn load_document(path: &Path) -> ConfigDocument {
    match ConfigDocument::load(path) {
        Ok(doc) => doc,
        Err(e) if e.kind() == io::ErrorKind::NotFound => ConfigDocument::new(),
        Err(e) => {
            log::warn!("Treating unreadable {:?} as empty: {}", path, e);
            ConfigDocument::new()
        }
    }
}

/// Load a JSON object; missing, corrupt or non-object files yield `None`.
pub fn load_json_object(path: &Path) -> Option<Map<String, Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            log::warn!("Treating unreadable {:?} as empty: {}", path, e);
            return None;
        }
    };
    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) | Err(_) => {
            log::warn!("Treating corrupt {:?} as empty", path);
            None
        }
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.lock", name))
}

/// Replace `path` with `after` unless it equals `before`.
///
/// Both arguments are canonical serialized forms. The write goes through a
/// temp file under an exclusive lock on a sidecar lock file.
pub fn write_if_changed(path: &Path, before: &str, after: &str) -> io::Result<bool> {
    if before == after && path.exists() {
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path(path))?;
    lock_file.lock_exclusive()?;

    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(after.as_bytes())?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;

    log::info!("Updated {:?}", path);
    Ok(true)
}

/// Canonical form of a JSON object file, or empty when there is none.
pub fn json_canonical(map: Option<&Map<String, Value>>) -> Result<String> {
    match map {
        Some(map) => Ok(serde_json::to_string_pretty(map)?),
        None => Ok(String::new()),
    }
}

/// A JSON string or number as text.
pub fn json_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
