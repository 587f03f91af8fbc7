//! User settings persisted next to the engine's caches.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::registry::ProgramKind;

/// Mutable, user-chosen settings.
///
/// An unreadable or corrupt file yields the defaults; the next save
/// overwrites it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Data directories chosen by the user, replacing the registry defaults.
    #[serde(default)]
    pub custom_data_paths: HashMap<ProgramKind, PathBuf>,
}

impl Settings {
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) if !content.trim().is_empty() => {
                serde_json::from_str(&content).unwrap_or_else(|e| {
                    log::warn!("Ignoring corrupt settings file {:?}: {}", path, e);
                    Self::default()
                })
            }
            _ => Self::default(),
        }
    }

    /// Atomic write via a temp file.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp_path, path)
    }

    pub fn data_path(&self, kind: ProgramKind) -> Option<&Path> {
        self.custom_data_paths.get(&kind).map(PathBuf::as_path)
    }
}
