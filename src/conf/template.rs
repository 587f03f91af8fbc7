//! Remote configuration templates and the coin manifest.
//!
//! Templates are read from the on-disk cache when present and usable; only a
//! miss (or an unusable cache file) goes to the network. A successful fetch is
//! written back to the cache so later runs stay offline.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conf::ConfigDocument;
use crate::defaults;
use crate::registry::Registry;
use crate::retry::RetryPolicy;

const MANIFEST_CACHE_FILE: &str = "manifest-latest.json";

/// Errors from template and manifest lookups.
///
/// All of them are transient from the engine's point of view: the caller
/// skips the current reconciliation and tries again later.
#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Template {what} unavailable: {reason}")]
    Unavailable { what: String, reason: String },

    #[error("No manifest entry for ticker {0}")]
    UnknownTicker(String),

    #[error("Unsafe template file name: {0:?}")]
    UnsafeName(String),
}

pub type Result<T> = std::result::Result<T, TemplateError>;

/// Which remote template to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TemplateKind {
    /// Node-level wallet conf (`wallet-confs/<file>`)
    Wallet(String),
    /// Per-coin XBridge conf (`xbridge-confs/<file>`)
    XBridge(String),
}

impl TemplateKind {
    fn file_name(&self) -> &str {
        match self {
            Self::Wallet(file) | Self::XBridge(file) => file,
        }
    }

    /// Manifest-supplied names must stay a single component under the cache.
    fn check_file_name(&self) -> Result<()> {
        let name = self.file_name();
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return Err(TemplateError::UnsafeName(name.to_string()));
        }
        Ok(())
    }

    fn remote_path(&self) -> String {
        match self {
            Self::Wallet(file) => format!("wallet-confs/{}", file),
            Self::XBridge(file) => format!("xbridge-confs/{}", file),
        }
    }
}

impl std::fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.remote_path())
    }
}

/// One manifest row: a ticker and the config files for one of its versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub ticker: String,
    /// Version identifier such as `litecoin--v0.18.1`.
    pub ver_id: String,
    #[serde(default)]
    pub blockchain: String,
    #[serde(default)]
    pub conf_name: String,
    #[serde(default)]
    pub xbridge_conf: String,
    #[serde(default)]
    pub wallet_conf: String,
}

impl ManifestEntry {
    /// Numeric components of the version part of `ver_id`.
    pub fn version_key(&self) -> Vec<u64> {
        let version = self
            .ver_id
            .rsplit("--")
            .next()
            .unwrap_or(&self.ver_id)
            .trim_start_matches(['v', 'V']);

        version
            .split(['.', '-'])
            .map(|part| {
                let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().unwrap_or(0)
            })
            .collect()
    }
}

/// The coin registry: ticker → versioned config filenames.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// The highest-versioned entry for a ticker (case-insensitive).
    pub fn latest_for(&self, ticker: &str) -> Option<&ManifestEntry> {
        self.entries
            .iter()
            .filter(|e| e.ticker.eq_ignore_ascii_case(ticker))
            .max_by(|a, b| compare_versions(&a.version_key(), &b.version_key()))
    }
}

fn compare_versions(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let (x, y) = (a.get(i).copied().unwrap_or(0), b.get(i).copied().unwrap_or(0));
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Cache-first access to remote templates and the manifest.
pub struct TemplateCache {
    client: Client,
    base_url: String,
    manifest_url: String,
    cache_dir: PathBuf,
    retry: RetryPolicy,
}

impl TemplateCache {
    pub fn new(registry: &Registry) -> Self {
        let client = Client::builder()
            .timeout(defaults::request_timeout())
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: registry.template_base_url.trim_end_matches('/').to_string(),
            manifest_url: registry.manifest_url.clone(),
            cache_dir: registry.cache_dir(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Location of a template's cached copy.
    pub fn cache_path(&self, kind: &TemplateKind) -> PathBuf {
        self.cache_dir.join("templates").join(kind.remote_path())
    }

    pub async fn get_template(&self, kind: &TemplateKind) -> Result<ConfigDocument> {
        kind.check_file_name()?;
        let cache_path = self.cache_path(kind);

        if let Some(doc) = read_cached_template(&cache_path) {
            return Ok(doc);
        }

        let url = format!("{}/{}", self.base_url, kind.remote_path());
        let body = self
            .retry
            .run("Template fetch", || self.fetch_text(&url))
            .await
            .map_err(|reason| TemplateError::Unavailable {
                what: kind.to_string(),
                reason,
            })?;

        let doc = ConfigDocument::parse(&body);
        if doc.is_empty() {
            return Err(TemplateError::Unavailable {
                what: kind.to_string(),
                reason: "remote template is empty".into(),
            });
        }

        if let Err(e) = doc.save(&cache_path) {
            log::warn!("Failed to cache template {} at {:?}: {}", kind, cache_path, e);
        }
        log::debug!("Fetched template {} from {}", kind, url);
        Ok(doc)
    }

    pub async fn get_manifest(&self) -> Result<Manifest> {
        let cache_path = self.cache_dir.join(MANIFEST_CACHE_FILE);

        if let Ok(content) = std::fs::read_to_string(&cache_path) {
            match serde_json::from_str::<Manifest>(&content) {
                Ok(manifest) if !manifest.entries.is_empty() => return Ok(manifest),
                Ok(_) => log::debug!("Cached manifest is empty, refetching"),
                Err(e) => log::warn!("Cached manifest {:?} is corrupt: {}", cache_path, e),
            }
        }

        let unavailable = |reason: String| TemplateError::Unavailable {
            what: "manifest".into(),
            reason,
        };

        let body = self
            .retry
            .run("Manifest fetch", || self.fetch_text(&self.manifest_url))
            .await
            .map_err(unavailable)?;

        let manifest: Manifest = serde_json::from_str(&body)
            .map_err(|e| unavailable(format!("invalid manifest format: {}", e)))?;

        if let Some(parent) = cache_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&cache_path, &body) {
            log::warn!("Failed to cache manifest at {:?}: {}", cache_path, e);
        }

        Ok(manifest)
    }

    /// Manifest lookup that reports a missing ticker as an error.
    pub async fn manifest_entry(&self, ticker: &str) -> Result<ManifestEntry> {
        let manifest = self.get_manifest().await?;
        manifest
            .latest_for(ticker)
            .cloned()
            .ok_or_else(|| TemplateError::UnknownTicker(ticker.to_string()))
    }

    async fn fetch_text(&self, url: &str) -> std::result::Result<String, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("request to {} failed: {}", url, e))?;

        if !response.status().is_success() {
            return Err(format!("server returned {}", response.status()));
        }

        response
            .text()
            .await
            .map_err(|e| format!("failed to read body: {}", e))
    }
}

fn read_cached_template(path: &Path) -> Option<ConfigDocument> {
    let doc = ConfigDocument::load(path).ok()?;
    if doc.is_empty() {
        log::debug!("Cached template {:?} is empty, refetching", path);
        return None;
    }
    Some(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DataDirs, Platform};
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn entry(ticker: &str, ver_id: &str) -> ManifestEntry {
        ManifestEntry {
            ticker: ticker.into(),
            ver_id: ver_id.into(),
            blockchain: String::new(),
            conf_name: String::new(),
            xbridge_conf: format!("{}.conf", ver_id),
            wallet_conf: format!("{}.conf", ver_id),
        }
    }

    fn test_cache(home: &Path, server: &str) -> TemplateCache {
        let dirs = DataDirs {
            node: home.join("node"),
            trading_desk: home.join("dx"),
            wallet: home.join("xlite"),
        };
        let mut registry = Registry::new(Platform::current(), home.to_path_buf(), dirs);
        registry.template_base_url = server.to_string();
        registry.manifest_url = format!("{}/manifest-latest.json", server);
        TemplateCache::new(&registry).with_retry(RetryPolicy {
            max_attempts: 2,
            first: Duration::from_millis(1),
            max: Duration::from_millis(1),
            factor: 1.0,
        })
    }

    #[test]
    fn test_latest_for_picks_highest_version() {
        let manifest = Manifest {
            entries: vec![
                entry("LTC", "litecoin--v0.17.1"),
                entry("LTC", "litecoin--v0.18.10"),
                entry("LTC", "litecoin--v0.18.2"),
                entry("BTC", "bitcoin--v25.0"),
            ],
        };
        let latest = manifest.latest_for("ltc").unwrap();
        assert_eq!(latest.ver_id, "litecoin--v0.18.10");
        assert!(manifest.latest_for("DOGE").is_none());
    }

    #[test]
    fn test_version_key_tolerates_suffixes() {
        assert_eq!(entry("X", "x--v1.2.3rc1").version_key(), vec![1, 2, 3]);
        assert_eq!(entry("X", "x--v0.21.0-beta").version_key(), vec![0, 21, 0, 0]);
    }

    #[tokio::test]
    async fn test_template_fetched_then_served_from_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/wallet-confs/blocknet--v4.4.1.conf"))
            .respond_with(ResponseTemplate::new(200).set_body_string("rpcport=41414\nserver=1\n"))
            .expect(1)
            .mount(&server)
            .await;

        let home = tempfile::tempdir().unwrap();
        let cache = test_cache(home.path(), &server.uri());
        let kind = TemplateKind::Wallet("blocknet--v4.4.1.conf".into());

        let first = cache.get_template(&kind).await.unwrap();
        let second = cache.get_template(&kind).await.unwrap();

        assert_eq!(first.get(crate::conf::GLOBAL, "rpcport"), Some("41414"));
        assert_eq!(first, second);
        assert!(cache.cache_path(&kind).exists());
    }

    #[tokio::test]
    async fn test_template_unavailable_when_cache_and_network_fail() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let home = tempfile::tempdir().unwrap();
        let cache = test_cache(home.path(), &server.uri());
        let result = cache
            .get_template(&TemplateKind::XBridge("litecoin--v0.18.1.conf".into()))
            .await;

        assert!(matches!(result, Err(TemplateError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_traversing_file_name_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("rpcport=1\n"))
            .expect(0)
            .mount(&server)
            .await;

        let home = tempfile::tempdir().unwrap();
        let cache = test_cache(home.path(), &server.uri());
        for name in ["../../escape.conf", "sub/dir.conf", "..", "", "a\\b.conf"] {
            let result = cache
                .get_template(&TemplateKind::XBridge(name.to_string()))
                .await;
            assert!(
                matches!(result, Err(TemplateError::UnsafeName(_))),
                "{:?} was accepted",
                name
            );
        }
        assert!(!home.path().join("escape.conf").exists());
    }

    #[tokio::test]
    async fn test_corrupt_manifest_cache_is_refetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/manifest-latest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"[{"ticker":"LTC","ver_id":"litecoin--v0.18.1","xbridge_conf":"litecoin--v0.18.1.conf","wallet_conf":"litecoin--v0.18.1.conf"}]"#,
            ))
            .mount(&server)
            .await;

        let home = tempfile::tempdir().unwrap();
        let cache_dir = home.path().join("cache");
        std::fs::create_dir_all(&cache_dir).unwrap();
        std::fs::write(cache_dir.join(MANIFEST_CACHE_FILE), "garbage").unwrap();

        let cache = test_cache(home.path(), &server.uri());
        let entry = cache.manifest_entry("LTC").await.unwrap();
        assert_eq!(entry.xbridge_conf, "litecoin--v0.18.1.conf");

        let unknown = cache.manifest_entry("DOGE").await;
        assert!(matches!(unknown, Err(TemplateError::UnknownTicker(_))));
    }
}
