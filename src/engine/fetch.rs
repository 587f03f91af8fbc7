//! Release download, verification and installation.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use tar::Archive;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::defaults;
use crate::registry::{ArchiveKind, Platform, ProgramKind, ProgramSpec, Registry, ReleaseAsset};
use crate::retry::RetryPolicy;

/// Errors that can occur while provisioning a program.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("No release of {program} for {platform}")]
    UnsupportedPlatform {
        program: ProgramKind,
        platform: Platform,
    },

    #[error("Unsupported archive format: {0}")]
    UnsupportedArchive(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server did not report a size for {0}")]
    MissingContentLength(String),

    #[error("Download size mismatch: expected {expected} bytes, got {actual}")]
    Integrity { expected: u64, actual: u64 },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },

    #[error("Extraction failed: {0}")]
    Extract(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Network(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;

/// Receiver for download progress.
///
/// Implemented by whatever owns the status field a presentation layer polls.
pub trait ProgressSink: Send + Sync {
    /// Download progress in percent, `0.0..=100.0`.
    fn report(&self, percent: f64);

    /// Forget the last reported value.
    fn clear(&self);
}

/// A sink that discards progress.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _percent: f64) {}
    fn clear(&self) {}
}

/// Clears the sink however `install` exits.
struct ProgressGuard<'a>(&'a dyn ProgressSink);

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.clear();
    }
}

/// Downloads and installs release archives into the install root.
pub struct BinaryProvisioner {
    client: Client,
    platform: Platform,
    install_root: PathBuf,
    download_dir: PathBuf,
    retry: RetryPolicy,
}

impl BinaryProvisioner {
    pub fn new(registry: &Registry) -> Self {
        let client = Client::builder()
            .timeout(defaults::download_timeout())
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            platform: registry.platform,
            install_root: registry.install_root(),
            download_dir: registry.download_dir(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    /// Download, verify and install the program's release for this platform.
    ///
    /// Returns the path of the installed executable. A program already
    /// installed at the expected version is left alone.
    pub async fn install(&self, spec: &ProgramSpec, sink: &dyn ProgressSink) -> Result<PathBuf> {
        let _guard = ProgressGuard(sink);

        let asset = spec
            .release_for(self.platform)
            .ok_or(FetchError::UnsupportedPlatform {
                program: spec.kind,
                platform: self.platform,
            })?;
        let kind = asset
            .archive_kind()
            .ok_or_else(|| FetchError::UnsupportedArchive(asset.file_name().to_string()))?;

        if let Some(executable) = self.executable_path(spec) {
            log::debug!("{} {} already installed", spec.kind, spec.version);
            return Ok(executable);
        }

        std::fs::create_dir_all(&self.download_dir)?;
        std::fs::create_dir_all(&self.install_root)?;

        let part_path = self.download_dir.join(format!("{}.part", asset.file_name()));

        let expected = self
            .retry
            .run("Release size probe", || self.probe_size(&asset.url))
            .await?;

        log::info!(
            "Downloading {} {} ({} bytes) from {}",
            spec.kind,
            spec.version,
            expected,
            asset.url
        );
        self.retry
            .run("Release download", || {
                self.download_to(&asset.url, &part_path, expected, sink)
            })
            .await?;

        verify_download(&part_path, expected)?;
        if let Some(digest) = self.expected_sha256(asset).await {
            verify_sha256(&part_path, &digest)?;
        }

        self.unpack(asset, kind, &part_path).await?;

        log::info!("Installed {} {}", spec.kind, spec.version);
        self.executable_path(spec).ok_or_else(|| {
            FetchError::Extract(format!(
                "archive {} did not contain the expected {} install",
                asset.file_name(),
                spec.kind
            ))
        })
    }

    /// Whether the expected version is present under the install root.
    ///
    /// Installs of other versions are logged and left in place.
    pub fn detect_installed_version(&self, spec: &ProgramSpec) -> bool {
        self.installed_dir(spec).is_some()
    }

    /// The install directory matching the expected version.
    ///
    /// For disk-image installs this is the install root itself, reported once
    /// the downloaded image is present.
    pub fn installed_dir(&self, spec: &ProgramSpec) -> Option<PathBuf> {
        let disk_image = spec
            .release_for(self.platform)
            .filter(|a| a.archive_kind() == Some(ArchiveKind::DiskImage));

        let entries = std::fs::read_dir(&self.install_root).ok()?;
        let version = spec.bare_version();
        let mut found = None;

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();

            if let Some(asset) = disk_image {
                if name == asset.file_name() {
                    found = Some(self.install_root.clone());
                } else if name.contains(&spec.prefix) && name.ends_with(".dmg") {
                    log::warn!(
                        "Found {} image {:?} but expected {}",
                        spec.kind,
                        name,
                        asset.file_name()
                    );
                }
                continue;
            }

            if !name.contains(&spec.prefix) {
                continue;
            }
            if name.contains(version) && entry.path().is_dir() {
                found = Some(entry.path());
            } else {
                log::warn!(
                    "Found {} install {:?} not matching expected version {}",
                    spec.kind,
                    name,
                    spec.version
                );
            }
        }

        found
    }

    /// Full path of the installed executable, if the expected version is present.
    pub fn executable_path(&self, spec: &ProgramSpec) -> Option<PathBuf> {
        self.installed_dir(spec).map(|dir| dir.join(&spec.executable))
    }

    /// Remove every install of the program, matching version or not.
    pub fn uninstall(&self, spec: &ProgramSpec) -> Result<()> {
        let entries = match std::fs::read_dir(&self.install_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let bundle = app_bundle_name(spec);

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let owned = name.contains(&spec.prefix) || bundle.as_deref() == Some(name.as_str());
            if !owned {
                continue;
            }

            let path = entry.path();
            log::info!("Removing {} install {:?}", spec.kind, path);
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }

        Ok(())
    }

    async fn probe_size(&self, url: &str) -> Result<u64> {
        let response = self.client.head(url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Network(format!("HEAD {} returned {}", url, response.status())));
        }

        // `Response::content_length` reflects the (empty) HEAD body, not the header.
        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|&len| len > 0)
            .ok_or_else(|| FetchError::MissingContentLength(url.to_string()))
    }

    /// Stream `url` into `part_path`, resuming a previous partial download.
    async fn download_to(
        &self,
        url: &str,
        part_path: &Path,
        expected: u64,
        sink: &dyn ProgressSink,
    ) -> Result<()> {
        let mut existing = tokio::fs::metadata(part_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        if existing == expected {
            log::debug!("Reusing complete partial download {:?}", part_path);
            sink.report(100.0);
            return Ok(());
        }
        if existing > expected {
            tokio::fs::remove_file(part_path).await?;
            existing = 0;
        }

        let mut request = self.client.get(url);
        if existing > 0 {
            request = request.header(RANGE, format!("bytes={}-", existing));
        }

        let mut response = request.send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Network(format!("GET {} returned {}", url, response.status())));
        }

        let resuming = existing > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
        if existing > 0 && !resuming {
            log::debug!("Server ignored range request, restarting download");
            existing = 0;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(resuming)
            .truncate(!resuming)
            .open(part_path)
            .await?;

        let mut written = existing;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            sink.report((written as f64 / expected as f64 * 100.0).min(100.0));
        }
        file.flush().await?;

        Ok(())
    }

    /// The pinned digest, else one published beside the asset as `<url>.sha256`.
    async fn expected_sha256(&self, asset: &ReleaseAsset) -> Option<String> {
        if let Some(digest) = &asset.sha256 {
            return Some(digest.clone());
        }

        let url = format!("{}.sha256", asset.url);
        let response = match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                log::debug!("No checksum at {} ({})", url, response.status());
                return None;
            }
            Err(e) => {
                log::debug!("Checksum fetch from {} failed: {}", url, e);
                return None;
            }
        };

        let digest = parse_sha256(&response.text().await.ok()?);
        if digest.is_none() {
            log::warn!("Ignoring malformed checksum file {}", url);
        }
        digest
    }

    async fn unpack(&self, asset: &ReleaseAsset, kind: ArchiveKind, part_path: &Path) -> Result<()> {
        let root = self.install_root.clone();
        let archive_path = part_path.to_path_buf();

        match kind {
            ArchiveKind::Zip => {
                tokio::task::spawn_blocking(move || extract_zip(&archive_path, &root))
                    .await
                    .map_err(|e| FetchError::Extract(e.to_string()))??;
                std::fs::remove_file(part_path)?;
            }
            ArchiveKind::TarGz => {
                tokio::task::spawn_blocking(move || extract_tar_gz(&archive_path, &root))
                    .await
                    .map_err(|e| FetchError::Extract(e.to_string()))??;
                std::fs::remove_file(part_path)?;
            }
            ArchiveKind::DiskImage => {
                // Mounting happens when the program is first started.
                std::fs::rename(part_path, self.install_root.join(asset.file_name()))?;
            }
        }

        Ok(())
    }
}

/// Discard `path` unless it is exactly `expected` bytes long.
pub fn verify_download(path: &Path, expected: u64) -> Result<()> {
    let actual = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    if actual != expected {
        let _ = std::fs::remove_file(path);
        log::warn!(
            "Discarding {:?}: expected {} bytes, got {}",
            path,
            expected,
            actual
        );
        return Err(FetchError::Integrity { expected, actual });
    }
    Ok(())
}

/// First token of a `sha256sum`-style line, when it is a hex SHA-256.
fn parse_sha256(text: &str) -> Option<String> {
    let digest = text.split_whitespace().next()?;
    (digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit()))
        .then(|| digest.to_ascii_lowercase())
}

fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let mut hasher = Sha256::new();
    let mut file = File::open(path)?;
    io::copy(&mut file, &mut hasher)?;
    let actual = hex::encode(hasher.finalize());

    if !actual.eq_ignore_ascii_case(expected) {
        let _ = std::fs::remove_file(path);
        return Err(FetchError::Checksum {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

fn app_bundle_name(spec: &ProgramSpec) -> Option<String> {
    let first = spec.executable.components().next()?;
    let name = first.as_os_str().to_string_lossy();
    name.ends_with(".app").then(|| name.into_owned())
}

fn check_entry_path(path: &Path) -> Result<()> {
    let path_str = path.to_string_lossy();
    if path.is_absolute() || path_str.starts_with('/') || path_str.contains("..") {
        return Err(FetchError::Extract(format!("Unsafe path in archive: {}", path_str)));
    }
    Ok(())
}

fn extract_tar_gz(archive_path: &Path, root: &Path) -> Result<()> {
    let decoder = GzDecoder::new(File::open(archive_path)?);
    let mut archive = Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        check_entry_path(&path)?;

        let dest = root.join(&path);
        let entry_type = entry.header().entry_type();

        if entry_type.is_dir() {
            std::fs::create_dir_all(&dest)?;
            continue;
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if entry_type.is_file() {
            let mut file = File::create(&dest)?;
            io::copy(&mut entry, &mut file)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mode = entry.header().mode().unwrap_or(0o755);
                std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode))?;
            }
        } else if entry_type.is_symlink() {
            entry.unpack(&dest)?;
        }
    }

    Ok(())
}

fn extract_zip(archive_path: &Path, root: &Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(File::open(archive_path)?)
        .map_err(|e| FetchError::Extract(e.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| FetchError::Extract(e.to_string()))?;

        let Some(relative) = entry.enclosed_name() else {
            return Err(FetchError::Extract(format!(
                "Unsafe path in archive: {}",
                entry.name()
            )));
        };
        let dest = root.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&dest)?;
            continue;
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&dest)?;
        io::copy(&mut entry, &mut file)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode))?;
            }
        }
    }

    Ok(())
}
