//! Immutable configuration registry.
//!
//! Everything that depends on the host platform (data directories, release
//! archive URLs, executable locations) is resolved once when the registry is
//! built. The registry is then shared as `Arc<Registry>` and never mutated.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults;

const TEMPLATE_BASE_URL: &str =
    "https://raw.githubusercontent.com/blocknetdx/blockchain-configuration-files/master";
const MANIFEST_FILE: &str = "manifest-latest.json";

const NODE_VERSION: &str = "v4.4.1";
const TRADING_DESK_VERSION: &str = "v1.9.5";
const WALLET_VERSION: &str = "v1.0.7";

/// Ticker whose xbridge section carries the node's own credentials.
pub const NODE_TICKER: &str = "BLOCK";

/// Template file name for the node, in both `wallet-confs/` and `xbridge-confs/`.
const NODE_TEMPLATE_FILE: &str = "blocknet--v4.4.1.conf";

const NODE_SEEDS: &[&str] = &[
    "seed1.blocknet.co",
    "seed2.blocknet.co",
    "seed3.blocknet.co",
];

/// The three programs under supervision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramKind {
    /// Blocknet daemon exposing JSON-RPC
    Node,
    /// Block DX, reading node and per-coin credentials through XBridge
    TradingDesk,
    /// XLite light wallet and its daemon
    Wallet,
}

impl ProgramKind {
    pub const ALL: [ProgramKind; 3] = [Self::Node, Self::TradingDesk, Self::Wallet];

    /// Programs that expose an RPC endpoint worth health-checking.
    pub fn is_node_like(&self) -> bool {
        matches!(self, Self::Node)
    }
}

impl fmt::Display for ProgramKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node => write!(f, "blocknet"),
            Self::TradingDesk => write!(f, "blockdx"),
            Self::Wallet => write!(f, "xlite"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl Os {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => Self::Linux,
            "macos" => Self::MacOs,
            "windows" => Self::Windows,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    Aarch64,
    Other,
}

impl Arch {
    pub fn current() -> Self {
        match std::env::consts::ARCH {
            "x86_64" => Self::X86_64,
            "aarch64" => Self::Aarch64,
            _ => Self::Other,
        }
    }
}

/// Host operating system and CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Platform {
    pub os: Os,
    pub arch: Arch,
}

impl Platform {
    pub const fn new(os: Os, arch: Arch) -> Self {
        Self { os, arch }
    }

    pub fn current() -> Self {
        Self::new(Os::current(), Arch::current())
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.os, self.arch)
    }
}

/// Release archive format, derived from the asset file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
    DiskImage,
}

/// A downloadable release artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseAsset {
    pub url: String,
    /// Hex SHA-256 of the artifact, when published.
    pub sha256: Option<String>,
}

impl ReleaseAsset {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            sha256: None,
        }
    }

    /// Last path segment of the URL.
    pub fn file_name(&self) -> &str {
        let path = self.url.split(['?', '#']).next().unwrap_or_default();
        path.rsplit('/').next().unwrap_or(path)
    }

    pub fn archive_kind(&self) -> Option<ArchiveKind> {
        let name = self.file_name().to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if name.ends_with(".dmg") {
            Some(ArchiveKind::DiskImage)
        } else {
            None
        }
    }
}

/// Static description of one managed program on the current platform.
#[derive(Debug, Clone)]
pub struct ProgramSpec {
    pub kind: ProgramKind,
    /// Install directory prefix, e.g. `blocknet` in `blocknet-4.4.1`.
    pub prefix: String,
    /// Expected release version, with its leading `v`.
    pub version: String,
    /// Executable path relative to the matched install directory (or to the
    /// install root for disk-image installs).
    pub executable: PathBuf,
    /// Process names used when scanning for orphaned instances.
    pub process_names: Vec<String>,
    /// Default data directory; `Settings` may override it.
    pub data_dir: PathBuf,
    pub stop_timeout: Duration,
    /// Argument prefix used to pass the data directory, e.g. `-datadir=`.
    pub data_dir_arg: Option<String>,
    pub releases: HashMap<Platform, ReleaseAsset>,
}

impl ProgramSpec {
    /// Version without its leading `v`.
    pub fn bare_version(&self) -> &str {
        self.version.trim_start_matches('v')
    }

    pub fn release_for(&self, platform: Platform) -> Option<&ReleaseAsset> {
        self.releases.get(&platform)
    }

    /// Arguments for launching the program against `data_dir`.
    pub fn launch_args(&self, data_dir: &Path) -> Vec<String> {
        self.data_dir_arg
            .iter()
            .map(|arg| format!("{}{}", arg, data_dir.display()))
            .collect()
    }
}

/// Per-program data directories.
#[derive(Debug, Clone)]
pub struct DataDirs {
    pub node: PathBuf,
    pub trading_desk: PathBuf,
    pub wallet: PathBuf,
}

impl DataDirs {
    /// Conventional locations used by the programs themselves.
    pub fn default_for(os: Os) -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        let config = dirs::config_dir().unwrap_or_else(|| home.join(".config"));
        let data = dirs::data_dir().unwrap_or_else(|| config.clone());

        let node = match os {
            Os::MacOs | Os::Windows => data.join("Blocknet"),
            Os::Linux | Os::Other => home.join(".blocknet"),
        };

        Self {
            node,
            trading_desk: config.join("BLOCK DX"),
            wallet: config.join("CloudChains"),
        }
    }
}

/// Process-wide configuration, built once at start-up.
#[derive(Debug, Clone)]
pub struct Registry {
    pub platform: Platform,
    /// Engine home holding caches, downloads, logs and the install root.
    pub home: PathBuf,
    pub template_base_url: String,
    pub manifest_url: String,
    /// Template file names used for the node's own wallet and xbridge confs.
    pub node_template_file: String,
    pub node_seeds: Vec<String>,
    pub node: ProgramSpec,
    pub trading_desk: ProgramSpec,
    pub wallet: ProgramSpec,
}

impl Registry {
    /// Build the registry for the running host.
    ///
    /// `AIO_HOME` overrides the engine home directory.
    pub fn load() -> Self {
        let platform = Platform::current();
        let home = match std::env::var("AIO_HOME") {
            Ok(home) if !home.is_empty() => PathBuf::from(home),
            _ => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("aio-blocknet"),
        };
        Self::new(platform, home, DataDirs::default_for(platform.os))
    }

    pub fn new(platform: Platform, home: PathBuf, data_dirs: DataDirs) -> Self {
        let exe = |name: &str| {
            if platform.os == Os::Windows {
                PathBuf::from(format!("{}.exe", name))
            } else {
                PathBuf::from(name)
            }
        };

        let node = ProgramSpec {
            kind: ProgramKind::Node,
            prefix: "blocknet".into(),
            version: NODE_VERSION.into(),
            executable: PathBuf::from("bin").join(exe("blocknetd")),
            process_names: vec!["blocknetd".into(), "blocknetd.exe".into()],
            data_dir: data_dirs.node,
            stop_timeout: Duration::from_secs(defaults::NODE_STOP_TIMEOUT_SECS),
            data_dir_arg: Some("-datadir=".into()),
            releases: node_releases(),
        };

        let trading_desk = ProgramSpec {
            kind: ProgramKind::TradingDesk,
            prefix: "BLOCK-DX".into(),
            version: TRADING_DESK_VERSION.into(),
            executable: match platform.os {
                Os::MacOs => PathBuf::from("BLOCK DX.app/Contents/MacOS/BLOCK DX"),
                Os::Windows => PathBuf::from("BLOCK DX.exe"),
                Os::Linux | Os::Other => PathBuf::from("block-dx"),
            },
            process_names: vec!["BLOCK DX".into(), "block-dx".into(), "BLOCK DX.exe".into()],
            data_dir: data_dirs.trading_desk,
            stop_timeout: Duration::from_secs(defaults::NODE_STOP_TIMEOUT_SECS),
            data_dir_arg: None,
            releases: trading_desk_releases(),
        };

        let wallet = ProgramSpec {
            kind: ProgramKind::Wallet,
            prefix: "XLite".into(),
            version: WALLET_VERSION.into(),
            executable: match platform.os {
                Os::MacOs => PathBuf::from("XLite.app/Contents/MacOS/XLite"),
                Os::Windows => PathBuf::from("XLite.exe"),
                Os::Linux | Os::Other => PathBuf::from("xlite"),
            },
            process_names: vec![
                "XLite".into(),
                "xlite".into(),
                "XLite.exe".into(),
                "xlite-daemon-linux64".into(),
                "xlite-daemon-osx64".into(),
                "xlite-daemon-win64.exe".into(),
            ],
            data_dir: data_dirs.wallet,
            stop_timeout: Duration::from_secs(defaults::WALLET_STOP_TIMEOUT_SECS),
            data_dir_arg: None,
            releases: wallet_releases(),
        };

        Self {
            platform,
            home,
            template_base_url: TEMPLATE_BASE_URL.into(),
            manifest_url: format!("{}/{}", TEMPLATE_BASE_URL, MANIFEST_FILE),
            node_template_file: NODE_TEMPLATE_FILE.into(),
            node_seeds: NODE_SEEDS.iter().map(|s| s.to_string()).collect(),
            node,
            trading_desk,
            wallet,
        }
    }

    pub fn program(&self, kind: ProgramKind) -> &ProgramSpec {
        match kind {
            ProgramKind::Node => &self.node,
            ProgramKind::TradingDesk => &self.trading_desk,
            ProgramKind::Wallet => &self.wallet,
        }
    }

    pub fn program_mut(&mut self, kind: ProgramKind) -> &mut ProgramSpec {
        match kind {
            ProgramKind::Node => &mut self.node,
            ProgramKind::TradingDesk => &mut self.trading_desk,
            ProgramKind::Wallet => &mut self.wallet,
        }
    }

    /// Directory holding extracted releases.
    pub fn install_root(&self) -> PathBuf {
        self.home.join("bin")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.home.join("cache")
    }

    pub fn download_dir(&self) -> PathBuf {
        self.home.join("downloads")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.home.join("settings.json")
    }
}

fn node_releases() -> HashMap<Platform, ReleaseAsset> {
    let base = format!(
        "https://github.com/blocknetdx/blocknet/releases/download/{}",
        NODE_VERSION
    );
    let v = NODE_VERSION.trim_start_matches('v');
    HashMap::from([
        (
            Platform::new(Os::Linux, Arch::X86_64),
            ReleaseAsset::new(format!("{}/blocknet-{}-x86_64-linux-gnu.tar.gz", base, v)),
        ),
        (
            Platform::new(Os::Linux, Arch::Aarch64),
            ReleaseAsset::new(format!("{}/blocknet-{}-aarch64-linux-gnu.tar.gz", base, v)),
        ),
        (
            Platform::new(Os::MacOs, Arch::X86_64),
            ReleaseAsset::new(format!("{}/blocknet-{}-osx64.tar.gz", base, v)),
        ),
        (
            Platform::new(Os::MacOs, Arch::Aarch64),
            ReleaseAsset::new(format!("{}/blocknet-{}-osx64.tar.gz", base, v)),
        ),
        (
            Platform::new(Os::Windows, Arch::X86_64),
            ReleaseAsset::new(format!("{}/blocknet-{}-win64.zip", base, v)),
        ),
    ])
}

fn trading_desk_releases() -> HashMap<Platform, ReleaseAsset> {
    let base = format!(
        "https://github.com/blocknetdx/block-dx/releases/download/{}",
        TRADING_DESK_VERSION
    );
    let v = TRADING_DESK_VERSION.trim_start_matches('v');
    HashMap::from([
        (
            Platform::new(Os::Linux, Arch::X86_64),
            ReleaseAsset::new(format!("{}/BLOCK-DX-{}-linux-x64.tar.gz", base, v)),
        ),
        (
            Platform::new(Os::MacOs, Arch::X86_64),
            ReleaseAsset::new(format!("{}/BLOCK-DX-{}-mac.dmg", base, v)),
        ),
        (
            Platform::new(Os::MacOs, Arch::Aarch64),
            ReleaseAsset::new(format!("{}/BLOCK-DX-{}-mac.dmg", base, v)),
        ),
        (
            Platform::new(Os::Windows, Arch::X86_64),
            ReleaseAsset::new(format!("{}/BLOCK-DX-{}-win-x64.zip", base, v)),
        ),
    ])
}

fn wallet_releases() -> HashMap<Platform, ReleaseAsset> {
    let base = format!(
        "https://github.com/blocknetdx/xlite/releases/download/{}",
        WALLET_VERSION
    );
    let v = WALLET_VERSION.trim_start_matches('v');
    HashMap::from([
        (
            Platform::new(Os::Linux, Arch::X86_64),
            ReleaseAsset::new(format!("{}/XLite-{}-linux.tar.gz", base, v)),
        ),
        (
            Platform::new(Os::MacOs, Arch::X86_64),
            ReleaseAsset::new(format!("{}/XLite-{}-mac.dmg", base, v)),
        ),
        (
            Platform::new(Os::MacOs, Arch::Aarch64),
            ReleaseAsset::new(format!("{}/XLite-{}-mac.dmg", base, v)),
        ),
        (
            Platform::new(Os::Windows, Arch::X86_64),
            ReleaseAsset::new(format!("{}/XLite-{}-win-x64.zip", base, v)),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry(os: Os) -> Registry {
        let dirs = DataDirs {
            node: PathBuf::from("/data/node"),
            trading_desk: PathBuf::from("/data/dx"),
            wallet: PathBuf::from("/data/xlite"),
        };
        Registry::new(Platform::new(os, Arch::X86_64), PathBuf::from("/aio"), dirs)
    }

    #[test]
    fn test_asset_file_name_and_kind() {
        let asset = ReleaseAsset::new("https://host/releases/x/BLOCK-DX-1.9.5-mac.dmg?raw=1");
        assert_eq!(asset.file_name(), "BLOCK-DX-1.9.5-mac.dmg");
        assert_eq!(asset.archive_kind(), Some(ArchiveKind::DiskImage));
        assert_eq!(
            ReleaseAsset::new("https://h/a.tar.gz").archive_kind(),
            Some(ArchiveKind::TarGz)
        );
        assert_eq!(ReleaseAsset::new("https://h/a.zip").archive_kind(), Some(ArchiveKind::Zip));
        assert_eq!(ReleaseAsset::new("https://h/a.exe").archive_kind(), None);
    }

    #[test]
    fn test_node_launch_args_carry_data_dir() {
        let registry = test_registry(Os::Linux);
        let args = registry.node.launch_args(Path::new("/data/node"));
        assert_eq!(args, vec!["-datadir=/data/node".to_string()]);
        assert!(registry.wallet.launch_args(Path::new("/x")).is_empty());
    }

    #[test]
    fn test_stop_timeouts() {
        let registry = test_registry(Os::Linux);
        assert_eq!(registry.node.stop_timeout, Duration::from_secs(60));
        assert_eq!(registry.trading_desk.stop_timeout, Duration::from_secs(60));
        assert_eq!(registry.wallet.stop_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_windows_executables() {
        let registry = test_registry(Os::Windows);
        assert_eq!(registry.node.executable, PathBuf::from("bin/blocknetd.exe"));
        assert!(registry
            .node
            .release_for(registry.platform)
            .is_some_and(|a| a.archive_kind() == Some(ArchiveKind::Zip)));
    }

    #[test]
    fn test_unsupported_platform_has_no_release() {
        let registry = test_registry(Os::Other);
        assert!(registry.node.release_for(registry.platform).is_none());
    }

    #[test]
    fn test_bare_version() {
        let registry = test_registry(Os::Linux);
        assert_eq!(registry.node.bare_version(), "4.4.1");
    }
}
