//! aio-supervisor - supervision and config reconciliation for the Blocknet
//! node, the Block DX trading desk and the XLite wallet.

mod defaults;
pub mod error;

pub mod conf;
pub mod engine;
pub mod manager;
pub mod program;
pub mod reconcile;
pub mod registry;
pub mod retry;
pub mod rpc;
pub mod settings;

pub use error::{Error, Result};

pub use conf::template::{Manifest, ManifestEntry, TemplateCache, TemplateError, TemplateKind};
pub use conf::{ConfValue, ConfigDocument, Section};

pub use engine::fetch::{BinaryProvisioner, FetchError, NoProgress, ProgressSink};
pub use engine::lifecycle::{LifecycleError, ProcessHandle, ProcessSupervisor, StopOutcome};
pub use engine::multiprocess;

pub use manager::AioManager;
pub use program::{ManagedProgram, ProcessState, ProgramStatus};
pub use reconcile::{Credentials, ReconcileError};
pub use registry::{Arch, DataDirs, Os, Platform, ProgramKind, ProgramSpec, Registry};
pub use retry::RetryPolicy;
pub use rpc::{HealthMonitor, RpcClient};
pub use settings::Settings;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
