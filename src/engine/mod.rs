//! Program provisioning and supervision.
//!
//! This module provides:
//! - Release download, verification and installation (`fetch`)
//! - Process lifecycle management (`lifecycle`)
//! - PID files, signals and process discovery (`multiprocess`)

pub mod fetch;
pub mod lifecycle;
pub mod multiprocess;

pub use fetch::{BinaryProvisioner, FetchError, NoProgress, ProgressSink};
pub use lifecycle::{
    stop_with_escalation, LifecycleError, ProcessHandle, ProcessSupervisor, StopOutcome,
};
