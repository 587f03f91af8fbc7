//! Error types for the supervisor.

use thiserror::Error;

use crate::registry::ProgramKind;

/// Crate-level error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Another install/start/stop/delete holds the program
    #[error("{0} is busy with another operation")]
    Busy(ProgramKind),

    /// The operation needs the program stopped first
    #[error("{0} is running")]
    Running(ProgramKind),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Background task failed to complete
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Provisioning error
    #[error("Fetch error: {0}")]
    Fetch(#[from] crate::engine::fetch::FetchError),

    /// Process lifecycle error
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] crate::engine::lifecycle::LifecycleError),

    /// Template or manifest error
    #[error("Template error: {0}")]
    Template(#[from] crate::conf::template::TemplateError),

    /// Reconciliation error
    #[error("Reconcile error: {0}")]
    Reconcile(#[from] crate::reconcile::ReconcileError),
}

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, Error>;
