//! Crate-level error type.
//!
//! Each subsystem owns its own error enum next to the code that raises it:
//! - Configuration loading and validation ([`ConfigError`])
//! - Job queue bookkeeping ([`QueueError`])
//! - Registry lookups ([`RegistryError`])
//! - Worker launch and control ([`LaunchError`])
//! - Job source reporting ([`JobSourceError`])
//! - Wire protocol ([`ProtocolError`])
//!
//! [`SupervisorError`] wraps all of them for callers that just want `?`.

use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::job_source::JobSourceError;
pub use crate::launcher::LaunchError;
pub use crate::process::RegistryError;
pub use crate::protocol::ProtocolError;
pub use crate::scheduler::QueueError;

/// Errors surfaced by the supervisor and its handle.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),

    #[error("Job source error: {0}")]
    JobSource(#[from] JobSourceError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The supervisor loop is no longer running.
    #[error("Supervisor is not running")]
    NotRunning,
}

/// Result alias using [`SupervisorError`].
pub type Result<T> = std::result::Result<T, SupervisorError>;
