//! Process-launch collaborator.
//!
//! The supervisor never touches worker processes directly. It asks a
//! [`ProcessLauncher`] to spawn, terminate and feed them. Each launcher is
//! built with the sending half of the supervisor's message channel and
//! forwards everything its workers say into it, plus an `Exited` message
//! when a worker ends without being asked to.
//!
//! Two implementations are provided:
//!
//! - [`InProcessLauncher`]: simulated workers as tokio tasks
//! - [`CommandLauncher`]: OS processes speaking JSON lines over stdio

pub mod command;
pub mod in_process;

pub use command::CommandLauncher;
pub use in_process::InProcessLauncher;

use async_trait::async_trait;
use thiserror::Error;

use crate::process::ProcessId;
use crate::protocol::WorkerCommand;

/// Errors that can occur while controlling workers.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The worker could not be started.
    #[error("Failed to spawn worker {process_id}: {message}")]
    SpawnFailed {
        process_id: ProcessId,
        message: String,
    },

    /// The worker could not be killed.
    #[error("Failed to terminate worker {process_id}: {message}")]
    TerminateFailed {
        process_id: ProcessId,
        message: String,
    },

    /// A command could not be delivered.
    #[error("Failed to dispatch to worker {process_id}: {message}")]
    DispatchFailed {
        process_id: ProcessId,
        message: String,
    },

    /// No running worker for this slot.
    #[error("No running worker for slot {0}")]
    UnknownProcess(ProcessId),
}

/// Starts, stops and talks to workers.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Starts a worker for `process_id` stamped with `launch_id`.
    ///
    /// Any worker still running in the slot is killed first.
    async fn spawn(
        &self,
        process_id: ProcessId,
        launch_id: u64,
        model_hint: Option<&str>,
    ) -> Result<(), LaunchError>;

    /// Hard-kills the slot's worker. Succeeds if nothing is running.
    async fn terminate(&self, process_id: ProcessId) -> Result<(), LaunchError>;

    /// Delivers a command to the slot's worker.
    async fn dispatch(
        &self,
        process_id: ProcessId,
        command: WorkerCommand,
    ) -> Result<(), LaunchError>;
}
