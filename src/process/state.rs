//! Worker lifecycle states.
//!
//! Transitions are driven only by state-change messages from the worker.
//! The supervisor never moves a worker between states on a timer; timing is
//! only used to judge whether the current state has lasted too long.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Launched, not yet reported ready.
    Starting,
    /// Idle and ready for a job.
    WaitingForJob,
    /// Fetching model weights.
    DownloadingModel,
    /// Loading a model into memory.
    PreloadingModel,
    /// Model resident, ready for a job on it.
    PreloadedModel,
    /// Actively computing inference steps.
    InferenceStarting,
    /// Steps done, running post-processing.
    InferencePostProcessing,
    /// Job finished; the worker will return to `WaitingForJob`.
    InferenceComplete,
    /// The inference pipeline reported a failure.
    InferenceFailed,
    /// The worker process died. Terminal for this launch.
    Crashed,
}

impl ProcessState {
    /// True for states in which the worker can accept a new job.
    pub fn is_idle(self) -> bool {
        matches!(self, ProcessState::WaitingForJob | ProcessState::PreloadedModel)
    }

    /// True for the terminal state of a launch.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Crashed)
    }

    /// Entering one of these states clears progress tracking.
    pub fn resets_progress(self) -> bool {
        matches!(
            self,
            ProcessState::WaitingForJob | ProcessState::InferenceComplete
        )
    }

    /// Short lowercase label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Starting => "starting",
            ProcessState::WaitingForJob => "waiting_for_job",
            ProcessState::DownloadingModel => "downloading_model",
            ProcessState::PreloadingModel => "preloading_model",
            ProcessState::PreloadedModel => "preloaded_model",
            ProcessState::InferenceStarting => "inference_starting",
            ProcessState::InferencePostProcessing => "inference_post_processing",
            ProcessState::InferenceComplete => "inference_complete",
            ProcessState::InferenceFailed => "inference_failed",
            ProcessState::Crashed => "crashed",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
