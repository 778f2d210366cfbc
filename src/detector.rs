//! Stall detection.
//!
//! [`is_stuck`] is the core predicate for workers in `InferenceStarting`.
//! It applies two independent tests against a single timeout:
//!
//! ```text
//! state != InferenceStarting         ──► not stuck
//! now - last_progress_timestamp > T  ──► stuck (alive, frozen percentage)
//! now - last_heartbeat_timestamp > T ──► stuck (silent)
//! otherwise                          ──► not stuck
//! ```
//!
//! No percentage is exempt from the progress test, including 100: a worker
//! parked on the decode gate at 100% is caught like any other.
//!
//! [`StuckDetector`] wraps the predicate and adds single-timeout checks for
//! the other phases a worker can hang in:
//!
//! | state | clock | limit |
//! |---|---|---|
//! | `Starting` | state entered | `preload` |
//! | `DownloadingModel` | state entered | `download` |
//! | `PreloadingModel` | state entered | `preload` |
//! | `InferencePostProcessing` | state entered | `post_process` |
//! | idle with a job assigned | job assigned | `preload` |

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::SupervisorConfig;
use crate::process::{ProcessInfo, ProcessState};

/// Whether `info` is stalled mid-inference at `now`.
pub fn is_stuck(info: &ProcessInfo, timeout: Duration, now: Instant) -> bool {
    if info.lifecycle_state() != ProcessState::InferenceStarting {
        return false;
    }
    if info.progress_age(now) > timeout {
        return true;
    }
    info.heartbeat_age(now) > timeout
}

/// Outcome of evaluating one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum StallVerdict {
    Healthy,
    /// Heartbeats arriving, percentage unchanged beyond the timeout.
    ProgressStall,
    /// No heartbeat at all beyond the timeout.
    HeartbeatSilence,
    /// A non-inference phase lasted longer than its own timeout.
    PhaseTimeout { state: ProcessState },
}

impl StallVerdict {
    pub fn is_healthy(self) -> bool {
        matches!(self, StallVerdict::Healthy)
    }
}

impl fmt::Display for StallVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StallVerdict::Healthy => f.write_str("healthy"),
            StallVerdict::ProgressStall => f.write_str("progress_stall"),
            StallVerdict::HeartbeatSilence => f.write_str("heartbeat_silence"),
            StallVerdict::PhaseTimeout { state } => write!(f, "phase_timeout({})", state),
        }
    }
}

/// Per-phase timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallTimeouts {
    /// Shared by both inference tests.
    pub inference_step: Duration,
    pub preload: Duration,
    pub download: Duration,
    pub post_process: Duration,
}

impl Default for StallTimeouts {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

impl From<&SupervisorConfig> for StallTimeouts {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            inference_step: config.inference_step_timeout,
            preload: config.preload_timeout,
            download: config.download_timeout,
            post_process: config.post_process_timeout,
        }
    }
}

/// Pure stall classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct StuckDetector {
    timeouts: StallTimeouts,
}

impl StuckDetector {
    pub fn new(timeouts: StallTimeouts) -> Self {
        Self { timeouts }
    }

    pub fn timeouts(&self) -> StallTimeouts {
        self.timeouts
    }

    /// Classifies `info` at `now`.
    ///
    /// For `InferenceStarting` this agrees with [`is_stuck`] exactly: the
    /// verdict is non-healthy iff `is_stuck` returns true. When both tests
    /// fire, the progress stall is reported.
    pub fn evaluate(&self, info: &ProcessInfo, now: Instant) -> StallVerdict {
        let state = info.lifecycle_state();
        let phase_limit = match state {
            ProcessState::InferenceStarting => {
                let timeout = self.timeouts.inference_step;
                if info.progress_age(now) > timeout {
                    return StallVerdict::ProgressStall;
                }
                if info.heartbeat_age(now) > timeout {
                    return StallVerdict::HeartbeatSilence;
                }
                return StallVerdict::Healthy;
            }
            ProcessState::Starting | ProcessState::PreloadingModel => self.timeouts.preload,
            ProcessState::DownloadingModel => self.timeouts.download,
            ProcessState::InferencePostProcessing => self.timeouts.post_process,
            ProcessState::WaitingForJob | ProcessState::PreloadedModel => {
                // Assignment restarts the progress clock; a worker that never
                // picks the job up shows up here.
                if info.current_job_reference().is_some()
                    && info.progress_age(now) > self.timeouts.preload
                {
                    return StallVerdict::PhaseTimeout { state };
                }
                return StallVerdict::Healthy;
            }
            _ => return StallVerdict::Healthy,
        };

        if info.state_age(now) > phase_limit {
            StallVerdict::PhaseTimeout { state }
        } else {
            StallVerdict::Healthy
        }
    }
}
