//! Per-slot worker state.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::protocol::HeartbeatKind;
use crate::scheduler::JobId;

use super::state::ProcessState;

/// Stable identity of a worker slot.
///
/// Ids are arena indices; the registry never hands the same id to a
/// different slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub usize);

impl ProcessId {
    /// Returns the arena index.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Last memory report received from a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub ram_bytes: u64,
    pub vram_bytes: Option<u64>,
}

/// Everything the supervisor knows about one worker slot.
///
/// Fields are only mutated through the registry so the progress invariant
/// holds: `last_progress_timestamp` moves only when `last_progress_value`
/// changes, or when progress is explicitly reset.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    process_id: ProcessId,
    launch_id: u64,
    lifecycle_state: ProcessState,
    state_entered_at: Instant,
    last_heartbeat_timestamp: Instant,
    last_heartbeat_kind: Option<HeartbeatKind>,
    last_progress_value: Option<u8>,
    last_progress_timestamp: Instant,
    loaded_model_name: Option<String>,
    current_job_reference: Option<JobId>,
    recently_recovered: bool,
    memory: Option<MemoryUsage>,
    last_info: Option<String>,
}

impl ProcessInfo {
    pub(crate) fn new(process_id: ProcessId, now: Instant) -> Self {
        Self {
            process_id,
            launch_id: 0,
            lifecycle_state: ProcessState::Starting,
            state_entered_at: now,
            last_heartbeat_timestamp: now,
            last_heartbeat_kind: None,
            last_progress_value: None,
            last_progress_timestamp: now,
            loaded_model_name: None,
            current_job_reference: None,
            recently_recovered: false,
            memory: None,
            last_info: None,
        }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    /// Incremented on every respawn into this slot.
    pub fn launch_id(&self) -> u64 {
        self.launch_id
    }

    pub fn lifecycle_state(&self) -> ProcessState {
        self.lifecycle_state
    }

    /// When the current lifecycle state was entered.
    pub fn state_entered_at(&self) -> Instant {
        self.state_entered_at
    }

    pub fn last_heartbeat_timestamp(&self) -> Instant {
        self.last_heartbeat_timestamp
    }

    pub fn last_heartbeat_kind(&self) -> Option<HeartbeatKind> {
        self.last_heartbeat_kind
    }

    pub fn last_progress_value(&self) -> Option<u8> {
        self.last_progress_value
    }

    pub fn last_progress_timestamp(&self) -> Instant {
        self.last_progress_timestamp
    }

    pub fn loaded_model_name(&self) -> Option<&str> {
        self.loaded_model_name.as_deref()
    }

    pub fn current_job_reference(&self) -> Option<JobId> {
        self.current_job_reference
    }

    pub fn recently_recovered(&self) -> bool {
        self.recently_recovered
    }

    pub fn memory(&self) -> Option<MemoryUsage> {
        self.memory
    }

    /// Free-form detail from the latest state change.
    pub fn last_info(&self) -> Option<&str> {
        self.last_info.as_deref()
    }

    /// Time since the last heartbeat of any kind.
    pub fn heartbeat_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat_timestamp)
    }

    /// Time since the reported percentage last changed.
    pub fn progress_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_progress_timestamp)
    }

    /// Time spent in the current lifecycle state.
    pub fn state_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state_entered_at)
    }

    /// Idle and not holding a job: eligible for assignment.
    pub fn is_available(&self) -> bool {
        self.lifecycle_state.is_idle()
            && self.current_job_reference.is_none()
            && !self.recently_recovered
    }

    pub(crate) fn apply_heartbeat(
        &mut self,
        kind: HeartbeatKind,
        percent_complete: Option<u8>,
        now: Instant,
    ) {
        self.touch(now);
        self.last_heartbeat_kind = Some(kind);

        let Some(percent) = percent_complete else {
            return;
        };
        let percent = if percent > 100 {
            warn!(
                process_id = %self.process_id,
                percent = percent,
                "Heartbeat percentage above 100, clamping"
            );
            100
        } else {
            percent
        };

        if self.last_progress_value != Some(percent) {
            self.last_progress_value = Some(percent);
            self.last_progress_timestamp = self.last_progress_timestamp.max(now);
        }
    }

    pub(crate) fn reset_progress(&mut self, now: Instant) {
        self.last_progress_value = None;
        self.last_progress_timestamp = self.last_progress_timestamp.max(now);
        self.recently_recovered = false;
    }

    /// Liveness refresh without touching progress.
    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_heartbeat_timestamp = self.last_heartbeat_timestamp.max(now);
    }

    pub(crate) fn set_state(&mut self, state: ProcessState, now: Instant) {
        if self.lifecycle_state != state {
            self.lifecycle_state = state;
            self.state_entered_at = now;
        }
    }

    pub(crate) fn set_model(&mut self, model_name: Option<String>) {
        self.loaded_model_name = model_name;
    }

    pub(crate) fn set_job(&mut self, job: Option<JobId>) {
        self.current_job_reference = job;
    }

    pub(crate) fn set_info(&mut self, info: Option<String>) {
        self.last_info = info;
    }

    pub(crate) fn set_memory(&mut self, memory: MemoryUsage) {
        self.memory = Some(memory);
    }

    /// Starts a new launch in this slot and returns its id.
    ///
    /// The slot goes back to `Starting` with fresh clocks, and drops its job,
    /// model and memory report. `recovered` sets the cool-down flag.
    pub(crate) fn relaunch(&mut self, now: Instant, recovered: bool) -> u64 {
        self.launch_id += 1;
        self.lifecycle_state = ProcessState::Starting;
        self.state_entered_at = now;
        self.touch(now);
        self.last_heartbeat_kind = None;
        self.last_progress_value = None;
        self.last_progress_timestamp = self.last_progress_timestamp.max(now);
        self.loaded_model_name = None;
        self.current_job_reference = None;
        self.memory = None;
        self.last_info = None;
        self.recently_recovered = recovered;
        self.launch_id
    }

    /// Immutable, serializable view for status readers.
    pub fn snapshot(&self, now: Instant) -> ProcessSnapshot {
        ProcessSnapshot {
            process_id: self.process_id,
            launch_id: self.launch_id,
            state: self.lifecycle_state,
            state_age_secs: self.state_age(now).as_secs_f64(),
            heartbeat_age_secs: self.heartbeat_age(now).as_secs_f64(),
            progress_age_secs: self.progress_age(now).as_secs_f64(),
            last_heartbeat_kind: self.last_heartbeat_kind,
            percent_complete: self.last_progress_value,
            loaded_model: self.loaded_model_name.clone(),
            current_job: self.current_job_reference,
            recently_recovered: self.recently_recovered,
            memory: self.memory,
            info: self.last_info.clone(),
        }
    }
}

/// Point-in-time copy of a [`ProcessInfo`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub process_id: ProcessId,
    pub launch_id: u64,
    pub state: ProcessState,
    pub state_age_secs: f64,
    pub heartbeat_age_secs: f64,
    pub progress_age_secs: f64,
    pub last_heartbeat_kind: Option<HeartbeatKind>,
    pub percent_complete: Option<u8>,
    pub loaded_model: Option<String>,
    pub current_job: Option<JobId>,
    pub recently_recovered: bool,
    pub memory: Option<MemoryUsage>,
    pub info: Option<String>,
}
