//! Authoritative process id → [`ProcessInfo`] mapping.
//!
//! The registry is an arena: a `Vec` of slots addressed by [`ProcessId`].
//! Ids are handed out by pushing, so they are never reused; retiring a slot
//! leaves a tombstone behind. The supervisor's control loop owns the only
//! instance. Readers outside the loop get [`ProcessSnapshot`]s.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::detector;
use crate::protocol::HeartbeatKind;
use crate::scheduler::JobId;

use super::info::{MemoryUsage, ProcessId, ProcessInfo, ProcessSnapshot};
use super::state::ProcessState;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No slot was ever registered under this id.
    #[error("Process {0} not found in registry")]
    ProcessNotFound(ProcessId),

    /// The slot existed but has been permanently retired.
    #[error("Process {0} has been retired")]
    ProcessRetired(ProcessId),
}

/// Arena of worker slots.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    slots: Vec<Option<ProcessInfo>>,
}

impl ProcessRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry for a pool of `capacity` workers.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
        }
    }

    /// Adds a new slot in the `Starting` state and returns its id.
    pub fn register(&mut self, now: Instant) -> ProcessId {
        let id = ProcessId(self.slots.len());
        self.slots.push(Some(ProcessInfo::new(id, now)));
        debug!(process_id = %id, "Registered worker slot");
        id
    }

    /// Permanently removes a slot. Its id is never handed out again.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is unknown or already retired.
    pub fn retire(&mut self, id: ProcessId) -> Result<ProcessInfo, RegistryError> {
        let slot = self
            .slots
            .get_mut(id.index())
            .ok_or(RegistryError::ProcessNotFound(id))?;
        slot.take().ok_or(RegistryError::ProcessRetired(id))
    }

    /// Looks up a live slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is unknown or retired.
    pub fn get(&self, id: ProcessId) -> Result<&ProcessInfo, RegistryError> {
        self.slots
            .get(id.index())
            .ok_or(RegistryError::ProcessNotFound(id))?
            .as_ref()
            .ok_or(RegistryError::ProcessRetired(id))
    }

    fn get_mut(&mut self, id: ProcessId) -> Result<&mut ProcessInfo, RegistryError> {
        self.slots
            .get_mut(id.index())
            .ok_or(RegistryError::ProcessNotFound(id))?
            .as_mut()
            .ok_or(RegistryError::ProcessRetired(id))
    }

    /// Live slots in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ProcessInfo> {
        self.slots.iter().flatten()
    }

    /// Ids of live slots in id order.
    pub fn ids(&self) -> Vec<ProcessId> {
        self.iter().map(ProcessInfo::process_id).collect()
    }

    /// Number of live slots.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Returns true if there are no live slots.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records a heartbeat received now.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is unknown or retired.
    pub fn record_heartbeat(
        &mut self,
        id: ProcessId,
        kind: HeartbeatKind,
        percent_complete: Option<u8>,
    ) -> Result<(), RegistryError> {
        self.record_heartbeat_at(id, kind, percent_complete, Instant::now())
    }

    /// Records a heartbeat received at `now`.
    ///
    /// Always refreshes the heartbeat timestamp and kind, whatever the kind.
    /// Progress fields move only when `percent_complete` is present and
    /// differs from the stored value; a repeated value leaves them alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is unknown or retired.
    pub fn record_heartbeat_at(
        &mut self,
        id: ProcessId,
        kind: HeartbeatKind,
        percent_complete: Option<u8>,
        now: Instant,
    ) -> Result<(), RegistryError> {
        self.get_mut(id)?.apply_heartbeat(kind, percent_complete, now);
        Ok(())
    }

    /// Clears progress tracking as of now.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is unknown or retired.
    pub fn reset_progress(&mut self, id: ProcessId) -> Result<(), RegistryError> {
        self.reset_progress_at(id, Instant::now())
    }

    /// Clears `last_progress_value`, restarts the progress clock at `now` and
    /// lifts the recovery cool-down.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is unknown or retired.
    pub fn reset_progress_at(&mut self, id: ProcessId, now: Instant) -> Result<(), RegistryError> {
        self.get_mut(id)?.reset_progress(now);
        Ok(())
    }

    /// Applies a worker-reported lifecycle transition and returns the
    /// previous state.
    ///
    /// A state change counts as liveness. Entering `WaitingForJob` or
    /// `InferenceComplete` resets progress, and `WaitingForJob` also drops
    /// the job reference. Entering `InferenceStarting` from another state
    /// restarts the progress clock, since a new inference run begins there.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is unknown or retired.
    pub fn apply_state_change_at(
        &mut self,
        id: ProcessId,
        new_state: ProcessState,
        model_name: Option<String>,
        info: Option<String>,
        now: Instant,
    ) -> Result<ProcessState, RegistryError> {
        let process = self.get_mut(id)?;
        let previous = process.lifecycle_state();

        process.touch(now);
        process.set_state(new_state, now);
        process.set_info(info);
        if model_name.is_some() {
            process.set_model(model_name);
        }

        if new_state.resets_progress() {
            process.reset_progress(now);
        }
        if new_state == ProcessState::WaitingForJob {
            process.set_job(None);
        }
        if new_state == ProcessState::InferenceStarting && previous != new_state {
            process.reset_progress(now);
        }
        if new_state == ProcessState::Crashed {
            process.set_model(None);
        }

        Ok(previous)
    }

    /// Records `job_id` as the slot's current job and resets progress.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is unknown or retired.
    pub fn assign_job_at(
        &mut self,
        id: ProcessId,
        job_id: JobId,
        now: Instant,
    ) -> Result<(), RegistryError> {
        let process = self.get_mut(id)?;
        process.set_job(Some(job_id));
        process.reset_progress(now);
        Ok(())
    }

    /// Drops the slot's job reference without touching progress.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is unknown or retired.
    pub fn clear_job(&mut self, id: ProcessId) -> Result<(), RegistryError> {
        self.get_mut(id)?.set_job(None);
        Ok(())
    }

    /// Stores the latest memory report.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is unknown or retired.
    pub fn record_memory(
        &mut self,
        id: ProcessId,
        ram_bytes: u64,
        vram_bytes: Option<u64>,
    ) -> Result<(), RegistryError> {
        self.get_mut(id)?.set_memory(MemoryUsage {
            ram_bytes,
            vram_bytes,
        });
        Ok(())
    }

    /// Opens a new launch for a slot being recovered and returns its id.
    ///
    /// The slot restarts in `Starting` without a job, and the cool-down flag
    /// stays set until the replacement reports `WaitingForJob`. Messages
    /// stamped with an older launch id are stale from here on.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is unknown or retired.
    pub fn begin_recovery(&mut self, id: ProcessId, now: Instant) -> Result<u64, RegistryError> {
        Ok(self.get_mut(id)?.relaunch(now, true))
    }

    /// Opens a new launch without setting the cool-down flag.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is unknown or retired.
    pub fn begin_launch(&mut self, id: ProcessId, now: Instant) -> Result<u64, RegistryError> {
        Ok(self.get_mut(id)?.relaunch(now, false))
    }

    /// Whether the slot currently counts as stalled, judged now.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is unknown or retired.
    pub fn is_stuck(&self, id: ProcessId, timeout: Duration) -> Result<bool, RegistryError> {
        self.is_stuck_at(id, timeout, Instant::now())
    }

    /// Whether the slot counts as stalled at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is unknown or retired.
    pub fn is_stuck_at(
        &self,
        id: ProcessId,
        timeout: Duration,
        now: Instant,
    ) -> Result<bool, RegistryError> {
        Ok(detector::is_stuck(self.get(id)?, timeout, now))
    }

    /// Snapshots of every live slot.
    pub fn snapshot(&self, now: Instant) -> Vec<ProcessSnapshot> {
        self.iter().map(|process| process.snapshot(now)).collect()
    }
}
