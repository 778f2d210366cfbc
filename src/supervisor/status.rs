//! Read-only views of the supervisor for status readers.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::process::{ProcessId, ProcessSnapshot, ProcessState};
use crate::scheduler::JobId;

/// One job the supervisor gave up on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultedJobRecord {
    pub job_id: JobId,
    pub model_name: Option<String>,
    /// Worker that owned the job, if it had left the pending queue.
    pub process_id: Option<ProcessId>,
    pub reason: String,
    pub faulted_at: DateTime<Utc>,
}

impl FaultedJobRecord {
    pub fn new(
        job_id: JobId,
        model_name: Option<String>,
        process_id: Option<ProcessId>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            model_name,
            process_id,
            reason: reason.into(),
            faulted_at: Utc::now(),
        }
    }
}

/// Most recent faulted jobs, oldest dropped first.
#[derive(Debug, Clone)]
pub(crate) struct FaultedHistory {
    limit: usize,
    records: VecDeque<FaultedJobRecord>,
}

impl FaultedHistory {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            records: VecDeque::with_capacity(limit),
        }
    }

    pub(crate) fn push(&mut self, record: FaultedJobRecord) {
        if self.limit == 0 {
            return;
        }
        while self.records.len() >= self.limit {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub(crate) fn to_vec(&self) -> Vec<FaultedJobRecord> {
        self.records.iter().cloned().collect()
    }
}

/// Immutable snapshot published after every control-loop iteration.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub processes: Vec<ProcessSnapshot>,
    pub pending_jobs: usize,
    pub pending_cost: u64,
    pub assigned_jobs: usize,
    pub jobs_enqueued: u64,
    pub jobs_popped: u64,
    pub jobs_completed: u64,
    pub jobs_faulted: u64,
    pub recoveries: u64,
    pub faulted_history: Vec<FaultedJobRecord>,
    pub shutting_down: bool,
    pub updated_at: DateTime<Utc>,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            processes: Vec::new(),
            pending_jobs: 0,
            pending_cost: 0,
            assigned_jobs: 0,
            jobs_enqueued: 0,
            jobs_popped: 0,
            jobs_completed: 0,
            jobs_faulted: 0,
            recoveries: 0,
            faulted_history: Vec::new(),
            shutting_down: false,
            updated_at: Utc::now(),
        }
    }
}

impl SupervisorStatus {
    /// Jobs that have left the supervisor, either way.
    pub fn jobs_finished(&self) -> u64 {
        self.jobs_completed + self.jobs_faulted
    }

    /// Nothing pending and nothing running.
    pub fn is_drained(&self) -> bool {
        self.pending_jobs == 0 && self.assigned_jobs == 0
    }

    /// Slots currently holding a job.
    pub fn busy_workers(&self) -> usize {
        self.processes
            .iter()
            .filter(|p| p.current_job.is_some())
            .count()
    }

    /// Slots in `state`.
    pub fn count_in(&self, state: ProcessState) -> usize {
        self.processes.iter().filter(|p| p.state == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: usize) -> FaultedJobRecord {
        FaultedJobRecord::new(JobId::new(), None, Some(ProcessId(n)), "stalled")
    }

    #[test]
    fn test_history_keeps_most_recent() {
        let mut history = FaultedHistory::new(2);
        history.push(record(0));
        history.push(record(1));
        history.push(record(2));

        let kept: Vec<_> = history
            .to_vec()
            .into_iter()
            .filter_map(|r| r.process_id)
            .collect();
        assert_eq!(kept, vec![ProcessId(1), ProcessId(2)]);
    }

    #[test]
    fn test_history_disabled() {
        let mut history = FaultedHistory::new(0);
        history.push(record(0));
        assert!(history.to_vec().is_empty());
    }

    #[test]
    fn test_status_counters() {
        let status = SupervisorStatus {
            jobs_completed: 3,
            jobs_faulted: 2,
            pending_jobs: 1,
            ..Default::default()
        };

        assert_eq!(status.jobs_finished(), 5);
        assert!(!status.is_drained());
        assert_eq!(status.busy_workers(), 0);
        assert_eq!(status.count_in(ProcessState::Starting), 0);
    }

    #[test]
    fn test_status_serializes() {
        let json = serde_json::to_value(SupervisorStatus::default()).unwrap();
        assert_eq!(json["pending_cost"], 0);
        assert_eq!(json["shutting_down"], false);
    }
}
