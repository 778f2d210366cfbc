//! In-memory job queue with a cached pending-cost aggregate.
//!
//! The queue is owned by the supervisor's control loop and is never shared,
//! so it carries no locks. It tracks two collections:
//!
//! - **pending**: jobs in arrival order, waiting for a worker
//! - **assigned**: jobs handed to exactly one worker, keyed by job id
//!
//! # Cost cache
//!
//! The scheduling loop asks for the total cost of pending work on every
//! tick. Summing is O(n), so the result is cached and only recomputed on the
//! first read after a mutation. Every mutating operation (`enqueue`,
//! `dequeue`, `complete`, `fault`) clears `cache_valid`. An empty queue
//! starts with a valid cache of zero.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use thiserror::Error;
use tracing::debug;

use crate::process::ProcessId;

use super::job::{Job, JobId, JobState};

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Job not found in the collection the operation targets.
    #[error("Job {0} not found")]
    JobNotFound(JobId),

    /// A job with the same id is already pending or assigned.
    #[error("Job {0} is already queued")]
    DuplicateJob(JobId),

    /// The job exists but is in the wrong state for the operation.
    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },
}

/// A job together with the worker that currently owns it.
#[derive(Debug, Clone)]
pub struct Assignment {
    /// The job being run.
    pub job: Job,
    /// Sole owner of the job while assigned.
    pub process_id: ProcessId,
    /// When the job was handed over.
    pub assigned_at: Instant,
}

/// Running counters for the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Jobs accepted from the job source.
    pub enqueued: u64,
    /// Jobs handed to a worker.
    pub popped: u64,
    /// Jobs finished successfully.
    pub completed: u64,
    /// Jobs abandoned.
    pub faulted: u64,
}

/// Ordered queue of pending jobs plus assignment bookkeeping.
#[derive(Debug)]
pub struct JobQueue {
    pending: VecDeque<Job>,
    assigned: HashMap<JobId, Assignment>,
    cached_total_cost: u64,
    cache_valid: bool,
    stats: QueueStats,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    /// Creates an empty queue with a valid zero-cost cache.
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            assigned: HashMap::new(),
            cached_total_cost: 0,
            cache_valid: true,
            stats: QueueStats::default(),
        }
    }

    /// Appends a job to the back of the pending queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::DuplicateJob` if a job with the same id is
    /// already pending or assigned.
    pub fn enqueue(&mut self, mut job: Job) -> Result<(), QueueError> {
        if self.contains(job.id) {
            return Err(QueueError::DuplicateJob(job.id));
        }

        job.state = JobState::Pending;
        self.pending.push_back(job);
        self.stats.enqueued += 1;
        self.invalidate();
        Ok(())
    }

    /// Removes a pending job and records `process_id` as its sole owner.
    ///
    /// Returns a copy of the job for dispatch to the worker.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::JobNotFound` if the job is not pending.
    pub fn dequeue(
        &mut self,
        job_id: JobId,
        process_id: ProcessId,
        now: Instant,
    ) -> Result<Job, QueueError> {
        let position = self
            .pending
            .iter()
            .position(|job| job.id == job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;

        let mut job = self
            .pending
            .remove(position)
            .ok_or(QueueError::JobNotFound(job_id))?;
        job.state = JobState::Assigned;

        self.assigned.insert(
            job_id,
            Assignment {
                job: job.clone(),
                process_id,
                assigned_at: now,
            },
        );
        self.stats.popped += 1;
        self.invalidate();

        debug!(job_id = %job_id, process_id = %process_id, "Job assigned");
        Ok(job)
    }

    /// Marks an assigned job as done and drops it from the queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::InvalidTransition` if the job is still pending
    /// and `QueueError::JobNotFound` if it is unknown.
    pub fn complete(&mut self, job_id: JobId) -> Result<Assignment, QueueError> {
        let Some(mut assignment) = self.assigned.remove(&job_id) else {
            if self.pending.iter().any(|job| job.id == job_id) {
                return Err(QueueError::InvalidTransition {
                    job_id,
                    from: JobState::Pending,
                    to: JobState::Done,
                });
            }
            return Err(QueueError::JobNotFound(job_id));
        };

        assignment.job.state = JobState::Done;
        self.stats.completed += 1;
        self.invalidate();
        Ok(assignment)
    }

    /// Marks a job as faulted and drops it from the queue.
    ///
    /// Works on both assigned and pending jobs; the returned owner is `None`
    /// for a job that never left the pending queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::JobNotFound` if the job is unknown.
    pub fn fault(&mut self, job_id: JobId) -> Result<(Job, Option<ProcessId>), QueueError> {
        let (mut job, owner) = if let Some(assignment) = self.assigned.remove(&job_id) {
            (assignment.job, Some(assignment.process_id))
        } else {
            let position = self
                .pending
                .iter()
                .position(|job| job.id == job_id)
                .ok_or(QueueError::JobNotFound(job_id))?;
            let job = self
                .pending
                .remove(position)
                .ok_or(QueueError::JobNotFound(job_id))?;
            (job, None)
        };

        job.state = JobState::Faulted;
        self.stats.faulted += 1;
        self.invalidate();
        Ok((job, owner))
    }

    /// Returns the summed cost of all pending jobs.
    ///
    /// O(1) when the cache is valid; otherwise recomputes, stores and
    /// revalidates the cache. The total saturates at `u64::MAX`.
    pub fn total_pending_cost(&mut self) -> u64 {
        if !self.cache_valid {
            self.cached_total_cost = self
                .pending
                .iter()
                .fold(0, |total: u64, job| total.saturating_add(job.cost));
            self.cache_valid = true;
        }
        self.cached_total_cost
    }

    /// Whether the next `total_pending_cost` call will be served from cache.
    pub fn cache_valid(&self) -> bool {
        self.cache_valid
    }

    fn invalidate(&mut self) {
        self.cache_valid = false;
    }

    /// Pending jobs in arrival order.
    pub fn pending(&self) -> impl Iterator<Item = &Job> {
        self.pending.iter()
    }

    /// Current assignments, in no particular order.
    pub fn assignments(&self) -> impl Iterator<Item = &Assignment> {
        self.assigned.values()
    }

    /// Looks up the worker owning an assigned job.
    pub fn owner_of(&self, job_id: JobId) -> Option<ProcessId> {
        self.assigned.get(&job_id).map(|a| a.process_id)
    }

    /// Returns the job currently assigned to `process_id`, if any.
    pub fn assignment_for(&self, process_id: ProcessId) -> Option<&Assignment> {
        self.assigned
            .values()
            .find(|assignment| assignment.process_id == process_id)
    }

    /// Returns whether a job with this id is pending or assigned.
    pub fn contains(&self, job_id: JobId) -> bool {
        self.assigned.contains_key(&job_id) || self.pending.iter().any(|job| job.id == job_id)
    }

    /// Number of pending jobs.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of assigned jobs.
    pub fn assigned_len(&self) -> usize {
        self.assigned.len()
    }

    /// Returns true when nothing is pending or assigned.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.assigned.is_empty()
    }

    /// Running counters.
    pub fn stats(&self) -> QueueStats {
        self.stats
    }
}
