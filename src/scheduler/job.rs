//! Job definitions for the scheduler.
//!
//! This module defines the core job types handled by the supervisor:
//!
//! - `Job`: A single image-generation request awaiting or undergoing inference
//! - `JobId`: Stable identity of a job as issued by the job source
//! - `JobState`: Where the job currently sits in its lifecycle
//! - `JobResult`: Outcome reported back to the job source

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::process::ProcessId;

/// Default number of sampling steps for a job.
const DEFAULT_STEPS: u32 = 30;

/// Default image edge length in pixels.
const DEFAULT_DIMENSION: u32 = 512;

/// Pixel area that counts as one unit of cost per step (512x512).
const COST_UNIT_PIXELS: u64 = 512 * 512;

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a fresh random job id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an id issued by the job source.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in the queue for a worker.
    Pending,
    /// Handed to exactly one worker.
    Assigned,
    /// Finished successfully.
    Done,
    /// Abandoned after a stall, crash or reported failure.
    Faulted,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Assigned => write!(f, "assigned"),
            JobState::Done => write!(f, "done"),
            JobState::Faulted => write!(f, "faulted"),
        }
    }
}

/// A job representing one image-generation request.
///
/// The `cost` is a workload weight (resolution × steps) used for aggregate
/// admission accounting; it is computed from the dimensions unless
/// overridden with [`Job::with_cost`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job. Generated when absent.
    #[serde(default)]
    pub id: JobId,
    /// Model the job must run on.
    pub model_name: String,
    /// Output width in pixels.
    #[serde(default = "default_dimension")]
    pub width: u32,
    /// Output height in pixels.
    #[serde(default = "default_dimension")]
    pub height: u32,
    /// Number of sampling steps.
    #[serde(default = "default_steps")]
    pub steps: u32,
    /// Workload weight.
    #[serde(default)]
    pub cost: u64,
    /// Current lifecycle state.
    #[serde(default = "default_state")]
    pub state: JobState,
    /// When the job was received from the job source.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_dimension() -> u32 {
    DEFAULT_DIMENSION
}

fn default_steps() -> u32 {
    DEFAULT_STEPS
}

fn default_state() -> JobState {
    JobState::Pending
}

impl Job {
    /// Creates a new pending job at the default resolution and step count.
    pub fn new(model_name: impl Into<String>) -> Self {
        Self::with_dimensions(model_name, DEFAULT_DIMENSION, DEFAULT_DIMENSION, DEFAULT_STEPS)
    }

    /// Creates a new pending job with explicit dimensions and steps.
    pub fn with_dimensions(
        model_name: impl Into<String>,
        width: u32,
        height: u32,
        steps: u32,
    ) -> Self {
        Self {
            id: JobId::new(),
            model_name: model_name.into(),
            width,
            height,
            steps,
            cost: compute_cost(width, height, steps),
            state: JobState::Pending,
            created_at: Utc::now(),
        }
    }

    /// Overrides the computed cost.
    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    /// Sets the job id (used when the id comes from the job source).
    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    /// Fills in a zero cost from the dimensions.
    ///
    /// Jobs deserialized without a `cost` field get one here.
    pub fn normalized(mut self) -> Self {
        if self.cost == 0 {
            self.cost = compute_cost(self.width, self.height, self.steps);
        }
        self
    }

    /// Returns how long ago the job was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// Resolution × steps, in units of one 512x512 step. Never zero, and
/// saturates at `u64::MAX` for absurd dimensions.
pub fn compute_cost(width: u32, height: u32, steps: u32) -> u64 {
    let pixels = u64::from(width) * u64::from(height);
    (pixels.saturating_mul(u64::from(steps)) / COST_UNIT_PIXELS).max(1)
}

/// Result of a job execution, reported to the job source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// ID of the job that was executed.
    pub job_id: JobId,
    /// Worker slot that ran the job.
    pub process_id: ProcessId,
    /// Whether generation succeeded.
    pub success: bool,
    /// Free-form detail from the worker.
    pub info: Option<String>,
    /// Wall time spent in the worker, in seconds.
    pub time_elapsed_secs: f64,
    /// When the job was completed.
    pub completed_at: DateTime<Utc>,
}

impl JobResult {
    /// Creates a new successful job result.
    pub fn success(job_id: JobId, process_id: ProcessId, time_elapsed_secs: f64) -> Self {
        Self {
            job_id,
            process_id,
            success: true,
            info: None,
            time_elapsed_secs,
            completed_at: Utc::now(),
        }
    }

    /// Creates a new failed job result.
    pub fn failure(
        job_id: JobId,
        process_id: ProcessId,
        info: impl Into<String>,
        time_elapsed_secs: f64,
    ) -> Self {
        Self {
            job_id,
            process_id,
            success: false,
            info: Some(info.into()),
            time_elapsed_secs,
            completed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_new_defaults() {
        let job = Job::new("sdxl");

        assert_eq!(job.model_name, "sdxl");
        assert_eq!(job.width, 512);
        assert_eq!(job.height, 512);
        assert_eq!(job.steps, 30);
        assert_eq!(job.cost, 30);
        assert_eq!(job.state, JobState::Pending);
    }

    #[test]
    fn test_compute_cost_scales_with_resolution_and_steps() {
        assert_eq!(compute_cost(512, 512, 1), 1);
        assert_eq!(compute_cost(1024, 1024, 20), 80);
        assert_eq!(compute_cost(64, 64, 1), 1);
    }

    #[test]
    fn test_compute_cost_saturates_on_huge_dimensions() {
        assert_eq!(
            compute_cost(u32::MAX, u32::MAX, u32::MAX),
            u64::MAX / (512 * 512)
        );

        let job = Job::with_dimensions("sd15", u32::MAX, u32::MAX, u32::MAX);
        assert!(job.cost > 0);
    }

    #[test]
    fn test_job_with_cost_override() {
        let job = Job::new("sd15").with_cost(10);
        assert_eq!(job.cost, 10);
    }

    #[test]
    fn test_job_deserialize_minimal() {
        let raw = r#"{"id":"6f1c2c56-3f0e-4d43-9d38-9f3f1e2b8a10","model_name":"sd15"}"#;
        let job: Job = serde_json::from_str(raw).unwrap();
        let job = job.normalized();

        assert_eq!(job.steps, 30);
        assert_eq!(job.cost, 30);
        assert_eq!(job.state, JobState::Pending);
    }

    #[test]
    fn test_job_result_constructors() {
        let id = JobId::new();
        let ok = JobResult::success(id, ProcessId(1), 2.5);
        assert!(ok.success);
        assert!(ok.info.is_none());

        let failed = JobResult::failure(id, ProcessId(1), "oom", 1.0);
        assert!(!failed.success);
        assert_eq!(failed.info.as_deref(), Some("oom"));
    }

    #[test]
    fn test_job_state_display() {
        assert_eq!(JobState::Pending.to_string(), "pending");
        assert_eq!(JobState::Faulted.to_string(), "faulted");
    }
}
