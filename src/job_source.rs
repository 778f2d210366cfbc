//! Job source collaborator.
//!
//! The supervisor never retries a job on its own. Every job it gives up on
//! goes back to the job source through [`JobSource::report_fault`], which
//! decides whether to resubmit it. Successful jobs are reported through
//! [`JobSource::report_complete`].

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::scheduler::{Job, JobId, JobResult};

/// Errors that can occur while talking to the job source.
#[derive(Debug, Error)]
pub enum JobSourceError {
    /// The backend rejected or failed to receive a report.
    #[error("Failed to report job {job_id}: {message}")]
    ReportFailed { job_id: JobId, message: String },

    /// IO error while reading jobs.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A job line did not parse.
    #[error("Invalid job on line {line}: {source}")]
    InvalidJob {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Backend that owns jobs and receives their outcomes.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// A job was abandoned. `reason` is a short human-readable cause.
    async fn report_fault(&self, job_id: JobId, reason: &str) -> Result<(), JobSourceError>;

    /// A job finished successfully.
    async fn report_complete(&self, result: &JobResult) -> Result<(), JobSourceError>;
}

/// Job source that only logs outcomes and counts them.
#[derive(Debug, Default)]
pub struct LoggingJobSource {
    faulted: AtomicU64,
    completed: AtomicU64,
}

impl LoggingJobSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of faults reported so far.
    pub fn faulted(&self) -> u64 {
        self.faulted.load(Ordering::Relaxed)
    }

    /// Number of completions reported so far.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl JobSource for LoggingJobSource {
    async fn report_fault(&self, job_id: JobId, reason: &str) -> Result<(), JobSourceError> {
        self.faulted.fetch_add(1, Ordering::Relaxed);
        warn!(job_id = %job_id, reason = reason, "Job faulted");
        Ok(())
    }

    async fn report_complete(&self, result: &JobResult) -> Result<(), JobSourceError> {
        self.completed.fetch_add(1, Ordering::Relaxed);
        info!(
            job_id = %result.job_id,
            process_id = %result.process_id,
            elapsed_secs = result.time_elapsed_secs,
            "Job completed"
        );
        Ok(())
    }
}

/// Reads newline-delimited JSON jobs from a file.
///
/// Blank lines and lines starting with `#` are skipped. Jobs without an
/// explicit cost get one computed from their dimensions.
///
/// # Errors
///
/// Returns `JobSourceError::Io` if the file cannot be read and
/// `JobSourceError::InvalidJob` for the first malformed line.
pub fn load_jobs(path: impl AsRef<Path>) -> Result<Vec<Job>, JobSourceError> {
    let content = std::fs::read_to_string(path)?;
    parse_jobs(&content)
}

/// Parses newline-delimited JSON jobs.
///
/// # Errors
///
/// Returns `JobSourceError::InvalidJob` for the first malformed line.
pub fn parse_jobs(content: &str) -> Result<Vec<Job>, JobSourceError> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with('#')
        })
        .map(|(idx, line)| {
            serde_json::from_str::<Job>(line)
                .map(Job::normalized)
                .map_err(|source| JobSourceError::InvalidJob {
                    line: idx + 1,
                    source,
                })
        })
        .collect()
}
