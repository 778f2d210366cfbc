//! High-level recording interface over the raw Prometheus statics.

use super::prometheus::{
    BUSY_WORKERS, GATE_TIMEOUTS_TOTAL, GATE_WAIT, JOBS_TOTAL, JOB_DURATION, PENDING_COST,
    PENDING_JOBS, RECOVERIES_TOTAL,
};

/// Metrics collector for supervisor operations.
///
/// Zero-sized and freely cloneable. Every method is a no-op until
/// [`init_metrics`](super::init_metrics) has been called, so library users
/// and tests that never initialize metrics pay nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one recovery.
    ///
    /// `reason` is a short label such as `progress_stall` or `worker_crash`.
    pub fn record_recovery(&self, reason: &str) {
        if let Some(recoveries) = RECOVERIES_TOTAL.get() {
            recoveries.with_label_values(&[reason]).inc();
        }

        tracing::trace!(reason = reason, "Recorded recovery metric");
    }

    /// Record a job leaving the supervisor.
    ///
    /// `status` is `done` or `faulted`. Duration is observed only when the
    /// worker reported one.
    pub fn record_job(&self, status: &str, duration_secs: Option<f64>) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[status]).inc();
        }

        if let (Some(histogram), Some(secs)) = (JOB_DURATION.get(), duration_secs) {
            histogram.observe(secs);
        }

        tracing::trace!(status = status, "Recorded job metric");
    }

    /// Update queue gauges.
    pub fn update_queue(&self, pending_jobs: usize, pending_cost: u64) {
        if let Some(gauge) = PENDING_JOBS.get() {
            gauge.set(pending_jobs as f64);
        }
        if let Some(gauge) = PENDING_COST.get() {
            gauge.set(pending_cost as f64);
        }
    }

    /// Update the busy-worker gauge.
    pub fn update_busy_workers(&self, count: usize) {
        if let Some(gauge) = BUSY_WORKERS.get() {
            gauge.set(count as f64);
        }
    }

    /// Record a decode-gate wait. `timed_out` marks a degraded continuation.
    pub fn record_gate_wait(&self, wait_secs: f64, timed_out: bool) {
        if let Some(histogram) = GATE_WAIT.get() {
            histogram.observe(wait_secs);
        }
        if timed_out {
            if let Some(counter) = GATE_TIMEOUTS_TOTAL.get() {
                counter.inc();
            }
        }
    }
}
