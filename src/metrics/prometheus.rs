//! Prometheus metrics registration and export.
//!
//! All supervisor metrics live in a private registry held in a `OnceLock`.
//! Nothing is recorded until [`init_metrics`] has run; recording through
//! [`MetricsCollector`](super::MetricsCollector) is a no-op before that.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, IntCounter, Opts, Registry,
    TextEncoder,
};
use std::sync::{Mutex, OnceLock};

/// Global Prometheus registry for all supervisor metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Recoveries performed, labeled by reason.
pub static RECOVERIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Jobs that left the supervisor, labeled by final status.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Wall time reported by workers for finished jobs.
pub static JOB_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Sum of cost over pending jobs.
pub static PENDING_COST: OnceLock<Gauge> = OnceLock::new();

/// Number of pending jobs.
pub static PENDING_JOBS: OnceLock<Gauge> = OnceLock::new();

/// Workers currently holding a job.
pub static BUSY_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Decode gate acquisitions that gave up waiting.
pub static GATE_TIMEOUTS_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Time spent waiting on the decode gate.
pub static GATE_WAIT: OnceLock<Histogram> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling this more than once keeps the first registry.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric creation or registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    static INIT: Mutex<()> = Mutex::new(());
    let _guard = INIT.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let recoveries_total = CounterVec::new(
        Opts::new("supervisor_recoveries_total", "Worker recoveries performed"),
        &["reason"],
    )?;

    let jobs_total = CounterVec::new(
        Opts::new("supervisor_jobs_total", "Jobs finished, by final status"),
        &["status"],
    )?;

    let job_duration = Histogram::with_opts(
        HistogramOpts::new(
            "supervisor_job_duration_seconds",
            "Job wall time reported by workers",
        )
        .buckets(vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
    )?;

    let pending_cost = Gauge::new("supervisor_pending_cost", "Sum of cost over pending jobs")?;
    let pending_jobs = Gauge::new("supervisor_pending_jobs", "Number of pending jobs")?;
    let busy_workers = Gauge::new("supervisor_busy_workers", "Workers currently holding a job")?;

    let gate_timeouts_total = IntCounter::new(
        "supervisor_gate_timeouts_total",
        "Decode gate acquisitions that timed out",
    )?;

    let gate_wait = Histogram::with_opts(
        HistogramOpts::new(
            "supervisor_gate_wait_seconds",
            "Time spent waiting for the decode gate",
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
    )?;

    registry.register(Box::new(recoveries_total.clone()))?;
    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(pending_cost.clone()))?;
    registry.register(Box::new(pending_jobs.clone()))?;
    registry.register(Box::new(busy_workers.clone()))?;
    registry.register(Box::new(gate_timeouts_total.clone()))?;
    registry.register(Box::new(gate_wait.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = RECOVERIES_TOTAL.set(recoveries_total);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = PENDING_COST.set(pending_cost);
    let _ = PENDING_JOBS.set(pending_jobs);
    let _ = BUSY_WORKERS.set(busy_workers);
    let _ = GATE_TIMEOUTS_TOTAL.set(gate_timeouts_total);
    let _ = GATE_WAIT.set(gate_wait);

    tracing::info!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry is not initialized or
/// encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
