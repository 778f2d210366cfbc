//! Prometheus metrics for the supervisor.
//!
//! # Example
//!
//! ```ignore
//! use inference_supervisor::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_recovery("progress_stall");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    BUSY_WORKERS, GATE_TIMEOUTS_TOTAL, GATE_WAIT, JOBS_TOTAL, JOB_DURATION, PENDING_COST,
    PENDING_JOBS, RECOVERIES_TOTAL, REGISTRY,
};
