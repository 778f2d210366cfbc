//! Worker slot tracking.
//!
//! This module holds the supervisor's view of its worker pool:
//!
//! - **Lifecycle**: the closed set of [`ProcessState`]s a worker reports
//! - **Per-slot state**: [`ProcessInfo`] with heartbeat and progress history
//! - **Registry**: [`ProcessRegistry`], the arena that owns every slot
//!
//! # Progress tracking
//!
//! ```text
//! heartbeat(kind, pct?) ──► last_heartbeat_timestamp = now      (always)
//!                      └──► pct changed? ──► last_progress_value = pct
//!                                            last_progress_timestamp = now
//! ```
//!
//! Re-sending an unchanged percentage refreshes liveness but not progress.
//! That asymmetry is what lets the detector tell a live-but-frozen worker
//! apart from a healthy one.

pub mod info;
pub mod registry;
pub mod state;

pub use info::{MemoryUsage, ProcessId, ProcessInfo, ProcessSnapshot};
pub use registry::{ProcessRegistry, RegistryError};
pub use state::ProcessState;
