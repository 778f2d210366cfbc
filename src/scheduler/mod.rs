//! Job bookkeeping for the supervisor.
//!
//! - **Job**: A single image-generation request and its workload cost
//! - **JobQueue**: Arrival-ordered pending jobs, assignment ownership and a
//!   cached pending-cost aggregate
//!
//! # Flow
//!
//! ```text
//!   job source ──enqueue──▶ pending ──dequeue──▶ assigned ──complete──▶ done
//!                              │                    │
//!                              └──────fault─────────┴──────────────────▶ faulted
//! ```
//!
//! A job has exactly one owning worker while assigned. Ownership only ends
//! through normal completion or through the recovery controller faulting it.

pub mod job;
pub mod queue;

pub use job::{compute_cost, Job, JobId, JobResult, JobState};
pub use queue::{Assignment, JobQueue, QueueError, QueueStats};
