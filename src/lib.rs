//! inference-supervisor: process supervisor for image-generation workers.
//!
//! This library tracks a fixed pool of inference workers through their
//! heartbeats, detects workers that are alive but no longer making
//! progress, and recovers them by faulting their job, terminating them and
//! spawning a replacement.

// Core modules
pub mod config;
pub mod detector;
pub mod error;
pub mod gate;
pub mod job_source;
pub mod launcher;
pub mod process;
pub mod protocol;
pub mod recovery;
pub mod scheduler;
pub mod supervisor;

// Runtime
pub mod cli;
pub mod metrics;
pub mod worker;

// Re-export commonly used types
pub use config::SupervisorConfig;
pub use error::{
    ConfigError, JobSourceError, LaunchError, ProtocolError, QueueError, RegistryError,
    SupervisorError,
};
pub use supervisor::{Supervisor, SupervisorHandle, SupervisorStatus};
