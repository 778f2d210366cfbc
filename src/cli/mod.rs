//! Command-line interface for inference-supervisor.
//!
//! Provides commands for running the supervisor, running a single worker
//! over stdio, and inspecting configuration.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
