//! CLI command definitions for inference-supervisor.
//!
//! Three subcommands:
//!
//! - `run`: start the supervisor over a pool of workers and feed it jobs
//! - `worker`: run one simulated worker over stdin/stdout (spawned by `run`
//!   when `worker_command` is set)
//! - `config`: print the effective configuration as YAML

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;
use crate::gate::DecodeGate;
use crate::job_source::{load_jobs, LoggingJobSource};
use crate::launcher::{CommandLauncher, InProcessLauncher, ProcessLauncher};
use crate::metrics::{export_metrics, init_metrics};
use crate::process::ProcessId;
use crate::scheduler::Job;
use crate::supervisor::{message_channel, Supervisor, SupervisorStatus};
use crate::worker::{run_stdio, WorkerBehaviour, WorkerError};

/// Default model for generated demo jobs.
const DEFAULT_DEMO_MODEL: &str = "sd15";

/// Default simulated step time in milliseconds.
const DEFAULT_STEP_MS: u64 = 100;

/// Process supervisor for image-generation inference workers.
#[derive(Parser)]
#[command(name = "inference-supervisor")]
#[command(about = "Supervise inference workers: heartbeats, stall detection and recovery")]
#[command(version)]
#[command(
    long_about = "inference-supervisor runs a fixed pool of inference workers, tracks their heartbeats, detects workers that are alive but no longer making progress, and replaces them.\n\nExample usage:\n  inference-supervisor run --workers 4 --demo-jobs 20\n  inference-supervisor run --jobs jobs.jsonl --worker-command \"inference-supervisor worker\""
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Start the supervisor and run jobs to completion.
    Run(RunArgs),

    /// Run a single simulated worker speaking JSON lines on stdio.
    ///
    /// Not meant to be run by hand; `run` spawns it when a worker command
    /// is configured.
    Worker(WorkerArgs),

    /// Print the effective configuration as YAML.
    Config(ConfigArgs),
}

/// Arguments for `inference-supervisor run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// YAML configuration file. `SUPERVISOR_*` variables override it.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Number of worker slots.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Spawn workers as OS processes with this command line.
    #[arg(long)]
    pub worker_command: Option<String>,

    /// Inference step timeout in seconds.
    #[arg(long)]
    pub step_timeout: Option<f64>,

    /// Newline-delimited JSON jobs to submit.
    #[arg(short, long)]
    pub jobs: Option<String>,

    /// Number of generated demo jobs to submit.
    #[arg(long, default_value = "0")]
    pub demo_jobs: usize,

    /// Model name for demo jobs.
    #[arg(long, default_value = DEFAULT_DEMO_MODEL)]
    pub model: String,

    /// Simulated step time in milliseconds for in-process workers.
    #[arg(long, default_value_t = DEFAULT_STEP_MS)]
    pub step_ms: u64,

    /// Freeze the first launch of slot 0 at this percentage.
    #[arg(long)]
    pub stall_at: Option<u8>,

    /// Crash the first launch of slot 0 at this percentage.
    #[arg(long)]
    pub crash_at: Option<u8>,

    /// Print Prometheus metrics when done.
    #[arg(long)]
    pub metrics: bool,

    /// Print the final status as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `inference-supervisor worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Slot this worker runs in.
    #[arg(long)]
    pub process_id: usize,

    /// Launch id to stamp on every message.
    #[arg(long)]
    pub launch_id: u64,

    /// Model to load before reporting ready.
    #[arg(long)]
    pub model: Option<String>,

    /// Simulated step time in milliseconds.
    #[arg(long, default_value_t = DEFAULT_STEP_MS)]
    pub step_ms: u64,

    /// Bounded wait for the decode gate, in seconds.
    #[arg(long, default_value = "120")]
    pub gate_timeout: f64,

    /// Freeze at this percentage.
    #[arg(long)]
    pub stall_at: Option<u8>,

    /// Crash at this percentage.
    #[arg(long)]
    pub crash_at: Option<u8>,
}

/// Arguments for `inference-supervisor config`.
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// YAML configuration file to start from.
    #[arg(short, long)]
    pub config: Option<String>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_supervisor_command(args).await,
        Commands::Worker(args) => run_worker_command(args).await,
        Commands::Config(args) => run_config_command(args),
    }
}

// ============================================================================
// Run
// ============================================================================

async fn run_supervisor_command(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    let config = apply_run_overrides(config, &args);
    config.validate()?;

    init_metrics().context("Failed to initialize metrics")?;

    let jobs = collect_jobs(&args)?;
    if jobs.is_empty() {
        warn!("No jobs to run; supervising idle workers until Ctrl-C");
    }

    let (outbox, messages) = message_channel();
    let launcher = build_launcher(&config, &args, outbox)?;
    let source = Arc::new(LoggingJobSource::new());
    let (supervisor, handle) = Supervisor::new(config, launcher, source.clone(), messages)?;
    let task = tokio::spawn(supervisor.run());

    let total = jobs.len() as u64;
    info!(jobs = total, "Submitting jobs");
    for job in jobs {
        handle.submit(job).await?;
    }

    if total > 0 {
        tokio::select! {
            result = handle.wait_until(|s| s.jobs_finished() >= total) => {
                result?;
            }
            _ = tokio::signal::ctrl_c() => warn!("Interrupted, shutting down"),
        }
    } else {
        tokio::signal::ctrl_c().await?;
    }

    handle.shutdown();
    let status = task.await??;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_summary(&status, source.completed(), source.faulted());
    }
    if args.metrics {
        print!("{}", export_metrics());
    }
    Ok(())
}

fn load_config(path: Option<&str>) -> anyhow::Result<SupervisorConfig> {
    let config = match path {
        Some(path) => SupervisorConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => SupervisorConfig::default(),
    };
    Ok(config.with_env_overrides()?)
}

fn apply_run_overrides(mut config: SupervisorConfig, args: &RunArgs) -> SupervisorConfig {
    if let Some(workers) = args.workers {
        config = config.with_max_workers(workers);
    }
    if let Some(command) = &args.worker_command {
        config = config.with_worker_command(command.split_whitespace().map(String::from).collect());
    }
    if let Some(secs) = args.step_timeout {
        if let Ok(timeout) = Duration::try_from_secs_f64(secs) {
            config = config.with_inference_step_timeout(timeout);
        }
    }
    config
}

fn collect_jobs(args: &RunArgs) -> anyhow::Result<Vec<Job>> {
    let mut jobs = match &args.jobs {
        Some(path) => load_jobs(Path::new(path))
            .with_context(|| format!("Failed to load jobs from {}", path))?,
        None => Vec::new(),
    };
    jobs.extend(demo_jobs(&args.model, args.demo_jobs));
    Ok(jobs)
}

/// Generates `count` jobs with a spread of step counts.
fn demo_jobs(model: &str, count: usize) -> Vec<Job> {
    (0..count)
        .map(|i| {
            let steps = 20 + (i % 3) as u32 * 10;
            Job::with_dimensions(model, 512, 512, steps)
        })
        .collect()
}

fn build_launcher(
    config: &SupervisorConfig,
    args: &RunArgs,
    outbox: tokio::sync::mpsc::Sender<crate::protocol::WorkerMessage>,
) -> anyhow::Result<Arc<dyn ProcessLauncher>> {
    let gate = DecodeGate::new(config.effective_gate_capacity());

    if let Some(command) = &config.worker_command {
        let launcher = CommandLauncher::from_command_line(command, outbox)
            .ok_or_else(|| anyhow::anyhow!("worker_command is empty"))?
            .with_gate(gate, config.gate_acquire_timeout);
        info!(command = ?command, "Using OS-process workers");
        return Ok(Arc::new(launcher));
    }

    let base = WorkerBehaviour::default()
        .with_step_interval(Duration::from_millis(args.step_ms))
        .with_gate_timeout(config.gate_acquire_timeout);
    let (stall_at, crash_at) = (args.stall_at, args.crash_at);

    info!(gate_capacity = gate.capacity(), "Using in-process workers");
    Ok(Arc::new(InProcessLauncher::with_behaviour_fn(
        outbox,
        gate,
        move |process_id, launch_id| {
            faulty_first_launch(&base, process_id, launch_id, stall_at, crash_at)
        },
    )))
}

/// Applies fault injection to the first launch of slot 0 only, so the
/// replacement runs clean.
fn faulty_first_launch(
    base: &WorkerBehaviour,
    process_id: ProcessId,
    launch_id: u64,
    stall_at: Option<u8>,
    crash_at: Option<u8>,
) -> WorkerBehaviour {
    let mut behaviour = base.clone();
    if process_id == ProcessId(0) && launch_id == 0 {
        if let Some(percent) = stall_at {
            behaviour = behaviour.with_stall_at(percent);
        }
        if let Some(percent) = crash_at {
            behaviour = behaviour.with_crash_at(percent);
        }
    }
    behaviour
}

fn print_summary(status: &SupervisorStatus, reported_complete: u64, reported_faulted: u64) {
    println!("Jobs enqueued:   {}", status.jobs_enqueued);
    println!("Jobs completed:  {}", status.jobs_completed);
    println!("Jobs faulted:    {}", status.jobs_faulted);
    println!("Recoveries:      {}", status.recoveries);
    println!(
        "Reported to job source: {} complete, {} faulted",
        reported_complete, reported_faulted
    );
    for record in &status.faulted_history {
        println!(
            "  faulted {} on {}: {}",
            record.job_id,
            record
                .process_id
                .map_or_else(|| "-".to_string(), |p| p.to_string()),
            record.reason
        );
    }
}

// ============================================================================
// Worker
// ============================================================================

async fn run_worker_command(args: WorkerArgs) -> anyhow::Result<()> {
    let gate_timeout = Duration::try_from_secs_f64(args.gate_timeout)
        .context("gate timeout must be a non-negative number of seconds")?;
    let mut behaviour = WorkerBehaviour::default()
        .with_step_interval(Duration::from_millis(args.step_ms))
        .with_gate_timeout(gate_timeout);
    if let Some(percent) = args.stall_at {
        behaviour = behaviour.with_stall_at(percent);
    }
    if let Some(percent) = args.crash_at {
        behaviour = behaviour.with_crash_at(percent);
    }

    let result = run_stdio(ProcessId(args.process_id), args.launch_id, behaviour, args.model).await;
    let code = match result {
        Ok(()) | Err(WorkerError::ChannelClosed) => 0,
        Err(e) => {
            error!(process_id = args.process_id, error = %e, "Worker failed");
            1
        }
    };
    // Exit directly: a pending stdin read would otherwise hold up runtime shutdown.
    std::process::exit(code)
}

// ============================================================================
// Config
// ============================================================================

fn run_config_command(args: ConfigArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    print!("{}", config.to_yaml()?);
    Ok(())
}
