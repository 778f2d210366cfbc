//! Simulated inference worker.
//!
//! Stands in for the real inference engine. It speaks the worker side of
//! the protocol faithfully, so the supervisor cannot tell it apart from a
//! real worker:
//!
//! ```text
//! WaitingForJob ─RunJob─► [PreloadingModel] ─► InferenceStarting
//!      ▲                                          │ step heartbeats 0..100
//!      │                                          ▼
//!      │                              decode gate wait (DecodeWait @ 100)
//!      │                                          ▼
//!      └── InferenceComplete ◄── JobFinished ◄── InferencePostProcessing
//! ```
//!
//! While waiting on the decode gate the worker keeps heartbeating
//! `percent_complete = 100` at its step cadence, so a wedged gate shows up
//! as a frozen percentage rather than as silence. The wait is bounded; on
//! timeout the worker decodes without the gate.
//!
//! A worker in its own OS process cannot share a [`DecodeGate`] with its
//! siblings. It asks the launcher instead: `GateRequest` out, then
//! `GateGranted` or `GateDenied` back as a [`GateReply`], and `GateRelease`
//! once decoding is done.
//!
//! [`WorkerBehaviour::stall_at`] and [`WorkerBehaviour::crash_at`] inject
//! the two failure modes the supervisor has to handle.

pub mod stdio;

use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::gate::{DecodeGate, DecodePermit, GateError};
use crate::metrics::MetricsCollector;
use crate::process::{ProcessId, ProcessState};
use crate::protocol::{
    GateMessage, HeartbeatKind, HeartbeatMessage, JobFinishedMessage, MemoryReportMessage,
    ProtocolError, StateChangeMessage, WorkerCommand, WorkerMessage,
};
use crate::scheduler::Job;

pub use stdio::run_stdio;

const BASE_RAM_BYTES: u64 = 2 * 1024 * 1024 * 1024;
const MODEL_VRAM_BYTES: u64 = 6 * 1024 * 1024 * 1024;

/// Errors that end a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The supervisor side of the channel is gone.
    #[error("Supervisor channel closed")]
    ChannelClosed,

    /// Injected crash.
    #[error("Worker crashed at {percent}%")]
    Crashed { percent: u8 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Timing and fault injection for a [`SimulatedWorker`].
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerBehaviour {
    /// Time per sampling step, also the heartbeat cadence.
    pub step_interval: Duration,
    /// Time to load a model.
    pub preload_delay: Duration,
    /// Time spent decoding while holding the gate.
    pub decode_duration: Duration,
    pub post_process_duration: Duration,
    /// Bounded wait for the decode gate.
    pub gate_timeout: Duration,
    /// Freeze once progress reaches this percentage, heartbeating forever.
    pub stall_at: Option<u8>,
    /// Exit with an error once progress reaches this percentage.
    pub crash_at: Option<u8>,
}

impl Default for WorkerBehaviour {
    fn default() -> Self {
        Self {
            step_interval: Duration::from_millis(100),
            preload_delay: Duration::from_millis(300),
            decode_duration: Duration::from_millis(200),
            post_process_duration: Duration::from_millis(100),
            gate_timeout: Duration::from_secs(120),
            stall_at: None,
            crash_at: None,
        }
    }
}

impl WorkerBehaviour {
    pub fn with_step_interval(mut self, interval: Duration) -> Self {
        self.step_interval = interval;
        self
    }

    pub fn with_gate_timeout(mut self, timeout: Duration) -> Self {
        self.gate_timeout = timeout;
        self
    }

    pub fn with_stall_at(mut self, percent: u8) -> Self {
        self.stall_at = Some(percent);
        self
    }

    pub fn with_crash_at(mut self, percent: u8) -> Self {
        self.crash_at = Some(percent);
        self
    }
}

/// The launcher's answer to a `GateRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateReply {
    Granted,
    Denied(String),
}

enum GateWait {
    Local(DecodePermit),
    Remote,
    TimedOut(Duration),
    Denied(String),
    Closed,
}

/// One simulated worker launch.
pub struct SimulatedWorker {
    process_id: ProcessId,
    launch_id: u64,
    behaviour: WorkerBehaviour,
    gate: DecodeGate,
    gate_replies: Option<mpsc::Receiver<GateReply>>,
    outbox: mpsc::Sender<WorkerMessage>,
    preload: Option<String>,
    loaded_model: Option<String>,
    metrics: MetricsCollector,
}

impl SimulatedWorker {
    pub fn new(
        process_id: ProcessId,
        launch_id: u64,
        behaviour: WorkerBehaviour,
        gate: DecodeGate,
        outbox: mpsc::Sender<WorkerMessage>,
    ) -> Self {
        Self {
            process_id,
            launch_id,
            behaviour,
            gate,
            gate_replies: None,
            outbox,
            preload: None,
            loaded_model: None,
            metrics: MetricsCollector::new(),
        }
    }

    /// Loads `model` before reporting ready.
    pub fn with_preload(mut self, model: Option<String>) -> Self {
        self.preload = model;
        self
    }

    /// Asks the launcher for the decode gate over the protocol instead of
    /// using the local gate. Replies arrive on `replies`.
    pub fn with_remote_gate(mut self, replies: mpsc::Receiver<GateReply>) -> Self {
        self.gate_replies = Some(replies);
        self
    }

    /// Runs until `Shutdown`, until the command channel closes, or until an
    /// error ends the launch.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::ChannelClosed` when the supervisor is gone and
    /// `WorkerError::Crashed` for an injected crash.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<WorkerCommand>,
    ) -> Result<(), WorkerError> {
        info!(
            process_id = %self.process_id,
            launch_id = self.launch_id,
            "Worker started"
        );

        if let Some(model) = self.preload.take() {
            self.load_model(&model).await?;
        }
        self.report_memory().await?;
        self.state(ProcessState::WaitingForJob).await?;

        while let Some(command) = commands.recv().await {
            match command {
                WorkerCommand::RunJob { job } => {
                    self.run_job(job).await?;
                    self.report_memory().await?;
                    self.state(ProcessState::WaitingForJob).await?;
                }
                WorkerCommand::Shutdown => {
                    info!(process_id = %self.process_id, "Worker shutting down");
                    return Ok(());
                }
                WorkerCommand::GateGranted | WorkerCommand::GateDenied { .. } => {
                    debug!(process_id = %self.process_id, "Ignoring gate reply outside decode");
                }
            }
        }

        Ok(())
    }

    async fn run_job(&mut self, job: Job) -> Result<(), WorkerError> {
        let started = Instant::now();
        info!(
            process_id = %self.process_id,
            job_id = %job.id,
            model = %job.model_name,
            steps = job.steps,
            "Starting job"
        );

        if self.loaded_model.as_deref() != Some(job.model_name.as_str()) {
            self.load_model(&job.model_name).await?;
        }
        self.state(ProcessState::InferenceStarting).await?;

        let steps = job.steps.max(1);
        for step in 1..=steps {
            tokio::time::sleep(self.behaviour.step_interval).await;
            let percent = u8::try_from(step * 100 / steps).unwrap_or(100);

            if self.behaviour.stall_at.is_some_and(|at| percent >= at) {
                return self.stall(percent).await;
            }
            if self.behaviour.crash_at.is_some_and(|at| percent >= at) {
                warn!(process_id = %self.process_id, percent = percent, "Injected crash");
                return Err(WorkerError::Crashed { percent });
            }

            self.heartbeat(HeartbeatKind::StepProgress, Some(percent))
                .await?;
        }

        self.heartbeat(HeartbeatKind::PipelinePhaseChange, Some(100))
            .await?;
        self.decode().await?;

        self.state(ProcessState::InferencePostProcessing).await?;
        self.heartbeat(HeartbeatKind::PostProcessing, Some(100))
            .await?;
        tokio::time::sleep(self.behaviour.post_process_duration).await;

        self.send(WorkerMessage::JobFinished(JobFinishedMessage {
            process_id: self.process_id,
            launch_id: self.launch_id,
            job_id: job.id,
            success: true,
            info: None,
            time_elapsed_secs: started.elapsed().as_secs_f64(),
        }))
        .await?;
        self.state(ProcessState::InferenceComplete).await?;

        Ok(())
    }

    /// Keeps heartbeating a frozen percentage and never returns on its own.
    async fn stall(&self, percent: u8) -> Result<(), WorkerError> {
        warn!(
            process_id = %self.process_id,
            percent = percent,
            "Injected stall, progress frozen"
        );
        loop {
            self.heartbeat(HeartbeatKind::StepProgress, Some(percent))
                .await?;
            tokio::time::sleep(self.behaviour.step_interval).await;
        }
    }

    async fn decode(&mut self) -> Result<(), WorkerError> {
        let wait_started = Instant::now();
        let wait = if self.gate_replies.is_some() {
            self.wait_remote_gate().await?
        } else {
            self.wait_local_gate().await?
        };

        let waited = wait_started.elapsed().as_secs_f64();
        let mut permit = None;
        let mut remote = false;
        match wait {
            GateWait::Local(held) => {
                self.metrics.record_gate_wait(waited, false);
                permit = Some(held);
            }
            GateWait::Remote => {
                self.metrics.record_gate_wait(waited, false);
                remote = true;
            }
            GateWait::TimedOut(limit) => {
                self.metrics.record_gate_wait(waited, true);
                warn!(
                    process_id = %self.process_id,
                    timeout_secs = limit.as_secs_f64(),
                    "Decode gate wait timed out, decoding without it"
                );
            }
            GateWait::Denied(reason) => {
                self.metrics.record_gate_wait(waited, true);
                warn!(
                    process_id = %self.process_id,
                    reason = %reason,
                    "Decode gate denied, decoding without it"
                );
            }
            GateWait::Closed => {
                debug!(process_id = %self.process_id, "Decode gate closed");
            }
        }

        tokio::time::sleep(self.behaviour.decode_duration).await;
        if let Some(permit) = permit {
            permit.release();
        }
        if remote {
            self.send(WorkerMessage::GateRelease(self.gate_message()))
                .await?;
        }
        Ok(())
    }

    async fn wait_local_gate(&self) -> Result<GateWait, WorkerError> {
        let acquire = self.gate.acquire(self.behaviour.gate_timeout);
        tokio::pin!(acquire);

        let mut ticker = tokio::time::interval(self.behaviour.step_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                outcome = &mut acquire => break outcome,
                _ = ticker.tick() => {
                    self.heartbeat(HeartbeatKind::DecodeWait, Some(100)).await?;
                }
            }
        };

        Ok(match outcome {
            Ok(permit) => GateWait::Local(permit),
            Err(GateError::Timeout(limit)) => GateWait::TimedOut(limit),
            Err(GateError::Closed) => GateWait::Closed,
        })
    }

    async fn wait_remote_gate(&mut self) -> Result<GateWait, WorkerError> {
        // A reply to a request we already withdrew.
        if let Some(replies) = self.gate_replies.as_mut() {
            while replies.try_recv().is_ok() {}
        }
        self.send(WorkerMessage::GateRequest(self.gate_message()))
            .await?;

        let limit = self.behaviour.gate_timeout;
        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);

        let mut ticker = tokio::time::interval(self.behaviour.step_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                reply = next_reply(&mut self.gate_replies) => {
                    return Ok(match reply {
                        Some(GateReply::Granted) => GateWait::Remote,
                        Some(GateReply::Denied(reason)) => GateWait::Denied(reason),
                        None => GateWait::Closed,
                    });
                }
                _ = &mut deadline => {
                    // Withdraws the request; a late grant is released by the launcher.
                    self.send(WorkerMessage::GateRelease(self.gate_message()))
                        .await?;
                    return Ok(GateWait::TimedOut(limit));
                }
                _ = ticker.tick() => {
                    self.heartbeat(HeartbeatKind::DecodeWait, Some(100)).await?;
                }
            }
        }
    }

    fn gate_message(&self) -> GateMessage {
        GateMessage {
            process_id: self.process_id,
            launch_id: self.launch_id,
        }
    }

    async fn load_model(&mut self, model: &str) -> Result<(), WorkerError> {
        self.loaded_model = None;
        self.send(WorkerMessage::StateChange(StateChangeMessage {
            process_id: self.process_id,
            launch_id: self.launch_id,
            new_state: ProcessState::PreloadingModel,
            model_name: Some(model.to_string()),
            info: None,
        }))
        .await?;

        tokio::time::sleep(self.behaviour.preload_delay).await;
        self.loaded_model = Some(model.to_string());
        self.state(ProcessState::PreloadedModel).await
    }

    async fn report_memory(&self) -> Result<(), WorkerError> {
        let vram_bytes = self.loaded_model.as_ref().map(|_| MODEL_VRAM_BYTES);
        self.send(WorkerMessage::MemoryReport(MemoryReportMessage {
            process_id: self.process_id,
            launch_id: self.launch_id,
            ram_bytes: BASE_RAM_BYTES,
            vram_bytes,
        }))
        .await
    }

    async fn state(&self, new_state: ProcessState) -> Result<(), WorkerError> {
        self.send(WorkerMessage::StateChange(StateChangeMessage {
            process_id: self.process_id,
            launch_id: self.launch_id,
            new_state,
            model_name: self.loaded_model.clone(),
            info: None,
        }))
        .await
    }

    async fn heartbeat(
        &self,
        kind: HeartbeatKind,
        percent_complete: Option<u8>,
    ) -> Result<(), WorkerError> {
        self.send(WorkerMessage::Heartbeat(HeartbeatMessage {
            process_id: self.process_id,
            launch_id: self.launch_id,
            kind,
            percent_complete,
        }))
        .await
    }

    async fn send(&self, message: WorkerMessage) -> Result<(), WorkerError> {
        self.outbox
            .send(message)
            .await
            .map_err(|_| WorkerError::ChannelClosed)
    }
}

async fn next_reply(replies: &mut Option<mpsc::Receiver<GateReply>>) -> Option<GateReply> {
    match replies {
        Some(replies) => replies.recv().await,
        None => std::future::pending().await,
    }
}
