//! The supervisor control loop.
//!
//! One task owns the [`ProcessRegistry`] and the [`JobQueue`] and is the
//! only place either is mutated. It waits on four event sources:
//!
//! ```text
//!   shutdown (broadcast) ─┐
//!   worker messages ──────┼──► select! ──► registry / queue ──► schedule ──► publish status
//!   job submissions ──────┤
//!   sweep timer ──────────┘
//! ```
//!
//! Worker messages are applied in arrival order. Each carries the launch it
//! came from; anything from a launch other than the slot's current one is
//! dropped. Status readers get immutable [`SupervisorStatus`] snapshots
//! through a watch channel and never see the live structures.
//!
//! Shutdown stops accepting work, gives in-flight jobs `shutdown_timeout` to
//! finish, faults whatever is left through the job source and then
//! terminates every worker.

pub mod status;

pub use status::{FaultedJobRecord, SupervisorStatus};

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::detector::{StallTimeouts, StuckDetector};
use crate::error::{Result, SupervisorError};
use crate::job_source::JobSource;
use crate::launcher::ProcessLauncher;
use crate::metrics::MetricsCollector;
use crate::process::{ProcessId, ProcessRegistry, ProcessState};
use crate::protocol::{
    ExitedMessage, JobFinishedMessage, StateChangeMessage, WorkerCommand, WorkerMessage,
};
use crate::recovery::{RecoveryController, RecoveryReason, RecoveryRecord};
use crate::scheduler::{Job, JobId, JobQueue, JobResult};

use status::FaultedHistory;

/// Capacity of the worker message channel.
pub const MESSAGE_CHANNEL_CAPACITY: usize = 1024;

const SUBMIT_CHANNEL_CAPACITY: usize = 256;
const SHUTDOWN_REASON: &str = "supervisor shutdown";

/// Creates the channel workers report on. Give the sender to the launcher
/// and the receiver to [`Supervisor::new`].
pub fn message_channel() -> (mpsc::Sender<WorkerMessage>, mpsc::Receiver<WorkerMessage>) {
    mpsc::channel(MESSAGE_CHANNEL_CAPACITY)
}

/// Cloneable handle for talking to a running [`Supervisor`].
///
/// Dropping every handle shuts the supervisor down.
#[derive(Clone)]
pub struct SupervisorHandle {
    submit_tx: mpsc::Sender<Job>,
    shutdown_tx: broadcast::Sender<()>,
    status_rx: watch::Receiver<SupervisorStatus>,
}

impl SupervisorHandle {
    /// Hands a job to the supervisor.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::NotRunning` once the loop has stopped
    /// accepting jobs.
    pub async fn submit(&self, job: Job) -> Result<()> {
        self.submit_tx
            .send(job)
            .await
            .map_err(|_| SupervisorError::NotRunning)
    }

    /// Asks the supervisor to shut down. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Latest published status.
    pub fn status(&self) -> SupervisorStatus {
        self.status_rx.borrow().clone()
    }

    /// Receiver notified on every published status.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.status_rx.clone()
    }

    /// Waits until a published status satisfies `pred`.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::NotRunning` if the supervisor stops before
    /// that happens.
    pub async fn wait_until<F>(&self, mut pred: F) -> Result<SupervisorStatus>
    where
        F: FnMut(&SupervisorStatus) -> bool,
    {
        let mut rx = self.status_rx.clone();
        loop {
            {
                let status = rx.borrow_and_update();
                if pred(&*status) {
                    return Ok(status.clone());
                }
            }
            rx.changed().await.map_err(|_| SupervisorError::NotRunning)?;
        }
    }
}

/// Supervises a fixed pool of worker slots.
pub struct Supervisor {
    config: SupervisorConfig,
    registry: ProcessRegistry,
    queue: JobQueue,
    recovery: RecoveryController,
    launcher: Arc<dyn ProcessLauncher>,
    jobs: Arc<dyn JobSource>,
    messages: mpsc::Receiver<WorkerMessage>,
    submissions: mpsc::Receiver<Job>,
    shutdown_rx: broadcast::Receiver<()>,
    status_tx: watch::Sender<SupervisorStatus>,
    history: FaultedHistory,
    metrics: MetricsCollector,
    shutting_down: bool,
}

impl Supervisor {
    /// Creates a supervisor and its handle.
    ///
    /// `messages` must be the receiving half of the channel the launcher
    /// reports on.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::Config` if the configuration is invalid.
    pub fn new(
        config: SupervisorConfig,
        launcher: Arc<dyn ProcessLauncher>,
        jobs: Arc<dyn JobSource>,
        messages: mpsc::Receiver<WorkerMessage>,
    ) -> Result<(Self, SupervisorHandle)> {
        config.validate()?;

        let (submit_tx, submissions) = mpsc::channel(SUBMIT_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (status_tx, status_rx) = watch::channel(SupervisorStatus::default());

        let detector = StuckDetector::new(StallTimeouts::from(&config));
        let supervisor = Self {
            registry: ProcessRegistry::with_capacity(config.max_workers),
            queue: JobQueue::new(),
            recovery: RecoveryController::new(detector),
            history: FaultedHistory::new(config.faulted_history_limit),
            config,
            launcher,
            jobs,
            messages,
            submissions,
            shutdown_rx,
            status_tx,
            metrics: MetricsCollector::new(),
            shutting_down: false,
        };
        let handle = SupervisorHandle {
            submit_tx,
            shutdown_tx,
            status_rx,
        };
        Ok((supervisor, handle))
    }

    /// Runs until shutdown and returns the final status.
    ///
    /// # Errors
    ///
    /// Per-worker failures never end the loop; they are logged and isolated
    /// to their slot.
    pub async fn run(mut self) -> Result<SupervisorStatus> {
        info!(
            workers = self.config.max_workers,
            step_timeout_secs = self.config.inference_step_timeout.as_secs_f64(),
            "Supervisor starting"
        );
        self.start_workers().await;
        self.publish_status();

        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut messages_open = true;
        let mut submissions_open = true;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.recv() => break,
                message = self.messages.recv(), if messages_open => match message {
                    Some(message) => self.handle_message(message, Instant::now()).await,
                    None => {
                        warn!("Worker message channel closed");
                        messages_open = false;
                    }
                },
                job = self.submissions.recv(), if submissions_open => match job {
                    Some(job) => self.accept(job),
                    None => submissions_open = false,
                },
                _ = sweep.tick() => self.sweep(Instant::now()).await,
            }

            self.schedule_pending(Instant::now()).await;
            self.publish_status();
        }

        self.shutdown().await;
        let status = self.build_status();
        info!(
            completed = status.jobs_completed,
            faulted = status.jobs_faulted,
            recoveries = status.recoveries,
            "Supervisor stopped"
        );
        Ok(status)
    }

    async fn start_workers(&mut self) {
        let now = Instant::now();
        for _ in 0..self.config.max_workers {
            let process_id = self.registry.register(now);
            if let Err(e) = self.launcher.spawn(process_id, 0, None).await {
                // Left in Starting; the phase timeout retries it.
                error!(process_id = %process_id, error = %e, "Failed to spawn worker");
            }
        }
    }

    fn accept(&mut self, job: Job) {
        let job = job.normalized();
        let job_id = job.id;
        let cost = job.cost;
        match self.queue.enqueue(job) {
            Ok(()) => debug!(job_id = %job_id, cost = cost, "Job accepted"),
            Err(e) => warn!(job_id = %job_id, error = %e, "Rejected job"),
        }
    }

    async fn handle_message(&mut self, message: WorkerMessage, now: Instant) {
        let process_id = message.process_id();
        let current = match self.registry.get(process_id) {
            Ok(info) => info.launch_id(),
            Err(e) => {
                warn!(process_id = %process_id, error = %e, "Message for unknown slot");
                return;
            }
        };
        if message.launch_id() != current {
            debug!(
                process_id = %process_id,
                launch_id = message.launch_id(),
                current = current,
                "Dropping message from replaced launch"
            );
            return;
        }

        match message {
            WorkerMessage::Heartbeat(heartbeat) => {
                if let Err(e) = self.registry.record_heartbeat_at(
                    process_id,
                    heartbeat.kind,
                    heartbeat.percent_complete,
                    now,
                ) {
                    warn!(process_id = %process_id, error = %e, "Failed to record heartbeat");
                }
            }
            WorkerMessage::StateChange(change) => self.on_state_change(change, now).await,
            WorkerMessage::MemoryReport(report) => {
                if let Err(e) =
                    self.registry
                        .record_memory(process_id, report.ram_bytes, report.vram_bytes)
                {
                    warn!(process_id = %process_id, error = %e, "Failed to record memory");
                }
            }
            WorkerMessage::JobFinished(finished) => self.on_job_finished(finished).await,
            WorkerMessage::Exited(exited) => self.on_exited(exited, now).await,
            WorkerMessage::GateRequest(_) | WorkerMessage::GateRelease(_) => {
                // The launcher owns the gate and answers these itself.
                debug!(process_id = %process_id, "Ignoring decode-gate message");
            }
        }
    }

    async fn on_state_change(&mut self, change: StateChangeMessage, now: Instant) {
        let process_id = change.process_id;
        if change.new_state == ProcessState::Crashed {
            self.on_crash(process_id, None, now).await;
            return;
        }

        let previous = match self.registry.apply_state_change_at(
            process_id,
            change.new_state,
            change.model_name,
            change.info,
            now,
        ) {
            Ok(previous) => previous,
            Err(e) => {
                warn!(process_id = %process_id, error = %e, "Failed to apply state change");
                return;
            }
        };
        debug!(
            process_id = %process_id,
            from = %previous,
            to = %change.new_state,
            "Worker state changed"
        );
        if previous == ProcessState::Starting && change.new_state != ProcessState::Starting {
            info!(process_id = %process_id, state = %change.new_state, "Worker ready");
        }

        // A command can cross a ready report in flight. Keep the slot tied to
        // the job it still owns; a job that never starts is caught by the
        // idle-with-job timeout.
        if change.new_state == ProcessState::WaitingForJob {
            if let Some(job_id) = self.queue.assignment_for(process_id).map(|a| a.job.id) {
                debug!(process_id = %process_id, job_id = %job_id, "Ready report with job in flight");
                if let Err(e) = self.registry.assign_job_at(process_id, job_id, now) {
                    warn!(process_id = %process_id, error = %e, "Failed to re-tie job");
                }
            }
        }
    }

    async fn on_job_finished(&mut self, finished: JobFinishedMessage) {
        let process_id = finished.process_id;
        let job_id = finished.job_id;

        if self.queue.owner_of(job_id) != Some(process_id) {
            warn!(
                process_id = %process_id,
                job_id = %job_id,
                "Ignoring result for a job this worker does not own"
            );
            return;
        }
        self.release_slot(process_id);

        if !finished.success {
            let reason = finished
                .info
                .unwrap_or_else(|| "inference failed".to_string());
            self.fault_job(job_id, &reason, Some(finished.time_elapsed_secs))
                .await;
            return;
        }

        if let Err(e) = self.queue.complete(job_id) {
            warn!(job_id = %job_id, error = %e, "Failed to complete job");
            return;
        }
        self.metrics
            .record_job("done", Some(finished.time_elapsed_secs));
        info!(
            process_id = %process_id,
            job_id = %job_id,
            elapsed_secs = finished.time_elapsed_secs,
            "Job finished"
        );

        let mut result = JobResult::success(job_id, process_id, finished.time_elapsed_secs);
        result.info = finished.info;
        if let Err(e) = self.jobs.report_complete(&result).await {
            error!(job_id = %job_id, error = %e, "Failed to report completed job");
        }
    }

    async fn on_exited(&mut self, exited: ExitedMessage, now: Instant) {
        debug!(process_id = %exited.process_id, exit_code = ?exited.exit_code, "Worker exited");
        self.on_crash(exited.process_id, exited.exit_code, now).await;
    }

    async fn on_crash(&mut self, process_id: ProcessId, exit_code: Option<i32>, now: Instant) {
        if self.shutting_down {
            // No replacements while shutting down; just release the job.
            if let Some(job_id) = self.queue.assignment_for(process_id).map(|a| a.job.id) {
                self.release_slot(process_id);
                self.fault_job(job_id, "worker exited during shutdown", None)
                    .await;
            }
            return;
        }

        let outcome = self
            .recovery
            .recover_crashed(
                &mut self.registry,
                &mut self.queue,
                self.launcher.as_ref(),
                self.jobs.as_ref(),
                process_id,
                exit_code,
                now,
            )
            .await;
        match outcome {
            Ok(record) => self.remember(&record),
            Err(e) => error!(process_id = %process_id, error = %e, "Crash recovery failed"),
        }
    }

    async fn sweep(&mut self, now: Instant) {
        let records = self
            .recovery
            .sweep_and_recover(
                &mut self.registry,
                &mut self.queue,
                self.launcher.as_ref(),
                self.jobs.as_ref(),
                now,
            )
            .await;
        for record in &records {
            self.remember(record);
        }
    }

    fn remember(&mut self, record: &RecoveryRecord) {
        if let Some(job_id) = record.job_id {
            self.history.push(FaultedJobRecord::new(
                job_id,
                record.job_model.clone(),
                Some(record.process_id),
                record.reason.to_string(),
            ));
        }
    }

    /// Hands pending jobs to idle workers, oldest first, preferring a worker
    /// that already has the job's model loaded.
    async fn schedule_pending(&mut self, now: Instant) {
        if self.shutting_down {
            return;
        }

        let pending: Vec<(JobId, String)> = self
            .queue
            .pending()
            .map(|job| (job.id, job.model_name.clone()))
            .collect();

        for (job_id, model_name) in pending {
            let Some(process_id) = self.pick_worker(&model_name) else {
                break;
            };

            let job = match self.queue.dequeue(job_id, process_id, now) {
                Ok(job) => job,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Failed to dequeue job");
                    continue;
                }
            };
            if let Err(e) = self.registry.assign_job_at(process_id, job_id, now) {
                warn!(process_id = %process_id, error = %e, "Failed to record assignment");
            }

            info!(
                process_id = %process_id,
                job_id = %job_id,
                model = %model_name,
                "Dispatching job"
            );
            if let Err(e) = self
                .launcher
                .dispatch(process_id, WorkerCommand::RunJob { job })
                .await
            {
                error!(process_id = %process_id, job_id = %job_id, error = %e, "Dispatch failed");
                let outcome = self
                    .recovery
                    .recover(
                        &mut self.registry,
                        &mut self.queue,
                        self.launcher.as_ref(),
                        self.jobs.as_ref(),
                        process_id,
                        RecoveryReason::DispatchFailed,
                        true,
                        now,
                    )
                    .await;
                match outcome {
                    Ok(record) => self.remember(&record),
                    Err(e) => error!(process_id = %process_id, error = %e, "Recovery failed"),
                }
            }
        }
    }

    fn release_slot(&mut self, process_id: ProcessId) {
        if let Err(e) = self.registry.clear_job(process_id) {
            warn!(process_id = %process_id, error = %e, "Failed to clear job reference");
        }
    }

    fn pick_worker(&self, model_name: &str) -> Option<ProcessId> {
        let mut fallback = None;
        for info in self.registry.iter() {
            if !info.is_available() || self.queue.assignment_for(info.process_id()).is_some() {
                continue;
            }
            if info.loaded_model_name() == Some(model_name) {
                return Some(info.process_id());
            }
            fallback.get_or_insert(info.process_id());
        }
        fallback
    }

    async fn fault_job(&mut self, job_id: JobId, reason: &str, elapsed_secs: Option<f64>) {
        let (job, owner) = match self.queue.fault(job_id) {
            Ok(faulted) => faulted,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to fault job");
                return;
            }
        };

        warn!(
            job_id = %job_id,
            process_id = ?owner.map(|p| p.index()),
            reason = reason,
            "Job faulted"
        );
        self.metrics.record_job("faulted", elapsed_secs);
        self.history.push(FaultedJobRecord::new(
            job_id,
            Some(job.model_name),
            owner,
            reason,
        ));
        if let Err(e) = self.jobs.report_fault(job_id, reason).await {
            error!(job_id = %job_id, error = %e, "Failed to report faulted job");
        }
    }

    async fn shutdown(&mut self) {
        info!(
            assigned = self.queue.assigned_len(),
            pending = self.queue.pending_len(),
            "Supervisor shutting down"
        );
        self.shutting_down = true;

        self.submissions.close();
        while let Ok(job) = self.submissions.try_recv() {
            self.accept(job);
        }
        self.publish_status();

        let deadline = Instant::now() + self.config.shutdown_timeout;
        while self.queue.assigned_len() > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.messages.recv()).await {
                Ok(Some(message)) => {
                    self.handle_message(message, Instant::now()).await;
                    self.publish_status();
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        in_flight = self.queue.assigned_len(),
                        "Shutdown timeout reached with jobs in flight"
                    );
                    break;
                }
            }
        }

        let leftover: Vec<(JobId, Option<ProcessId>)> = self
            .queue
            .assignments()
            .map(|a| (a.job.id, Some(a.process_id)))
            .chain(self.queue.pending().map(|job| (job.id, None)))
            .collect();
        for (job_id, owner) in leftover {
            if let Some(process_id) = owner {
                self.release_slot(process_id);
            }
            self.fault_job(job_id, SHUTDOWN_REASON, None).await;
        }

        for process_id in self.registry.ids() {
            if let Err(e) = self
                .launcher
                .dispatch(process_id, WorkerCommand::Shutdown)
                .await
            {
                debug!(process_id = %process_id, error = %e, "Shutdown command not delivered");
            }
            if let Err(e) = self.launcher.terminate(process_id).await {
                error!(process_id = %process_id, error = %e, "Failed to terminate worker");
            }
        }

        self.publish_status();
    }

    fn build_status(&mut self) -> SupervisorStatus {
        let stats = self.queue.stats();
        SupervisorStatus {
            processes: self.registry.snapshot(Instant::now()),
            pending_jobs: self.queue.pending_len(),
            pending_cost: self.queue.total_pending_cost(),
            assigned_jobs: self.queue.assigned_len(),
            jobs_enqueued: stats.enqueued,
            jobs_popped: stats.popped,
            jobs_completed: stats.completed,
            jobs_faulted: stats.faulted,
            recoveries: self.recovery.recoveries(),
            faulted_history: self.history.to_vec(),
            shutting_down: self.shutting_down,
            updated_at: chrono::Utc::now(),
        }
    }

    fn publish_status(&mut self) {
        let status = self.build_status();
        self.metrics
            .update_queue(status.pending_jobs, status.pending_cost);
        self.metrics.update_busy_workers(status.busy_workers());
        self.status_tx.send_replace(status);
    }
}
