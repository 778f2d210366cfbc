//! Recovery of stalled and crashed workers.
//!
//! A recovery is one indivisible step on the supervisor's control loop:
//!
//! 1. log the slot's diagnostics (ages, percentage, job or "none")
//! 2. fault the slot's job in the queue
//! 3. open a new launch for the slot and set its cool-down flag
//! 4. report the fault to the job source
//! 5. hard-terminate the old worker and spawn its replacement
//!
//! Steps 1-3 are synchronous bookkeeping and always complete together, so a
//! recovery can never leave a job both faulted and assigned. Failures in
//! steps 4-5 are logged and isolated to the slot.
//!
//! The cool-down flag makes repeated sweeps idempotent: a slot is recovered
//! at most once until its replacement reports `WaitingForJob`. The single
//! exception is a replacement that never leaves `Starting`, which is retried
//! once the `Starting` phase timeout expires.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::detector::{StallVerdict, StuckDetector};
use crate::job_source::JobSource;
use crate::launcher::ProcessLauncher;
use crate::metrics::MetricsCollector;
use crate::process::{ProcessId, ProcessRegistry, ProcessState, RegistryError};
use crate::scheduler::{JobId, JobQueue};

/// Why a slot was recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RecoveryReason {
    ProgressStall,
    HeartbeatSilence,
    PhaseTimeout { state: ProcessState },
    /// The worker exited or reported `Crashed`.
    WorkerCrash { exit_code: Option<i32> },
    /// A job could not be delivered to the worker.
    DispatchFailed,
}

impl RecoveryReason {
    /// Maps a detector verdict to a reason. `Healthy` maps to `None`.
    pub fn from_verdict(verdict: StallVerdict) -> Option<Self> {
        match verdict {
            StallVerdict::Healthy => None,
            StallVerdict::ProgressStall => Some(RecoveryReason::ProgressStall),
            StallVerdict::HeartbeatSilence => Some(RecoveryReason::HeartbeatSilence),
            StallVerdict::PhaseTimeout { state } => Some(RecoveryReason::PhaseTimeout { state }),
        }
    }

    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            RecoveryReason::ProgressStall => "progress_stall",
            RecoveryReason::HeartbeatSilence => "heartbeat_silence",
            RecoveryReason::PhaseTimeout { .. } => "phase_timeout",
            RecoveryReason::WorkerCrash { .. } => "worker_crash",
            RecoveryReason::DispatchFailed => "dispatch_failed",
        }
    }
}

impl fmt::Display for RecoveryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryReason::ProgressStall => f.write_str("progress stalled"),
            RecoveryReason::HeartbeatSilence => f.write_str("heartbeat silence"),
            RecoveryReason::PhaseTimeout { state } => write!(f, "timed out in {}", state),
            RecoveryReason::WorkerCrash {
                exit_code: Some(code),
            } => write!(f, "worker crashed with exit code {}", code),
            RecoveryReason::WorkerCrash { exit_code: None } => f.write_str("worker crashed"),
            RecoveryReason::DispatchFailed => f.write_str("job dispatch failed"),
        }
    }
}

/// Diagnostic record of one recovery.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryRecord {
    pub process_id: ProcessId,
    /// Launch that was torn down.
    pub launch_id: u64,
    /// Launch opened for the replacement.
    pub new_launch_id: u64,
    pub reason: RecoveryReason,
    pub state: ProcessState,
    pub heartbeat_age: Duration,
    pub progress_age: Duration,
    pub last_progress: Option<u8>,
    pub job_id: Option<JobId>,
    /// Model of the faulted job, if one was faulted.
    pub job_model: Option<String>,
    pub loaded_model: Option<String>,
    /// Whether a replacement was requested.
    pub respawned: bool,
    pub at: DateTime<Utc>,
}

/// Finds stalled slots and recovers them.
#[derive(Debug, Default)]
pub struct RecoveryController {
    detector: StuckDetector,
    metrics: MetricsCollector,
    recoveries: u64,
}

impl RecoveryController {
    pub fn new(detector: StuckDetector) -> Self {
        Self {
            detector,
            metrics: MetricsCollector::new(),
            recoveries: 0,
        }
    }

    pub fn detector(&self) -> &StuckDetector {
        &self.detector
    }

    /// Total recoveries performed.
    pub fn recoveries(&self) -> u64 {
        self.recoveries
    }

    /// Slots that need recovery at `now`, with the reason.
    ///
    /// Slots in cool-down are skipped unless their replacement is stuck in
    /// `Starting`.
    pub fn find_stalled(
        &self,
        registry: &ProcessRegistry,
        now: Instant,
    ) -> Vec<(ProcessId, RecoveryReason)> {
        registry
            .iter()
            .filter_map(|info| {
                let verdict = self.detector.evaluate(info, now);
                let reason = RecoveryReason::from_verdict(verdict)?;

                let retry_launch = matches!(
                    verdict,
                    StallVerdict::PhaseTimeout {
                        state: ProcessState::Starting
                    }
                );
                if info.recently_recovered() && !retry_launch {
                    debug!(
                        process_id = %info.process_id(),
                        verdict = %verdict,
                        "Skipping slot in recovery cool-down"
                    );
                    return None;
                }
                Some((info.process_id(), reason))
            })
            .collect()
    }

    /// Runs one detection sweep and recovers every stalled slot.
    pub async fn sweep_and_recover(
        &mut self,
        registry: &mut ProcessRegistry,
        queue: &mut JobQueue,
        launcher: &dyn ProcessLauncher,
        jobs: &dyn JobSource,
        now: Instant,
    ) -> Vec<RecoveryRecord> {
        let stalled = self.find_stalled(registry, now);
        let mut records = Vec::with_capacity(stalled.len());

        for (process_id, reason) in stalled {
            match self
                .recover(registry, queue, launcher, jobs, process_id, reason, true, now)
                .await
            {
                Ok(record) => records.push(record),
                Err(e) => error!(process_id = %process_id, error = %e, "Recovery failed"),
            }
        }
        records
    }

    /// Handles a worker that died or reported `Crashed`.
    ///
    /// A worker that dies before ever leaving `Starting` is not respawned
    /// right away; the `Starting` phase timeout retries it later.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is unknown or retired.
    pub async fn recover_crashed(
        &mut self,
        registry: &mut ProcessRegistry,
        queue: &mut JobQueue,
        launcher: &dyn ProcessLauncher,
        jobs: &dyn JobSource,
        process_id: ProcessId,
        exit_code: Option<i32>,
        now: Instant,
    ) -> Result<RecoveryRecord, RegistryError> {
        let respawn = registry.get(process_id)?.lifecycle_state() != ProcessState::Starting;
        if !respawn {
            warn!(
                process_id = %process_id,
                exit_code = ?exit_code,
                "Worker died before becoming ready, deferring relaunch"
            );
        }
        self.recover(
            registry,
            queue,
            launcher,
            jobs,
            process_id,
            RecoveryReason::WorkerCrash { exit_code },
            respawn,
            now,
        )
        .await
    }

    /// Recovers one slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is unknown or retired. Launcher and job
    /// source failures are logged, not returned.
    #[allow(clippy::too_many_arguments)]
    pub async fn recover(
        &mut self,
        registry: &mut ProcessRegistry,
        queue: &mut JobQueue,
        launcher: &dyn ProcessLauncher,
        jobs: &dyn JobSource,
        process_id: ProcessId,
        reason: RecoveryReason,
        respawn: bool,
        now: Instant,
    ) -> Result<RecoveryRecord, RegistryError> {
        let info = registry.get(process_id)?;
        let launch_id = info.launch_id();
        let state = info.lifecycle_state();
        let heartbeat_age = info.heartbeat_age(now);
        let progress_age = info.progress_age(now);
        let last_progress = info.last_progress_value();
        let loaded_model = info.loaded_model_name().map(String::from);
        // The queue is the owner of record; the slot may not have seen the
        // assignment yet.
        let job_id = info
            .current_job_reference()
            .or_else(|| queue.assignment_for(process_id).map(|a| a.job.id));

        warn!(
            process_id = %process_id,
            launch_id = launch_id,
            reason = %reason,
            state = %state,
            heartbeat_age_secs = heartbeat_age.as_secs_f64(),
            progress_age_secs = progress_age.as_secs_f64(),
            last_progress = ?last_progress,
            job_id = %job_id.map_or_else(|| "none".to_string(), |id| id.to_string()),
            "Recovering worker"
        );

        let job_model = match job_id.map(|id| queue.fault(id)) {
            Some(Ok((job, _owner))) => Some(job.model_name),
            Some(Err(e)) => {
                debug!(process_id = %process_id, error = %e, "Job already left the queue");
                None
            }
            None => None,
        };
        let faulted = job_model.is_some();

        let new_launch_id = registry.begin_recovery(process_id, now)?;
        self.recoveries += 1;
        self.metrics.record_recovery(reason.label());
        if faulted {
            self.metrics.record_job("faulted", None);
        }

        if let (true, Some(job_id)) = (faulted, job_id) {
            if let Err(e) = jobs.report_fault(job_id, &reason.to_string()).await {
                error!(job_id = %job_id, error = %e, "Failed to report faulted job");
            }
        }

        if let Err(e) = launcher.terminate(process_id).await {
            error!(process_id = %process_id, error = %e, "Failed to terminate worker");
        }
        if respawn {
            if let Err(e) = launcher
                .spawn(process_id, new_launch_id, loaded_model.as_deref())
                .await
            {
                error!(
                    process_id = %process_id,
                    launch_id = new_launch_id,
                    error = %e,
                    "Failed to spawn replacement worker"
                );
            }
        }

        Ok(RecoveryRecord {
            process_id,
            launch_id,
            new_launch_id,
            reason,
            state,
            heartbeat_age,
            progress_age,
            last_progress,
            job_id: if faulted { job_id } else { None },
            job_model,
            loaded_model,
            respawned: respawn,
            at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::StallTimeouts;
    use crate::job_source::JobSourceError;
    use crate::launcher::LaunchError;
    use crate::protocol::{HeartbeatKind, WorkerCommand};
    use crate::scheduler::{Job, JobResult};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingLauncher {
        calls: Mutex<Vec<String>>,
        fail_spawn: bool,
    }

    impl RecordingLauncher {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProcessLauncher for RecordingLauncher {
        async fn spawn(
            &self,
            process_id: ProcessId,
            launch_id: u64,
            model_hint: Option<&str>,
        ) -> Result<(), LaunchError> {
            self.calls.lock().unwrap().push(format!(
                "spawn {} {} {}",
                process_id,
                launch_id,
                model_hint.unwrap_or("-")
            ));
            if self.fail_spawn {
                return Err(LaunchError::SpawnFailed {
                    process_id,
                    message: "no binary".to_string(),
                });
            }
            Ok(())
        }

        async fn terminate(&self, process_id: ProcessId) -> Result<(), LaunchError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("terminate {}", process_id));
            Ok(())
        }

        async fn dispatch(&self, _: ProcessId, _: WorkerCommand) -> Result<(), LaunchError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSource {
        faults: Mutex<Vec<(JobId, String)>>,
    }

    #[async_trait]
    impl JobSource for RecordingSource {
        async fn report_fault(&self, job_id: JobId, reason: &str) -> Result<(), JobSourceError> {
            self.faults
                .lock()
                .unwrap()
                .push((job_id, reason.to_string()));
            Ok(())
        }

        async fn report_complete(&self, _: &JobResult) -> Result<(), JobSourceError> {
            Ok(())
        }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn controller() -> RecoveryController {
        RecoveryController::new(StuckDetector::new(StallTimeouts {
            inference_step: secs(5),
            preload: secs(30),
            download: secs(60),
            post_process: secs(30),
        }))
    }

    struct Fixture {
        registry: ProcessRegistry,
        queue: JobQueue,
        launcher: RecordingLauncher,
        source: RecordingSource,
        t0: Instant,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: ProcessRegistry::new(),
                queue: JobQueue::new(),
                launcher: RecordingLauncher::default(),
                source: RecordingSource::default(),
                t0: Instant::now(),
            }
        }

        fn at(&self, n: u64) -> Instant {
            self.t0 + secs(n)
        }

        /// Registers a slot that took a job and froze at 50%, heartbeating
        /// every 2s until t=11.
        fn frozen_worker(&mut self) -> (ProcessId, JobId) {
            let t0 = self.t0;
            let id = self.registry.register(t0);
            self.registry
                .apply_state_change_at(id, ProcessState::WaitingForJob, Some("sd15".into()), None, t0)
                .unwrap();

            let job = Job::new("sd15");
            let job_id = job.id;
            self.queue.enqueue(job).unwrap();
            self.queue.dequeue(job_id, id, t0).unwrap();
            self.registry.assign_job_at(id, job_id, t0).unwrap();
            self.registry
                .apply_state_change_at(id, ProcessState::InferenceStarting, None, None, t0)
                .unwrap();

            for t in (1..=11).step_by(2) {
                self.registry
                    .record_heartbeat_at(id, HeartbeatKind::StepProgress, Some(50), self.at(t))
                    .unwrap();
            }
            (id, job_id)
        }

        async fn sweep(&mut self, ctl: &mut RecoveryController, n: u64) -> Vec<RecoveryRecord> {
            let now = self.at(n);
            ctl.sweep_and_recover(
                &mut self.registry,
                &mut self.queue,
                &self.launcher,
                &self.source,
                now,
            )
            .await
        }
    }

    #[tokio::test]
    async fn test_sweep_recovers_frozen_worker() {
        let mut fx = Fixture::new();
        let mut ctl = controller();
        let (id, job_id) = fx.frozen_worker();

        let records = fx.sweep(&mut ctl, 11).await;

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.reason, RecoveryReason::ProgressStall);
        assert_eq!(record.last_progress, Some(50));
        assert_eq!(record.job_id, Some(job_id));
        assert_eq!(record.new_launch_id, record.launch_id + 1);
        assert!(record.respawned);

        assert_eq!(fx.launcher.calls(), vec!["terminate 0", "spawn 0 1 sd15"]);
        assert_eq!(fx.source.faults.lock().unwrap().len(), 1);
        assert!(!fx.queue.contains(job_id));
        assert_eq!(fx.queue.stats().faulted, 1);

        let info = fx.registry.get(id).unwrap();
        assert_eq!(info.lifecycle_state(), ProcessState::Starting);
        assert!(info.recently_recovered());
        assert!(info.current_job_reference().is_none());
    }

    #[tokio::test]
    async fn test_repeated_sweeps_recover_once() {
        let mut fx = Fixture::new();
        let mut ctl = controller();
        fx.frozen_worker();

        fx.sweep(&mut ctl, 11).await;
        let second = fx.sweep(&mut ctl, 12).await;
        let third = fx.sweep(&mut ctl, 20).await;

        assert!(second.is_empty());
        assert!(third.is_empty());
        assert_eq!(fx.launcher.calls().len(), 2);
        assert_eq!(fx.source.faults.lock().unwrap().len(), 1);
        assert_eq!(ctl.recoveries(), 1);
    }

    #[tokio::test]
    async fn test_healthy_worker_untouched() {
        let mut fx = Fixture::new();
        let mut ctl = controller();
        let id = fx.registry.register(fx.t0);
        fx.registry
            .apply_state_change_at(id, ProcessState::InferenceStarting, None, None, fx.t0)
            .unwrap();
        for t in 1..=10u8 {
            fx.registry
                .record_heartbeat_at(id, HeartbeatKind::StepProgress, Some(t * 10), fx.at(t.into()))
                .unwrap();
        }

        assert!(fx.sweep(&mut ctl, 10).await.is_empty());
        assert!(fx.launcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_silent_worker_without_job() {
        let mut fx = Fixture::new();
        let mut ctl = controller();
        let id = fx.registry.register(fx.t0);
        fx.registry
            .apply_state_change_at(id, ProcessState::InferenceStarting, None, None, fx.t0)
            .unwrap();

        let records = fx.sweep(&mut ctl, 6).await;

        assert_eq!(records.len(), 1);
        assert!(records[0].job_id.is_none());
        assert!(fx.source.faults.lock().unwrap().is_empty());
        assert_eq!(fx.launcher.calls(), vec!["terminate 0", "spawn 0 1 -"]);
    }

    #[tokio::test]
    async fn test_replacement_recovered_again_after_ready() {
        let mut fx = Fixture::new();
        let mut ctl = controller();
        let (id, _) = fx.frozen_worker();
        fx.sweep(&mut ctl, 11).await;

        fx.registry
            .apply_state_change_at(id, ProcessState::WaitingForJob, None, None, fx.at(12))
            .unwrap();
        assert!(!fx.registry.get(id).unwrap().recently_recovered());
        fx.registry
            .apply_state_change_at(id, ProcessState::InferenceStarting, None, None, fx.at(13))
            .unwrap();

        let records = fx.sweep(&mut ctl, 19).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, RecoveryReason::ProgressStall);
        assert_eq!(records[0].new_launch_id, 2);
    }

    #[tokio::test]
    async fn test_crash_before_ready_defers_relaunch() {
        let mut fx = Fixture::new();
        let mut ctl = controller();
        let id = fx.registry.register(fx.t0);

        let now = fx.at(1);
        let record = ctl
            .recover_crashed(
                &mut fx.registry,
                &mut fx.queue,
                &fx.launcher,
                &fx.source,
                id,
                Some(1),
                now,
            )
            .await
            .unwrap();
        assert!(!record.respawned);
        assert_eq!(fx.launcher.calls(), vec!["terminate 0"]);

        // Cool-down does not block the Starting retry.
        assert!(fx.sweep(&mut ctl, 20).await.is_empty());
        let retried = fx.sweep(&mut ctl, 32).await;
        assert_eq!(retried.len(), 1);
        assert_eq!(
            retried[0].reason,
            RecoveryReason::PhaseTimeout {
                state: ProcessState::Starting
            }
        );
        assert_eq!(fx.launcher.calls().last().unwrap(), "spawn 0 2 -");
    }

    #[tokio::test]
    async fn test_crash_mid_job_faults_and_respawns() {
        let mut fx = Fixture::new();
        let mut ctl = controller();
        let (id, job_id) = fx.frozen_worker();

        let now = fx.at(3);
        let record = ctl
            .recover_crashed(
                &mut fx.registry,
                &mut fx.queue,
                &fx.launcher,
                &fx.source,
                id,
                Some(137),
                now,
            )
            .await
            .unwrap();

        assert!(record.respawned);
        assert_eq!(record.job_id, Some(job_id));
        let faults = fx.source.faults.lock().unwrap();
        assert_eq!(faults[0].1, "worker crashed with exit code 137");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_isolated() {
        let mut fx = Fixture::new();
        fx.launcher.fail_spawn = true;
        let mut ctl = controller();
        let (first, _) = fx.frozen_worker();
        let second = fx.registry.register(fx.t0);
        fx.registry
            .apply_state_change_at(second, ProcessState::InferenceStarting, None, None, fx.t0)
            .unwrap();

        let records = fx.sweep(&mut ctl, 11).await;

        assert_eq!(records.len(), 2);
        assert!(fx.registry.get(first).unwrap().recently_recovered());
        assert!(fx.registry.get(second).unwrap().recently_recovered());
    }

    #[tokio::test]
    async fn test_unknown_slot_is_an_error() {
        let mut fx = Fixture::new();
        let mut ctl = controller();

        let result = ctl
            .recover(
                &mut fx.registry,
                &mut fx.queue,
                &fx.launcher,
                &fx.source,
                ProcessId(7),
                RecoveryReason::DispatchFailed,
                true,
                fx.t0,
            )
            .await;
        assert!(matches!(result, Err(RegistryError::ProcessNotFound(_))));
        assert!(fx.launcher.calls().is_empty());
    }

    #[test]
    fn test_reason_labels() {
        assert_eq!(
            RecoveryReason::from_verdict(StallVerdict::HeartbeatSilence),
            Some(RecoveryReason::HeartbeatSilence)
        );
        assert_eq!(RecoveryReason::from_verdict(StallVerdict::Healthy), None);
        assert_eq!(
            RecoveryReason::PhaseTimeout {
                state: ProcessState::DownloadingModel
            }
            .label(),
            "phase_timeout"
        );
        assert_eq!(
            RecoveryReason::WorkerCrash { exit_code: None }.to_string(),
            "worker crashed"
        );
    }
}
