//! Integration tests for the supervisor control loop.
//!
//! Two kinds of worker pools are used: real simulated workers through the
//! in-process launcher, and a scripted launcher where the test itself plays
//! the worker by pushing messages into the supervisor's channel.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use inference_supervisor::config::SupervisorConfig;
use inference_supervisor::gate::DecodeGate;
use inference_supervisor::job_source::{JobSource, JobSourceError};
use inference_supervisor::launcher::{InProcessLauncher, LaunchError, ProcessLauncher};
use inference_supervisor::process::{ProcessId, ProcessState};
use inference_supervisor::protocol::{
    HeartbeatKind, HeartbeatMessage, JobFinishedMessage, MemoryReportMessage, StateChangeMessage,
    WorkerCommand, WorkerMessage,
};
use inference_supervisor::scheduler::{Job, JobId, JobResult};
use inference_supervisor::supervisor::{message_channel, Supervisor, SupervisorHandle};
use inference_supervisor::worker::WorkerBehaviour;
use inference_supervisor::SupervisorStatus;

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct RecordingSource {
    faults: Mutex<Vec<(JobId, String)>>,
    completed: Mutex<Vec<JobResult>>,
}

impl RecordingSource {
    fn faults(&self) -> Vec<(JobId, String)> {
        self.faults.lock().unwrap().clone()
    }

    fn completed(&self) -> Vec<JobResult> {
        self.completed.lock().unwrap().clone()
    }
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

    async fn report_complete(&self, result: &JobResult) -> Result<(), JobSourceError> {
        self.completed.lock().unwrap().push(result.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Spawn(ProcessId, u64),
    Terminate(ProcessId),
    RunJob(ProcessId, JobId),
    Shutdown(ProcessId),
}

/// Launcher that only records what it was asked to do.
#[derive(Default)]
struct ScriptedLauncher {
    calls: Mutex<Vec<Call>>,
    fail_dispatch: bool,
}

impl ScriptedLauncher {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }
}

#[async_trait]
impl ProcessLauncher for ScriptedLauncher {
    async fn spawn(
        &self,
        process_id: ProcessId,
        launch_id: u64,
        _model_hint: Option<&str>,
    ) -> Result<(), LaunchError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Spawn(process_id, launch_id));
        Ok(())
    }

    async fn terminate(&self, process_id: ProcessId) -> Result<(), LaunchError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Terminate(process_id));
        Ok(())
    }

    async fn dispatch(
        &self,
        process_id: ProcessId,
        command: WorkerCommand,
    ) -> Result<(), LaunchError> {
        if self.fail_dispatch {
            return Err(LaunchError::DispatchFailed {
                process_id,
                message: "pipe closed".to_string(),
            });
        }
        let call = match command {
            WorkerCommand::RunJob { job } => Call::RunJob(process_id, job.id),
            WorkerCommand::Shutdown => Call::Shutdown(process_id),
            WorkerCommand::GateGranted | WorkerCommand::GateDenied { .. } => return Ok(()),
        };
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn test_config(workers: usize) -> SupervisorConfig {
    SupervisorConfig::default()
        .with_max_workers(workers)
        .with_inference_step_timeout(Duration::from_millis(300))
        .with_gate_acquire_timeout(Duration::from_millis(100))
        .with_sweep_interval(Duration::from_millis(20))
        .with_shutdown_timeout(Duration::from_millis(200))
}

fn fast_behaviour() -> WorkerBehaviour {
    WorkerBehaviour {
        step_interval: Duration::from_millis(5),
        preload_delay: Duration::from_millis(5),
        decode_duration: Duration::from_millis(5),
        post_process_duration: Duration::from_millis(5),
        gate_timeout: Duration::from_millis(100),
        stall_at: None,
        crash_at: None,
    }
}

async fn wait_status<F>(handle: &SupervisorHandle, pred: F) -> SupervisorStatus
where
    F: FnMut(&SupervisorStatus) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), handle.wait_until(pred))
        .await
        .expect("status condition not reached in time")
        .expect("supervisor stopped")
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn state(process_id: usize, launch_id: u64, new_state: ProcessState) -> WorkerMessage {
    WorkerMessage::StateChange(StateChangeMessage {
        process_id: ProcessId(process_id),
        launch_id,
        new_state,
        model_name: None,
        info: None,
    })
}

fn heartbeat(process_id: usize, launch_id: u64, percent: u8) -> WorkerMessage {
    WorkerMessage::Heartbeat(HeartbeatMessage {
        process_id: ProcessId(process_id),
        launch_id,
        kind: HeartbeatKind::StepProgress,
        percent_complete: Some(percent),
    })
}

fn finished(process_id: usize, launch_id: u64, job_id: JobId, success: bool) -> WorkerMessage {
    WorkerMessage::JobFinished(JobFinishedMessage {
        process_id: ProcessId(process_id),
        launch_id,
        job_id,
        success,
        info: None,
        time_elapsed_secs: 1.5,
    })
}

struct Scripted {
    handle: SupervisorHandle,
    outbox: mpsc::Sender<WorkerMessage>,
    launcher: Arc<ScriptedLauncher>,
    source: Arc<RecordingSource>,
    task: tokio::task::JoinHandle<inference_supervisor::error::Result<SupervisorStatus>>,
}

fn start_scripted(config: SupervisorConfig, launcher: ScriptedLauncher) -> Scripted {
    let (outbox, messages) = message_channel();
    let launcher = Arc::new(launcher);
    let source = Arc::new(RecordingSource::default());
    let (supervisor, handle) =
        Supervisor::new(config, launcher.clone(), source.clone(), messages).unwrap();
    let task = tokio::spawn(supervisor.run());
    Scripted {
        handle,
        outbox,
        launcher,
        source,
        task,
    }
}

impl Scripted {
    async fn send(&self, message: WorkerMessage) {
        self.outbox.send(message).await.unwrap();
    }

    /// Brings slot 0 to ready and hands it one job. Returns the job id.
    async fn running_job(&self) -> JobId {
        self.send(state(0, 0, ProcessState::WaitingForJob)).await;
        let job = Job::new("sd15");
        let job_id = job.id;
        self.handle.submit(job).await.unwrap();

        let launcher = self.launcher.clone();
        eventually(move || launcher.calls().contains(&Call::RunJob(ProcessId(0), job_id))).await;
        self.send(state(0, 0, ProcessState::InferenceStarting)).await;
        job_id
    }
}

// ============================================================================
// Simulated workers
// ============================================================================

fn start_in_process(
    config: SupervisorConfig,
    behaviour_for: impl Fn(ProcessId, u64) -> WorkerBehaviour + Send + Sync + 'static,
) -> (
    SupervisorHandle,
    Arc<RecordingSource>,
    tokio::task::JoinHandle<inference_supervisor::error::Result<SupervisorStatus>>,
) {
    let (outbox, messages) = message_channel();
    let gate = DecodeGate::new(config.effective_gate_capacity());
    let launcher = Arc::new(InProcessLauncher::with_behaviour_fn(outbox, gate, behaviour_for));
    let source = Arc::new(RecordingSource::default());
    let (supervisor, handle) = Supervisor::new(config, launcher, source.clone(), messages).unwrap();
    (handle, source, tokio::spawn(supervisor.run()))
}

#[tokio::test]
async fn test_healthy_pool_completes_every_job() {
    let (handle, source, task) = start_in_process(test_config(2), |_, _| fast_behaviour());

    for _ in 0..6 {
        handle
            .submit(Job::with_dimensions("sd15", 512, 512, 4))
            .await
            .unwrap();
    }
    let status = wait_status(&handle, |s| s.jobs_completed == 6).await;

    assert_eq!(status.jobs_faulted, 0);
    assert_eq!(status.recoveries, 0);
    assert_eq!(status.pending_cost, 0);
    assert_eq!(source.completed().len(), 6);

    handle.shutdown();
    let final_status = task.await.unwrap().unwrap();
    assert!(final_status.shutting_down);
    assert!(source.faults().is_empty());
}

#[tokio::test]
async fn test_stalled_worker_is_replaced_and_job_faulted() {
    let (handle, source, task) = start_in_process(test_config(1), |process_id, launch_id| {
        let behaviour = fast_behaviour();
        if process_id == ProcessId(0) && launch_id == 0 {
            behaviour.with_stall_at(50)
        } else {
            behaviour
        }
    });

    let stalled = Job::with_dimensions("sd15", 512, 512, 4);
    let stalled_id = stalled.id;
    handle.submit(stalled).await.unwrap();
    handle
        .submit(Job::with_dimensions("sd15", 512, 512, 4))
        .await
        .unwrap();

    let status = wait_status(&handle, |s| s.jobs_finished() == 2).await;

    assert_eq!(status.jobs_faulted, 1);
    assert_eq!(status.jobs_completed, 1);
    assert_eq!(status.recoveries, 1);
    assert_eq!(status.faulted_history[0].job_id, stalled_id);
    assert_eq!(status.faulted_history[0].reason, "progress stalled");
    assert_eq!(status.processes[0].launch_id, 1);
    assert_eq!(source.faults(), vec![(stalled_id, "progress stalled".to_string())]);

    handle.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_crashed_worker_is_replaced() {
    let (handle, source, task) = start_in_process(test_config(1), |process_id, launch_id| {
        let behaviour = fast_behaviour();
        if process_id == ProcessId(0) && launch_id == 0 {
            behaviour.with_crash_at(50)
        } else {
            behaviour
        }
    });

    handle
        .submit(Job::with_dimensions("sd15", 512, 512, 4))
        .await
        .unwrap();
    handle
        .submit(Job::with_dimensions("sd15", 512, 512, 4))
        .await
        .unwrap();

    let status = wait_status(&handle, |s| s.jobs_finished() == 2).await;

    assert_eq!(status.jobs_faulted, 1);
    assert_eq!(status.jobs_completed, 1);
    assert_eq!(status.recoveries, 1);
    let faults = source.faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].1, "worker crashed with exit code 1");

    handle.shutdown();
    task.await.unwrap().unwrap();
}

// ============================================================================
// Scripted workers
// ============================================================================

#[tokio::test]
async fn test_silent_worker_recovered_once_and_stale_messages_dropped() {
    let sup = start_scripted(test_config(1), ScriptedLauncher::default());
    let job_id = sup.running_job().await;

    // No heartbeats from here on.
    let status = wait_status(&sup.handle, |s| s.recoveries == 1).await;
    assert_eq!(status.jobs_faulted, 1);
    assert_eq!(status.processes[0].launch_id, 1);
    assert_eq!(status.processes[0].state, ProcessState::Starting);
    assert!(status.processes[0].recently_recovered);

    // Late messages from the replaced launch change nothing.
    sup.send(heartbeat(0, 0, 60)).await;
    sup.send(finished(0, 0, job_id, true)).await;
    sup.send(WorkerMessage::MemoryReport(MemoryReportMessage {
        process_id: ProcessId(0),
        launch_id: 1,
        ram_bytes: 1024,
        vram_bytes: None,
    }))
    .await;
    let status = wait_status(&sup.handle, |s| s.processes[0].memory.is_some()).await;
    assert_eq!(status.jobs_completed, 0);
    assert!(status.processes[0].percent_complete.is_none());
    assert!(sup.source.completed().is_empty());

    // Further sweeps inside the cool-down do nothing.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(sup.launcher.count(|c| matches!(c, Call::Terminate(_))), 1);
    assert_eq!(sup.launcher.count(|c| matches!(c, Call::Spawn(..))), 2);
    assert!(sup.launcher.calls().contains(&Call::Spawn(ProcessId(0), 1)));
    assert_eq!(sup.source.faults().len(), 1);

    sup.handle.shutdown();
    sup.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_progressing_worker_completes_job() {
    let sup = start_scripted(test_config(1), ScriptedLauncher::default());
    let job_id = sup.running_job().await;

    for percent in [10, 40, 70, 100] {
        tokio::time::sleep(Duration::from_millis(100)).await;
        sup.send(heartbeat(0, 0, percent)).await;
    }
    sup.send(state(0, 0, ProcessState::InferencePostProcessing)).await;
    sup.send(finished(0, 0, job_id, true)).await;
    sup.send(state(0, 0, ProcessState::InferenceComplete)).await;
    sup.send(state(0, 0, ProcessState::WaitingForJob)).await;

    let status = wait_status(&sup.handle, |s| s.jobs_completed == 1).await;
    assert_eq!(status.recoveries, 0);
    assert_eq!(status.assigned_jobs, 0);

    let completed = sup.source.completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].job_id, job_id);
    assert_eq!(completed[0].process_id, ProcessId(0));
    assert!((completed[0].time_elapsed_secs - 1.5).abs() < f64::EPSILON);

    sup.handle.shutdown();
    sup.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_failed_job_is_faulted_without_recovery() {
    let sup = start_scripted(test_config(1), ScriptedLauncher::default());
    let job_id = sup.running_job().await;

    sup.send(WorkerMessage::JobFinished(JobFinishedMessage {
        process_id: ProcessId(0),
        launch_id: 0,
        job_id,
        success: false,
        info: Some("out of memory".to_string()),
        time_elapsed_secs: 0.2,
    }))
    .await;
    sup.send(state(0, 0, ProcessState::WaitingForJob)).await;

    let status = wait_status(&sup.handle, |s| s.jobs_faulted == 1).await;
    assert_eq!(status.recoveries, 0);
    assert_eq!(sup.source.faults(), vec![(job_id, "out of memory".to_string())]);

    sup.handle.shutdown();
    sup.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reported_crash_recovers_slot() {
    let sup = start_scripted(test_config(1), ScriptedLauncher::default());
    let job_id = sup.running_job().await;

    sup.send(state(0, 0, ProcessState::Crashed)).await;

    let status = wait_status(&sup.handle, |s| s.recoveries == 1).await;
    assert_eq!(status.processes[0].launch_id, 1);
    assert_eq!(sup.source.faults(), vec![(job_id, "worker crashed".to_string())]);
    assert!(sup.launcher.calls().contains(&Call::Spawn(ProcessId(0), 1)));

    sup.handle.shutdown();
    sup.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_dispatch_failure_faults_job_and_relaunches() {
    let launcher = ScriptedLauncher {
        fail_dispatch: true,
        ..Default::default()
    };
    let sup = start_scripted(test_config(1), launcher);

    sup.send(state(0, 0, ProcessState::WaitingForJob)).await;
    let job = Job::new("sd15");
    let job_id = job.id;
    sup.handle.submit(job).await.unwrap();

    let status = wait_status(&sup.handle, |s| s.jobs_faulted == 1).await;
    assert_eq!(status.recoveries, 1);
    assert_eq!(status.faulted_history[0].reason, "job dispatch failed");
    assert_eq!(sup.source.faults()[0].0, job_id);
    assert!(sup.launcher.calls().contains(&Call::Spawn(ProcessId(0), 1)));

    sup.handle.shutdown();
    sup.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_faults_in_flight_and_pending_jobs() {
    let sup = start_scripted(test_config(1), ScriptedLauncher::default());
    let running = sup.running_job().await;
    let queued = Job::new("sdxl");
    let queued_id = queued.id;
    sup.handle.submit(queued).await.unwrap();
    wait_status(&sup.handle, |s| s.pending_jobs == 1).await;

    // Keep the worker healthy while shutdown waits on it.
    sup.send(heartbeat(0, 0, 10)).await;
    sup.handle.shutdown();
    let status = sup.task.await.unwrap().unwrap();

    assert!(status.shutting_down);
    assert_eq!(status.jobs_faulted, 2);
    assert_eq!(status.assigned_jobs, 0);
    assert_eq!(status.pending_jobs, 0);

    let mut faulted: Vec<JobId> = sup.source.faults().into_iter().map(|(id, _)| id).collect();
    faulted.sort();
    let mut expected = vec![running, queued_id];
    expected.sort();
    assert_eq!(faulted, expected);
    assert!(sup
        .source
        .faults()
        .iter()
        .all(|(_, reason)| reason == "supervisor shutdown"));

    let calls = sup.launcher.calls();
    assert!(calls.contains(&Call::Shutdown(ProcessId(0))));
    assert!(calls.contains(&Call::Terminate(ProcessId(0))));
}
