//! Launcher running simulated workers as tokio tasks.
//!
//! Workers share one [`DecodeGate`], so gate contention between slots is
//! real. Termination aborts the task, which is as hard as it gets for a
//! task: the worker gets no chance to send anything else.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::gate::DecodeGate;
use crate::process::ProcessId;
use crate::protocol::{ExitedMessage, WorkerCommand, WorkerMessage};
use crate::worker::{SimulatedWorker, WorkerBehaviour, WorkerError};

use super::{LaunchError, ProcessLauncher};

type BehaviourFn = dyn Fn(ProcessId, u64) -> WorkerBehaviour + Send + Sync;

struct RunningWorker {
    launch_id: u64,
    commands: mpsc::Sender<WorkerCommand>,
    task: JoinHandle<()>,
}

/// Runs [`SimulatedWorker`]s inside the supervisor process.
pub struct InProcessLauncher {
    outbox: mpsc::Sender<WorkerMessage>,
    gate: DecodeGate,
    behaviour: Arc<BehaviourFn>,
    workers: Mutex<HashMap<ProcessId, RunningWorker>>,
}

impl InProcessLauncher {
    /// Creates a launcher whose workers all use `behaviour`.
    pub fn new(
        outbox: mpsc::Sender<WorkerMessage>,
        gate: DecodeGate,
        behaviour: WorkerBehaviour,
    ) -> Self {
        Self::with_behaviour_fn(outbox, gate, move |_, _| behaviour.clone())
    }

    /// Creates a launcher that picks the behaviour per slot and launch.
    pub fn with_behaviour_fn<F>(outbox: mpsc::Sender<WorkerMessage>, gate: DecodeGate, f: F) -> Self
    where
        F: Fn(ProcessId, u64) -> WorkerBehaviour + Send + Sync + 'static,
    {
        Self {
            outbox,
            gate,
            behaviour: Arc::new(f),
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// The gate shared by this launcher's workers.
    pub fn gate(&self) -> &DecodeGate {
        &self.gate
    }

    /// Number of slots with a live task.
    pub async fn running(&self) -> usize {
        self.workers
            .lock()
            .await
            .values()
            .filter(|w| !w.task.is_finished())
            .count()
    }
}

#[async_trait]
impl ProcessLauncher for InProcessLauncher {
    async fn spawn(
        &self,
        process_id: ProcessId,
        launch_id: u64,
        model_hint: Option<&str>,
    ) -> Result<(), LaunchError> {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let behaviour = (self.behaviour)(process_id, launch_id);
        let worker = SimulatedWorker::new(
            process_id,
            launch_id,
            behaviour,
            self.gate.clone(),
            self.outbox.clone(),
        )
        .with_preload(model_hint.map(String::from));

        let outbox = self.outbox.clone();
        let task = tokio::spawn(async move {
            let exit_code = match worker.run(cmd_rx).await {
                Ok(()) => 0,
                Err(WorkerError::ChannelClosed) => return,
                Err(e) => {
                    warn!(process_id = %process_id, error = %e, "Worker task failed");
                    1
                }
            };
            let _ = outbox
                .send(WorkerMessage::Exited(ExitedMessage {
                    process_id,
                    launch_id,
                    exit_code: Some(exit_code),
                }))
                .await;
        });

        let previous = self.workers.lock().await.insert(
            process_id,
            RunningWorker {
                launch_id,
                commands: cmd_tx,
                task,
            },
        );
        if let Some(previous) = previous {
            debug!(
                process_id = %process_id,
                launch_id = previous.launch_id,
                "Replacing worker still registered in slot"
            );
            previous.task.abort();
        }

        info!(process_id = %process_id, launch_id = launch_id, "Spawned in-process worker");
        Ok(())
    }

    async fn terminate(&self, process_id: ProcessId) -> Result<(), LaunchError> {
        let Some(worker) = self.workers.lock().await.remove(&process_id) else {
            debug!(process_id = %process_id, "Terminate requested for empty slot");
            return Ok(());
        };

        worker.task.abort();
        info!(
            process_id = %process_id,
            launch_id = worker.launch_id,
            "Terminated in-process worker"
        );
        Ok(())
    }

    async fn dispatch(
        &self,
        process_id: ProcessId,
        command: WorkerCommand,
    ) -> Result<(), LaunchError> {
        let commands = self
            .workers
            .lock()
            .await
            .get(&process_id)
            .map(|w| w.commands.clone())
            .ok_or(LaunchError::UnknownProcess(process_id))?;

        commands
            .send(command)
            .await
            .map_err(|_| LaunchError::DispatchFailed {
                process_id,
                message: "worker command channel closed".to_string(),
            })
    }
}
