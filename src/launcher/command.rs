//! Launcher running workers as OS processes.
//!
//! Each worker is started as `<program> <args..> --process-id N --launch-id L
//! --gate-timeout S [--model M]` with piped stdin/stdout. Commands are written to stdin and
//! messages are read from stdout, one JSON object per line. Stderr is
//! inherited so worker logs land next to the supervisor's.
//!
//! A monitor task per child forwards decoded lines to the supervisor. When
//! stdout closes on its own, the monitor reaps the child and reports
//! `Exited` with its exit code. A terminated child is killed and reaped
//! without an `Exited` message: the supervisor already knows. A kill request
//! is honoured even while the monitor waits on a full supervisor channel.
//!
//! The launcher owns the [`DecodeGate`] for all of its children. A child's
//! `GateRequest` is answered with `GateGranted` or `GateDenied` on its
//! stdin, and the permit is held here until `GateRelease` or until the child
//! goes away. Gate traffic never reaches the supervisor.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::gate::{DecodeGate, DecodePermit, GateError};
use crate::process::ProcessId;
use crate::protocol::{ExitedMessage, WorkerCommand, WorkerMessage};

use super::{LaunchError, ProcessLauncher};

const REAP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_GATE_TIMEOUT: Duration = Duration::from_secs(120);

struct ChildHandle {
    launch_id: u64,
    commands: mpsc::Sender<WorkerCommand>,
    kill: oneshot::Sender<()>,
    monitor: JoinHandle<()>,
}

/// Spawns workers with `tokio::process`.
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
    outbox: mpsc::Sender<WorkerMessage>,
    gate: DecodeGate,
    gate_timeout: Duration,
    children: Mutex<HashMap<ProcessId, ChildHandle>>,
}

impl CommandLauncher {
    /// Creates a launcher for `program args..`.
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        outbox: mpsc::Sender<WorkerMessage>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            outbox,
            gate: DecodeGate::new(1),
            gate_timeout: DEFAULT_GATE_TIMEOUT,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Shares `gate` between this launcher's children. `timeout` bounds each
    /// acquisition and is passed to the children as `--gate-timeout`.
    pub fn with_gate(mut self, gate: DecodeGate, timeout: Duration) -> Self {
        self.gate = gate;
        self.gate_timeout = timeout;
        self
    }

    /// Creates a launcher from a full command line, program first.
    ///
    /// Returns `None` for an empty command line.
    pub fn from_command_line(
        command: &[String],
        outbox: mpsc::Sender<WorkerMessage>,
    ) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self::new(program.clone(), args.to_vec(), outbox))
    }

    fn build_command(&self, process_id: ProcessId, launch_id: u64, model: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--process-id")
            .arg(process_id.to_string())
            .arg("--launch-id")
            .arg(launch_id.to_string())
            .arg("--gate-timeout")
            .arg(self.gate_timeout.as_secs_f64().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        if let Some(model) = model {
            cmd.arg("--model").arg(model);
        }
        cmd
    }

    async fn kill(process_id: ProcessId, handle: ChildHandle) -> Result<(), LaunchError> {
        // The monitor may already be gone if the child exited on its own.
        let _ = handle.kill.send(());
        let mut monitor = handle.monitor;

        match tokio::time::timeout(REAP_TIMEOUT, &mut monitor).await {
            Ok(_) => {
                info!(
                    process_id = %process_id,
                    launch_id = handle.launch_id,
                    "Terminated worker process"
                );
                Ok(())
            }
            Err(_) => {
                monitor.abort();
                Err(LaunchError::TerminateFailed {
                    process_id,
                    message: format!("child not reaped within {:?}", REAP_TIMEOUT),
                })
            }
        }
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn spawn(
        &self,
        process_id: ProcessId,
        launch_id: u64,
        model_hint: Option<&str>,
    ) -> Result<(), LaunchError> {
        if let Some(previous) = self.children.lock().await.remove(&process_id) {
            debug!(
                process_id = %process_id,
                launch_id = previous.launch_id,
                "Killing worker still registered in slot"
            );
            if let Err(e) = Self::kill(process_id, previous).await {
                warn!(process_id = %process_id, error = %e, "Previous worker did not die cleanly");
            }
        }

        let mut child = self
            .build_command(process_id, launch_id, model_hint)
            .spawn()
            .map_err(|e| LaunchError::SpawnFailed {
                process_id,
                message: format!("{}: {}", self.program, e),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| LaunchError::SpawnFailed {
            process_id,
            message: "stdin not captured".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| LaunchError::SpawnFailed {
            process_id,
            message: "stdout not captured".to_string(),
        })?;

        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(write_commands(process_id, stdin, cmd_rx));
        let (broker, grants) = GateBroker::new(
            process_id,
            self.gate.clone(),
            self.gate_timeout,
            cmd_tx.clone(),
        );
        let monitor = tokio::spawn(monitor_child(
            process_id,
            launch_id,
            child,
            stdout,
            kill_rx,
            self.outbox.clone(),
            broker,
            grants,
        ));

        self.children.lock().await.insert(
            process_id,
            ChildHandle {
                launch_id,
                commands: cmd_tx,
                kill: kill_tx,
                monitor,
            },
        );

        info!(
            process_id = %process_id,
            launch_id = launch_id,
            program = %self.program,
            "Spawned worker process"
        );
        Ok(())
    }

    async fn terminate(&self, process_id: ProcessId) -> Result<(), LaunchError> {
        let Some(handle) = self.children.lock().await.remove(&process_id) else {
            debug!(process_id = %process_id, "Terminate requested for empty slot");
            return Ok(());
        };
        Self::kill(process_id, handle).await
    }

    async fn dispatch(
        &self,
        process_id: ProcessId,
        command: WorkerCommand,
    ) -> Result<(), LaunchError> {
        let commands = self
            .children
            .lock()
            .await
            .get(&process_id)
            .map(|c| c.commands.clone())
            .ok_or(LaunchError::UnknownProcess(process_id))?;

        commands
            .send(command)
            .await
            .map_err(|_| LaunchError::DispatchFailed {
                process_id,
                message: "worker stdin closed".to_string(),
            })
    }
}

async fn write_commands(
    process_id: ProcessId,
    mut stdin: ChildStdin,
    mut commands: mpsc::Receiver<WorkerCommand>,
) {
    while let Some(command) = commands.recv().await {
        let mut line = match command.encode_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(process_id = %process_id, error = %e, "Dropping unencodable command");
                continue;
            }
        };
        line.push('\n');

        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            debug!(process_id = %process_id, error = %e, "Worker stdin closed");
            break;
        }
    }
}

type Grant = (u64, Result<DecodePermit, GateError>);

/// One child's side of the shared decode gate.
///
/// Acquisition runs in its own task so a waiting child never blocks the
/// monitor. Each request gets a ticket; a grant for a withdrawn ticket is
/// dropped, which frees the slot again.
struct GateBroker {
    process_id: ProcessId,
    gate: DecodeGate,
    timeout: Duration,
    replies: mpsc::Sender<WorkerCommand>,
    grants: mpsc::Sender<Grant>,
    ticket: u64,
    awaiting: Option<u64>,
    pending: Option<JoinHandle<()>>,
    held: Option<DecodePermit>,
}

impl GateBroker {
    fn new(
        process_id: ProcessId,
        gate: DecodeGate,
        timeout: Duration,
        replies: mpsc::Sender<WorkerCommand>,
    ) -> (Self, mpsc::Receiver<Grant>) {
        let (grants, grant_rx) = mpsc::channel(4);
        let broker = Self {
            process_id,
            gate,
            timeout,
            replies,
            grants,
            ticket: 0,
            awaiting: None,
            pending: None,
            held: None,
        };
        (broker, grant_rx)
    }

    fn request(&mut self) {
        self.withdraw();
        if self.held.take().is_some() {
            debug!(process_id = %self.process_id, "Gate requested while held, releasing old permit");
        }

        self.ticket += 1;
        let ticket = self.ticket;
        let gate = self.gate.clone();
        let timeout = self.timeout;
        let grants = self.grants.clone();
        self.awaiting = Some(ticket);
        self.pending = Some(tokio::spawn(async move {
            let outcome = gate.acquire(timeout).await;
            // A closed channel means the monitor is gone; the permit drops here.
            let _ = grants.send((ticket, outcome)).await;
        }));
    }

    fn on_grant(&mut self, ticket: u64, outcome: Result<DecodePermit, GateError>) {
        if self.awaiting != Some(ticket) {
            debug!(process_id = %self.process_id, ticket = ticket, "Dropping stale gate grant");
            return;
        }
        self.awaiting = None;
        self.pending = None;

        match outcome {
            Ok(permit) => match self.replies.try_send(WorkerCommand::GateGranted) {
                Ok(()) => {
                    debug!(process_id = %self.process_id, "Decode gate granted");
                    self.held = Some(permit);
                }
                Err(e) => {
                    warn!(process_id = %self.process_id, error = %e, "Failed to deliver gate grant, releasing");
                }
            },
            Err(e) => {
                debug!(process_id = %self.process_id, error = %e, "Decode gate denied");
                let denied = WorkerCommand::GateDenied {
                    reason: e.to_string(),
                };
                if let Err(e) = self.replies.try_send(denied) {
                    warn!(process_id = %self.process_id, error = %e, "Failed to deliver gate denial");
                }
            }
        }
    }

    fn release(&mut self) {
        self.withdraw();
        if let Some(permit) = self.held.take() {
            debug!(
                process_id = %self.process_id,
                held_secs = permit.held_for().as_secs_f64(),
                "Decode gate released"
            );
            permit.release();
        }
    }

    fn withdraw(&mut self) {
        self.awaiting = None;
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }
}

impl Drop for GateBroker {
    fn drop(&mut self) {
        self.withdraw();
    }
}

async fn kill_and_reap(process_id: ProcessId, child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(process_id = %process_id, error = %e, "Kill failed, child already gone");
    }
    if let Err(e) = child.wait().await {
        debug!(process_id = %process_id, error = %e, "Failed to reap killed child");
    }
}

#[allow(clippy::too_many_arguments)]
async fn monitor_child(
    process_id: ProcessId,
    launch_id: u64,
    mut child: Child,
    stdout: ChildStdout,
    mut kill: oneshot::Receiver<()>,
    outbox: mpsc::Sender<WorkerMessage>,
    mut broker: GateBroker,
    mut grants: mpsc::Receiver<Grant>,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            biased;

            _ = &mut kill => {
                kill_and_reap(process_id, &mut child).await;
                return;
            }
            Some((ticket, outcome)) = grants.recv() => broker.on_grant(ticket, outcome),
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match WorkerMessage::decode_line(&line) {
                        Ok(message) if message.process_id() != process_id => {
                            warn!(
                                process_id = %process_id,
                                claimed = %message.process_id(),
                                "Dropping message claiming another slot"
                            );
                        }
                        Ok(WorkerMessage::GateRequest(_)) => broker.request(),
                        Ok(WorkerMessage::GateRelease(_)) => broker.release(),
                        Ok(message) => {
                            tokio::select! {
                                biased;

                                _ = &mut kill => {
                                    kill_and_reap(process_id, &mut child).await;
                                    return;
                                }
                                sent = outbox.send(message) => {
                                    if sent.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            warn!(process_id = %process_id, error = %e, "Ignoring malformed worker line");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(process_id = %process_id, error = %e, "Failed to read worker stdout");
                    break;
                }
            },
        }
    }

    // A child that is gone holds no gate slot.
    broker.release();

    let exit_code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(process_id = %process_id, error = %e, "Failed to reap worker");
            None
        }
    };
    info!(
        process_id = %process_id,
        launch_id = launch_id,
        exit_code = ?exit_code,
        "Worker process exited"
    );

    let exited = WorkerMessage::Exited(ExitedMessage {
        process_id,
        launch_id,
        exit_code,
    });
    tokio::select! {
        biased;

        // Terminated while reporting: the supervisor already knows.
        Ok(()) = &mut kill => {}
        sent = outbox.send(exited) => {
            if sent.is_err() {
                debug!(process_id = %process_id, "Supervisor gone, exit not reported");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::protocol::HeartbeatMessage;

    // Asks for the gate, reports whether it got it as percent_complete 1 or
    // 0, holds it briefly, then releases. `$1` is the process id.
    const GATE_SCRIPT: &str = r#"
echo "{\"type\":\"gate_request\",\"process_id\":$1,\"launch_id\":0}"
read reply
case "$reply" in *gate_granted*) p=1;; *) p=0;; esac
echo "{\"type\":\"heartbeat\",\"process_id\":$1,\"launch_id\":0,\"kind\":\"decode_wait\",\"percent_complete\":$p}"
sleep 0.3
echo "{\"type\":\"gate_release\",\"process_id\":$1,\"launch_id\":0}"
exec sleep 5
"#;

    fn shell(script: &str, outbox: mpsc::Sender<WorkerMessage>) -> CommandLauncher {
        CommandLauncher::new("sh", vec!["-c".to_string(), script.to_string()], outbox)
    }

    async fn next_heartbeat(rx: &mut mpsc::Receiver<WorkerMessage>) -> HeartbeatMessage {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            match message {
                WorkerMessage::Heartbeat(h) => return h,
                WorkerMessage::Exited(e) => panic!("worker exited early: {:?}", e),
                _ => continue,
            }
        }
    }

    #[test]
    fn test_command_passes_gate_timeout() {
        let (tx, _rx) = mpsc::channel(1);
        let launcher = CommandLauncher::new("worker", Vec::new(), tx)
            .with_gate(DecodeGate::new(2), Duration::from_millis(2500));

        let cmd = launcher.build_command(ProcessId(4), 7, Some("sdxl"));
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let at = args.iter().position(|a| a == "--gate-timeout").unwrap();
        assert_eq!(args[at + 1], "2.5");
        assert!(args.windows(2).any(|w| w[0] == "--process-id" && w[1] == "4"));
        assert!(args.windows(2).any(|w| w[0] == "--model" && w[1] == "sdxl"));
    }

    #[test]
    fn test_from_command_line() {
        let (tx, _rx) = mpsc::channel(1);
        assert!(CommandLauncher::from_command_line(&[], tx.clone()).is_none());

        let launcher = CommandLauncher::from_command_line(
            &["inference-supervisor".to_string(), "worker".to_string()],
            tx,
        )
        .unwrap();
        assert_eq!(launcher.program, "inference-supervisor");
        assert_eq!(launcher.args, vec!["worker".to_string()]);
    }

    #[tokio::test]
    async fn test_forwards_lines_and_reports_exit() {
        let (tx, mut rx) = mpsc::channel(16);
        let script = r#"echo '{"type":"heartbeat","process_id":0,"launch_id":2,"kind":"step_progress","percent_complete":5}'; echo 'garbage'; exit 3"#;
        let launcher = shell(script, tx);

        launcher.spawn(ProcessId(0), 2, None).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, WorkerMessage::Heartbeat(ref h) if h.percent_complete == Some(5)));

        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match second {
            WorkerMessage::Exited(e) => {
                assert_eq!(e.launch_id, 2);
                assert_eq!(e.exit_code, Some(3));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_drops_message_for_other_slot() {
        let (tx, mut rx) = mpsc::channel(16);
        let script = r#"echo '{"type":"heartbeat","process_id":9,"launch_id":0,"kind":"step_progress"}'"#;
        let launcher = shell(script, tx);

        launcher.spawn(ProcessId(1), 0, None).await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(message, WorkerMessage::Exited(_)));
    }

    #[tokio::test]
    async fn test_terminate_kills_without_exit_message() {
        let (tx, mut rx) = mpsc::channel(16);
        let launcher = shell("exec sleep 30", tx);

        launcher.spawn(ProcessId(0), 0, None).await.unwrap();
        launcher.terminate(ProcessId(0)).await.unwrap();
        launcher.terminate(ProcessId(0)).await.unwrap();

        let quiet = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(!matches!(quiet, Ok(Some(_))));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (tx, _rx) = mpsc::channel(16);
        let launcher = CommandLauncher::new("/nonexistent/worker-binary", Vec::new(), tx);

        let err = launcher.spawn(ProcessId(0), 0, None).await.unwrap_err();
        assert!(matches!(err, LaunchError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn test_dispatch_writes_to_stdin() {
        let (tx, mut rx) = mpsc::channel(16);
        // Echo back a heartbeat once a command line arrives.
        let script = r#"read line; echo '{"type":"heartbeat","process_id":0,"launch_id":0,"kind":"decode_wait"}'"#;
        let launcher = shell(script, tx);

        launcher.spawn(ProcessId(0), 0, None).await.unwrap();
        launcher
            .dispatch(ProcessId(0), WorkerCommand::Shutdown)
            .await
            .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(message, WorkerMessage::Heartbeat(_)));
    }

    #[tokio::test]
    async fn test_processes_share_decode_gate() {
        let gate = DecodeGate::new(1);
        let (tx, mut rx) = mpsc::channel(16);
        let launcher = shell(GATE_SCRIPT, tx).with_gate(gate.clone(), Duration::from_secs(2));

        launcher.spawn(ProcessId(0), 0, None).await.unwrap();
        let first = next_heartbeat(&mut rx).await;
        assert_eq!(first.process_id, ProcessId(0));
        assert_eq!(first.percent_complete, Some(1));
        assert_eq!(gate.available(), 0);

        let started = Instant::now();
        launcher.spawn(ProcessId(1), 0, None).await.unwrap();
        let second = next_heartbeat(&mut rx).await;
        assert_eq!(second.process_id, ProcessId(1));
        assert_eq!(second.percent_complete, Some(1));
        // Granted only after the first process released.
        assert!(started.elapsed() >= Duration::from_millis(150));

        launcher.terminate(ProcessId(0)).await.unwrap();
        launcher.terminate(ProcessId(1)).await.unwrap();
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn test_gate_denied_after_timeout() {
        let gate = DecodeGate::new(1);
        let held = gate.try_acquire().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let launcher = shell(GATE_SCRIPT, tx).with_gate(gate.clone(), Duration::from_millis(100));

        launcher.spawn(ProcessId(0), 0, None).await.unwrap();
        let heartbeat = next_heartbeat(&mut rx).await;
        assert_eq!(heartbeat.percent_complete, Some(0));

        launcher.terminate(ProcessId(0)).await.unwrap();
        held.release();
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn test_terminate_while_supervisor_channel_full() {
        // Never drained, so the monitor is parked on a full channel.
        let (tx, _rx) = mpsc::channel(1);
        let script = r#"while :; do echo '{"type":"heartbeat","process_id":0,"launch_id":0,"kind":"step_progress"}'; done"#;
        let launcher = shell(script, tx);

        launcher.spawn(ProcessId(0), 0, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        launcher.terminate(ProcessId(0)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
