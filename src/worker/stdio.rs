//! JSON-lines transport for a [`SimulatedWorker`] running as its own process.
//!
//! Commands arrive on stdin and messages leave on stdout, one JSON object
//! per line. Logs go to stderr so they never interleave with the protocol.
//! Gate replies are split off the command stream and handed to the worker's
//! remote gate, since they can arrive while the worker is mid-job.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

use crate::gate::DecodeGate;
use crate::process::ProcessId;
use crate::protocol::{WorkerCommand, WorkerMessage};

use super::{GateReply, SimulatedWorker, WorkerBehaviour, WorkerError};

/// Runs one worker launch over stdin/stdout.
///
/// The decode gate is held by the launcher on the other end of the pipes
/// and requested over the protocol.
///
/// # Errors
///
/// Returns the worker's error, or an IO error from the stdout writer.
pub async fn run_stdio(
    process_id: ProcessId,
    launch_id: u64,
    behaviour: WorkerBehaviour,
    model: Option<String>,
) -> Result<(), WorkerError> {
    let (out_tx, mut out_rx) = mpsc::channel::<WorkerMessage>(256);
    let (cmd_tx, cmd_rx) = mpsc::channel::<WorkerCommand>(16);
    let (reply_tx, reply_rx) = mpsc::channel::<GateReply>(4);

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = out_rx.recv().await {
            let mut line = message.encode_line()?;
            line.push('\n');
            stdout.write_all(line.as_bytes()).await?;
            stdout.flush().await?;
        }
        Ok::<(), WorkerError>(())
    });

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match WorkerCommand::decode_line(&line) {
                Ok(WorkerCommand::GateGranted) => {
                    if reply_tx.send(GateReply::Granted).await.is_err() {
                        break;
                    }
                }
                Ok(WorkerCommand::GateDenied { reason }) => {
                    if reply_tx.send(GateReply::Denied(reason)).await.is_err() {
                        break;
                    }
                }
                Ok(command) => {
                    if cmd_tx.send(command).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Ignoring malformed command"),
            }
        }
        Ok::<(), WorkerError>(())
    });

    // The local gate is unused once the remote gate is set.
    let worker = SimulatedWorker::new(process_id, launch_id, behaviour, DecodeGate::new(1), out_tx)
        .with_remote_gate(reply_rx)
        .with_preload(model);
    let result = worker.run(cmd_rx).await;

    reader.abort();
    // The worker owned the only sender, so the writer drains and stops.
    let written = match writer.await {
        Ok(written) => written,
        Err(e) => {
            warn!(error = %e, "Stdout writer task failed");
            Ok(())
        }
    };

    result.and(written)
}
