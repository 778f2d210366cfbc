//! Messages exchanged between the supervisor and its workers.
//!
//! Workers report to the supervisor with [`WorkerMessage`]s and receive
//! [`WorkerCommand`]s. Both are plain serde types; OS-process workers carry
//! them as newline-delimited JSON over stdout/stdin, in-process workers send
//! them over tokio channels unchanged.
//!
//! Every worker message carries the `launch_id` it was produced under so
//! the supervisor can drop trailing messages from a launch it has already
//! replaced.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::process::{ProcessId, ProcessState};
use crate::scheduler::{Job, JobId};

/// Errors decoding or encoding protocol lines.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The line was not a valid message.
    #[error("Failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    /// The message could not be serialized.
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Tag describing what a heartbeat was emitted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatKind {
    /// A sampling step finished.
    StepProgress,
    /// The pipeline moved to another phase (e.g. sampling to decode).
    PipelinePhaseChange,
    /// Waiting on or running the shared final-stage decode.
    DecodeWait,
    /// Post-processing the generated image.
    PostProcessing,
}

impl HeartbeatKind {
    /// Short lowercase label used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            HeartbeatKind::StepProgress => "step_progress",
            HeartbeatKind::PipelinePhaseChange => "pipeline_phase_change",
            HeartbeatKind::DecodeWait => "decode_wait",
            HeartbeatKind::PostProcessing => "post_processing",
        }
    }
}

/// Liveness and optional progress signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub process_id: ProcessId,
    pub launch_id: u64,
    pub kind: HeartbeatKind,
    /// Completion percentage, 0..=100.
    #[serde(default)]
    pub percent_complete: Option<u8>,
}

/// Lifecycle transition reported by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangeMessage {
    pub process_id: ProcessId,
    pub launch_id: u64,
    pub new_state: ProcessState,
    /// Model resident after the transition, when the worker knows it.
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub info: Option<String>,
}

/// Memory usage report. Observability only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryReportMessage {
    pub process_id: ProcessId,
    pub launch_id: u64,
    pub ram_bytes: u64,
    #[serde(default)]
    pub vram_bytes: Option<u64>,
}

/// The worker finished (or gave up on) its current job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFinishedMessage {
    pub process_id: ProcessId,
    pub launch_id: u64,
    pub job_id: JobId,
    pub success: bool,
    #[serde(default)]
    pub info: Option<String>,
    #[serde(default)]
    pub time_elapsed_secs: f64,
}

/// Out-of-band exit notice, produced by the launcher rather than the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitedMessage {
    pub process_id: ProcessId,
    pub launch_id: u64,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// Decode-gate traffic from an OS-process worker. Answered by the launcher,
/// which owns the gate; never forwarded to the supervisor loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateMessage {
    pub process_id: ProcessId,
    pub launch_id: u64,
}

/// Inbound message from a worker slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Heartbeat(HeartbeatMessage),
    StateChange(StateChangeMessage),
    MemoryReport(MemoryReportMessage),
    JobFinished(JobFinishedMessage),
    Exited(ExitedMessage),
    /// Asks for one decode-gate slot; answered with `GateGranted` or
    /// `GateDenied`.
    GateRequest(GateMessage),
    /// Returns the slot, or withdraws a request the worker stopped waiting on.
    GateRelease(GateMessage),
}

impl WorkerMessage {
    /// Slot the message is about.
    pub fn process_id(&self) -> ProcessId {
        match self {
            WorkerMessage::Heartbeat(m) => m.process_id,
            WorkerMessage::StateChange(m) => m.process_id,
            WorkerMessage::MemoryReport(m) => m.process_id,
            WorkerMessage::JobFinished(m) => m.process_id,
            WorkerMessage::Exited(m) => m.process_id,
            WorkerMessage::GateRequest(m) | WorkerMessage::GateRelease(m) => m.process_id,
        }
    }

    /// Launch the message was produced under.
    pub fn launch_id(&self) -> u64 {
        match self {
            WorkerMessage::Heartbeat(m) => m.launch_id,
            WorkerMessage::StateChange(m) => m.launch_id,
            WorkerMessage::MemoryReport(m) => m.launch_id,
            WorkerMessage::JobFinished(m) => m.launch_id,
            WorkerMessage::Exited(m) => m.launch_id,
            WorkerMessage::GateRequest(m) | WorkerMessage::GateRelease(m) => m.launch_id,
        }
    }

    /// Parses one JSON line.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Decode` for malformed input.
    pub fn decode_line(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line.trim()).map_err(ProtocolError::Decode)
    }

    /// Serializes to one JSON line, without the trailing newline.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Encode` if serialization fails.
    pub fn encode_line(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

/// Outbound command to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Run this job to completion.
    RunJob { job: Job },
    /// Finish up and exit.
    Shutdown,
    /// The pending decode-gate request holds a slot now.
    GateGranted,
    /// The pending decode-gate request was not satisfied.
    GateDenied { reason: String },
}

impl WorkerCommand {
    /// Parses one JSON line.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Decode` for malformed input.
    pub fn decode_line(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line.trim()).map_err(ProtocolError::Decode)
    }

    /// Serializes to one JSON line, without the trailing newline.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Encode` if serialization fails.
    pub fn encode_line(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_wire_format() {
        let line = r#"{"type":"heartbeat","process_id":3,"launch_id":1,"kind":"decode_wait","percent_complete":100}"#;
        let message = WorkerMessage::decode_line(line).unwrap();

        assert_eq!(message.process_id(), ProcessId(3));
        assert_eq!(message.launch_id(), 1);
        match message {
            WorkerMessage::Heartbeat(h) => {
                assert_eq!(h.kind, HeartbeatKind::DecodeWait);
                assert_eq!(h.percent_complete, Some(100));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_without_progress() {
        let line = r#"{"type":"heartbeat","process_id":0,"launch_id":0,"kind":"pipeline_phase_change"}"#;
        let message = WorkerMessage::decode_line(line).unwrap();

        assert!(matches!(
            message,
            WorkerMessage::Heartbeat(HeartbeatMessage {
                percent_complete: None,
                ..
            })
        ));
    }

    #[test]
    fn test_state_change_wire_format() {
        let line = r#"{"type":"state_change","process_id":1,"launch_id":2,"new_state":"inference_starting","model_name":"sdxl"}"#;
        let message = WorkerMessage::decode_line(line).unwrap();

        match message {
            WorkerMessage::StateChange(s) => {
                assert_eq!(s.new_state, ProcessState::InferenceStarting);
                assert_eq!(s.model_name.as_deref(), Some("sdxl"));
                assert!(s.info.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(WorkerMessage::decode_line("not json").is_err());
        assert!(WorkerMessage::decode_line(r#"{"type":"unknown"}"#).is_err());
    }

    #[test]
    fn test_command_line_contains_job() {
        let job = Job::new("sd15");
        let id = job.id;
        let line = WorkerCommand::RunJob { job }.encode_line().unwrap();

        assert!(line.contains("\"type\":\"run_job\""));
        match WorkerCommand::decode_line(&line).unwrap() {
            WorkerCommand::RunJob { job } => assert_eq!(job.id, id),
            other => panic!("expected run_job, got {:?}", other),
        }
    }

    #[test]
    fn test_gate_wire_format() {
        let line = r#"{"type":"gate_request","process_id":2,"launch_id":5}"#;
        let message = WorkerMessage::decode_line(line).unwrap();
        assert_eq!(message.process_id(), ProcessId(2));
        assert_eq!(message.launch_id(), 5);
        assert!(matches!(message, WorkerMessage::GateRequest(_)));

        let granted = WorkerCommand::GateGranted.encode_line().unwrap();
        assert_eq!(granted, r#"{"type":"gate_granted"}"#);
        let denied = WorkerCommand::decode_line(r#"{"type":"gate_denied","reason":"timeout"}"#).unwrap();
        assert!(matches!(denied, WorkerCommand::GateDenied { ref reason } if reason == "timeout"));
    }
}
