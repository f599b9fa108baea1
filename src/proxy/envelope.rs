//! Transport envelope between the session manager and a proxy worker.
//!
//! Messages are typed, ordered, and serde-serializable, so the default
//! in-process channel pair can be swapped for a pipe or IPC transport
//! without touching either endpoint. Every message carries the session id
//! for routing.

use crate::dap::types::SourceBreakpoint;
use crate::policy::AdapterSpawn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Everything the worker needs to bring one adapter up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPayload {
    pub session_id: String,
    pub adapter_spawn: AdapterSpawn,
    /// Adapter-shaped launch config (already normalized by the policy).
    pub launch_config: Value,
    /// What the caller explicitly asked for; None means unset.
    pub stop_on_entry: Option<bool>,
    pub script_path: String,
    /// Breakpoints recorded before the run started, grouped by file.
    #[serde(default)]
    pub initial_breakpoints: HashMap<String, Vec<SourceBreakpoint>>,
    /// Render the spawn command and terminate instead of connecting.
    #[serde(default)]
    pub dry_run_spawn: bool,
    pub log_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_dir: Option<PathBuf>,
}

/// One DAP request forwarded through the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DapCommand {
    pub request_id: u64,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ParentCommand {
    Init(Box<InitPayload>),
    Dap(DapCommand),
    Terminate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentEnvelope {
    pub session_id: String,
    pub command: ParentCommand,
}

/// Status tags the worker reports while moving through its state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum WorkerStatus {
    InitReceived,
    AdapterConnected,
    AdapterConfiguredAndLaunched,
    DryRunComplete { command: String, script: String },
    Terminated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerMessage {
    Status(WorkerStatus),
    DapResponse {
        request_id: u64,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    DapEvent {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerEnvelope {
    pub session_id: String,
    pub message: WorkerMessage,
}

/// Parent side of the bus.
pub struct ParentEndpoint {
    pub tx: mpsc::UnboundedSender<ParentEnvelope>,
    pub rx: mpsc::UnboundedReceiver<WorkerEnvelope>,
}

/// Worker side of the bus.
pub struct WorkerEndpoint {
    pub rx: mpsc::UnboundedReceiver<ParentEnvelope>,
    pub tx: mpsc::UnboundedSender<WorkerEnvelope>,
}

/// In-process bus: a pair of ordered unbounded channels.
pub fn channel_pair() -> (ParentEndpoint, WorkerEndpoint) {
    let (parent_tx, worker_rx) = mpsc::unbounded_channel();
    let (worker_tx, parent_rx) = mpsc::unbounded_channel();
    (
        ParentEndpoint {
            tx: parent_tx,
            rx: parent_rx,
        },
        WorkerEndpoint {
            rx: worker_rx,
            tx: worker_tx,
        },
    )
}
