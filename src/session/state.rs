//! Session data model: lifecycle and per-run execution state, plus the
//! breakpoint book-keeping a session owns.

use crate::dap::types::SourceBreakpoint;
use crate::policy::ToolchainReport;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;
use uuid::Uuid;

/// Lifecycle state, persistent across runs. Terminated is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Created,
    Active,
    Terminated,
}

/// Execution state of the current debug run:
/// Created → Initializing → Running ↔ Paused → Stopped | Error.
/// Error ends the run, not the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ExecutionState {
    Created,
    Initializing,
    Running,
    Paused { thread_id: i64, reason: String },
    Stopped,
    Error { message: String },
}

impl ExecutionState {
    pub fn is_paused(&self) -> bool {
        matches!(self, ExecutionState::Paused { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionState::Stopped | ExecutionState::Error { .. })
    }

    pub fn paused_thread(&self) -> Option<i64> {
        match self {
            ExecutionState::Paused { thread_id, .. } => Some(*thread_id),
            _ => None,
        }
    }
}

/// One user breakpoint. The file path is stored exactly as supplied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointRecord {
    pub id: String,
    pub file: String,
    pub line: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Tri-state: None = unknown, Some(bool) = adapter-backed heuristic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition_verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition_error: Option<String>,
}

impl BreakpointRecord {
    pub fn new(file: String, line: i64, condition: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            file,
            line,
            condition,
            verified: false,
            message: None,
            condition_verified: None,
            condition_error: None,
        }
    }

    pub fn to_source_breakpoint(&self) -> SourceBreakpoint {
        SourceBreakpoint {
            line: self.line,
            column: None,
            condition: self.condition.clone(),
            hit_condition: None,
        }
    }

    /// Fold in one adapter verification result. Condition verification is a
    /// heuristic: a verified breakpoint with a condition counts as a
    /// verified condition; an unverified one surfaces the adapter message
    /// as the condition error.
    pub fn apply_verification(&mut self, dap: &crate::dap::types::Breakpoint) {
        self.verified = dap.verified;
        if let Some(line) = dap.line {
            self.line = line;
        }
        self.message = dap.message.clone();
        if self.condition.is_some() {
            self.condition_verified = Some(dap.verified);
            if !dap.verified {
                if let Some(message) = &dap.message {
                    self.condition_error = Some(message.clone());
                }
            } else {
                self.condition_error = None;
            }
        }
    }
}

/// A named, stateful debugging context.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub language: String,
    pub name: String,
    pub executable_hint: Option<String>,
    pub policy_id: String,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    pub log_dir: PathBuf,
    pub lifecycle: Lifecycle,
    pub execution: ExecutionState,
    /// Breakpoints keyed by internal breakpoint id.
    pub breakpoints: HashMap<String, BreakpointRecord>,
    pub toolchain_report: Option<ToolchainReport>,
    /// Effective stopOnEntry for the current run.
    pub stop_on_entry: bool,
}

impl Session {
    pub fn new(
        language: String,
        name: String,
        executable_hint: Option<String>,
        policy_id: String,
        base_log_dir: &std::path::Path,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let now = SystemTime::now();
        let log_dir = base_log_dir.join(&id);
        Self {
            id,
            language,
            name,
            executable_hint,
            policy_id,
            created_at: now,
            updated_at: now,
            log_dir,
            lifecycle: Lifecycle::Created,
            execution: ExecutionState::Created,
            breakpoints: HashMap::new(),
            toolchain_report: None,
            stop_on_entry: false,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = SystemTime::now();
    }

    pub fn set_execution(&mut self, execution: ExecutionState) {
        self.execution = execution;
        self.touch();
    }

    pub fn is_terminated(&self) -> bool {
        self.lifecycle == Lifecycle::Terminated
    }

    /// All breakpoints for one file, in line order.
    pub fn breakpoints_in_file(&self, file: &str) -> Vec<BreakpointRecord> {
        let mut bps: Vec<BreakpointRecord> = self
            .breakpoints
            .values()
            .filter(|bp| bp.file == file)
            .cloned()
            .collect();
        bps.sort_by_key(|bp| bp.line);
        bps
    }

    /// All breakpoints grouped by file, ready for `setBreakpoints`.
    pub fn grouped_breakpoints(&self) -> HashMap<String, Vec<SourceBreakpoint>> {
        let mut grouped: HashMap<String, Vec<BreakpointRecord>> = HashMap::new();
        for bp in self.breakpoints.values() {
            grouped.entry(bp.file.clone()).or_default().push(bp.clone());
        }
        grouped
            .into_iter()
            .map(|(file, mut bps)| {
                bps.sort_by_key(|bp| bp.line);
                (
                    file,
                    bps.iter().map(BreakpointRecord::to_source_breakpoint).collect(),
                )
            })
            .collect()
    }
}
