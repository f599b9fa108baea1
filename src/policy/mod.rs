//! Per-adapter behavior bundles.
//!
//! Every debugger quirk the bridge has to absorb (command queueing before
//! `initialized`, reverse `startDebugging`, launch-config shapes, readiness
//! criteria) lives behind the [`AdapterPolicy`] trait so the proxy worker
//! and session manager stay free of per-adapter branches. One policy per
//! adapter family; selection happens once, at worker init, by matching the
//! adapter spawn command against the ordered registry.

pub mod codelldb;
pub mod debugpy;
pub mod default;
pub mod js_debug;
pub mod lldb_dap;
pub mod mock;

use crate::dap::client::DapClient;
use crate::dap::types::Request;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// How the worker reaches the adapter once spawned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectMode {
    /// DAP over the adapter's stdin/stdout (lldb-dap).
    Stdio,
    /// DAP over a TCP connection to localhost.
    Tcp { port: u16 },
}

/// Canonical adapter invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterSpawn {
    /// None means attach to an endpoint somebody else is listening on
    /// (scripted adapters in tests).
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub connect: ConnectMode,
}

impl AdapterSpawn {
    /// The command line as it would be typed, for dry-run reporting.
    pub fn command_line(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(cmd) = &self.command {
            parts.push(cmd.clone());
        }
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    fn haystack(&self) -> String {
        let mut text = self.command.clone().unwrap_or_default();
        for arg in &self.args {
            text.push(' ');
            text.push_str(arg);
        }
        text
    }

    pub fn mentions(&self, needle: &str) -> bool {
        self.haystack().contains(needle)
    }
}

/// Inputs for building an adapter spawn config.
#[derive(Debug, Clone)]
pub struct SpawnContext<'a> {
    pub language: &'a str,
    /// Caller-supplied executable hint (interpreter or adapter binary).
    pub executable_hint: Option<&'a str>,
    pub port: u16,
    /// Prefer bundled install locations (container images).
    pub container_mode: bool,
}

/// Inputs for normalizing a launch config into the adapter's shape.
#[derive(Debug, Clone)]
pub struct LaunchContext<'a> {
    pub program: &'a str,
    /// What the caller explicitly asked for; None means they left it unset.
    pub stop_on_entry: Option<bool>,
}

/// Per-run bag of flags the policy reads and mutates through its hooks.
#[derive(Debug, Default, Clone)]
pub struct AdapterState {
    pub initialize_responded: bool,
    pub initialized_event_seen: bool,
    pub launch_sent: bool,
    pub launch_responded: bool,
    pub configuration_done_sent: bool,
    /// A reverse `startDebugging` arrived and the child is not configured yet.
    pub child_adoption_pending: bool,
    pub child_sessions: u32,
    pub queued_commands: u32,
}

/// What `initialize`/`launch` handling needs from the policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitializationBehavior {
    /// Hold `configurationDone` until the policy-driven drain.
    pub defer_config_done: bool,
    /// Enforce a stop after launch by polling `threads` and pausing.
    pub requires_initial_stop: bool,
    /// Inject `runtimeExecutable` into the launch config.
    pub add_runtime_executable: bool,
    /// Track the `initialize` response in adapter state.
    pub track_initialize_response: bool,
}

/// Fine-grained per-command queueing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDecision {
    pub should_queue: bool,
    /// Inject a silent, debounced `configurationDone` when draining.
    pub should_defer_config_done: bool,
    pub reason: &'static str,
}

impl QueueDecision {
    pub fn pass() -> Self {
        Self {
            should_queue: false,
            should_defer_config_done: false,
            reason: "no queueing required",
        }
    }

    pub fn queue(reason: &'static str) -> Self {
        Self {
            should_queue: true,
            should_defer_config_done: false,
            reason,
        }
    }
}

/// A command parked by the queueing rules, drained in policy order.
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub request_id: u64,
    pub command: String,
    pub arguments: Option<Value>,
    /// Executed without emitting a response upstream (injected commands).
    pub silent: bool,
}

/// Child session adoption requested by a reverse request.
#[derive(Debug, Clone)]
pub struct ChildSpawnRequest {
    pub pending_target_id: Option<String>,
    pub configuration: Value,
}

/// Outcome of offering a reverse request to the policy.
#[derive(Debug, Clone, Default)]
pub struct ReverseRequestOutcome {
    pub handled: bool,
    pub create_child_session: Option<ChildSpawnRequest>,
}

/// Execution snapshot the readiness predicate sees.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadinessCheck {
    pub paused: bool,
    pub running: bool,
    /// `adapter_configured_and_launched` was observed.
    pub configured: bool,
    pub stop_on_entry: bool,
}

/// Structured toolchain-validation record attached to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolchainReport {
    pub behavior: ToolchainBehavior,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolchainBehavior {
    Continue,
    Warn,
    Error,
}

impl ToolchainReport {
    pub fn can_continue(&self) -> bool {
        self.behavior != ToolchainBehavior::Error
    }
}

/// Per-adapter behavior bundle. All hooks except the handshake are pure
/// decisions; mutable per-run state lives in [`AdapterState`] and is only
/// touched through the `update_state_*` hooks.
#[async_trait]
pub trait AdapterPolicy: Send + Sync {
    /// Stable policy identifier (used in logs and session records).
    fn id(&self) -> &'static str;

    /// Pattern-match the adapter invocation to identify the family.
    fn matches_adapter(&self, spawn: &AdapterSpawn) -> bool;

    /// Whether this policy is the default for a language tag.
    fn matches_language(&self, language: &str) -> bool;

    /// Canonical adapter invocation for this family.
    fn build_spawn(&self, ctx: &SpawnContext<'_>) -> Result<AdapterSpawn>;

    /// `adapterID` sent in `initialize`.
    fn dap_adapter_id(&self) -> &'static str;

    fn initialization_behavior(&self) -> InitializationBehavior {
        InitializationBehavior::default()
    }

    /// True iff commands may be parked until after `initialized`.
    fn requires_command_queueing(&self) -> bool {
        false
    }

    fn should_queue_command(&self, _command: &str, _state: &AdapterState) -> QueueDecision {
        QueueDecision::pass()
    }

    /// Reorder the drain (e.g. `setBreakpoints` before `configurationDone`).
    fn process_queued_commands(
        &self,
        queue: Vec<QueuedCommand>,
        _state: &AdapterState,
    ) -> Vec<QueuedCommand> {
        queue
    }

    fn update_state_on_command(&self, command: &str, state: &mut AdapterState) {
        match command {
            "launch" | "attach" => state.launch_sent = true,
            "configurationDone" => state.configuration_done_sent = true,
            _ => {}
        }
    }

    fn update_state_on_response(&self, command: &str, success: bool, state: &mut AdapterState) {
        match command {
            "initialize" if success => state.initialize_responded = true,
            "launch" | "attach" if success => state.launch_responded = true,
            _ => {}
        }
    }

    fn update_state_on_event(&self, event: &str, state: &mut AdapterState) {
        if event == "initialized" {
            state.initialized_event_seen = true;
        }
    }

    /// Offer a reverse request. Unhandled requests are auto-acknowledged by
    /// the worker to avoid deadlock.
    fn handle_reverse_request(&self, _request: &Request) -> ReverseRequestOutcome {
        ReverseRequestOutcome::default()
    }

    /// Optional post-launch readiness routine run against the live client.
    async fn perform_handshake(&self, _client: &DapClient, _state: &AdapterState) -> Result<()> {
        Ok(())
    }

    /// Readiness predicate given the current execution snapshot.
    fn is_session_ready(&self, check: &ReadinessCheck) -> bool {
        if check.stop_on_entry {
            check.paused
        } else {
            check.paused || check.running || check.configured
        }
    }

    /// When true, `stackTrace` must be served by a child session.
    fn stack_trace_requires_child(&self) -> bool {
        false
    }

    /// Transform the generic launch config into the adapter-specific shape.
    fn normalize_launch_config(&self, config: Value, ctx: &LaunchContext<'_>) -> Value;

    /// Resolve the executable the spawn config needs (interpreter or
    /// adapter binary). Paths are used as given; only PATH lookup happens
    /// here.
    fn resolve_executable(&self, hint: Option<&str>) -> Result<String>;

    /// Optional toolchain validation. The core only carries the report;
    /// producing one belongs to the static validator outside the core.
    fn validate_toolchain(&self, _ctx: &SpawnContext<'_>) -> Option<ToolchainReport> {
        None
    }
}

/// Ordered policy registry. Instantiated in the composition root and passed
/// by reference; no global registration.
#[derive(Clone)]
pub struct PolicyRegistry {
    policies: Vec<Arc<dyn AdapterPolicy>>,
    fallback: Arc<dyn AdapterPolicy>,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self {
            policies: vec![
                Arc::new(debugpy::DebugpyPolicy),
                Arc::new(js_debug::JsDebugPolicy),
                Arc::new(codelldb::CodeLldbPolicy),
                Arc::new(lldb_dap::LldbDapPolicy),
                Arc::new(mock::MockPolicy),
            ],
            fallback: Arc::new(default::DefaultPolicy),
        }
    }

    /// Select the policy for an adapter invocation. Runs once at worker
    /// init; the Default policy is the final fallback.
    pub fn for_spawn(&self, spawn: &AdapterSpawn) -> Arc<dyn AdapterPolicy> {
        self.policies
            .iter()
            .find(|p| p.matches_adapter(spawn))
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    /// Default policy for a language tag.
    pub fn for_language(&self, language: &str) -> Result<Arc<dyn AdapterPolicy>> {
        let language = language.to_ascii_lowercase();
        self.policies
            .iter()
            .find(|p| p.matches_language(&language))
            .cloned()
            .ok_or(Error::UnsupportedLanguage(language))
    }

    pub fn fallback(&self) -> Arc<dyn AdapterPolicy> {
        self.fallback.clone()
    }
}

/// Search PATH for the first of `names` that exists as a file.
pub(crate) fn find_in_path(names: &[&str]) -> Option<String> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        for name in names {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate.to_string_lossy().into_owned());
            }
        }
    }
    None
}

/// Merge the generic launch fields into an adapter-shaped object. The
/// adapter type/request pair wins; generic fields fill the gaps.
pub(crate) fn merge_launch(mut base: Value, config: &Value) -> Value {
    if let (Some(base_map), Some(config_map)) = (base.as_object_mut(), config.as_object()) {
        for (key, value) in config_map {
            base_map.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    base
}

/// Existence check used only for user feedback; the path is forwarded to
/// the adapter exactly as supplied either way.
pub fn path_exists_for_feedback(path: &str) -> bool {
    Path::new(path).exists()
}
