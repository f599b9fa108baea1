//! Session Manager: the public core API. Validates sessions, consults the
//! adapter policy, drives the proxy worker over the envelope, and keeps
//! session state in the store in step with worker events.

use super::eval::{self, EvalErrorInfo, Preview};
use super::state::{BreakpointRecord, ExecutionState, Lifecycle, Session};
use super::store::SessionStore;
use crate::config::CoreEnv;
use crate::dap::types::{Scope, StackFrame, Variable};
use crate::policy::{
    path_exists_for_feedback, AdapterSpawn, LaunchContext, PolicyRegistry, ReadinessCheck,
    SpawnContext, ToolchainReport,
};
use crate::proxy::envelope::{InitPayload, WorkerStatus};
use crate::proxy::worker::{logging_exit_hook, ExitHook};
use crate::proxy::{DapOutcome, ProxyHandle, WorkerEvent};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Ceiling for one step to report a stop.
const STEP_TIMEOUT: Duration = Duration::from_secs(5);
/// Ceiling for overall start readiness.
const START_READY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_DRY_RUN_TIMEOUT: Duration = Duration::from_secs(10);
const PAUSE_THREAD_FALLBACK: i64 = 1;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub language: String,
    pub name: String,
    pub lifecycle: Lifecycle,
    pub execution: ExecutionState,
    pub policy: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDebuggingArgs {
    pub script_path: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra launch-config fields forwarded to the adapter.
    #[serde(default)]
    pub dap_launch_args: Option<Value>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub dry_run_timeout_ms: Option<u64>,
    /// Explicit adapter invocation, overriding the language default.
    #[serde(default)]
    pub adapter_launch_override: Option<AdapterSpawn>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDebuggingResult {
    pub success: bool,
    pub state: ExecutionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ToolchainReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_continue: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameLocation {
    pub file: String,
    pub line: i64,
    pub column: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub success: bool,
    pub state: ExecutionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<FrameLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResult {
    pub success: bool,
    pub state: ExecutionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<Preview>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_info: Option<EvalErrorInfo>,
}

enum StepKind {
    Over,
    Into,
    Out,
}

impl StepKind {
    fn command(&self) -> &'static str {
        match self {
            StepKind::Over => "next",
            StepKind::Into => "stepIn",
            StepKind::Out => "stepOut",
        }
    }
}

struct ListenerHandle {
    token: u64,
    hub: crate::proxy::EventHub,
    task: JoinHandle<()>,
}

pub struct SessionManager {
    store: SessionStore,
    registry: Arc<PolicyRegistry>,
    env: CoreEnv,
    base_log_dir: PathBuf,
    workers: Arc<RwLock<HashMap<String, Arc<ProxyHandle>>>>,
    listeners: Arc<RwLock<HashMap<String, ListenerHandle>>>,
    exit_hook: ExitHook,
}

impl SessionManager {
    pub fn new(env: CoreEnv) -> Self {
        Self::with_base_log_dir(env, std::env::temp_dir().join("dap_bridge").join("sessions"))
    }

    pub fn with_base_log_dir(env: CoreEnv, base_log_dir: PathBuf) -> Self {
        Self {
            store: SessionStore::new(),
            registry: Arc::new(PolicyRegistry::new()),
            env,
            base_log_dir,
            workers: Arc::new(RwLock::new(HashMap::new())),
            listeners: Arc::new(RwLock::new(HashMap::new())),
            exit_hook: logging_exit_hook(),
        }
    }

    /// Replace the critical-failure exit hook (tests).
    pub fn set_exit_hook(&mut self, hook: ExitHook) {
        self.exit_hook = hook;
    }

    pub fn registry(&self) -> Arc<PolicyRegistry> {
        self.registry.clone()
    }

    // === Session lifecycle ===

    pub async fn create_session(
        &self,
        language: &str,
        name: Option<String>,
        executable_hint: Option<String>,
    ) -> Result<SessionInfo> {
        let language = language.to_ascii_lowercase();
        if self.env.language_disabled(&language) {
            return Err(Error::UnsupportedLanguage(format!(
                "{} (disabled by configuration)",
                language
            )));
        }
        let policy = self.registry.for_language(&language)?;

        let name = name.unwrap_or_else(|| format!("{language}-session"));
        let session = Session::new(
            language,
            name,
            executable_hint,
            policy.id().to_string(),
            &self.base_log_dir,
        );
        info!("Created session {} ({})", session.id, session.language);

        let entry = self.store.create(session).await;
        let session = entry.read().await;
        Ok(Self::info_of(&session))
    }

    /// Attach an externally produced toolchain-validation report.
    pub async fn set_toolchain_report(&self, id: &str, report: ToolchainReport) -> Result<()> {
        self.store
            .update(id, |session| session.toolchain_report = Some(report))
            .await
    }

    pub async fn get_session(&self, id: &str) -> Result<SessionInfo> {
        let entry = self.store.get_or_err(id).await?;
        let session = entry.read().await;
        Ok(Self::info_of(&session))
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut infos = Vec::new();
        for id in self.store.all_ids().await {
            if let Some(entry) = self.store.get(&id).await {
                let session = entry.read().await;
                infos.push(Self::info_of(&session));
            }
        }
        infos
    }

    fn info_of(session: &Session) -> SessionInfo {
        SessionInfo {
            id: session.id.clone(),
            language: session.language.clone(),
            name: session.name.clone(),
            lifecycle: session.lifecycle,
            execution: session.execution.clone(),
            policy: session.policy_id.clone(),
        }
    }

    /// Idempotent close: detach listeners, stop the worker, mark the
    /// session Stopped then Terminated. Returns whether a session existed.
    pub async fn close_session(&self, id: &str) -> Result<bool> {
        let Some(entry) = self.store.get(id).await else {
            return Ok(false);
        };

        self.detach_listeners(id).await;

        let worker = self.workers.write().await.remove(id);
        if let Some(worker) = worker {
            worker.stop().await;
        }

        {
            let mut session = entry.write().await;
            if !session.execution.is_terminal() {
                session.set_execution(ExecutionState::Stopped);
            }
            session.lifecycle = Lifecycle::Terminated;
            session.touch();
        }

        info!("Closed session {}", id);
        Ok(true)
    }

    pub async fn close_all_sessions(&self) {
        for id in self.store.all_ids().await {
            if let Err(e) = self.close_session(&id).await {
                warn!("Failed to close session {}: {}", id, e);
            }
        }
    }

    // === Breakpoints ===

    pub async fn set_breakpoint(
        &self,
        id: &str,
        file: &str,
        line: i64,
        condition: Option<String>,
    ) -> Result<BreakpointRecord> {
        let entry = self.store.get_or_err(id).await?;
        {
            let session = entry.read().await;
            if session.is_terminated() {
                return Err(Error::SessionTerminated(id.to_string()));
            }
        }

        // Existence check is feedback only; the path goes to the adapter
        // exactly as supplied.
        if !path_exists_for_feedback(file) {
            warn!("Breakpoint file {} does not exist on disk", file);
        }

        let record = BreakpointRecord::new(file.to_string(), line, condition);
        let record_id = record.id.clone();
        {
            let mut session = entry.write().await;
            session.breakpoints.insert(record_id.clone(), record);
            session.touch();
        }

        let worker = self.workers.read().await.get(id).cloned();
        let should_send = {
            let session = entry.read().await;
            matches!(
                session.execution,
                ExecutionState::Running | ExecutionState::Paused { .. }
            )
        };

        if let (Some(worker), true) = (worker, should_send) {
            self.sync_file_breakpoints(&entry, &worker, file).await?;
        }

        let session = entry.read().await;
        session
            .breakpoints
            .get(&record_id)
            .cloned()
            .ok_or_else(|| Error::Internal("breakpoint vanished during update".to_string()))
    }

    /// Replace all breakpoints for one file on the adapter and fold the
    /// verification results back into the records.
    async fn sync_file_breakpoints(
        &self,
        entry: &Arc<RwLock<Session>>,
        worker: &ProxyHandle,
        file: &str,
    ) -> Result<()> {
        let (ids, source_bps): (Vec<String>, Vec<_>) = {
            let session = entry.read().await;
            let records = session.breakpoints_in_file(file);
            (
                records.iter().map(|r| r.id.clone()).collect(),
                records
                    .iter()
                    .map(BreakpointRecord::to_source_breakpoint)
                    .collect(),
            )
        };

        let outcome = worker
            .request(
                "setBreakpoints",
                Some(json!({
                    "source": {"path": file},
                    "breakpoints": source_bps,
                    "sourceModified": false,
                })),
                None,
            )
            .await?;

        if !outcome.success {
            return Err(Error::Dap(
                outcome
                    .error
                    .unwrap_or_else(|| "setBreakpoints failed".to_string()),
            ));
        }

        let verified: Vec<crate::dap::types::Breakpoint> = outcome
            .body
            .as_ref()
            .and_then(|b| b.get("breakpoints"))
            .and_then(|b| serde_json::from_value(b.clone()).ok())
            .unwrap_or_default();

        let mut session = entry.write().await;
        for (record_id, dap_bp) in ids.iter().zip(verified.iter()) {
            if let Some(record) = session.breakpoints.get_mut(record_id) {
                record.apply_verification(dap_bp);
            }
        }
        session.touch();
        Ok(())
    }

    // === Debug run lifecycle ===

    pub async fn start_debugging(
        &self,
        id: &str,
        args: StartDebuggingArgs,
    ) -> Result<StartDebuggingResult> {
        let entry = self.store.get_or_err(id).await?;
        {
            let session = entry.read().await;
            if session.is_terminated() {
                return Err(Error::SessionTerminated(id.to_string()));
            }
        }

        // A previous run's worker is closed before a new one starts.
        if let Some(old) = self.workers.write().await.remove(id) {
            self.detach_listeners(id).await;
            old.stop().await;
        }

        let (language, executable_hint, toolchain_report) = {
            let session = entry.read().await;
            (
                session.language.clone(),
                session.executable_hint.clone(),
                session.toolchain_report.clone(),
            )
        };

        // Incompatible toolchain aborts unless it said "continue".
        if let Some(report) = &toolchain_report {
            if report.behavior != crate::policy::ToolchainBehavior::Continue {
                let mut session = entry.write().await;
                session.lifecycle = Lifecycle::Created;
                session.touch();
                return Ok(StartDebuggingResult {
                    success: false,
                    state: session.execution.clone(),
                    reason: None,
                    data: None,
                    error: Some(
                        report
                            .message
                            .clone()
                            .unwrap_or_else(|| "incompatible toolchain".to_string()),
                    ),
                    validation: Some(report.clone()),
                    can_continue: Some(report.can_continue()),
                });
            }
        }

        if !path_exists_for_feedback(&args.script_path) {
            return Err(Error::FileNotFound(args.script_path));
        }

        let stop_on_entry = args
            .dap_launch_args
            .as_ref()
            .and_then(|v| v.get("stopOnEntry"))
            .and_then(Value::as_bool);

        // Build the adapter invocation and the adapter-shaped launch config.
        let port = crate::dap::socket::find_free_port()?;
        let spawn_ctx = SpawnContext {
            language: &language,
            executable_hint: executable_hint.as_deref(),
            port,
            container_mode: self.env.container_mode,
        };

        let (spawn, policy) = match &args.adapter_launch_override {
            Some(spawn) => (spawn.clone(), self.registry.for_spawn(spawn)),
            None => {
                let policy = self.registry.for_language(&language)?;
                (policy.build_spawn(&spawn_ctx)?, policy)
            }
        };

        let mut generic = json!({
            "program": args.script_path,
            "cwd": Path::new(&args.script_path)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
        });
        if !args.args.is_empty() {
            generic["args"] = json!(args.args);
        }
        if let Some(extra) = &args.dap_launch_args {
            if let (Some(obj), Some(extra)) = (generic.as_object_mut(), extra.as_object()) {
                for (key, value) in extra {
                    obj.insert(key.clone(), value.clone());
                }
            }
        }

        let launch_ctx = LaunchContext {
            program: &args.script_path,
            stop_on_entry,
        };
        let launch_config = policy.normalize_launch_config(generic, &launch_ctx);
        let effective_stop_on_entry = launch_config
            .get("stopOnEntry")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let (session_id, log_dir, initial_breakpoints) = {
            let mut session = entry.write().await;
            session.lifecycle = Lifecycle::Active;
            session.set_execution(ExecutionState::Initializing);
            session.stop_on_entry = effective_stop_on_entry;
            (
                session.id.clone(),
                session.log_dir.clone(),
                session.grouped_breakpoints(),
            )
        };

        let payload = InitPayload {
            session_id: session_id.clone(),
            adapter_spawn: spawn,
            launch_config,
            stop_on_entry,
            script_path: args.script_path.clone(),
            initial_breakpoints,
            dry_run_spawn: args.dry_run,
            log_dir,
            trace_dir: self.env.trace_dir.clone(),
        };

        let worker = Arc::new(ProxyHandle::start(
            payload,
            self.registry.clone(),
            self.exit_hook.clone(),
        ));
        self.attach_listeners(&session_id, worker.clone()).await;
        self.workers
            .write()
            .await
            .insert(session_id.clone(), worker.clone());

        if args.dry_run {
            let timeout = args
                .dry_run_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_DRY_RUN_TIMEOUT);
            return self.await_dry_run(&entry, &worker, timeout).await;
        }

        self.await_readiness(&entry, &worker, effective_stop_on_entry, policy)
            .await
    }

    async fn await_dry_run(
        &self,
        entry: &Arc<RwLock<Session>>,
        worker: &ProxyHandle,
        timeout: Duration,
    ) -> Result<StartDebuggingResult> {
        if worker.dry_run_snapshot().await.is_none() {
            worker
                .wait_for_event(timeout, |event| {
                    matches!(
                        event,
                        WorkerEvent::Status(WorkerStatus::DryRunComplete { .. })
                            | WorkerEvent::Exit
                    )
                })
                .await;
        }

        match worker.dry_run_snapshot().await {
            Some(snapshot) => {
                let state = {
                    let mut session = entry.write().await;
                    session.set_execution(ExecutionState::Stopped);
                    session.execution.clone()
                };
                Ok(StartDebuggingResult {
                    success: true,
                    state,
                    reason: None,
                    data: Some(json!({
                        "dryRun": true,
                        "command": snapshot.command,
                        "script": snapshot.script,
                    })),
                    error: None,
                    validation: None,
                    can_continue: None,
                })
            }
            None => Ok(StartDebuggingResult {
                success: false,
                state: entry.read().await.execution.clone(),
                reason: None,
                data: None,
                error: Some("timed out waiting for dry run to complete".to_string()),
                validation: None,
                can_continue: None,
            }),
        }
    }

    /// Wait until the policy's readiness predicate accepts the session,
    /// listening for stops and configuration, bounded by 30s.
    async fn await_readiness(
        &self,
        entry: &Arc<RwLock<Session>>,
        worker: &Arc<ProxyHandle>,
        stop_on_entry: bool,
        policy: Arc<dyn crate::policy::AdapterPolicy>,
    ) -> Result<StartDebuggingResult> {
        let hub = worker.events().clone();
        let (token, mut rx) = hub.subscribe().await;
        let deadline = tokio::time::Instant::now() + START_READY_TIMEOUT;

        let result = loop {
            let (execution, ready) = {
                let session = entry.read().await;
                let check = ReadinessCheck {
                    paused: session.execution.is_paused(),
                    running: session.execution == ExecutionState::Running,
                    configured: worker.is_configured(),
                    stop_on_entry,
                };
                (session.execution.clone(), policy.is_session_ready(&check))
            };

            if ready {
                let reason = match &execution {
                    ExecutionState::Paused { reason, .. } => Some(reason.clone()),
                    _ => None,
                };
                break StartDebuggingResult {
                    success: true,
                    state: execution,
                    reason,
                    data: None,
                    error: None,
                    validation: None,
                    can_continue: None,
                };
            }

            if let ExecutionState::Error { message } = &execution {
                break StartDebuggingResult {
                    success: false,
                    state: execution.clone(),
                    reason: None,
                    data: None,
                    error: Some(message.clone()),
                    validation: None,
                    can_continue: None,
                };
            }

            // The debuggee can finish before any readiness criterion is
            // met; a completed run is still a successful start.
            if execution == ExecutionState::Stopped {
                break StartDebuggingResult {
                    success: true,
                    state: execution,
                    reason: Some("completed".to_string()),
                    data: None,
                    error: None,
                    validation: None,
                    can_continue: None,
                };
            }

            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(WorkerEvent::Exit)) => {
                    break StartDebuggingResult {
                        success: false,
                        state: entry.read().await.execution.clone(),
                        reason: None,
                        data: None,
                        error: Some("debug adapter exited before the session was ready".to_string()),
                        validation: None,
                        can_continue: None,
                    };
                }
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => {
                    break StartDebuggingResult {
                        success: false,
                        state: entry.read().await.execution.clone(),
                        reason: None,
                        data: None,
                        error: Some("timed out waiting for the session to become ready".to_string()),
                        validation: None,
                        can_continue: None,
                    };
                }
            }
        };

        hub.unsubscribe(token).await;
        Ok(result)
    }

    // === Event handling ===

    /// One long-lived listener per worker keeps the store in step with
    /// adapter events. Registered handlers are tracked so close can prove
    /// they are gone.
    async fn attach_listeners(&self, session_id: &str, worker: Arc<ProxyHandle>) {
        let hub = worker.events().clone();
        let (token, mut rx) = hub.subscribe().await;

        let store = self.store.clone();
        let id = session_id.to_string();
        let worker_for_events = worker.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    WorkerEvent::Dap { event, body } => {
                        Self::on_dap_event(&store, &id, &worker_for_events, &event, body).await;
                    }
                    WorkerEvent::Status(status) => match status {
                        WorkerStatus::AdapterConfiguredAndLaunched => {
                            let _ = store
                                .update(&id, |session| {
                                    if session.execution == ExecutionState::Initializing {
                                        session.execution = ExecutionState::Running;
                                    }
                                })
                                .await;
                        }
                        WorkerStatus::DryRunComplete { .. } => {
                            let _ = store
                                .update(&id, |session| {
                                    session.execution = ExecutionState::Stopped;
                                })
                                .await;
                        }
                        WorkerStatus::Terminated => {
                            let _ = store
                                .update(&id, |session| {
                                    if !session.execution.is_terminal() {
                                        session.execution = ExecutionState::Stopped;
                                    }
                                })
                                .await;
                        }
                        WorkerStatus::InitReceived | WorkerStatus::AdapterConnected => {}
                    },
                    WorkerEvent::Error(message) => {
                        let _ = store
                            .update(&id, |session| {
                                if !session.execution.is_terminal() {
                                    session.execution = ExecutionState::Error { message };
                                }
                            })
                            .await;
                    }
                    WorkerEvent::Exit => {
                        let _ = store
                            .update(&id, |session| {
                                if !session.execution.is_terminal() {
                                    session.execution = ExecutionState::Stopped;
                                }
                            })
                            .await;
                        break;
                    }
                }
            }
        });

        let mut listeners = self.listeners.write().await;
        if let Some(previous) = listeners.insert(
            session_id.to_string(),
            ListenerHandle { token, hub, task },
        ) {
            previous.hub.unsubscribe(previous.token).await;
            previous.task.abort();
        }
    }

    async fn on_dap_event(
        store: &SessionStore,
        id: &str,
        worker: &Arc<ProxyHandle>,
        event: &str,
        body: Option<Value>,
    ) {
        match event {
            "stopped" => {
                let thread_id = body
                    .as_ref()
                    .and_then(|b| b.get("threadId"))
                    .and_then(Value::as_i64)
                    .unwrap_or(PAUSE_THREAD_FALLBACK);
                let reason = body
                    .as_ref()
                    .and_then(|b| b.get("reason"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();

                let stop_on_entry = match store.get(id).await {
                    Some(entry) => entry.read().await.stop_on_entry,
                    None => false,
                };

                if reason == "entry" && !stop_on_entry {
                    // The caller did not ask for an entry stop; resume
                    // without surfacing the pause.
                    debug!("Auto-continuing entry stop for session {}", id);
                    let outcome = worker
                        .request("continue", Some(json!({"threadId": thread_id})), None)
                        .await;
                    let resumed = matches!(outcome, Ok(DapOutcome { success: true, .. }));
                    let _ = store
                        .update(id, |session| {
                            session.execution = if resumed {
                                ExecutionState::Running
                            } else {
                                ExecutionState::Paused { thread_id, reason }
                            };
                        })
                        .await;
                    return;
                }

                let _ = store
                    .update(id, |session| {
                        session.execution = ExecutionState::Paused { thread_id, reason };
                    })
                    .await;
            }
            "continued" => {
                let _ = store
                    .update(id, |session| {
                        // A late continued after a breakpoint must not wipe
                        // out the pause the user is inspecting.
                        if !session.execution.is_paused() && !session.execution.is_terminal() {
                            session.execution = ExecutionState::Running;
                        }
                    })
                    .await;
            }
            "terminated" | "exited" => {
                let _ = store
                    .update(id, |session| {
                        if !session.execution.is_terminal() {
                            session.execution = ExecutionState::Stopped;
                        }
                    })
                    .await;
            }
            _ => {}
        }
    }

    /// Detach the session's listener. Safe to call twice.
    async fn detach_listeners(&self, session_id: &str) {
        let handle = self.listeners.write().await.remove(session_id);
        if let Some(handle) = handle {
            handle.hub.unsubscribe(handle.token).await;
            handle.task.abort();
        } else {
            debug!("No listeners registered for session {}", session_id);
        }
    }

    /// Listener parity check: how many handlers the core still has on this
    /// session's worker.
    pub async fn listener_count(&self, session_id: &str) -> usize {
        match self.workers.read().await.get(session_id) {
            Some(worker) => worker.events().subscriber_count().await,
            None => 0,
        }
    }

    // === Stepping and execution control ===

    pub async fn step_over(&self, id: &str) -> Result<StepResult> {
        self.step(id, StepKind::Over).await
    }

    pub async fn step_into(&self, id: &str) -> Result<StepResult> {
        self.step(id, StepKind::Into).await
    }

    pub async fn step_out(&self, id: &str) -> Result<StepResult> {
        self.step(id, StepKind::Out).await
    }

    async fn step(&self, id: &str, kind: StepKind) -> Result<StepResult> {
        let entry = self.store.get_or_err(id).await?;
        let thread_id = {
            let session = entry.read().await;
            if session.is_terminated() {
                return Err(Error::SessionTerminated(id.to_string()));
            }
            session
                .execution
                .paused_thread()
                .ok_or_else(|| Error::InvalidState("session is not paused".to_string()))?
        };
        let worker = self.worker_for(id).await?;
        let thread_id = worker.current_thread_id().await.unwrap_or(thread_id);

        // Subscribe before sending so a fast stop is not missed.
        let hub = worker.events().clone();
        let (token, mut rx) = hub.subscribe().await;

        let outcome = worker
            .request(kind.command(), Some(json!({"threadId": thread_id})), None)
            .await?;
        if !outcome.success {
            hub.unsubscribe(token).await;
            return Ok(StepResult {
                success: false,
                state: entry.read().await.execution.clone(),
                location: None,
                error: outcome.error,
            });
        }

        let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
        let result = loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(WorkerEvent::Dap { event, .. })) if event == "stopped" => {
                    // Give the listener a chance to fold the stop in.
                    tokio::task::yield_now().await;
                    let location = self.capture_location(&worker).await;
                    break StepResult {
                        success: true,
                        state: entry.read().await.execution.clone(),
                        location,
                        error: None,
                    };
                }
                Ok(Some(WorkerEvent::Dap { event, .. }))
                    if event == "terminated" || event == "exited" =>
                {
                    break StepResult {
                        success: true,
                        state: ExecutionState::Stopped,
                        location: None,
                        error: None,
                    };
                }
                Ok(Some(WorkerEvent::Exit)) => {
                    break StepResult {
                        success: true,
                        state: ExecutionState::Stopped,
                        location: None,
                        error: None,
                    };
                }
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => {
                    // No stop within the ceiling: the debuggee kept going.
                    let _ = self
                        .store
                        .update(id, |session| {
                            if !session.execution.is_terminal() {
                                session.execution = ExecutionState::Running;
                            }
                        })
                        .await;
                    break StepResult {
                        success: false,
                        state: ExecutionState::Running,
                        location: None,
                        error: Some("step timed out".to_string()),
                    };
                }
            }
        };

        hub.unsubscribe(token).await;
        Ok(result)
    }

    /// Best-effort top frame after a stop.
    async fn capture_location(&self, worker: &ProxyHandle) -> Option<FrameLocation> {
        let thread_id = worker.current_thread_id().await?;
        let outcome = worker
            .request(
                "stackTrace",
                Some(json!({"threadId": thread_id, "levels": 1})),
                None,
            )
            .await
            .ok()?;
        let frames = outcome.body?;
        let frame = frames.get("stackFrames")?.get(0)?;
        Some(FrameLocation {
            file: frame
                .get("source")
                .and_then(|s| s.get("path"))
                .and_then(Value::as_str)?
                .to_string(),
            line: frame.get("line").and_then(Value::as_i64)?,
            column: frame.get("column").and_then(Value::as_i64).unwrap_or(0),
        })
    }

    pub async fn continue_execution(&self, id: &str) -> Result<ControlResult> {
        let entry = self.store.get_or_err(id).await?;
        let thread_id = {
            let session = entry.read().await;
            if session.is_terminated() {
                return Err(Error::SessionTerminated(id.to_string()));
            }
            session
                .execution
                .paused_thread()
                .ok_or_else(|| Error::InvalidState("session is not paused".to_string()))?
        };
        let worker = self.worker_for(id).await?;
        let thread_id = worker.current_thread_id().await.unwrap_or(thread_id);

        let outcome = worker
            .request("continue", Some(json!({"threadId": thread_id})), None)
            .await?;

        // State is not eagerly set to Running: a stopped event racing this
        // response must win, so events drive the transition.
        let state = entry.read().await.execution.clone();
        Ok(ControlResult {
            success: outcome.success,
            state,
            error: outcome.error,
        })
    }

    pub async fn pause(&self, id: &str) -> Result<ControlResult> {
        let entry = self.store.get_or_err(id).await?;
        {
            let session = entry.read().await;
            if session.is_terminated() {
                return Err(Error::SessionTerminated(id.to_string()));
            }
            if session.execution.is_paused() {
                return Ok(ControlResult {
                    success: true,
                    state: session.execution.clone(),
                    error: None,
                });
            }
        }
        let worker = self.worker_for(id).await?;

        let thread_id = match worker.current_thread_id().await {
            Some(thread_id) => thread_id,
            None => self.probe_first_thread(&worker).await,
        };

        let outcome = worker
            .request("pause", Some(json!({"threadId": thread_id})), None)
            .await?;

        // Request success does not imply Paused; the stopped event decides.
        let state = entry.read().await.execution.clone();
        Ok(ControlResult {
            success: outcome.success,
            state,
            error: outcome.error,
        })
    }

    async fn probe_first_thread(&self, worker: &ProxyHandle) -> i64 {
        match worker.request("threads", None, None).await {
            Ok(outcome) if outcome.success => outcome
                .body
                .as_ref()
                .and_then(|b| b.get("threads"))
                .and_then(|t| t.get(0))
                .and_then(|t| t.get("id"))
                .and_then(Value::as_i64)
                .unwrap_or(PAUSE_THREAD_FALLBACK),
            _ => PAUSE_THREAD_FALLBACK,
        }
    }

    // === State inspection ===

    /// Not paused or no worker: empty, never an error.
    pub async fn get_stack_trace(
        &self,
        id: &str,
        include_internals: bool,
    ) -> Result<Vec<StackFrame>> {
        let entry = self.store.get_or_err(id).await?;
        let thread_id = {
            let session = entry.read().await;
            match session.execution.paused_thread() {
                Some(t) => t,
                None => return Ok(Vec::new()),
            }
        };
        let Some(worker) = self.workers.read().await.get(id).cloned() else {
            return Ok(Vec::new());
        };
        let thread_id = worker.current_thread_id().await.unwrap_or(thread_id);

        let outcome = worker
            .request("stackTrace", Some(json!({"threadId": thread_id})), None)
            .await?;
        if !outcome.success {
            return Ok(Vec::new());
        }

        let mut frames: Vec<StackFrame> = outcome
            .body
            .as_ref()
            .and_then(|b| b.get("stackFrames"))
            .and_then(|f| serde_json::from_value(f.clone()).ok())
            .unwrap_or_default();

        if !include_internals {
            frames.retain(|f| f.source.as_ref().and_then(|s| s.path.as_ref()).is_some());
        }
        Ok(frames)
    }

    pub async fn get_scopes(&self, id: &str, frame_id: i64) -> Result<Vec<Scope>> {
        let Some(worker) = self.paused_worker(id).await? else {
            return Ok(Vec::new());
        };
        let outcome = worker
            .request("scopes", Some(json!({"frameId": frame_id})), None)
            .await?;
        if !outcome.success {
            return Ok(Vec::new());
        }
        Ok(outcome
            .body
            .as_ref()
            .and_then(|b| b.get("scopes"))
            .and_then(|s| serde_json::from_value(s.clone()).ok())
            .unwrap_or_default())
    }

    pub async fn get_variables(&self, id: &str, variables_reference: i64) -> Result<Vec<Variable>> {
        let Some(worker) = self.paused_worker(id).await? else {
            return Ok(Vec::new());
        };
        Ok(self.fetch_variables(&worker, variables_reference).await)
    }

    /// Variables of the top frame's first local scope.
    pub async fn get_local_variables(
        &self,
        id: &str,
        include_special: bool,
    ) -> Result<Vec<Variable>> {
        let frames = self.get_stack_trace(id, true).await?;
        let Some(top) = frames.first() else {
            return Ok(Vec::new());
        };
        let scopes = self.get_scopes(id, top.id).await?;
        let Some(scope) = scopes
            .iter()
            .find(|s| s.name.to_lowercase().contains("local"))
            .or_else(|| scopes.first())
        else {
            return Ok(Vec::new());
        };

        let mut variables = self.get_variables(id, scope.variables_reference).await?;
        if !include_special {
            variables.retain(|v| !v.name.starts_with("__"));
        }
        Ok(variables)
    }

    async fn paused_worker(&self, id: &str) -> Result<Option<Arc<ProxyHandle>>> {
        let entry = self.store.get_or_err(id).await?;
        if !entry.read().await.execution.is_paused() {
            return Ok(None);
        }
        Ok(self.workers.read().await.get(id).cloned())
    }

    async fn fetch_variables(&self, worker: &ProxyHandle, reference: i64) -> Vec<Variable> {
        match worker
            .request(
                "variables",
                Some(json!({"variablesReference": reference})),
                None,
            )
            .await
        {
            Ok(outcome) if outcome.success => outcome
                .body
                .as_ref()
                .and_then(|b| b.get("variables"))
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    // === Evaluation ===

    pub async fn evaluate_expression(
        &self,
        id: &str,
        expression: &str,
        frame_id: Option<i64>,
        context: Option<&str>,
    ) -> Result<EvaluateOutcome> {
        let entry = self.store.get_or_err(id).await?;
        {
            let session = entry.read().await;
            if session.is_terminated() {
                return Err(Error::SessionTerminated(id.to_string()));
            }
            if !session.execution.is_paused() {
                return Err(Error::InvalidState(
                    "session must be paused to evaluate expressions".to_string(),
                ));
            }
        }

        let expression = expression.trim();
        if expression.is_empty() {
            return Err(Error::InvalidParameters("expression is empty".to_string()));
        }
        if expression.len() > eval::MAX_EXPRESSION_LEN {
            return Err(Error::InvalidParameters(format!(
                "expression exceeds {} bytes",
                eval::MAX_EXPRESSION_LEN
            )));
        }

        let worker = self.worker_for(id).await?;

        let frame_id = match frame_id {
            Some(frame_id) => Some(frame_id),
            None => self
                .get_stack_trace(id, true)
                .await?
                .first()
                .map(|frame| frame.id),
        };

        let mut eval_args = json!({
            "expression": expression,
            // "variables" favors plain variable access across adapters.
            "context": context.unwrap_or("variables"),
        });
        if let Some(frame_id) = frame_id {
            eval_args["frameId"] = json!(frame_id);
        }

        let outcome = worker.request("evaluate", Some(eval_args), None).await?;

        if !outcome.success {
            let raw = outcome
                .error
                .unwrap_or_else(|| "evaluation failed".to_string());
            let info = eval::classify_eval_error(expression, &raw);
            return Ok(EvaluateOutcome {
                success: false,
                result: None,
                type_: None,
                preview: None,
                error: Some(raw),
                error_info: Some(info),
            });
        }

        let body = outcome.body.unwrap_or_else(|| json!({}));
        let result = body
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let type_ = body
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let variables_reference = body
            .get("variablesReference")
            .and_then(Value::as_i64)
            .unwrap_or(0);

        let preview = if variables_reference > 0 {
            let children = self.fetch_variables(&worker, variables_reference).await;
            if children.is_empty() {
                None
            } else {
                Some(eval::build_preview(&result, type_.as_deref(), &children))
            }
        } else {
            None
        };

        Ok(EvaluateOutcome {
            success: true,
            result: Some(result),
            type_,
            preview,
            error: None,
            error_info: None,
        })
    }

    async fn worker_for(&self, id: &str) -> Result<Arc<ProxyHandle>> {
        self.workers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ProxyNotRunning(id.to_string()))
    }
}
