//! The proxy worker: one per session, exclusively owning the adapter
//! process and its DAP connection.
//!
//! State machine: Uninitialized → Initializing → Connected → ShuttingDown
//! → Terminated. The worker accepts `init`, `dap`, and `terminate` from its
//! parent, performs the DAP handshake according to the selected adapter
//! policy, and forwards events and correlated responses upstream. Blocking
//! work (requests in flight, child adoption, queue drains) runs in spawned
//! tasks so the command loop never stalls.

use super::child::ChildManager;
use super::envelope::{
    DapCommand, InitPayload, ParentCommand, ParentEnvelope, WorkerEndpoint, WorkerEnvelope,
    WorkerMessage, WorkerStatus,
};
use crate::dap::client::{DapClient, InboundMessage};
use crate::dap::socket;
use crate::dap::trace::FrameTracer;
use crate::dap::transport;
use crate::dap::types::{InitializeRequestArguments, Request, Source, SourceBreakpoint};
use crate::policy::{
    AdapterPolicy, AdapterState, ConnectMode, PolicyRegistry, QueuedCommand,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Delay before a dry-run worker tears down, so the acknowledgment and
/// snapshot flush to the parent first.
const DRY_RUN_FLUSH_DELAY: Duration = Duration::from_millis(120);
/// How long the parent's `configurationDone` may be deferred while a child
/// session is being adopted.
const CONFIG_DONE_DEFER: Duration = Duration::from_millis(1500);
/// How long `stackTrace` waits for a child to become ready.
const CHILD_READY_TIMEOUT: Duration = Duration::from_secs(12);
const CHILD_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const INITIAL_STOP_TIMEOUT: Duration = Duration::from_secs(12);
const INITIAL_STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const THREADS_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Commands that act on the debuggee and must route to a child session
/// when the adapter uses one.
const DEBUGGEE_SCOPED: &[&str] = &[
    "next",
    "stepIn",
    "stepOut",
    "continue",
    "pause",
    "stackTrace",
    "scopes",
    "variables",
    "evaluate",
    "setBreakpoints",
    "threads",
];

/// Commands that should succeed gracefully when the debuggee is already gone.
const GRACEFUL_COMPLETION: &[&str] = &["continue", "disconnect", "terminate"];

/// Injectable exit hook for critical init failures, so tests observe the
/// non-zero exit without the host process dying.
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

pub fn logging_exit_hook() -> ExitHook {
    Arc::new(|code| error!("Worker hit a critical init failure (exit code {})", code))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninitialized,
    Initializing,
    Connected,
    ShuttingDown,
    Terminated,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

enum Internal {
    FromAdapter(InboundMessage),
    FromChild {
        child_id: String,
        message: InboundMessage,
    },
    AdapterExited {
        code: Option<i32>,
    },
    ChildConfigured {
        child_id: String,
    },
    ChildAdoptionFailed {
        child_id: String,
        error: String,
    },
    ConfigureFinished,
}

pub struct ProxyWorker {
    rx: mpsc::UnboundedReceiver<ParentEnvelope>,
    tx: mpsc::UnboundedSender<WorkerEnvelope>,
    registry: Arc<PolicyRegistry>,
    exit_hook: ExitHook,

    state: WorkerState,
    session_id: String,
    policy: Option<Arc<dyn AdapterPolicy>>,
    adapter_state: Arc<StdMutex<AdapterState>>,
    client: Option<Arc<DapClient>>,
    children: ChildManager,
    adoption_done: Arc<Notify>,

    /// Commands received while Initializing, before the DAP connection.
    pre_connect_queue: Vec<DapCommand>,
    /// Commands parked by the policy's queueing rules.
    policy_queue: Arc<Mutex<Vec<QueuedCommand>>>,
    /// Last breakpoints sent per file; mirrored onto adopted children.
    breakpoints_seen: HashMap<String, Vec<SourceBreakpoint>>,

    kill_tx: Option<oneshot::Sender<()>>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    initialized_handled: bool,
    child_port: Option<u16>,
}

impl ProxyWorker {
    pub fn new(endpoint: WorkerEndpoint, registry: Arc<PolicyRegistry>, exit_hook: ExitHook) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            rx: endpoint.rx,
            tx: endpoint.tx,
            registry,
            exit_hook,
            state: WorkerState::Uninitialized,
            session_id: String::new(),
            policy: None,
            adapter_state: Arc::new(StdMutex::new(AdapterState::default())),
            client: None,
            children: ChildManager::new(),
            adoption_done: Arc::new(Notify::new()),
            pre_connect_queue: Vec::new(),
            policy_queue: Arc::new(Mutex::new(Vec::new())),
            breakpoints_seen: HashMap::new(),
            kill_tx: None,
            internal_tx,
            internal_rx,
            initialized_handled: false,
            child_port: None,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                parent = self.rx.recv() => match parent {
                    Some(envelope) => {
                        if self.handle_parent(envelope).await == Flow::Stop {
                            break;
                        }
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(internal) = self.internal_rx.recv() => {
                    if self.handle_internal(internal).await == Flow::Stop {
                        break;
                    }
                }
            }
        }
    }

    fn send_msg(&self, message: WorkerMessage) {
        let _ = self.tx.send(WorkerEnvelope {
            session_id: self.session_id.clone(),
            message,
        });
    }

    fn send_status(&self, status: WorkerStatus) {
        self.send_msg(WorkerMessage::Status(status));
    }

    fn respond(&self, request_id: u64, success: bool, body: Option<Value>, error: Option<String>) {
        self.send_msg(WorkerMessage::DapResponse {
            request_id,
            success,
            body,
            error,
        });
    }

    /// Critical init failure: report, tear down, and fire the exit hook.
    fn critical(&mut self, message: String) -> Flow {
        error!("Worker critical failure: {}", message);
        self.send_msg(WorkerMessage::Error { message });
        self.state = WorkerState::Terminated;
        self.send_status(WorkerStatus::Terminated);
        (self.exit_hook)(1);
        Flow::Stop
    }

    async fn handle_parent(&mut self, envelope: ParentEnvelope) -> Flow {
        match envelope.command {
            ParentCommand::Init(payload) => match self.state {
                WorkerState::Uninitialized => self.do_init(*payload).await,
                WorkerState::Initializing => {
                    // Duplicate init while still bringing the adapter up is
                    // acknowledged, not re-executed.
                    self.send_status(WorkerStatus::InitReceived);
                    Flow::Continue
                }
                _ => {
                    self.send_msg(WorkerMessage::Error {
                        message: "Invalid state for init".to_string(),
                    });
                    Flow::Continue
                }
            },
            ParentCommand::Dap(cmd) => {
                self.handle_dap_command(cmd).await;
                Flow::Continue
            }
            ParentCommand::Terminate => {
                self.shutdown().await;
                Flow::Stop
            }
        }
    }

    async fn do_init(&mut self, payload: InitPayload) -> Flow {
        self.state = WorkerState::Initializing;
        self.session_id = payload.session_id.clone();
        self.send_status(WorkerStatus::InitReceived);

        let policy = self.registry.for_spawn(&payload.adapter_spawn);
        info!(
            "Worker {} selected policy '{}' for adapter {:?}",
            self.session_id,
            policy.id(),
            payload.adapter_spawn.command_line()
        );
        self.policy = Some(policy.clone());
        self.adapter_state = Arc::new(StdMutex::new(AdapterState::default()));
        self.breakpoints_seen = payload.initial_breakpoints.clone();
        if let ConnectMode::Tcp { port } = payload.adapter_spawn.connect {
            self.child_port = Some(port);
        }

        if let Err(e) = tokio::fs::create_dir_all(&payload.log_dir).await {
            return self.critical(format!(
                "Failed to create session log directory {:?}: {}",
                payload.log_dir, e
            ));
        }

        if payload.dry_run_spawn {
            info!("Dry-run spawn for session {}", self.session_id);
            self.send_status(WorkerStatus::DryRunComplete {
                command: payload.adapter_spawn.command_line(),
                script: payload.script_path.clone(),
            });
            self.state = WorkerState::Terminated;
            // Let the acknowledgment and snapshot flush before exiting.
            tokio::time::sleep(DRY_RUN_FLUSH_DELAY).await;
            self.send_status(WorkerStatus::Terminated);
            return Flow::Stop;
        }

        // Spawn the adapter process, if this config owns one.
        let mut stdio_handles = None;
        if let Some(command) = &payload.adapter_spawn.command {
            let mut cmd = Command::new(command);
            cmd.args(&payload.adapter_spawn.args)
                .envs(&payload.adapter_spawn.env)
                .kill_on_drop(true);

            match payload.adapter_spawn.connect {
                ConnectMode::Stdio => {
                    cmd.stdin(std::process::Stdio::piped())
                        .stdout(std::process::Stdio::piped())
                        .stderr(std::process::Stdio::null());
                }
                ConnectMode::Tcp { .. } => {
                    cmd.stdin(std::process::Stdio::null())
                        .stdout(std::process::Stdio::null())
                        .stderr(std::process::Stdio::null());
                }
            }

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    return self.critical(format!("Failed to spawn debug adapter: {}", e));
                }
            };

            if payload.adapter_spawn.connect == ConnectMode::Stdio {
                let stdin = child.stdin.take();
                let stdout = child.stdout.take();
                match (stdin, stdout) {
                    (Some(stdin), Some(stdout)) => stdio_handles = Some((stdin, stdout)),
                    _ => {
                        return self.critical(
                            "Failed to take adapter stdio handles".to_string(),
                        );
                    }
                }
            }

            // Exit monitor: adapter death is an event, not a surprise.
            let (kill_tx, kill_rx) = oneshot::channel::<()>();
            self.kill_tx = Some(kill_tx);
            let monitor_tx = self.internal_tx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    status = child.wait() => {
                        let code = status.ok().and_then(|s| s.code());
                        let _ = monitor_tx.send(Internal::AdapterExited { code });
                    }
                    _ = kill_rx => {
                        let _ = child.kill().await;
                    }
                }
            });
        }

        // Connect the DAP transport.
        let halves = match payload.adapter_spawn.connect {
            ConnectMode::Tcp { port } => {
                match socket::connect_with_retry(port, CONNECT_TIMEOUT).await {
                    Ok(stream) => transport::from_socket(stream),
                    Err(e) => {
                        return self
                            .critical(format!("Failed to connect to debug adapter: {}", e));
                    }
                }
            }
            ConnectMode::Stdio => match stdio_handles {
                Some((stdin, stdout)) => transport::from_stdio(stdin, stdout),
                None => {
                    return self.critical(
                        "Stdio transport requires a spawn command".to_string(),
                    );
                }
            },
        };

        let tracer = match &payload.trace_dir {
            Some(dir) => FrameTracer::open(dir, &self.session_id).await.ok(),
            None => None,
        };

        let (reader, writer) = halves;
        let (client, mut inbound) = DapClient::new(reader, writer, tracer);
        let client = Arc::new(client);
        self.client = Some(client.clone());

        let forward_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if forward_tx.send(Internal::FromAdapter(message)).is_err() {
                    break;
                }
            }
        });

        if policy.requires_command_queueing() {
            self.send_status(WorkerStatus::AdapterConnected);
        }

        // Drain commands that raced the connection.
        let pre_connect: Vec<DapCommand> = self.pre_connect_queue.drain(..).collect();
        for cmd in pre_connect {
            self.handle_dap_command(cmd).await;
        }

        // DAP handshake: initialize, then launch. The launch response often
        // arrives only after configurationDone, so it waits in its own task.
        let init_args = InitializeRequestArguments::for_adapter(policy.dap_adapter_id());
        match client.initialize(init_args).await {
            Ok(_caps) => {
                let mut state = self.adapter_state.lock().unwrap();
                policy.update_state_on_response("initialize", true, &mut state);
            }
            Err(e) => {
                self.send_msg(WorkerMessage::Error {
                    message: format!("initialize failed: {}", e),
                });
                self.shutdown().await;
                return Flow::Stop;
            }
        }

        let mut launch_config = payload.launch_config.clone();
        let behavior = policy.initialization_behavior();
        if behavior.add_runtime_executable && launch_config.get("runtimeExecutable").is_none() {
            if let Some(command) = &payload.adapter_spawn.command {
                launch_config["runtimeExecutable"] = json!(command);
            }
        }

        {
            let mut state = self.adapter_state.lock().unwrap();
            policy.update_state_on_command("launch", &mut state);
        }
        {
            let client = client.clone();
            let policy = policy.clone();
            let adapter_state = self.adapter_state.clone();
            let tx = self.tx.clone();
            let session_id = self.session_id.clone();
            tokio::spawn(async move {
                match client.send_request("launch", Some(launch_config)).await {
                    Ok(_) => {
                        let mut state = adapter_state.lock().unwrap();
                        policy.update_state_on_response("launch", true, &mut state);
                    }
                    Err(e) => {
                        warn!("launch request failed: {}", e);
                        let _ = tx.send(WorkerEnvelope {
                            session_id,
                            message: WorkerMessage::Error {
                                message: format!("launch failed: {}", e),
                            },
                        });
                    }
                }
            });
        }

        if behavior.requires_initial_stop {
            let client = client.clone();
            tokio::spawn(enforce_initial_stop(client));
        }

        Flow::Continue
    }

    async fn handle_dap_command(&mut self, cmd: DapCommand) {
        if matches!(
            self.state,
            WorkerState::ShuttingDown | WorkerState::Terminated
        ) {
            self.respond(
                cmd.request_id,
                false,
                None,
                Some("disconnected".to_string()),
            );
            return;
        }

        if self.state == WorkerState::Uninitialized {
            self.respond(
                cmd.request_id,
                false,
                None,
                Some("worker not initialized".to_string()),
            );
            return;
        }

        if cmd.command == "setBreakpoints" {
            self.record_breakpoints(&cmd);
        }

        let Some(client) = self.client.clone() else {
            // Still Initializing, no connection yet.
            debug!(
                "Queueing '{}' until the adapter connection is up",
                cmd.command
            );
            self.pre_connect_queue.push(cmd);
            return;
        };

        let Some(policy) = self.policy.clone() else {
            self.respond(
                cmd.request_id,
                false,
                None,
                Some("worker not initialized".to_string()),
            );
            return;
        };

        if policy.requires_command_queueing() {
            let decision = {
                let state = self.adapter_state.lock().unwrap();
                policy.should_queue_command(&cmd.command, &state)
            };
            if decision.should_queue {
                debug!("Queueing '{}': {}", cmd.command, decision.reason);
                let mut queue = self.policy_queue.lock().await;
                queue.push(QueuedCommand {
                    request_id: cmd.request_id,
                    command: cmd.command.clone(),
                    arguments: cmd.arguments.clone(),
                    silent: false,
                });

                // Debounced silent configurationDone so the queue drains
                // into a fully configured adapter.
                let config_done_sent = self.adapter_state.lock().unwrap().configuration_done_sent;
                if policy.initialization_behavior().defer_config_done
                    && !config_done_sent
                    && !queue.iter().any(|c| c.command == "configurationDone")
                {
                    queue.push(QueuedCommand {
                        request_id: 0,
                        command: "configurationDone".to_string(),
                        arguments: None,
                        silent: true,
                    });
                }
                self.adapter_state.lock().unwrap().queued_commands = queue.len() as u32;
                return;
            }
        }

        self.route_and_execute(client, policy, cmd).await;
    }

    fn record_breakpoints(&mut self, cmd: &DapCommand) {
        let Some(args) = &cmd.arguments else { return };
        let Some(path) = args
            .get("source")
            .and_then(|s| s.get("path"))
            .and_then(Value::as_str)
        else {
            return;
        };
        let breakpoints: Vec<SourceBreakpoint> = args
            .get("breakpoints")
            .and_then(|b| serde_json::from_value(b.clone()).ok())
            .unwrap_or_default();
        self.breakpoints_seen.insert(path.to_string(), breakpoints);
    }

    async fn route_and_execute(
        &mut self,
        parent_client: Arc<DapClient>,
        policy: Arc<dyn AdapterPolicy>,
        cmd: DapCommand,
    ) {
        let uses_children = policy.stack_trace_requires_child();
        let debuggee_scoped = DEBUGGEE_SCOPED.contains(&cmd.command.as_str());

        let target = if uses_children && debuggee_scoped {
            match self.children.active().await {
                Some(child) => child,
                None => {
                    let had_children = self.adapter_state.lock().unwrap().child_sessions > 0;
                    let graceful = GRACEFUL_COMPLETION.contains(&cmd.command.as_str());

                    if graceful && had_children && !self.children.has_any().await {
                        // The debuggee finished and took its child session
                        // with it; completing the command is the right
                        // answer, not an error.
                        self.respond(cmd.request_id, true, None, None);
                        return;
                    }

                    if cmd.command == "stackTrace" {
                        self.spawn_stack_trace_wait(cmd, policy);
                        return;
                    }

                    parent_client
                }
            }
        } else {
            parent_client
        };

        self.spawn_execute(target, policy, cmd);
    }

    /// `stackTrace` against a child-routing adapter waits for a child to
    /// become ready instead of asking the parent, which has no frames.
    fn spawn_stack_trace_wait(&self, cmd: DapCommand, policy: Arc<dyn AdapterPolicy>) {
        let children = self.children.clone();
        let adapter_state = self.adapter_state.clone();
        let tx = self.tx.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            match children.wait_for_ready(CHILD_READY_TIMEOUT).await {
                Some(child) => {
                    let (success, body, error) =
                        execute_command(&child, &policy, &adapter_state, &cmd).await;
                    let _ = tx.send(WorkerEnvelope {
                        session_id,
                        message: WorkerMessage::DapResponse {
                            request_id: cmd.request_id,
                            success,
                            body,
                            error,
                        },
                    });
                }
                None => {
                    let _ = tx.send(WorkerEnvelope {
                        session_id,
                        message: WorkerMessage::DapResponse {
                            request_id: cmd.request_id,
                            success: false,
                            body: None,
                            error: Some(
                                "Child session not ready; no stack trace available".to_string(),
                            ),
                        },
                    });
                }
            }
        });
    }

    fn spawn_execute(
        &self,
        client: Arc<DapClient>,
        policy: Arc<dyn AdapterPolicy>,
        cmd: DapCommand,
    ) {
        let adapter_state = self.adapter_state.clone();
        let tx = self.tx.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            let (success, body, error) =
                execute_command(&client, &policy, &adapter_state, &cmd).await;
            let _ = tx.send(WorkerEnvelope {
                session_id,
                message: WorkerMessage::DapResponse {
                    request_id: cmd.request_id,
                    success,
                    body,
                    error,
                },
            });
        });
    }

    async fn handle_internal(&mut self, internal: Internal) -> Flow {
        match internal {
            Internal::FromAdapter(InboundMessage::Event(event)) => {
                if let Some(policy) = &self.policy {
                    let mut state = self.adapter_state.lock().unwrap();
                    policy.update_state_on_event(&event.event, &mut state);
                }

                if event.event == "initialized" && !self.initialized_handled {
                    self.initialized_handled = true;
                    self.spawn_configure();
                }

                let forward = matches!(
                    event.event.as_str(),
                    "stopped" | "continued" | "terminated" | "exited" | "thread" | "output"
                );
                if forward {
                    self.send_msg(WorkerMessage::DapEvent {
                        event: event.event.clone(),
                        body: event.body.clone(),
                    });
                }

                if event.event == "terminated" {
                    self.shutdown().await;
                    return Flow::Stop;
                }
                Flow::Continue
            }
            Internal::FromAdapter(InboundMessage::ReverseRequest(request)) => {
                self.handle_reverse_request(request);
                Flow::Continue
            }
            Internal::FromAdapter(InboundMessage::Closed(reason)) => {
                if matches!(
                    self.state,
                    WorkerState::ShuttingDown | WorkerState::Terminated
                ) {
                    return Flow::Continue;
                }
                self.send_msg(WorkerMessage::Error {
                    message: format!("Adapter connection closed: {}", reason),
                });
                self.shutdown().await;
                Flow::Stop
            }
            Internal::FromChild { child_id, message } => {
                self.handle_child_message(child_id, message).await;
                Flow::Continue
            }
            Internal::AdapterExited { code } => {
                if matches!(
                    self.state,
                    WorkerState::ShuttingDown | WorkerState::Terminated
                ) {
                    return Flow::Continue;
                }
                self.send_msg(WorkerMessage::Error {
                    message: format!("Debug adapter exited early (code {:?})", code),
                });
                self.shutdown().await;
                Flow::Stop
            }
            Internal::ChildConfigured { child_id } => {
                self.children.mark_ready(&child_id).await;
                {
                    let mut state = self.adapter_state.lock().unwrap();
                    state.child_adoption_pending = false;
                    state.child_sessions += 1;
                }
                self.adoption_done.notify_waiters();
                self.spawn_drain_if_needed();
                Flow::Continue
            }
            Internal::ChildAdoptionFailed { child_id, error } => {
                warn!("Child session '{}' adoption failed: {}", child_id, error);
                self.children.remove(&child_id).await;
                self.adapter_state.lock().unwrap().child_adoption_pending = false;
                self.adoption_done.notify_waiters();
                self.send_msg(WorkerMessage::Error {
                    message: format!("Child session adoption failed: {}", error),
                });
                self.spawn_drain_if_needed();
                Flow::Continue
            }
            Internal::ConfigureFinished => {
                if self.state == WorkerState::Initializing {
                    self.state = WorkerState::Connected;
                }
                Flow::Continue
            }
        }
    }

    async fn handle_child_message(&mut self, child_id: String, message: InboundMessage) {
        match message {
            InboundMessage::Event(event) => {
                // Child events drive the session state exactly like parent
                // events; the user sees one debugging conversation.
                self.send_msg(WorkerMessage::DapEvent {
                    event: event.event.clone(),
                    body: event.body.clone(),
                });
                if matches!(event.event.as_str(), "terminated" | "exited") {
                    self.children.remove(&child_id).await;
                }
            }
            InboundMessage::ReverseRequest(request) => {
                if let Some(child) = self.children.get(&child_id).await {
                    let _ = child.send_response(request.seq, &request.command, true, Some(json!({})));
                }
            }
            InboundMessage::Closed(reason) => {
                debug!("Child session '{}' connection closed: {}", child_id, reason);
                self.children.remove(&child_id).await;
            }
        }
    }

    fn handle_reverse_request(&mut self, request: Request) {
        let Some(client) = self.client.clone() else {
            return;
        };
        let outcome = self
            .policy
            .as_ref()
            .map(|p| p.handle_reverse_request(&request))
            .unwrap_or_default();

        if let Some(child_req) = outcome.create_child_session {
            self.adapter_state.lock().unwrap().child_adoption_pending = true;
            let child_id = child_req
                .pending_target_id
                .clone()
                .unwrap_or_else(|| format!("child-{}", Uuid::new_v4()));

            match self.child_port {
                Some(port) => {
                    let adapter_id = self
                        .policy
                        .as_ref()
                        .map(|p| p.dap_adapter_id().to_string())
                        .unwrap_or_else(|| "debug-adapter".to_string());
                    let children = self.children.clone();
                    let internal_tx = self.internal_tx.clone();
                    let breakpoints = self.breakpoints_seen.clone();
                    tokio::spawn(adopt_child(
                        child_id,
                        child_req.pending_target_id,
                        port,
                        adapter_id,
                        breakpoints,
                        children,
                        internal_tx,
                    ));
                }
                None => {
                    warn!("Reverse startDebugging on a stdio adapter; cannot adopt a child");
                    self.adapter_state.lock().unwrap().child_adoption_pending = false;
                }
            }
        } else if !outcome.handled && request.command != "runInTerminal" {
            warn!(
                "Acknowledging unrecognized reverse request '{}'",
                request.command
            );
        }

        // Every reverse request gets a success acknowledgment; leaving one
        // unanswered deadlocks some adapters.
        let _ = client.send_response(request.seq, &request.command, true, Some(json!({})));
    }

    /// On `initialized`: initial breakpoints, then configuration, honoring
    /// the policy's queue drain and child-adoption deferral.
    fn spawn_configure(&mut self) {
        let Some(client) = self.client.clone() else {
            return;
        };
        let Some(policy) = self.policy.clone() else {
            return;
        };
        let adapter_state = self.adapter_state.clone();
        let queue = self.policy_queue.clone();
        let adoption_done = self.adoption_done.clone();
        let breakpoints = self.breakpoints_seen.clone();
        let tx = self.tx.clone();
        let session_id = self.session_id.clone();
        let internal_tx = self.internal_tx.clone();

        tokio::spawn(async move {
            for (file, bps) in breakpoints {
                if let Err(e) = client
                    .set_breakpoints(Source::from_path(&file), bps)
                    .await
                {
                    warn!("Failed to set initial breakpoints for {}: {}", file, e);
                }
            }

            if policy.requires_command_queueing() {
                {
                    let mut q = queue.lock().await;
                    let config_done_sent =
                        adapter_state.lock().unwrap().configuration_done_sent;
                    if !config_done_sent && !q.iter().any(|c| c.command == "configurationDone") {
                        q.push(QueuedCommand {
                            request_id: 0,
                            command: "configurationDone".to_string(),
                            arguments: None,
                            silent: true,
                        });
                    }
                }

                let adoption_pending = adapter_state.lock().unwrap().child_adoption_pending;
                if adoption_pending {
                    // Bounded deferral: wait for the child, but never hold
                    // the parent's configuration hostage.
                    let _ = tokio::time::timeout(CONFIG_DONE_DEFER, adoption_done.notified())
                        .await;
                }

                drain_queue(&queue, &policy, &adapter_state, &client, &tx, &session_id).await;
            } else {
                let config_done = DapCommand {
                    request_id: 0,
                    command: "configurationDone".to_string(),
                    arguments: None,
                    timeout_ms: None,
                };
                let (success, _, error) =
                    execute_command(&client, &policy, &adapter_state, &config_done).await;
                if !success {
                    warn!("configurationDone failed: {:?}", error);
                }
            }

            let _ = tx.send(WorkerEnvelope {
                session_id: session_id.clone(),
                message: WorkerMessage::Status(WorkerStatus::AdapterConfiguredAndLaunched),
            });

            let snapshot = adapter_state.lock().unwrap().clone();
            if let Err(e) = policy.perform_handshake(&client, &snapshot).await {
                warn!("Policy handshake failed: {}", e);
            }

            let _ = internal_tx.send(Internal::ConfigureFinished);
        });
    }

    /// Drain the policy queue after adoption finishes; a deferred
    /// `configurationDone` may still be parked there.
    fn spawn_drain_if_needed(&self) {
        let Some(client) = self.client.clone() else {
            return;
        };
        let Some(policy) = self.policy.clone() else {
            return;
        };
        if !policy.requires_command_queueing() || !self.initialized_handled {
            return;
        }
        let queue = self.policy_queue.clone();
        let adapter_state = self.adapter_state.clone();
        let tx = self.tx.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            drain_queue(&queue, &policy, &adapter_state, &client, &tx, &session_id).await;
        });
    }

    async fn shutdown(&mut self) {
        if self.state == WorkerState::Terminated {
            return;
        }
        info!("Worker {} shutting down", self.session_id);
        self.state = WorkerState::ShuttingDown;

        // Everything still parked gets a rejection, not silence.
        let parked: Vec<DapCommand> = self.pre_connect_queue.drain(..).collect();
        for cmd in parked {
            self.respond(
                cmd.request_id,
                false,
                None,
                Some("disconnected".to_string()),
            );
        }
        let queued: Vec<QueuedCommand> = self.policy_queue.lock().await.drain(..).collect();
        for cmd in queued {
            if !cmd.silent {
                self.respond(
                    cmd.request_id,
                    false,
                    None,
                    Some("disconnected".to_string()),
                );
            }
        }

        self.children.shutdown_all().await;

        if let Some(client) = &self.client {
            let _ = client.disconnect().await;
            client.shutdown().await;
        }

        if let Some(kill) = self.kill_tx.take() {
            let _ = kill.send(());
        }

        self.state = WorkerState::Terminated;
        self.send_status(WorkerStatus::Terminated);
    }
}

/// Send one command on a client, updating policy state around it.
async fn execute_command(
    client: &DapClient,
    policy: &Arc<dyn AdapterPolicy>,
    adapter_state: &Arc<StdMutex<AdapterState>>,
    cmd: &DapCommand,
) -> (bool, Option<Value>, Option<String>) {
    {
        let mut state = adapter_state.lock().unwrap();
        policy.update_state_on_command(&cmd.command, &mut state);
    }

    let timeout = cmd
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(crate::dap::requests::DEFAULT_REQUEST_TIMEOUT);

    match client
        .send_request_with_timeout(&cmd.command, cmd.arguments.clone(), timeout)
        .await
    {
        Ok(response) => {
            let mut state = adapter_state.lock().unwrap();
            policy.update_state_on_response(&cmd.command, true, &mut state);
            (true, response.body, None)
        }
        Err(e) => {
            let mut state = adapter_state.lock().unwrap();
            policy.update_state_on_response(&cmd.command, false, &mut state);
            (false, None, Some(e.to_string()))
        }
    }
}

/// Execute parked commands in policy order, forwarding responses for the
/// non-silent ones. Loops until the queue stays empty, so entries added
/// mid-drain are not stranded.
async fn drain_queue(
    queue: &Arc<Mutex<Vec<QueuedCommand>>>,
    policy: &Arc<dyn AdapterPolicy>,
    adapter_state: &Arc<StdMutex<AdapterState>>,
    client: &Arc<DapClient>,
    tx: &mpsc::UnboundedSender<WorkerEnvelope>,
    session_id: &str,
) {
    loop {
        let batch: Vec<QueuedCommand> = {
            let mut q = queue.lock().await;
            if q.is_empty() {
                break;
            }
            q.drain(..).collect()
        };

        let batch = {
            let snapshot = adapter_state.lock().unwrap().clone();
            policy.process_queued_commands(batch, &snapshot)
        };

        for queued in batch {
            if queued.command == "configurationDone"
                && adapter_state.lock().unwrap().configuration_done_sent
            {
                // Already configured; acknowledge rather than re-send.
                if !queued.silent {
                    let _ = tx.send(WorkerEnvelope {
                        session_id: session_id.to_string(),
                        message: WorkerMessage::DapResponse {
                            request_id: queued.request_id,
                            success: true,
                            body: None,
                            error: None,
                        },
                    });
                }
                continue;
            }

            let cmd = DapCommand {
                request_id: queued.request_id,
                command: queued.command.clone(),
                arguments: queued.arguments.clone(),
                timeout_ms: None,
            };
            let (success, body, error) =
                execute_command(client, policy, adapter_state, &cmd).await;
            if !queued.silent {
                let _ = tx.send(WorkerEnvelope {
                    session_id: session_id.to_string(),
                    message: WorkerMessage::DapResponse {
                        request_id: queued.request_id,
                        success,
                        body,
                        error,
                    },
                });
            }
        }
    }
}

/// Connect a secondary DAP client to the adapter's port and walk it through
/// initialize → launch(__pendingTargetId) → breakpoints → configurationDone.
async fn adopt_child(
    child_id: String,
    pending_target_id: Option<String>,
    port: u16,
    adapter_id: String,
    breakpoints: HashMap<String, Vec<SourceBreakpoint>>,
    children: ChildManager,
    internal_tx: mpsc::UnboundedSender<Internal>,
) {
    info!("Adopting child session '{}' on port {}", child_id, port);

    let result: crate::Result<()> = async {
        let socket = socket::connect_with_retry(port, CHILD_CONNECT_TIMEOUT).await?;
        let (reader, writer) = transport::from_socket(socket);
        let (client, mut inbound) = DapClient::new(reader, writer, None);
        let client = Arc::new(client);

        children.add(child_id.clone(), client.clone()).await;

        let forward_tx = internal_tx.clone();
        let forward_id = child_id.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let sent = forward_tx.send(Internal::FromChild {
                    child_id: forward_id.clone(),
                    message,
                });
                if sent.is_err() {
                    break;
                }
            }
        });

        client
            .initialize(InitializeRequestArguments::for_adapter(&adapter_id))
            .await?;

        // The adapter matches this connection to its pending target; it
        // never answers this launch.
        let mut launch = json!({"type": adapter_id, "request": "launch"});
        if let Some(target) = &pending_target_id {
            launch["__pendingTargetId"] = json!(target);
        }
        client.send_request_nowait("launch", Some(launch))?;

        for (file, bps) in breakpoints {
            if let Err(e) = client.set_breakpoints(Source::from_path(&file), bps).await {
                warn!("Failed to mirror breakpoints for {}: {}", file, e);
            }
        }

        client.configuration_done().await?;
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            let _ = internal_tx.send(Internal::ChildConfigured { child_id });
        }
        Err(e) => {
            let _ = internal_tx.send(Internal::ChildAdoptionFailed {
                child_id,
                error: e.to_string(),
            });
        }
    }
}

/// Some adapters never stop on their own after launch; poll for a thread
/// and pause it so the first step request has a stopped debuggee.
async fn enforce_initial_stop(client: Arc<DapClient>) {
    let deadline = tokio::time::Instant::now() + INITIAL_STOP_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(THREADS_PROBE_TIMEOUT, client.threads()).await {
            Ok(Ok(threads)) if !threads.is_empty() => {
                let thread_id = threads[0].id;
                debug!("Initial-stop enforcement pausing thread {}", thread_id);
                let _ = client.pause(thread_id).await;
                return;
            }
            _ => {}
        }
        tokio::time::sleep(INITIAL_STOP_POLL_INTERVAL).await;
    }
    debug!("Initial-stop enforcement gave up waiting for threads");
}
