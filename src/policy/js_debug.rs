//! vscode-js-debug (Node.js / pwa-node) adapter policy.
//!
//! js-debug is the awkward one: it queues debuggee commands until the
//! `initialized` event, spawns the actual debuggee in a *child* DAP session
//! announced via a reverse `startDebugging` request, and never answers the
//! child's `launch`. The parent session coordinates and does not run user
//! code, so `stackTrace` must be served by a child.

use super::*;
use serde_json::json;
use tracing::info;

/// Vendored dapDebugServer.js probe locations, bundled-install first.
const SERVER_LOCATIONS: &[&str] = &[
    "/usr/local/lib/vscode-js-debug/src/dapDebugServer.js",
    "/usr/local/lib/js-debug/src/dapDebugServer.js",
    "~/.vscode-js-debug/src/dapDebugServer.js",
];

/// Commands held until the adapter has announced `initialized`.
const QUEUED_BEFORE_INITIALIZED: &[&str] = &[
    "setBreakpoints",
    "setExceptionBreakpoints",
    "configurationDone",
];

pub struct JsDebugPolicy;

impl JsDebugPolicy {
    fn server_path(container_mode: bool) -> Result<String> {
        let locations: Vec<&str> = if container_mode {
            // Container images only carry the bundled copy.
            SERVER_LOCATIONS[..1].to_vec()
        } else {
            SERVER_LOCATIONS.to_vec()
        };

        for location in locations {
            let expanded = shellexpand::tilde(location);
            if std::path::Path::new(expanded.as_ref()).exists() {
                return Ok(expanded.to_string());
            }
        }

        Err(Error::ExecutableNotFound(
            "vscode-js-debug not found. Install from \
             https://github.com/microsoft/vscode-js-debug/releases/latest"
                .to_string(),
        ))
    }

    /// Strip `--inspect` / `--inspect-brk` from runtime args; the adapter
    /// owns the inspector and a second flag breaks child adoption timing.
    fn strip_inspect_args(launch: &mut Value) {
        let Some(runtime_args) = launch.get_mut("runtimeArgs").and_then(Value::as_array_mut)
        else {
            return;
        };
        runtime_args.retain(|arg| {
            let Some(arg) = arg.as_str() else { return true };
            let keep = !arg.starts_with("--inspect");
            if !keep {
                info!("Stripping runtime arg {:?} from js-debug launch", arg);
            }
            keep
        });
    }
}

#[async_trait]
impl AdapterPolicy for JsDebugPolicy {
    fn id(&self) -> &'static str {
        "js-debug"
    }

    fn matches_adapter(&self, spawn: &AdapterSpawn) -> bool {
        spawn.mentions("dapDebugServer.js")
            || spawn.mentions("vsDebugServer.js")
            || spawn.mentions("js-debug")
    }

    fn matches_language(&self, language: &str) -> bool {
        matches!(language, "javascript" | "typescript" | "node" | "nodejs")
    }

    fn build_spawn(&self, ctx: &SpawnContext<'_>) -> Result<AdapterSpawn> {
        let node = self.resolve_executable(ctx.executable_hint)?;
        let server = Self::server_path(ctx.container_mode)?;
        Ok(AdapterSpawn {
            command: Some(node),
            args: vec![
                server,
                ctx.port.to_string(),
                // Explicit IPv4: the server defaults to ::1, which breaks
                // localhost connects on v4-only stacks.
                "127.0.0.1".to_string(),
            ],
            env: HashMap::new(),
            connect: ConnectMode::Tcp { port: ctx.port },
        })
    }

    fn dap_adapter_id(&self) -> &'static str {
        "pwa-node"
    }

    fn initialization_behavior(&self) -> InitializationBehavior {
        InitializationBehavior {
            defer_config_done: true,
            add_runtime_executable: true,
            track_initialize_response: true,
            ..Default::default()
        }
    }

    fn requires_command_queueing(&self) -> bool {
        true
    }

    fn should_queue_command(&self, command: &str, state: &AdapterState) -> QueueDecision {
        if !state.initialized_event_seen && QUEUED_BEFORE_INITIALIZED.contains(&command) {
            return QueueDecision::queue("adapter has not announced initialized yet");
        }
        if command == "configurationDone" && state.child_adoption_pending {
            return QueueDecision {
                should_queue: true,
                should_defer_config_done: true,
                reason: "child session adoption in progress",
            };
        }
        QueueDecision::pass()
    }

    fn process_queued_commands(
        &self,
        mut queue: Vec<QueuedCommand>,
        _state: &AdapterState,
    ) -> Vec<QueuedCommand> {
        // Stable partition: every setBreakpoints before configurationDone,
        // original order otherwise preserved.
        queue.sort_by_key(|cmd| usize::from(cmd.command == "configurationDone"));
        queue
    }

    fn handle_reverse_request(&self, request: &Request) -> ReverseRequestOutcome {
        if request.command != "startDebugging" {
            return ReverseRequestOutcome::default();
        }

        let configuration = request
            .arguments
            .as_ref()
            .and_then(|args| args.get("configuration"))
            .cloned()
            .unwrap_or_else(|| json!({}));
        let pending_target_id = configuration
            .get("__pendingTargetId")
            .and_then(Value::as_str)
            .map(str::to_string);

        ReverseRequestOutcome {
            handled: true,
            create_child_session: Some(ChildSpawnRequest {
                pending_target_id,
                configuration,
            }),
        }
    }

    fn is_session_ready(&self, check: &ReadinessCheck) -> bool {
        if check.stop_on_entry {
            check.paused
        } else {
            // The parent reports configured before any child runs code;
            // that is the earliest point stepping requests can be accepted.
            check.paused || check.configured
        }
    }

    fn stack_trace_requires_child(&self) -> bool {
        true
    }

    fn normalize_launch_config(&self, config: Value, ctx: &LaunchContext<'_>) -> Value {
        // Child-adoption timing workaround: only force stopOnEntry=false
        // when the caller left it unset. An explicit request is honored.
        let stop_on_entry = ctx.stop_on_entry.unwrap_or(false);

        let base = json!({
            "type": "pwa-node",
            "request": "launch",
            "console": "internalConsole",
            "stopOnEntry": stop_on_entry,
        });
        let mut launch = merge_launch(base, &config);
        launch["stopOnEntry"] = json!(stop_on_entry);
        if ctx.stop_on_entry.is_none() {
            Self::strip_inspect_args(&mut launch);
        }
        launch
    }

    fn resolve_executable(&self, hint: Option<&str>) -> Result<String> {
        if let Some(hint) = hint {
            return Ok(hint.to_string());
        }
        find_in_path(&["node"])
            .ok_or_else(|| Error::ExecutableNotFound("no node on PATH".to_string()))
    }
}
