//! lldb-dap adapter policy.
//!
//! lldb-dap is natively a stdio adapter; it exits immediately when asked to
//! serve TCP on the versions we target, so the spawn config keeps it on
//! stdio and the same framer handles both transports. It is never the
//! default for a language: callers reach it through an explicit adapter
//! override.

use super::*;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

const HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const HANDSHAKE_POLL_ATTEMPTS: u32 = 50;

pub struct LldbDapPolicy;

#[async_trait]
impl AdapterPolicy for LldbDapPolicy {
    fn id(&self) -> &'static str {
        "lldb-dap"
    }

    fn matches_adapter(&self, spawn: &AdapterSpawn) -> bool {
        spawn.mentions("lldb-dap") || spawn.mentions("lldb-vscode")
    }

    fn matches_language(&self, _language: &str) -> bool {
        false
    }

    fn build_spawn(&self, ctx: &SpawnContext<'_>) -> Result<AdapterSpawn> {
        let lldb_dap = self.resolve_executable(ctx.executable_hint)?;
        Ok(AdapterSpawn {
            command: Some(lldb_dap),
            args: vec![],
            env: HashMap::new(),
            connect: ConnectMode::Stdio,
        })
    }

    fn dap_adapter_id(&self) -> &'static str {
        "lldb"
    }

    fn initialization_behavior(&self) -> InitializationBehavior {
        InitializationBehavior {
            // lldb-dap does not reliably honor stopOnEntry; force a stop so
            // the first step request has somewhere to land.
            requires_initial_stop: true,
            track_initialize_response: true,
            ..Default::default()
        }
    }

    async fn perform_handshake(&self, client: &DapClient, _state: &AdapterState) -> Result<()> {
        // Settle: wait until the debuggee reports at least one thread.
        for attempt in 0..HANDSHAKE_POLL_ATTEMPTS {
            match client.threads().await {
                Ok(threads) if !threads.is_empty() => {
                    debug!("lldb-dap reported {} thread(s)", threads.len());
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => debug!("threads probe {} failed: {}", attempt, e),
            }
            tokio::time::sleep(HANDSHAKE_POLL_INTERVAL).await;
        }
        Ok(())
    }

    fn normalize_launch_config(&self, config: Value, ctx: &LaunchContext<'_>) -> Value {
        let base = json!({
            "type": "lldb",
            "request": "launch",
            "stopOnEntry": ctx.stop_on_entry.unwrap_or(false),
        });
        merge_launch(base, &config)
    }

    fn resolve_executable(&self, hint: Option<&str>) -> Result<String> {
        if let Some(hint) = hint {
            return Ok(hint.to_string());
        }
        find_in_path(&["lldb-dap", "lldb-vscode"])
            .ok_or_else(|| Error::ExecutableNotFound("no lldb-dap on PATH".to_string()))
    }
}
