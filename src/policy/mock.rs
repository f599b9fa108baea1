//! Mock adapter policy for tests: attaches to a scripted DAP endpoint.

use super::*;
use serde_json::json;

pub struct MockPolicy;

#[async_trait]
impl AdapterPolicy for MockPolicy {
    fn id(&self) -> &'static str {
        "mock"
    }

    fn matches_adapter(&self, spawn: &AdapterSpawn) -> bool {
        spawn.mentions("mock-dap") || spawn.command.is_none()
    }

    fn matches_language(&self, language: &str) -> bool {
        language == "mock"
    }

    fn build_spawn(&self, ctx: &SpawnContext<'_>) -> Result<AdapterSpawn> {
        Ok(AdapterSpawn {
            // No process: the test harness is already listening.
            command: ctx.executable_hint.map(str::to_string),
            args: vec![],
            env: HashMap::new(),
            connect: ConnectMode::Tcp { port: ctx.port },
        })
    }

    fn dap_adapter_id(&self) -> &'static str {
        "mock"
    }

    fn normalize_launch_config(&self, config: Value, ctx: &LaunchContext<'_>) -> Value {
        let base = json!({
            "type": "mock",
            "request": "launch",
            "stopOnEntry": ctx.stop_on_entry.unwrap_or(false),
        });
        merge_launch(base, &config)
    }

    fn resolve_executable(&self, hint: Option<&str>) -> Result<String> {
        Ok(hint.unwrap_or("mock-dap").to_string())
    }
}
