//! Pass-through policy for adapters nothing else claims.

use super::*;
use serde_json::json;

pub struct DefaultPolicy;

#[async_trait]
impl AdapterPolicy for DefaultPolicy {
    fn id(&self) -> &'static str {
        "default"
    }

    fn matches_adapter(&self, _spawn: &AdapterSpawn) -> bool {
        false
    }

    fn matches_language(&self, _language: &str) -> bool {
        false
    }

    fn build_spawn(&self, ctx: &SpawnContext<'_>) -> Result<AdapterSpawn> {
        let command = self.resolve_executable(ctx.executable_hint)?;
        Ok(AdapterSpawn {
            command: Some(command),
            args: vec![],
            env: HashMap::new(),
            connect: ConnectMode::Stdio,
        })
    }

    fn dap_adapter_id(&self) -> &'static str {
        "debug-adapter"
    }

    fn normalize_launch_config(&self, config: Value, ctx: &LaunchContext<'_>) -> Value {
        let base = json!({
            "request": "launch",
            "stopOnEntry": ctx.stop_on_entry.unwrap_or(false),
        });
        merge_launch(base, &config)
    }

    fn resolve_executable(&self, hint: Option<&str>) -> Result<String> {
        hint.map(str::to_string).ok_or_else(|| {
            Error::ExecutableNotFound("no adapter executable supplied".to_string())
        })
    }
}
