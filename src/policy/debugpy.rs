//! debugpy (Python) adapter policy.

use super::*;
use serde_json::json;

pub struct DebugpyPolicy;

#[async_trait]
impl AdapterPolicy for DebugpyPolicy {
    fn id(&self) -> &'static str {
        "debugpy"
    }

    fn matches_adapter(&self, spawn: &AdapterSpawn) -> bool {
        spawn.mentions("debugpy")
    }

    fn matches_language(&self, language: &str) -> bool {
        language == "python"
    }

    fn build_spawn(&self, ctx: &SpawnContext<'_>) -> Result<AdapterSpawn> {
        let python = self.resolve_executable(ctx.executable_hint)?;
        Ok(AdapterSpawn {
            command: Some(python),
            args: vec![
                "-m".to_string(),
                "debugpy.adapter".to_string(),
                "--port".to_string(),
                ctx.port.to_string(),
            ],
            env: HashMap::new(),
            connect: ConnectMode::Tcp { port: ctx.port },
        })
    }

    fn dap_adapter_id(&self) -> &'static str {
        "debugpy"
    }

    fn initialization_behavior(&self) -> InitializationBehavior {
        InitializationBehavior {
            track_initialize_response: true,
            ..Default::default()
        }
    }

    fn normalize_launch_config(&self, config: Value, ctx: &LaunchContext<'_>) -> Value {
        let base = json!({
            "type": "python",
            "request": "launch",
            "console": "internalConsole",
            "justMyCode": true,
            "stopOnEntry": ctx.stop_on_entry.unwrap_or(false),
        });
        merge_launch(base, &config)
    }

    fn resolve_executable(&self, hint: Option<&str>) -> Result<String> {
        if let Some(hint) = hint {
            return Ok(hint.to_string());
        }
        find_in_path(&["python3", "python"]).ok_or_else(|| {
            Error::PythonNotFound(
                "no python3 or python on PATH; pass an interpreter path explicitly".to_string(),
            )
        })
    }
}
