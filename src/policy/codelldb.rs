//! CodeLLDB adapter policy (Rust, C, C++ over LLDB).

use super::*;
use serde_json::json;

pub struct CodeLldbPolicy;

#[async_trait]
impl AdapterPolicy for CodeLldbPolicy {
    fn id(&self) -> &'static str {
        "codelldb"
    }

    fn matches_adapter(&self, spawn: &AdapterSpawn) -> bool {
        spawn.mentions("codelldb")
    }

    fn matches_language(&self, language: &str) -> bool {
        matches!(language, "rust" | "c" | "cpp" | "c++")
    }

    fn build_spawn(&self, ctx: &SpawnContext<'_>) -> Result<AdapterSpawn> {
        let codelldb = self.resolve_executable(ctx.executable_hint)?;
        Ok(AdapterSpawn {
            command: Some(codelldb),
            args: vec!["--port".to_string(), ctx.port.to_string()],
            env: HashMap::new(),
            connect: ConnectMode::Tcp { port: ctx.port },
        })
    }

    fn dap_adapter_id(&self) -> &'static str {
        "lldb"
    }

    fn initialization_behavior(&self) -> InitializationBehavior {
        InitializationBehavior {
            track_initialize_response: true,
            ..Default::default()
        }
    }

    fn normalize_launch_config(&self, config: Value, ctx: &LaunchContext<'_>) -> Value {
        let base = json!({
            "type": "lldb",
            "request": "launch",
            "terminal": "console",
            "stopOnEntry": ctx.stop_on_entry.unwrap_or(false),
        });
        merge_launch(base, &config)
    }

    fn resolve_executable(&self, hint: Option<&str>) -> Result<String> {
        if let Some(hint) = hint {
            return Ok(hint.to_string());
        }
        find_in_path(&["codelldb"])
            .ok_or_else(|| Error::ExecutableNotFound("no codelldb on PATH".to_string()))
    }
}
