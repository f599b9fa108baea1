//! Environment knobs recognized by the core.
//!
//! Only three variables are consulted: the DAP frame-trace target, the
//! container-mode switch for bundled adapter locations, and the disabled
//! language list. Everything else is configuration of the outer surface.

use std::path::PathBuf;

pub const ENV_TRACE_DIR: &str = "DAP_BRIDGE_TRACE_DIR";
pub const ENV_CONTAINER: &str = "DAP_BRIDGE_CONTAINER";
pub const ENV_DISABLED_LANGUAGES: &str = "DAP_BRIDGE_DISABLED_LANGUAGES";

#[derive(Debug, Clone, Default)]
pub struct CoreEnv {
    /// Target directory for NDJSON DAP frame traces. None disables tracing.
    pub trace_dir: Option<PathBuf>,
    /// Prefer bundled adapter install locations (container images).
    pub container_mode: bool,
    /// Language tags rejected at session creation.
    pub disabled_languages: Vec<String>,
}

impl CoreEnv {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary lookup so tests don't mutate process env.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let trace_dir = lookup(ENV_TRACE_DIR)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let container_mode = lookup(ENV_CONTAINER)
            .map(|v| {
                let v = v.trim().to_ascii_lowercase();
                v == "1" || v == "true" || v == "yes"
            })
            .unwrap_or(false);

        let disabled_languages = lookup(ENV_DISABLED_LANGUAGES)
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_ascii_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            trace_dir,
            container_mode,
            disabled_languages,
        }
    }

    pub fn language_disabled(&self, language: &str) -> bool {
        let language = language.to_ascii_lowercase();
        self.disabled_languages.iter().any(|l| l == &language)
    }
}
