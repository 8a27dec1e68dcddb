//! Policy, catalog, and environment-override loading.

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::commands::CommandOptions;
use crate::core::healing::model_policy_fingerprint;
use crate::core::policy::{CommitPolicy, ModelPolicy, Policies, RetryPolicy, RoutingPolicy, RuntimePolicy};
use crate::core::types::AgentCatalog;
use crate::io::paths::CoordinationPaths;
use crate::io::store::{load_document, load_yaml_or_json};

/// How the worker is invoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerMode {
    #[default]
    Codex,
    /// Synthetic success without spawning anything; host probes are skipped.
    Mock,
}

/// `1`, `true`, `yes`, `on` (any case).
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Recognised environment overrides, read once per process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub worker_mode: WorkerMode,
    pub codex_command: Option<String>,
    pub python_command: Option<String>,
    pub enable_frontend_visual_qa: bool,
    pub frontend_visual_qa_strict: bool,
    pub allow_full_suite_validation: bool,
    pub no_color: bool,
    pub color_logs: bool,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let flag = |key: &str| text(key).is_some_and(|v| is_truthy(&v));
        let worker_mode = match text("REDKEEPERS_WORKER_MODE").as_deref() {
            Some(mode) if mode.eq_ignore_ascii_case("mock") => WorkerMode::Mock,
            _ => WorkerMode::Codex,
        };
        Self {
            worker_mode,
            codex_command: text("REDKEEPERS_CODEX_COMMAND"),
            python_command: text("REDKEEPERS_PYTHON_CMD"),
            enable_frontend_visual_qa: flag("REDKEEPERS_ENABLE_FRONTEND_VISUAL_QA"),
            frontend_visual_qa_strict: flag("REDKEEPERS_FRONTEND_VISUAL_QA_STRICT"),
            allow_full_suite_validation: flag("REDKEEPERS_ALLOW_FULL_SUITE_VALIDATION"),
            // NO_COLOR disables colour whatever its value.
            no_color: lookup("NO_COLOR").is_some(),
            color_logs: flag("REDKEEPERS_COLOR_LOGS"),
        }
    }

    pub fn is_mock(&self) -> bool {
        self.worker_mode == WorkerMode::Mock
    }

    /// Validation interpreter: env override, then `runtime.python_command`.
    pub fn python_launcher(&self, runtime: &RuntimePolicy) -> Option<String> {
        self.python_command
            .clone()
            .or_else(|| runtime.python_command.clone())
            .filter(|cmd| !cmd.trim().is_empty())
    }

    pub fn command_options(&self, policies: &Policies) -> CommandOptions {
        let visual = &policies.commit.frontend_visual_qa;
        CommandOptions {
            allow_full_suite: self.allow_full_suite_validation,
            frontend_visual_enabled: visual.enabled || self.enable_frontend_visual_qa,
            frontend_visual_strict: visual.strict || self.frontend_visual_qa_strict,
            python_launcher: self.python_launcher(&policies.runtime),
        }
    }
}

/// Load all five policy documents and fingerprint the model policy.
pub fn load_policies(paths: &CoordinationPaths) -> Result<Policies> {
    let (routing, _): (RoutingPolicy, _) = load_yaml_or_json(&paths.routing_policy)?;
    let (retry, _): (RetryPolicy, _) = load_yaml_or_json(&paths.retry_policy)?;
    let (model, raw_model): (ModelPolicy, _) = load_yaml_or_json(&paths.model_policy)?;
    let (commit, _): (CommitPolicy, _) = load_yaml_or_json(&paths.commit_policy)?;
    let (runtime, _): (RuntimePolicy, _) = load_yaml_or_json(&paths.runtime_policy)?;
    let model_fingerprint = model_policy_fingerprint(&raw_model);
    debug!(fingerprint = %model_fingerprint, "policies loaded");
    Ok(Policies {
        routing,
        retry,
        model,
        commit,
        runtime,
        model_fingerprint,
    })
}

pub fn load_catalog(paths: &CoordinationPaths) -> Result<AgentCatalog> {
    load_document(&paths.agents, AgentCatalog::new())
        .with_context(|| format!("load agent catalog {}", paths.agents.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    fn overrides(pairs: &[(&str, &str)]) -> EnvOverrides {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvOverrides::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn truthy_values_are_recognised_options() {
        for value in ["1", "true", "YES", " on "] {
            assert!(is_truthy(value), "{value}");
        }
        for value in ["0", "false", "off", "", "enabled"] {
            assert!(!is_truthy(value), "{value}");
        }
    }

    #[test]
    fn env_overrides_merge_into_command_options() {
        let env = overrides(&[
            ("REDKEEPERS_WORKER_MODE", "Mock"),
            ("REDKEEPERS_PYTHON_CMD", "/venv/bin/python"),
            ("REDKEEPERS_ENABLE_FRONTEND_VISUAL_QA", "yes"),
            ("REDKEEPERS_ALLOW_FULL_SUITE_VALIDATION", "0"),
            ("NO_COLOR", ""),
        ]);
        assert!(env.is_mock());
        assert!(env.no_color);
        let options = env.command_options(&Policies::default());
        assert!(options.frontend_visual_enabled);
        assert!(!options.frontend_visual_strict);
        assert!(!options.allow_full_suite);
        assert_eq!(options.python_launcher.as_deref(), Some("/venv/bin/python"));
    }

    #[test]
    fn missing_policies_take_defaults_and_fingerprint_changes_with_model_policy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = CoordinationPaths::new(temp.path());
        let empty = load_policies(&paths).expect("load");
        assert_eq!(empty.retry.max_retries_per_item_per_agent, 2);

        fs::create_dir_all(&paths.policies_dir).expect("mkdir");
        fs::write(&paths.model_policy, "fallback_model: safe\n").expect("write");
        fs::write(&paths.routing_policy, "{\"fallback_agent\": \"lead-1\"}").expect("write");
        let loaded = load_policies(&paths).expect("load");
        assert_eq!(loaded.model.fallback_model.as_deref(), Some("safe"));
        assert_eq!(loaded.routing.fallback_agent.as_deref(), Some("lead-1"));
        assert_ne!(loaded.model_fingerprint, empty.model_fingerprint);
    }
}
