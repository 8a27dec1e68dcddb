//! Preflight health checks run before every cycle.
//!
//! Every check contributes error strings; an empty list means the host and
//! the coordination documents are fit to run a cycle.

use std::fmt;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::contract_drift::{EventFeed, TokenContract, audit_contract_drift};
use crate::core::policy::{HostileTokenContract, Policies};
use crate::core::routing::active_profiles;
use crate::core::types::{AgentCatalog, ItemStatus, ModelAccess};
use crate::core::validators::validate_collection;
use crate::io::paths::CoordinationPaths;
use crate::io::policy::{EnvOverrides, load_catalog, load_policies};
use crate::io::process::{RunOptions, find_program, run_command};
use crate::io::probe::ModelProbe;
use crate::io::store::{parse_yaml_or_json, read_text};
use crate::io::worker::{DEFAULT_WORKER_COMMAND, resolve_worker_program, split_command_line, worker_cli_hint};

const VISUAL_IMPORT_TIMEOUT: Duration = Duration::from_secs(60);

/// Preflight found problems; the cycle must not run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightFailedError {
    pub errors: Vec<String>,
}

impl fmt::Display for PreflightFailedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "preflight failed:\n- {}", self.errors.join("\n- "))
    }
}

impl std::error::Error for PreflightFailedError {}

/// Run every check and return the problems found.
#[instrument(skip_all, fields(mock = env.is_mock()))]
pub fn run_preflight(paths: &CoordinationPaths, env: &EnvOverrides, probe: &dyn ModelProbe) -> Vec<String> {
    let mut errors = check_documents(paths);

    let policies = match load_policies(paths) {
        Ok(policies) => Some(policies),
        Err(err) => {
            errors.push(format!("{err:#}"));
            None
        }
    };
    let catalog = match load_catalog(paths) {
        Ok(catalog) => Some(catalog),
        Err(err) => {
            errors.push(format!("{err:#}"));
            None
        }
    };

    if let Some(policies) = &policies {
        if let Some(contract) = &policies.runtime.hostile_token_contract {
            errors.extend(check_token_contract(paths, contract));
        }
        if env.is_mock() {
            debug!("mock worker mode; skipping host probes");
        } else {
            errors.extend(check_worker_cli(env));
            errors.extend(check_python(env, policies));
            errors.extend(check_visual_dependency(paths, env, policies));
            if let Some(catalog) = &catalog {
                errors.extend(check_models(catalog, policies, probe));
            }
        }
    }

    if !errors.is_empty() {
        warn!(count = errors.len(), "preflight failed");
    }
    errors
}

/// [`run_preflight`], turned into a typed error when anything failed.
pub fn ensure_preflight(paths: &CoordinationPaths, env: &EnvOverrides, probe: &dyn ModelProbe) -> Result<()> {
    let errors = run_preflight(paths, env, probe);
    if errors.is_empty() {
        return Ok(());
    }
    Err(PreflightFailedError { errors }.into())
}

/// Required files exist and parse; backlog arrays hold valid work items.
pub fn check_documents(paths: &CoordinationPaths) -> Vec<String> {
    let mut errors = Vec::new();
    for path in paths.required_documents() {
        if !path.exists() {
            errors.push(format!("missing required file {}", paths.relative(path)));
        }
    }

    for (path, expected) in [
        (&paths.work_items, None),
        (&paths.completed_items, Some(ItemStatus::Completed)),
        (&paths.blocked_items, Some(ItemStatus::Blocked)),
    ] {
        let name = paths.relative(path);
        match read_json(path) {
            Ok(Some(Value::Array(values))) => errors.extend(validate_collection(&name, &values, expected)),
            Ok(Some(_)) => errors.push(format!("{name}: expected a JSON array")),
            Ok(None) => {}
            Err(err) => errors.push(format!("{err:#}")),
        }
    }

    match read_json(&paths.agents) {
        Ok(Some(Value::Object(_)) | None) => {}
        Ok(Some(_)) => errors.push(format!("{}: expected a JSON object", paths.relative(&paths.agents))),
        Err(err) => errors.push(format!("{err:#}")),
    }

    for path in [
        &paths.routing_policy,
        &paths.retry_policy,
        &paths.model_policy,
        &paths.commit_policy,
        &paths.runtime_policy,
    ] {
        let parsed = read_text(path).and_then(|contents| match contents {
            Some(contents) => parse_yaml_or_json(&contents).map(Some),
            None => Ok(None),
        });
        match parsed {
            Ok(Some(Value::Object(_) | Value::Null) | None) => {}
            Ok(Some(_)) => errors.push(format!("{}: expected a mapping", paths.relative(path))),
            Err(err) => errors.push(format!("{}: {err:#}", paths.relative(path))),
        }
    }
    errors
}

fn read_json(path: &Path) -> Result<Option<Value>> {
    let Some(contents) = read_text(path)? else {
        return Ok(None);
    };
    serde_json::from_str(&contents)
        .map(Some)
        .with_context(|| format!("parse {}", path.display()))
}

/// The worker CLI resolves on this host.
pub fn check_worker_cli(env: &EnvOverrides) -> Vec<String> {
    let line = env.codex_command.as_deref().unwrap_or(DEFAULT_WORKER_COMMAND);
    let argv = split_command_line(line);
    let Some(program) = argv.first() else {
        return vec!["REDKEEPERS_CODEX_COMMAND is empty".to_string()];
    };
    match resolve_worker_program(program) {
        Some(found) => {
            debug!(program = %found.display(), "worker CLI resolved");
            Vec::new()
        }
        None => vec![worker_cli_hint(program)],
    }
}

/// Configured launcher resolves.
pub fn check_python(env: &EnvOverrides, policies: &Policies) -> Vec<String> {
    let Some(launcher) = env.python_launcher(&policies.runtime) else {
        return Vec::new();
    };
    let program = split_command_line(&launcher).into_iter().next().unwrap_or_default();
    if find_program(&program).is_some() {
        return Vec::new();
    }
    vec![format!(
        "python launcher '{launcher}' not found; fix runtime.python_command or REDKEEPERS_PYTHON_CMD"
    )]
}

/// Visual QA, when enabled, needs Playwright importable by the launcher.
pub fn check_visual_dependency(paths: &CoordinationPaths, env: &EnvOverrides, policies: &Policies) -> Vec<String> {
    let options = env.command_options(policies);
    if !options.frontend_visual_enabled {
        return Vec::new();
    }
    let launcher = options.python_launcher.unwrap_or_else(|| "python".to_string());
    let mut argv = split_command_line(&launcher);
    if argv.is_empty() {
        argv.push("python".to_string());
    }
    let Some(program) = find_program(&argv[0]) else {
        return vec![format!(
            "frontend visual QA enabled but launcher '{launcher}' not found"
        )];
    };
    let mut cmd = Command::new(program);
    cmd.args(&argv[1..])
        .args(["-c", "import playwright"])
        .current_dir(&paths.root);
    match run_command(
        cmd,
        RunOptions {
            stdin: None,
            timeout: Some(VISUAL_IMPORT_TIMEOUT),
            output_limit_bytes: 16 * 1024,
            on_tick: None,
        },
    ) {
        Ok(output) if output.status.success() => Vec::new(),
        Ok(output) => vec![format!(
            "frontend visual QA enabled but playwright is not importable by '{launcher}': {}",
            output.stderr_text().lines().last().unwrap_or("import failed").trim()
        )],
        Err(err) => vec![format!("frontend visual QA dependency probe failed: {err:#}")],
    }
}

/// Every active profile has an accessible model or an accessible fallback.
/// Inconclusive probes do not fail health.
pub fn check_models(catalog: &AgentCatalog, policies: &Policies, probe: &dyn ModelProbe) -> Vec<String> {
    let mut errors = Vec::new();
    for profile in active_profiles(catalog, &policies.routing, &policies.model) {
        let ModelAccess::Inaccessible(reason) = probe.probe(&profile.model) else {
            continue;
        };
        let fallback_ok = profile
            .fallback_model
            .as_deref()
            .is_some_and(|fallback| !probe.probe(fallback).is_definitively_inaccessible());
        if !fallback_ok {
            errors.push(format!(
                "{}: model '{}' is inaccessible ({reason}) and no accessible fallback is configured",
                profile.label, profile.model
            ));
        }
    }
    errors
}

fn load_contract_file<T: DeserializeOwned>(paths: &CoordinationPaths, rel: &str) -> Result<Option<T>> {
    let path = paths.resolve(rel);
    let Some(contents) = read_text(&path)? else {
        return Ok(None);
    };
    serde_json::from_str(&contents)
        .map(Some)
        .with_context(|| format!("parse {rel}"))
}

/// Hostile runtime token-contract drift across the three content files.
pub fn check_token_contract(paths: &CoordinationPaths, contract: &HostileTokenContract) -> Vec<String> {
    let manifest = load_contract_file::<TokenContract>(paths, &contract.content_key_manifest);
    let runtime = load_contract_file::<TokenContract>(paths, &contract.runtime_contract);
    let feed = load_contract_file::<EventFeed>(paths, &contract.event_feed);
    match (manifest, runtime, feed) {
        (Ok(Some(manifest)), Ok(Some(runtime)), Ok(Some(feed))) => audit_contract_drift(&manifest, &runtime, &feed)
            .into_iter()
            .map(|drift| format!("hostile token contract drift: {drift}"))
            .collect(),
        (manifest, runtime, feed) => {
            let mut errors = Vec::new();
            for (rel, loaded) in [
                (&contract.content_key_manifest, manifest.map(|m| m.is_some())),
                (&contract.runtime_contract, runtime.map(|r| r.is_some())),
                (&contract.event_feed, feed.map(|f| f.is_some())),
            ] {
                match loaded {
                    Ok(true) => {}
                    Ok(false) => errors.push(format!("hostile token contract file missing: {rel}")),
                    Err(err) => errors.push(format!("hostile token contract: {err:#}")),
                }
            }
            errors
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::AgentModel;
    use crate::test_support::{StaticModelProbe, TestProject, catalog};
    use std::fs;

    #[test]
    fn fresh_project_passes_in_mock_mode() {
        let project = TestProject::new().expect("project");
        let errors = run_preflight(project.paths(), &project.mock_env(), &StaticModelProbe::default());
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn missing_and_malformed_documents_are_reported() {
        let project = TestProject::new().expect("project");
        let paths = project.paths();
        fs::remove_file(&paths.retry_policy).expect("remove");
        fs::write(&paths.blocked_items, "{}").expect("write");
        let errors = check_documents(paths);
        assert!(errors.iter().any(|e| e.contains("missing required file coordination/policies/retry.yaml")));
        assert!(errors.iter().any(|e| e.contains("blocked-items.json: expected a JSON array")));
    }

    #[test]
    fn placeholder_commands_fail_preflight() {
        let project = TestProject::new().expect("project");
        let mut item = crate::test_support::queued("A-1");
        item.validation_commands = vec!["pytest <path>".to_string()];
        project.write_active(&[item]).expect("write");
        let err = ensure_preflight(project.paths(), &project.mock_env(), &StaticModelProbe::default()).unwrap_err();
        let failed = err.downcast_ref::<PreflightFailedError>().expect("typed");
        assert!(failed.errors.iter().any(|e| e.contains("unresolved placeholder")));
    }

    #[test]
    fn inaccessible_model_needs_accessible_fallback() {
        let catalog = catalog(&[("backend-1", "backend")]);
        let mut policies = Policies::default();
        policies
            .routing
            .owner_role_map
            .insert("backend".to_string(), "backend-1".to_string());
        policies.model.agent_models.insert(
            "backend-1".to_string(),
            AgentModel {
                model: Some("old".to_string()),
                fallback_model: Some("spare".to_string()),
                ..AgentModel::default()
            },
        );

        let probe = StaticModelProbe::inaccessible(&["old"]);
        assert!(check_models(&catalog, &policies, &probe).is_empty());

        let probe = StaticModelProbe::inaccessible(&["old", "spare"]);
        let errors = check_models(&catalog, &policies, &probe);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("backend-1: model 'old' is inaccessible"));

        let probe = StaticModelProbe::unknown(&["old"]);
        assert!(check_models(&catalog, &policies, &probe).is_empty());
    }

    #[test]
    fn token_contract_drift_and_missing_files() {
        let project = TestProject::new().expect("project");
        let contract = HostileTokenContract::default();
        let errors = check_token_contract(project.paths(), &contract);
        assert_eq!(errors.len(), 3);

        let root = project.root();
        fs::create_dir_all(root.join("content")).expect("mkdir");
        let doc = r#"{"canonical_keys": ["raid"], "tokens": {"raid": ["r1"]}}"#;
        fs::write(root.join(&contract.content_key_manifest), doc).expect("write");
        fs::write(root.join(&contract.runtime_contract), doc).expect("write");
        fs::write(root.join(&contract.event_feed), r#"{"rows": [{"key": "raid", "tokens": ["r2"]}]}"#)
            .expect("write");
        let errors = check_token_contract(project.paths(), &contract);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("hostile token contract drift"));
    }
}
