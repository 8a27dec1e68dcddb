//! Test-only fixtures: deterministic work items and catalogs, a throwaway
//! project directory, and scripted stand-ins for the worker, validation,
//! and model-probe seams.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use crate::core::types::{
    AgentCatalog, AgentEntry, ItemStatus, ModelAccess, Priority, ValidationResult, WorkItem, WorkerOutcome,
};
use crate::io::paths::CoordinationPaths;
use crate::io::policy::{EnvOverrides, WorkerMode};
use crate::io::probe::ModelProbe;
use crate::io::store::{save_document, write_atomic};
use crate::io::validation::{ValidationRequest, ValidationRun, ValidationRunner};
use crate::io::worker::{Worker, WorkerRequest, WorkerRun};

pub const T0: &str = "2026-01-01T00:00:00Z";
pub const T1: &str = "2026-01-01T00:01:00Z";
pub const T2: &str = "2026-01-01T00:02:00Z";

/// `T0` plus `secs` seconds.
pub fn now_after(secs: i64) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(T0)
        .expect("T0 is RFC 3339")
        .with_timezone(&Utc)
        + chrono::Duration::seconds(secs)
}

/// Normal-priority queued backend item created at `T0`.
pub fn queued(id: &str) -> WorkItem {
    WorkItem::new(id, format!("{id} title"), "backend", Priority::Normal, T0)
}

pub fn item(id: &str, priority: Priority, dependencies: &[&str]) -> WorkItem {
    let mut item = queued(id);
    item.priority = priority;
    item.dependencies = dependencies.iter().map(|dep| dep.to_string()).collect();
    item
}

/// Blocked item last touched at `T0`.
pub fn blocked_item(id: &str, reason: &str, category: Option<&str>) -> WorkItem {
    let mut item = queued(id);
    item.status = ItemStatus::Blocked;
    item.blocker_reason = Some(reason.to_string());
    item.blocker_category = category.map(str::to_string);
    item
}

pub fn agent(role: &str, model: &str) -> AgentEntry {
    AgentEntry {
        display_name: format!("{role} agent"),
        role: role.to_string(),
        model: model.to_string(),
        reasoning: "medium".to_string(),
    }
}

/// Catalog of `(id, role)` pairs; each agent runs `model-<role>`.
pub fn catalog(entries: &[(&str, &str)]) -> AgentCatalog {
    entries
        .iter()
        .map(|(id, role)| (id.to_string(), agent(role, &format!("model-{role}"))))
        .collect()
}

pub fn validation_result(command: &str, exit_code: i32, stdout: &str, stderr: &str) -> ValidationResult {
    ValidationResult {
        command: command.to_string(),
        exit_code,
        stdout_tail: stdout.to_string(),
        stderr_tail: stderr.to_string(),
        runtime_seconds: 0.0,
    }
}

const ROUTING_YAML: &str = "\
owner_role_map:
  backend: backend-1
  frontend: frontend-1
  lead: lead-1
";

const RUNTIME_YAML: &str = "\
platform_bootstrap:
  enabled: false
";

/// Temp project holding every required coordination document.
///
/// Agents: `backend-1`, `frontend-1`, `lead-1`, routed by role. Platform
/// bootstrap is disabled so fixtures control the backlog exactly.
pub struct TestProject {
    _temp: TempDir,
    paths: CoordinationPaths,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let paths = CoordinationPaths::new(temp.path());
        let project = Self { _temp: temp, paths };
        project.write_active(&[])?;
        project.write_completed(&[])?;
        project.write_blocked(&[])?;
        project.write_catalog(&catalog(&[
            ("backend-1", "backend"),
            ("frontend-1", "frontend"),
            ("lead-1", "lead"),
        ]))?;
        project.write_text(&project.paths.routing_policy, ROUTING_YAML)?;
        project.write_text(&project.paths.retry_policy, "max_retries_per_item_per_agent: 2\n")?;
        project.write_text(&project.paths.model_policy, "{}\n")?;
        project.write_text(&project.paths.commit_policy, "commit_enabled: false\n")?;
        project.write_text(&project.paths.runtime_policy, RUNTIME_YAML)?;
        Ok(project)
    }

    pub fn paths(&self) -> &CoordinationPaths {
        &self.paths
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    /// Environment with the mock worker and nothing else overridden.
    pub fn mock_env(&self) -> EnvOverrides {
        EnvOverrides {
            worker_mode: WorkerMode::Mock,
            ..EnvOverrides::default()
        }
    }

    pub fn write_active(&self, items: &[WorkItem]) -> Result<()> {
        save_document(&self.paths.work_items, items)
    }

    pub fn write_completed(&self, items: &[WorkItem]) -> Result<()> {
        save_document(&self.paths.completed_items, items)
    }

    pub fn write_blocked(&self, items: &[WorkItem]) -> Result<()> {
        save_document(&self.paths.blocked_items, items)
    }

    pub fn write_catalog(&self, catalog: &AgentCatalog) -> Result<()> {
        save_document(&self.paths.agents, catalog)
    }

    /// Replace a policy (or any other) document verbatim.
    pub fn write_text(&self, path: &Path, contents: &str) -> Result<()> {
        write_atomic(path, contents)
    }
}

/// Worker that replays queued outcomes, then completes everything.
#[derive(Default)]
pub struct ScriptedWorker {
    outcomes: RefCell<VecDeque<WorkerOutcome>>,
    calls: RefCell<Vec<(String, String)>>,
}

impl ScriptedWorker {
    pub fn new(outcomes: Vec<WorkerOutcome>) -> Self {
        Self {
            outcomes: RefCell::new(outcomes.into()),
            calls: RefCell::new(Vec::new()),
        }
    }

    /// `(item_id, model)` for every invocation so far.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.borrow().clone()
    }
}

impl Worker for ScriptedWorker {
    fn run_agent(&self, request: &WorkerRequest<'_>) -> Result<WorkerRun> {
        self.calls
            .borrow_mut()
            .push((request.item_id.to_string(), request.model.to_string()));
        let outcome = self.outcomes.borrow_mut().pop_front().unwrap_or_else(|| WorkerOutcome::Completed {
            summary: format!("scripted completion of {}", request.item_id),
        });
        Ok(WorkerRun {
            stdout: String::new(),
            outcome,
            model_used: request.model.to_string(),
            fallback_used: false,
            exit_code: Some(0),
            runtime: Duration::from_secs(1),
        })
    }
}

/// Validation runner that replays queued result lists. Once the script
/// runs out, every requested command passes.
#[derive(Default)]
pub struct ScriptedValidationRunner {
    runs: RefCell<VecDeque<Vec<ValidationResult>>>,
    requests: RefCell<Vec<Vec<String>>>,
}

impl ScriptedValidationRunner {
    pub fn new(runs: Vec<Vec<ValidationResult>>) -> Self {
        Self {
            runs: RefCell::new(runs.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn passing() -> Self {
        Self::default()
    }

    /// Command lists received, one per run.
    pub fn requests(&self) -> Vec<Vec<String>> {
        self.requests.borrow().clone()
    }
}

impl ValidationRunner for ScriptedValidationRunner {
    fn run(&self, request: &ValidationRequest<'_>) -> Result<ValidationRun> {
        self.requests.borrow_mut().push(request.commands.to_vec());
        let results = self.runs.borrow_mut().pop_front().unwrap_or_else(|| {
            request
                .commands
                .iter()
                .map(|command| validation_result(command, 0, "ok", ""))
                .collect()
        });
        Ok(ValidationRun {
            passed: results.iter().all(ValidationResult::passed),
            results,
        })
    }
}

/// Probe with fixed verdicts; unlisted models are accessible.
#[derive(Debug, Clone, Default)]
pub struct StaticModelProbe {
    inaccessible: HashSet<String>,
    unknown: HashSet<String>,
}

impl StaticModelProbe {
    pub fn inaccessible(models: &[&str]) -> Self {
        Self {
            inaccessible: models.iter().map(|m| m.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn unknown(models: &[&str]) -> Self {
        Self {
            unknown: models.iter().map(|m| m.to_string()).collect(),
            ..Self::default()
        }
    }
}

impl ModelProbe for StaticModelProbe {
    fn probe(&self, model: &str) -> ModelAccess {
        if self.inaccessible.contains(model) {
            ModelAccess::Inaccessible(format!("model '{model}' is not supported"))
        } else if self.unknown.contains(model) {
            ModelAccess::Unknown("probe timed out".to_string())
        } else {
            ModelAccess::Accessible
        }
    }
}
