//! Read-only `status` render. Never writes anything.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::Result;
use serde_json::Value;

use crate::core::healing::{compile_patterns, stall_snapshot};
use crate::core::policy::Policies;
use crate::core::queue::Queue;
use crate::core::routing::route_agent;
use crate::core::stats::progress_summary;
use crate::core::types::{AgentCatalog, ItemStatus};
use crate::io::backlog::load_queue;
use crate::io::lock::{LockRecord, load_lock_record};
use crate::io::paths::CoordinationPaths;
use crate::io::policy::{load_catalog, load_policies};
use crate::io::state::{DaemonState, load_daemon_state};

/// Everything the render needs, loaded once.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub daemon: DaemonState,
    pub lock: LockRecord,
    pub lock_file_present: bool,
    pub queue: Queue,
    pub policies: Policies,
    pub catalog: AgentCatalog,
}

pub fn load_snapshot(paths: &CoordinationPaths) -> Result<StatusSnapshot> {
    Ok(StatusSnapshot {
        daemon: load_daemon_state(paths)?,
        lock: load_lock_record(paths)?,
        lock_file_present: paths.lock_file.exists(),
        queue: load_queue(paths)?,
        policies: load_policies(paths)?,
        catalog: load_catalog(paths)?,
    })
}

pub fn render_status(paths: &CoordinationPaths) -> Result<String> {
    render(&load_snapshot(paths)?)
}

#[derive(Debug, Default)]
struct Workload {
    role: String,
    assigned: usize,
    running: usize,
    queued: usize,
}

fn or_dash(value: Option<&str>) -> &str {
    value.filter(|v| !v.is_empty()).unwrap_or("-")
}

pub fn render(snapshot: &StatusSnapshot) -> Result<String> {
    let mut out = String::new();
    let daemon = &snapshot.daemon;
    let queue = &snapshot.queue;

    writeln!(
        out,
        "daemon: {} (updated {})",
        daemon.state.as_str(),
        or_dash(daemon.updated_at.as_deref())
    )?;
    writeln!(out, "active item: {}", or_dash(daemon.active_item.as_deref()))?;
    let lock = &snapshot.lock;
    if snapshot.lock_file_present {
        let pid = lock.pid.map_or_else(|| "?".to_string(), |pid| pid.to_string());
        writeln!(
            out,
            "lock: held by pid {pid} ({} since {})",
            or_dash(lock.command.as_deref()),
            or_dash(lock.acquired_at.as_deref())
        )?;
    } else {
        writeln!(out, "lock: free (last released {})", or_dash(lock.released_at.as_deref()))?;
    }
    if let Some(summary) = &daemon.last_run_summary {
        writeln!(out, "last run: {summary}")?;
    }
    if let Some(error) = &daemon.last_error {
        writeln!(out, "last error: {error}")?;
    }

    let summary = progress_summary(queue, "");
    let counts = &summary.counts;
    writeln!(
        out,
        "queue: active {} (queued {}, ready {}, assigned {}, running {}, validating {}), completed {}, blocked {}",
        counts.active,
        counts.queued,
        counts.ready,
        counts.assigned,
        counts.running,
        counts.validating,
        counts.completed,
        counts.blocked
    )?;

    if !summary.milestones.is_empty() {
        writeln!(out, "milestones:")?;
        for (name, rollup) in &summary.milestones {
            writeln!(
                out,
                "  {name}: active {}, completed {}, blocked {}",
                rollup.active, rollup.completed, rollup.blocked
            )?;
        }
    }

    let workloads = workloads(snapshot);
    if !workloads.is_empty() {
        writeln!(out, "agents:")?;
        for (id, load) in &workloads {
            writeln!(
                out,
                "  {id} ({}): assigned {}, running {}, queued {}",
                or_dash(Some(load.role.as_str())),
                load.assigned,
                load.running,
                load.queued
            )?;
        }
    }

    if !queue.blocked.is_empty() {
        writeln!(out, "blocked:")?;
        for item in &queue.blocked {
            writeln!(
                out,
                "  {} [{}]: {}",
                item.id,
                or_dash(item.blocker_category.as_deref()),
                or_dash(item.blocker_reason.as_deref())
            )?;
        }
    }

    let warnings = health_warnings(snapshot);
    if !warnings.is_empty() {
        writeln!(out, "backlog health:")?;
        for warning in warnings {
            writeln!(out, "  - {warning}")?;
        }
    }
    Ok(out)
}

fn workloads(snapshot: &StatusSnapshot) -> BTreeMap<String, Workload> {
    let mut loads: BTreeMap<String, Workload> = snapshot
        .catalog
        .iter()
        .map(|(id, entry)| {
            (
                id.clone(),
                Workload {
                    role: entry.role.clone(),
                    ..Workload::default()
                },
            )
        })
        .collect();
    for item in &snapshot.queue.active {
        let agent = match item.status {
            ItemStatus::Queued => {
                route_agent(item, &snapshot.policies.routing, &snapshot.catalog).map(|(id, _)| id.to_string())
            }
            _ => item.assigned_agent.clone(),
        };
        let Some(agent) = agent else {
            continue;
        };
        let load = loads.entry(agent).or_default();
        match item.status {
            ItemStatus::Queued => load.queued += 1,
            ItemStatus::Assigned => load.assigned += 1,
            ItemStatus::Running | ItemStatus::Validating => load.running += 1,
            _ => {}
        }
    }
    loads
}

fn list(value: &Value, key: &str) -> String {
    let items: Vec<&str> = value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join("+")
    }
}

fn health_warnings(snapshot: &StatusSnapshot) -> Vec<String> {
    let queue = &snapshot.queue;
    let mut warnings = Vec::new();

    for row in stall_snapshot(queue) {
        warnings.push(format!(
            "stall: {} waits on {} (blocked: {}, missing: {})",
            row.get("id").and_then(Value::as_str).unwrap_or("?"),
            list(&row, "unmet"),
            list(&row, "blocked"),
            list(&row, "missing")
        ));
    }

    let guard = &snapshot.policies.retry.non_actionable_blocker_guard;
    let patterns = compile_patterns(&guard.reason_patterns);
    for item in &queue.blocked {
        let reason = item.blocker_reason.as_deref().unwrap_or("");
        if patterns.iter().any(|re| re.is_match(reason)) {
            warnings.push(format!("non-actionable blocker: {} ({reason:?})", item.id));
        }
    }

    for item in &queue.active {
        for dep in &item.dependencies {
            if !queue.contains(dep) {
                warnings.push(format!("missing dependency: {} -> {dep}", item.id));
            }
        }
    }
    warnings
}
