//! Backlog self-healing passes.
//!
//! Each pass is a pure function over the in-memory [`Queue`]; the ordered
//! sequence that runs before selection lives in `crate::heal`.

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::clock;
use crate::core::fingerprint::{fingerprint, short_fingerprint};
use crate::core::policy::{BlockedArchivePolicy, BlockedRevisitPolicy, NonActionableBlockerGuard, PlatformBootstrap};
use crate::core::queue::Queue;
use crate::core::routing::ModelProfile;
use crate::core::types::{ItemStatus, ModelAccess, Priority, WorkItem, auto_tag, blocker_category};

/// Compile reason patterns case-insensitively. A pattern that is not a valid
/// regex matches as a literal.
pub fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .or_else(|_| {
                    RegexBuilder::new(&regex::escape(pattern))
                        .case_insensitive(true)
                        .build()
                })
                .ok()
        })
        .collect()
}

fn any_match(patterns: &[Regex], text: &str) -> bool {
    patterns.iter().any(|re| re.is_match(text))
}

fn cooled_down(updated_at: &str, cooldown_seconds: u64, now: DateTime<Utc>) -> bool {
    clock::age_seconds(updated_at, now).is_none_or(|age| age >= cooldown_seconds as i64)
}

/// Requeue active items left assigned/running/validating by an interrupted cycle.
pub fn requeue_orphans(queue: &mut Queue, now: DateTime<Utc>) -> Vec<String> {
    let stamp = clock::stamp(now);
    let mut ids = Vec::new();
    for item in &mut queue.active {
        if matches!(
            item.status,
            ItemStatus::Assigned | ItemStatus::Running | ItemStatus::Validating
        ) {
            item.status = ItemStatus::Queued;
            item.assigned_agent = None;
            item.last_unblocked_reason = Some("interrupted cycle; requeued".to_string());
            item.updated_at = stamp.clone();
            ids.push(item.id.clone());
        }
    }
    ids
}

/// Requeue blocked items whose reason the policy considers worth retrying.
///
/// `model_policy_drift` items skip the include patterns and are only
/// eligible once the model-policy fingerprint differs from the recorded one.
pub fn revisit_blocked(
    queue: &mut Queue,
    policy: &BlockedRevisitPolicy,
    model_fingerprint: &str,
    now: DateTime<Utc>,
) -> Vec<String> {
    if !policy.enabled || policy.max_items_per_cycle == 0 {
        return Vec::new();
    }
    let include = compile_patterns(&policy.include_reason_patterns);
    let exclude = compile_patterns(&policy.exclude_reason_patterns);

    let eligible: Vec<(String, bool)> = queue
        .blocked
        .iter()
        .filter_map(|item| {
            let reason = item.blocker_reason.as_deref().unwrap_or("");
            if any_match(&exclude, reason) {
                return None;
            }
            let drift = item.blocker_category.as_deref() == Some(blocker_category::MODEL_POLICY_DRIFT);
            if drift {
                if item.model_policy_fingerprint.as_deref() == Some(model_fingerprint) {
                    return None;
                }
            } else if !any_match(&include, reason) {
                return None;
            }
            let ready = item.blocked_revisit_count < policy.max_attempts_per_item
                && cooled_down(&item.updated_at, policy.cooldown_seconds, now)
                && queue.dependencies_ready(item);
            ready.then(|| (item.id.clone(), drift))
        })
        .take(policy.max_items_per_cycle)
        .collect();

    let stamp = clock::stamp(now);
    eligible
        .into_iter()
        .filter(|(id, drift)| {
            let reason = if *drift {
                "model policy fingerprint changed; revisiting"
            } else {
                "blocked revisit: reason matched revisit policy"
            };
            queue.requeue_blocked(id, reason, &stamp)
        })
        .map(|(id, _)| id)
        .collect()
}

pub const ARCHIVE_REASON: &str = "non_actionable_blocked";

/// Move matching blocked items out of the backlog. Returns the archive
/// records (item plus `archive_reason` and `archived_at`).
pub fn archive_blocked(queue: &mut Queue, policy: &BlockedArchivePolicy, now: DateTime<Utc>) -> Vec<Value> {
    if !policy.enabled || policy.include_reason_patterns.is_empty() {
        return Vec::new();
    }
    let include = compile_patterns(&policy.include_reason_patterns);
    let exclude = compile_patterns(&policy.exclude_reason_patterns);
    let stamp = clock::stamp(now);

    let (archived, kept): (Vec<WorkItem>, Vec<WorkItem>) =
        std::mem::take(&mut queue.blocked).into_iter().partition(|item| {
            let reason = item.blocker_reason.as_deref().unwrap_or("");
            any_match(&include, reason) && !any_match(&exclude, reason)
        });
    queue.blocked = kept;

    archived
        .into_iter()
        .filter_map(|item| match serde_json::to_value(&item) {
            Ok(Value::Object(mut map)) => {
                map.insert("archive_reason".to_string(), Value::from(ARCHIVE_REASON));
                map.insert("archived_at".to_string(), Value::from(stamp.clone()));
                Some(Value::Object(map))
            }
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuardReport {
    pub requeued: Vec<String>,
    pub triage_item: Option<String>,
}

/// Rescue items blocked with reasons like `None` or `- None.`.
///
/// Dependency-ready items are requeued (bounded per cycle and by
/// `max_attempts`); the rest that still hold up queued work are gathered
/// into one lead triage item keyed by their snapshot.
pub fn guard_non_actionable(
    queue: &mut Queue,
    guard: &NonActionableBlockerGuard,
    max_attempts: u32,
    lead_agent: &str,
    now: DateTime<Utc>,
) -> GuardReport {
    let mut report = GuardReport::default();
    if !guard.enabled {
        return report;
    }
    let patterns = compile_patterns(&guard.reason_patterns);
    let stamp = clock::stamp(now);

    let flagged: Vec<(String, bool, u32)> = queue
        .blocked
        .iter()
        .filter(|item| any_match(&patterns, item.blocker_reason.as_deref().unwrap_or("")))
        .map(|item| (item.id.clone(), queue.dependencies_ready(item), item.blocked_revisit_count))
        .collect();

    let mut remaining = Vec::new();
    for (id, deps_ready, revisits) in flagged {
        let can_requeue = guard.auto_requeue_dependency_ready
            && deps_ready
            && revisits < max_attempts
            && report.requeued.len() < guard.max_auto_requeue_per_cycle;
        if can_requeue && queue.requeue_blocked(&id, "non-actionable blocker reason; dependencies ready", &stamp) {
            report.requeued.push(id);
        } else {
            remaining.push(id);
        }
    }

    if !guard.route_lead_triage {
        return report;
    }
    let rows: Vec<Value> = remaining
        .iter()
        .filter_map(|id| {
            let dependants: Vec<&str> = queue
                .queued_dependants(id)
                .into_iter()
                .map(|item| item.id.as_str())
                .collect();
            if dependants.is_empty() {
                return None;
            }
            let reason = queue.find(id).and_then(|item| item.blocker_reason.clone());
            Some(json!({"id": id, "blocker_reason": reason, "dependants": dependants}))
        })
        .collect();
    if rows.is_empty() {
        return report;
    }

    let snapshot = Value::Array(rows);
    let id = format!("NAB-TRIAGE-{}", short_fingerprint(&snapshot, 10));
    if queue.contains(&id) {
        return report;
    }
    let blocked_ids: Vec<String> = remaining.clone();
    let mut item = WorkItem::new(
        id.clone(),
        "Triage blockers with no actionable reason",
        "lead",
        Priority::High,
        &stamp,
    );
    item.item_type = "triage".to_string();
    item.milestone = "backlog-health".to_string();
    item.preferred_agent = Some(lead_agent.to_string());
    item.description = format!(
        "These blocked items report no usable blocker reason and still hold up queued work: {}. \
         Determine the real blocker for each one. Requeue it with a concrete plan, re-scope it, or cancel it.",
        blocked_ids.join(", ")
    );
    item.acceptance_criteria = vec![
        "each listed item has a concrete blocker reason or is requeued".to_string(),
        "dependants of canceled items are re-planned".to_string(),
    ];
    item.auto_generated = Some(auto_tag::NON_ACTIONABLE_TRIAGE.to_string());
    item.non_actionable_blocked_snapshot = Some(snapshot);
    if queue.append_item(item) {
        report.triage_item = Some(id);
    }
    report
}

/// Last handled stall snapshot, persisted across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StallLedger {
    pub last_key: Option<String>,
    pub handled_at: Option<String>,
    pub last_item_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StallOutcome {
    NoStall,
    Suppressed { key: String },
    Created { key: String, item_id: String },
}

/// Rows describing why queued items cannot run, sorted by id. Empty when
/// something is ready or nothing waits on dependencies.
pub fn stall_snapshot(queue: &Queue) -> Vec<Value> {
    if !queue.ready_items().is_empty() {
        return Vec::new();
    }
    let completed = queue.completed_ids();
    let blocked = queue.blocked_ids();
    let mut waiting: Vec<&WorkItem> = queue
        .active
        .iter()
        .filter(|item| item.status == ItemStatus::Queued)
        .filter(|item| item.dependencies.iter().any(|dep| !completed.contains(dep.as_str())))
        .collect();
    waiting.sort_by(|a, b| a.id.cmp(&b.id));

    waiting
        .into_iter()
        .map(|item| {
            let mut unmet: Vec<&str> = item
                .dependencies
                .iter()
                .map(String::as_str)
                .filter(|dep| !completed.contains(dep))
                .collect();
            unmet.sort_unstable();
            unmet.dedup();
            let blocked_deps: Vec<&str> = unmet.iter().copied().filter(|dep| blocked.contains(dep)).collect();
            let missing: Vec<&str> = unmet.iter().copied().filter(|dep| !queue.contains(dep)).collect();
            json!({"id": item.id, "unmet": unmet, "blocked": blocked_deps, "missing": missing})
        })
        .collect()
}

/// Synthesise at most one `queue_stall_recovery` item per distinct snapshot
/// per cooldown window.
pub fn recover_stall(
    queue: &mut Queue,
    ledger: &mut StallLedger,
    cooldown_seconds: u64,
    lead_agent: &str,
    now: DateTime<Utc>,
) -> StallOutcome {
    let rows = stall_snapshot(queue);
    if rows.is_empty() {
        return StallOutcome::NoStall;
    }
    let key = short_fingerprint(&Value::Array(rows.clone()), 10);
    let prefix = format!("QSR-{key}-");

    let in_flight = queue.active.iter().any(|item| item.id.starts_with(&prefix));
    let recently_handled = ledger.last_key.as_deref() == Some(key.as_str())
        && ledger
            .handled_at
            .as_deref()
            .is_some_and(|at| !cooled_down(at, cooldown_seconds, now));
    if in_flight || recently_handled {
        return StallOutcome::Suppressed { key };
    }

    let seq = queue
        .active
        .iter()
        .chain(&queue.completed)
        .chain(&queue.blocked)
        .filter(|item| item.id.starts_with(&prefix))
        .count()
        + 1;
    let stamp = clock::stamp(now);
    let item_id = format!("{prefix}{seq}");
    let waiting: Vec<String> = rows
        .iter()
        .filter_map(|row| {
            let id = row.get("id")?.as_str()?;
            let unmet: Vec<&str> = row
                .get("unmet")?
                .as_array()?
                .iter()
                .filter_map(Value::as_str)
                .collect();
            Some(format!("{id} waits on {}", unmet.join("+")))
        })
        .collect();

    let mut item = WorkItem::new(item_id.clone(), "Recover stalled work queue", "lead", Priority::High, &stamp);
    item.item_type = "triage".to_string();
    item.milestone = "backlog-health".to_string();
    item.preferred_agent = Some(lead_agent.to_string());
    item.description = format!(
        "No queued item is ready to run. {}. Unblock, re-plan, or cancel the dependencies so work can resume.",
        waiting.join("; ")
    );
    item.acceptance_criteria = vec![
        "at least one queued item is ready".to_string(),
        "every listed dependency is completed, re-planned, or canceled".to_string(),
    ];
    item.auto_generated = Some(auto_tag::QUEUE_STALL_RECOVERY.to_string());
    item.stall_snapshot = rows;
    queue.append_item(item);

    ledger.last_key = Some(key.clone());
    ledger.handled_at = Some(stamp);
    ledger.last_item_id = Some(item_id.clone());
    StallOutcome::Created { key, item_id }
}

/// Build the critical lead item for one human-inbox file.
pub fn human_inbox_item(relative_path: &str, content: &str, lead_agent: &str, now: DateTime<Utc>) -> WorkItem {
    let stem = relative_path
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(relative_path)
        .split('.')
        .next()
        .unwrap_or("");
    let mut slug = String::new();
    for ch in stem.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_uppercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug: String = slug.trim_end_matches('-').chars().take(24).collect();
    let slug = if slug.is_empty() { "NOTE".to_string() } else { slug };
    let hash = short_fingerprint(&json!({"file": relative_path, "content": content}), 8);

    let stamp = clock::stamp(now);
    let mut item = WorkItem::new(
        format!("HUMAN-{slug}-{hash}"),
        format!("Human instruction: {}", stem),
        "lead",
        Priority::Critical,
        &stamp,
    );
    item.item_type = "human_request".to_string();
    item.milestone = "human-inbox".to_string();
    item.preferred_agent = Some(lead_agent.to_string());
    item.description = content.trim().to_string();
    item.acceptance_criteria = vec![
        "instruction acted on or broken down into backlog items".to_string(),
    ];
    item.human_instruction_file = Some(relative_path.to_string());
    item.auto_generated = Some(auto_tag::HUMAN_INBOX.to_string());
    item
}

pub const PLATFORM_BOOTSTRAP_ID: &str = "PLATFORM-BOOTSTRAP";

/// Seed a platform item when the backlog has never had one.
pub fn ensure_platform_bootstrap(
    queue: &mut Queue,
    policy: &PlatformBootstrap,
    now: DateTime<Utc>,
) -> Option<String> {
    if !policy.enabled || queue.contains(PLATFORM_BOOTSTRAP_ID) {
        return None;
    }
    let has_platform = queue
        .active
        .iter()
        .chain(&queue.completed)
        .chain(&queue.blocked)
        .any(|item| item.owner_role == "platform");
    if has_platform {
        return None;
    }
    let stamp = clock::stamp(now);
    let mut item = WorkItem::new(PLATFORM_BOOTSTRAP_ID, policy.title.clone(), "platform", Priority::Normal, &stamp);
    item.item_type = "infrastructure".to_string();
    item.milestone = policy.milestone.clone();
    item.description = policy.description.clone();
    item.acceptance_criteria = vec![
        "build and packaging commands documented".to_string(),
        "packaging smoke check wired into validation policy".to_string(),
    ];
    item.auto_generated = Some(auto_tag::PLATFORM_BOOTSTRAP.to_string());
    queue.append_item(item).then(|| PLATFORM_BOOTSTRAP_ID.to_string())
}

/// Fingerprint of the raw model-policy document.
pub fn model_policy_fingerprint(raw_model_policy: &Value) -> String {
    fingerprint(raw_model_policy)
}

/// Block stale queued items whose model and fallback are both definitively
/// inaccessible. Items checked against the current policy are stamped with
/// its fingerprint so later passes skip them.
pub fn audit_model_drift<P, A>(
    queue: &mut Queue,
    model_fingerprint: &str,
    mut profile_for: P,
    mut access: A,
    now: DateTime<Utc>,
) -> Vec<String>
where
    P: FnMut(&WorkItem) -> Option<ModelProfile>,
    A: FnMut(&str) -> ModelAccess,
{
    let stamp = clock::stamp(now);
    let stale: Vec<WorkItem> = queue
        .active
        .iter()
        .filter(|item| item.status == ItemStatus::Queued)
        .filter(|item| item.model_policy_fingerprint.as_deref() != Some(model_fingerprint))
        .cloned()
        .collect();

    let mut blocked = Vec::new();
    for item in stale {
        let verdict = profile_for(&item).and_then(|profile| {
            let ModelAccess::Inaccessible(primary_reason) = access(&profile.model) else {
                return None;
            };
            let fallback_dead = match &profile.fallback_model {
                Some(fallback) => access(fallback).is_definitively_inaccessible(),
                None => true,
            };
            fallback_dead.then(|| {
                format!(
                    "model policy drift: model '{}' is inaccessible ({primary_reason}); fallback {}",
                    profile.model,
                    profile
                        .fallback_model
                        .as_deref()
                        .map_or_else(|| "not configured".to_string(), |f| format!("'{f}' is inaccessible"))
                )
            })
        });

        match verdict {
            Some(reason) => {
                if queue
                    .mark_blocked(&item.id, &reason, Some(blocker_category::MODEL_POLICY_DRIFT), &stamp)
                    .is_ok()
                {
                    if let Some(moved) = queue.blocked.iter_mut().rev().find(|b| b.id == item.id) {
                        moved.model_policy_fingerprint = Some(model_fingerprint.to_string());
                    }
                    blocked.push(item.id);
                }
            }
            None => {
                if let Some(live) = queue.active.iter_mut().find(|a| a.id == item.id) {
                    live.model_policy_fingerprint = Some(model_fingerprint.to_string());
                }
            }
        }
    }
    blocked
}
