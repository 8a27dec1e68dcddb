//! Ordered self-healing pass that runs before every selection.
//!
//! The passes themselves live in [`crate::core::healing`]; this module fixes
//! their order, wires in the inbox and the model probe, and persists the
//! result. Running the pass twice without a worker in between is a no-op the
//! second time.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::core::healing::{
    GuardReport, StallLedger, StallOutcome, archive_blocked, audit_model_drift, ensure_platform_bootstrap,
    guard_non_actionable, human_inbox_item, recover_stall, requeue_orphans, revisit_blocked,
};
use crate::core::policy::Policies;
use crate::core::queue::Queue;
use crate::core::routing::{lead_agent_id, resolve_profile, route_agent};
use crate::core::types::{AgentCatalog, ItemStatus};
use crate::io::backlog::{append_archived, save_queue};
use crate::io::inbox::{InboxNote, consume_note, read_inbox};
use crate::io::paths::CoordinationPaths;
use crate::io::probe::ModelProbe;

/// Everything one healing pass changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealReport {
    pub orphans_requeued: Vec<String>,
    pub duplicates_repaired: Vec<String>,
    pub revisited: Vec<String>,
    /// Archive records (item plus `archive_reason`/`archived_at`).
    pub archived: Vec<Value>,
    pub guard: GuardReport,
    pub stall: Option<StallOutcome>,
    pub inbox_items: Vec<String>,
    /// Notes to delete once the backlog holding their items is saved.
    pub inbox_notes: Vec<InboxNote>,
    pub bootstrap: Option<String>,
    pub drift_blocked: Vec<String>,
    /// Queued items newly stamped with the current model-policy fingerprint.
    pub fingerprints_stamped: usize,
}

/// One `queue_health` line for the event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthNotice {
    pub title: String,
    pub description: String,
}

impl HealReport {
    /// True when the backlog needs to be written back.
    pub fn mutated(&self) -> bool {
        !self.orphans_requeued.is_empty()
            || !self.duplicates_repaired.is_empty()
            || !self.revisited.is_empty()
            || !self.archived.is_empty()
            || !self.guard.requeued.is_empty()
            || self.guard.triage_item.is_some()
            || matches!(self.stall, Some(StallOutcome::Created { .. }))
            || !self.inbox_items.is_empty()
            || !self.inbox_notes.is_empty()
            || self.bootstrap.is_some()
            || !self.drift_blocked.is_empty()
            || self.fingerprints_stamped > 0
    }

    pub fn notices(&self) -> Vec<HealthNotice> {
        let mut notices = Vec::new();
        let push = |notices: &mut Vec<HealthNotice>, title: &str, ids: &[String]| {
            if !ids.is_empty() {
                notices.push(HealthNotice {
                    title: format!("{title} ({})", ids.len()),
                    description: ids.join(", "),
                });
            }
        };
        push(&mut notices, "Requeued interrupted items", &self.orphans_requeued);
        push(&mut notices, "Repaired duplicate archive entries", &self.duplicates_repaired);
        push(&mut notices, "Revisited blocked items", &self.revisited);
        let archived: Vec<String> = self
            .archived
            .iter()
            .filter_map(|record| record.get("id").and_then(Value::as_str).map(str::to_string))
            .collect();
        push(&mut notices, "Archived non-actionable blocked items", &archived);
        push(&mut notices, "Requeued items with non-actionable blockers", &self.guard.requeued);
        if let Some(id) = &self.guard.triage_item {
            push(&mut notices, "Created blocker triage item", std::slice::from_ref(id));
        }
        match &self.stall {
            Some(StallOutcome::Created { key, item_id }) => notices.push(HealthNotice {
                title: "Queue stalled; created recovery item".to_string(),
                description: format!("{item_id} for snapshot {key}"),
            }),
            Some(StallOutcome::Suppressed { key }) => notices.push(HealthNotice {
                title: "Queue stalled; recovery already handled".to_string(),
                description: format!("snapshot {key} is within its cooldown or in flight"),
            }),
            Some(StallOutcome::NoStall) | None => {}
        }
        push(&mut notices, "Created items from the human inbox", &self.inbox_items);
        if let Some(id) = &self.bootstrap {
            push(&mut notices, "Seeded platform bootstrap item", std::slice::from_ref(id));
        }
        push(&mut notices, "Blocked items on model policy drift", &self.drift_blocked);
        notices
    }
}

/// Run every healing pass in order against the in-memory backlog.
///
/// The only I/O is reading the human inbox and probing models; nothing is
/// written. Call [`persist_healing`] afterwards.
#[instrument(skip_all, fields(active = queue.active.len(), blocked = queue.blocked.len()))]
#[allow(clippy::too_many_arguments)]
pub fn heal_backlog(
    paths: &CoordinationPaths,
    queue: &mut Queue,
    ledger: &mut StallLedger,
    policies: &Policies,
    catalog: &AgentCatalog,
    stall_cooldown_seconds: u64,
    probe: &dyn ModelProbe,
    now: DateTime<Utc>,
) -> Result<HealReport> {
    let retry = &policies.retry;
    let lead = lead_agent_id(&policies.routing, catalog);
    let mut report = HealReport {
        orphans_requeued: requeue_orphans(queue, now),
        duplicates_repaired: queue.repair_archive_duplicates(),
        ..HealReport::default()
    };
    report.revisited = revisit_blocked(queue, &retry.blocked_revisit, &policies.model_fingerprint, now);
    report.archived = archive_blocked(queue, &retry.blocked_archive, now);
    report.guard = guard_non_actionable(
        queue,
        &retry.non_actionable_blocker_guard,
        retry.blocked_revisit.max_attempts_per_item,
        &lead,
        now,
    );
    report.stall = Some(recover_stall(queue, ledger, stall_cooldown_seconds, &lead, now));

    for note in read_inbox(paths, &policies.runtime.human_inbox_dir)? {
        let item = human_inbox_item(&note.relative_path, &note.content, &lead, now);
        let id = item.id.clone();
        if queue.append_item(item) {
            info!(item = %id, file = %note.relative_path, "human inbox note queued");
            report.inbox_items.push(id);
        } else {
            debug!(item = %id, "human inbox note already in backlog");
        }
        report.inbox_notes.push(note);
    }

    report.bootstrap = ensure_platform_bootstrap(queue, &policies.runtime.platform_bootstrap, now);

    let fingerprint = policies.model_fingerprint.as_str();
    let unstamped_before = unstamped_queued(queue, fingerprint);
    report.drift_blocked = audit_model_drift(
        queue,
        fingerprint,
        |item| {
            route_agent(item, &policies.routing, catalog)
                .map(|(agent_id, agent)| resolve_profile(agent_id, agent, &policies.model, item))
        },
        |model| probe.probe(model),
        now,
    );
    report.fingerprints_stamped = unstamped_before
        .saturating_sub(unstamped_queued(queue, fingerprint))
        .saturating_sub(report.drift_blocked.len());

    debug!(mutated = report.mutated(), "healing pass finished");
    Ok(report)
}

fn unstamped_queued(queue: &Queue, fingerprint: &str) -> usize {
    queue
        .active
        .iter()
        .filter(|item| item.status == ItemStatus::Queued)
        .filter(|item| item.model_policy_fingerprint.as_deref() != Some(fingerprint))
        .count()
}

/// Write the healed backlog, append archive records, then delete consumed
/// inbox notes.
pub fn persist_healing(paths: &CoordinationPaths, queue: &Queue, report: &HealReport) -> Result<()> {
    if !report.mutated() {
        return Ok(());
    }
    save_queue(paths, queue)?;
    append_archived(paths, &report.archived)?;
    for note in &report.inbox_notes {
        consume_note(note)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::BlockedArchivePolicy;
    use crate::core::types::{Priority, auto_tag, blocker_category};
    use crate::io::backlog::{load_archived, load_queue};
    use crate::test_support::{StaticModelProbe, T0, TestProject, blocked_item, catalog, item, now_after, queued};
    use std::fs;

    fn policies() -> Policies {
        let mut policies = Policies::default();
        policies.runtime.platform_bootstrap.enabled = false;
        policies
            .routing
            .owner_role_map
            .insert("backend".to_string(), "backend-1".to_string());
        policies.routing.owner_role_map.insert("lead".to_string(), "lead-1".to_string());
        policies
    }

    #[test]
    fn second_pass_changes_nothing() {
        let project = TestProject::new().expect("project");
        let paths = project.paths();
        let mut policies = policies();
        policies.retry.blocked_archive = BlockedArchivePolicy {
            enabled: true,
            include_reason_patterns: vec!["duplicate of".to_string()],
            exclude_reason_patterns: Vec::new(),
        };
        let catalog = catalog(&[("backend-1", "backend"), ("lead-1", "lead")]);
        let mut running = queued("RUN");
        running.status = ItemStatus::Running;
        let waiting = item("WAIT", Priority::High, &["BLOCKED-DEP"]);
        let mut queue = Queue::new(
            vec![running, waiting],
            Vec::new(),
            vec![
                blocked_item("BLOCKED-DEP", "needs vendor keys", None),
                blocked_item("DUP", "duplicate of RUN", None),
            ],
        );
        fs::create_dir_all(project.root().join("Human")).expect("mkdir");
        fs::write(project.root().join("Human/ship-it.md"), "Ship the beta").expect("write");

        let mut ledger = StallLedger::default();
        let probe = StaticModelProbe::default();
        let now = now_after(60);
        let first = heal_backlog(paths, &mut queue, &mut ledger, &policies, &catalog, 1800, &probe, now)
            .expect("heal");
        assert_eq!(first.orphans_requeued, vec!["RUN".to_string()]);
        assert_eq!(first.archived.len(), 1);
        assert_eq!(first.inbox_items.len(), 1);
        assert!(first.mutated());
        persist_healing(paths, &queue, &first).expect("persist");
        assert!(!project.root().join("Human/ship-it.md").exists());
        assert_eq!(load_archived(paths).expect("archive").len(), 1);
        assert_eq!(load_queue(paths).expect("load"), queue);

        let snapshot = queue.clone();
        let second = heal_backlog(paths, &mut queue, &mut ledger, &policies, &catalog, 1800, &probe, now)
            .expect("heal");
        assert!(!second.mutated(), "{second:?}");
        assert_eq!(queue, snapshot);
    }

    #[test]
    fn stall_creates_one_recovery_item_per_cooldown() {
        let project = TestProject::new().expect("project");
        let paths = project.paths();
        let policies = policies();
        let catalog = catalog(&[("backend-1", "backend"), ("lead-1", "lead")]);
        let mut queue = Queue::new(
            vec![item("DOWN", Priority::High, &["UP"])],
            Vec::new(),
            vec![blocked_item("UP", "waiting on vendor", None)],
        );
        let mut ledger = StallLedger::default();
        let probe = StaticModelProbe::default();

        let first = heal_backlog(paths, &mut queue, &mut ledger, &policies, &catalog, 1800, &probe, now_after(10))
            .expect("heal");
        let Some(StallOutcome::Created { item_id, .. }) = first.stall else {
            panic!("expected stall item, got {:?}", first.stall);
        };

        // Recovery item is dropped (e.g. completed elsewhere); snapshot unchanged.
        queue.active.retain(|item| item.id != item_id);
        let second = heal_backlog(paths, &mut queue, &mut ledger, &policies, &catalog, 1800, &probe, now_after(20))
            .expect("heal");
        assert!(matches!(second.stall, Some(StallOutcome::Suppressed { .. })));
        let stall_items = queue
            .active
            .iter()
            .filter(|item| item.auto_generated.as_deref() == Some(auto_tag::QUEUE_STALL_RECOVERY))
            .count();
        assert_eq!(stall_items, 0);
        assert_eq!(ledger.last_item_id.as_deref(), Some(item_id.as_str()));
    }

    #[test]
    fn drift_audit_blocks_items_on_dead_models() {
        let project = TestProject::new().expect("project");
        let paths = project.paths();
        let mut policies = policies();
        policies.model_fingerprint = "fp-1".to_string();
        let mut catalog = catalog(&[("backend-1", "backend"), ("lead-1", "lead")]);
        if let Some(entry) = catalog.get_mut("backend-1") {
            entry.model = "retired".to_string();
        }
        let mut stale = queued("OLD");
        stale.created_at = T0.to_string();
        let mut queue = Queue::new(vec![stale], Vec::new(), Vec::new());
        let mut ledger = StallLedger::default();
        let probe = StaticModelProbe::inaccessible(&["retired"]);

        let report = heal_backlog(paths, &mut queue, &mut ledger, &policies, &catalog, 1800, &probe, now_after(5))
            .expect("heal");
        assert_eq!(report.drift_blocked, vec!["OLD".to_string()]);
        let blocked = queue.find("OLD").expect("item");
        assert_eq!(blocked.status, ItemStatus::Blocked);
        assert_eq!(blocked.blocker_category.as_deref(), Some(blocker_category::MODEL_POLICY_DRIFT));
        assert_eq!(blocked.model_policy_fingerprint.as_deref(), Some("fp-1"));
        assert!(
            report
                .notices()
                .iter()
                .any(|notice| notice.title.starts_with("Blocked items on model policy drift"))
        );
    }
}
