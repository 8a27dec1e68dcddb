//! End-to-end cycle scenarios.
//!
//! Each test drives `run_cycle` against a throwaway project with scripted
//! worker, validation and probe seams, then inspects the documents the
//! cycle left behind. Every cycle also checks that no id sits in two
//! backlog collections at once.

use redkeepers::core::queue::RETRY_THRESHOLD_REASON;
use redkeepers::core::types::{ItemStatus, Priority, RunResult, WorkerOutcome, auto_tag, blocker_category};
use redkeepers::cycle::{CycleDeps, CycleOptions, CycleOutcome, run_cycle};
use redkeepers::io::backlog::load_queue;
use redkeepers::io::config::DaemonConfig;
use redkeepers::io::state::{DaemonPhase, load_agent_stats, load_daemon_state, load_run_history};
use redkeepers::test_support::{
    ScriptedValidationRunner, ScriptedWorker, StaticModelProbe, T1, T2, TestProject, blocked_item, item,
    queued, validation_result,
};

const ROUTING: &str = "\
owner_role_map:
  backend: backend-1
  frontend: frontend-1
  lead: lead-1
";

struct Harness {
    project: TestProject,
    worker: ScriptedWorker,
    validator: ScriptedValidationRunner,
    probe: StaticModelProbe,
}

impl Harness {
    fn new() -> Self {
        Self {
            project: TestProject::new().expect("project"),
            worker: ScriptedWorker::default(),
            validator: ScriptedValidationRunner::passing(),
            probe: StaticModelProbe::default(),
        }
    }

    fn cycle(&self, dry_run: bool) -> CycleOutcome {
        let deps = CycleDeps {
            worker: &self.worker,
            validator: &self.validator,
            probe: &self.probe,
        };
        let options = CycleOptions { dry_run, color: false };
        let outcome = run_cycle(
            self.project.paths(),
            &self.project.mock_env(),
            &DaemonConfig::default(),
            deps,
            options,
        )
        .expect("cycle");
        let queue = load_queue(self.project.paths()).expect("queue");
        assert!(queue.partition_overlaps().is_empty(), "{:?}", queue.partition_overlaps());
        outcome
    }

    fn write(&self, path: &std::path::Path, contents: &str) {
        self.project.write_text(path, contents).expect("write policy");
    }
}

fn dry_run_pick(outcome: CycleOutcome) -> String {
    match outcome {
        CycleOutcome::DryRun { item_id, .. } => item_id,
        other => panic!("expected dry run, got {other:?}"),
    }
}

#[test]
fn unlocker_is_boosted_past_equal_rank() {
    let harness = Harness::new();
    let paths = harness.project.paths();
    harness.write(
        &paths.routing_policy,
        &format!("{ROUTING}dependency_unlock_priority:\n  enabled: true\n  priority_boost_levels: 1\n"),
    );
    harness
        .project
        .write_active(&[
            item("HIGH-1", Priority::High, &[]),
            item("NORMAL-UNLOCK", Priority::Normal, &[]),
            item("DOWN-1", Priority::High, &["NORMAL-UNLOCK"]),
        ])
        .expect("write");

    assert_eq!(dry_run_pick(harness.cycle(true)), "NORMAL-UNLOCK");
    // Dry runs leave the item queued, so the pick is stable.
    assert_eq!(dry_run_pick(harness.cycle(true)), "NORMAL-UNLOCK");
    assert!(harness.worker.calls().is_empty());

    let state = load_daemon_state(paths).expect("state");
    assert_eq!(state.state, DaemonPhase::DryRun);
    let history = load_run_history(paths).expect("history");
    assert!(history.iter().all(|record| record.result == RunResult::DryRun));
}

#[test]
fn critical_item_is_not_overridden_by_boost() {
    let harness = Harness::new();
    let paths = harness.project.paths();
    harness.write(
        &paths.routing_policy,
        &format!("{ROUTING}dependency_unlock_priority:\n  enabled: true\n  priority_boost_levels: 1\n"),
    );
    harness
        .project
        .write_active(&[
            item("CRIT-1", Priority::Critical, &[]),
            item("NORMAL-UNLOCK", Priority::Normal, &[]),
            item("DOWN-1", Priority::High, &["NORMAL-UNLOCK"]),
        ])
        .expect("write");

    assert_eq!(dry_run_pick(harness.cycle(true)), "CRIT-1");
}

#[test]
fn matching_blocked_item_is_revisited_once() {
    let harness = Harness::new();
    let paths = harness.project.paths();
    harness.write(
        &paths.retry_policy,
        "max_retries_per_item_per_agent: 2\n\
         blocked_revisit:\n  enabled: true\n  cooldown_seconds: 0\n  \
         include_reason_patterns: [\"not supported\"]\n  \
         exclude_reason_patterns: [\"audit-retained\"]\n",
    );
    harness
        .project
        .write_blocked(&[
            blocked_item("A", "Repeated failure: model is not supported", None),
            blocked_item("B", "Repeated failure: model is not supported (audit-retained)", None),
        ])
        .expect("write");

    assert_eq!(dry_run_pick(harness.cycle(true)), "A");
    let queue = load_queue(paths).expect("queue");
    let revisited = queue.active.iter().find(|i| i.id == "A").expect("A active");
    assert_eq!(revisited.status, ItemStatus::Queued);
    assert_eq!(revisited.blocked_revisit_count, 1);
    assert_eq!(queue.blocked.len(), 1);
    assert_eq!(queue.blocked[0].id, "B");
}

#[test]
fn environment_blocker_blocks_without_spending_a_retry() {
    let mut harness = Harness::new();
    let paths = harness.project.paths().clone();
    harness.project.write_active(&[queued("UI-1")]).expect("write");
    harness.validator = ScriptedValidationRunner::new(vec![vec![validation_result(
        "frontend_visual_smoke --strict",
        1,
        "STATUS: BLOCKED\nbrowser launch/run failed",
        "",
    )]]);

    let outcome = harness.cycle(false);
    assert_eq!(
        outcome,
        CycleOutcome::Ran {
            item_id: "UI-1".to_string(),
            agent_id: "backend-1".to_string(),
            result: RunResult::Blocked,
        }
    );

    let queue = load_queue(&paths).expect("queue");
    let blocked = queue.blocked.iter().find(|i| i.id == "UI-1").expect("blocked");
    assert_eq!(blocked.retry_count, 0);
    assert_eq!(blocked.blocker_category.as_deref(), Some(blocker_category::ENVIRONMENT));
    assert!(
        blocked
            .blocker_reason
            .as_deref()
            .is_some_and(|reason| reason.contains("browser launch/run failed"))
    );
    assert!(!queue.contains("UI-1-ESC"));

    let history = load_run_history(&paths).expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].blocker_category.as_deref(), Some(blocker_category::ENVIRONMENT));
    assert_eq!(load_daemon_state(&paths).expect("state").state, DaemonPhase::Blocked);
}

#[test]
fn same_stall_inside_cooldown_is_handled_once() {
    let harness = Harness::new();
    let paths = harness.project.paths();
    harness
        .project
        .write_active(&[item("WAIT", Priority::High, &["STUCK"])])
        .expect("write");
    harness
        .project
        .write_blocked(&[blocked_item("STUCK", "needs credentials", None)])
        .expect("write");

    // The recovery item is the only ready work, so the lead runs it.
    let first = harness.cycle(false);
    let CycleOutcome::Ran { item_id, agent_id, result } = first else {
        panic!("expected the recovery item to run, got {first:?}");
    };
    assert!(item_id.starts_with("QSR-"));
    assert_eq!(agent_id, "lead-1");
    assert_eq!(result, RunResult::Completed);

    // Same snapshot, still inside the cooldown: nothing new is synthesised.
    assert_eq!(harness.cycle(false), CycleOutcome::Idle);
    let queue = load_queue(paths).expect("queue");
    let recovery_items = queue
        .active
        .iter()
        .chain(&queue.completed)
        .chain(&queue.blocked)
        .filter(|i| i.auto_generated.as_deref() == Some(auto_tag::QUEUE_STALL_RECOVERY))
        .count();
    assert_eq!(recovery_items, 1);
    let ledger = load_daemon_state(paths).expect("state").stall_recovery;
    assert_eq!(ledger.last_item_id.as_deref(), Some(item_id.as_str()));
}

#[test]
fn model_drift_blocks_then_fingerprint_change_revisits() {
    let mut harness = Harness::new();
    let paths = harness.project.paths().clone();
    harness.write(&paths.model_policy, "fallback_model: spare\n");
    harness.write(
        &paths.retry_policy,
        "max_retries_per_item_per_agent: 2\nblocked_revisit:\n  cooldown_seconds: 0\n",
    );
    harness.probe = StaticModelProbe::inaccessible(&["model-backend", "spare"]);
    harness.project.write_active(&[queued("OLD")]).expect("write");

    assert_eq!(harness.cycle(false), CycleOutcome::Idle);
    let queue = load_queue(&paths).expect("queue");
    let blocked = queue.blocked.iter().find(|i| i.id == "OLD").expect("blocked");
    assert_eq!(blocked.blocker_category.as_deref(), Some(blocker_category::MODEL_POLICY_DRIFT));
    let fingerprint = load_daemon_state(&paths)
        .expect("state")
        .model_policy_fingerprint
        .expect("fingerprint");
    assert_eq!(blocked.model_policy_fingerprint.as_deref(), Some(fingerprint.as_str()));

    // Unchanged policy: the item stays parked.
    assert_eq!(harness.cycle(false), CycleOutcome::Idle);

    harness.write(
        &paths.model_policy,
        "fallback_model: spare\nagent_models:\n  backend-1:\n    model: model-next\n",
    );
    assert_eq!(dry_run_pick(harness.cycle(true)), "OLD");
    let queue = load_queue(&paths).expect("queue");
    let revived = queue.active.iter().find(|i| i.id == "OLD").expect("active");
    assert_eq!(revived.blocked_revisit_count, 1);
    assert_ne!(revived.model_policy_fingerprint.as_deref(), Some(fingerprint.as_str()));
}

#[test]
fn repeated_failures_spawn_exactly_one_escalation() {
    let mut harness = Harness::new();
    let paths = harness.project.paths().clone();
    harness.project.write_active(&[queued("API-1")]).expect("write");
    let failing = || vec![validation_result("cargo test", 1, "", "test api::login ... FAILED")];
    harness.validator = ScriptedValidationRunner::new(vec![failing(), failing(), failing()]);

    for attempt in 1..=2u32 {
        let outcome = harness.cycle(false);
        assert!(
            matches!(&outcome, CycleOutcome::Ran { result: RunResult::FailedValidation, .. }),
            "{outcome:?}"
        );
        let queue = load_queue(&paths).expect("queue");
        let item = queue.find("API-1").expect("item");
        assert_eq!(item.status, ItemStatus::Queued);
        assert_eq!(item.retry_count, attempt);
    }

    harness.cycle(false);
    let queue = load_queue(&paths).expect("queue");
    let source = queue.blocked.iter().find(|i| i.id == "API-1").expect("blocked");
    assert_eq!(source.blocker_reason.as_deref(), Some(RETRY_THRESHOLD_REASON));
    assert_eq!(source.blocker_category.as_deref(), Some(blocker_category::RETRY_THRESHOLD));
    let escalations: Vec<_> = queue.active.iter().filter(|i| i.id == "API-1-ESC").collect();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].preferred_agent.as_deref(), Some("lead-1"));

    let history = load_run_history(&paths).expect("history");
    assert_eq!(history.len(), 3);
    assert!(history[2].summary.contains("Escalated to API-1-ESC"));
    let stats = load_agent_stats(&paths).expect("stats");
    assert_eq!(stats.agents["backend-1"].failed_runs, 3);
}

#[test]
fn worker_reported_blocker_is_recorded() {
    let mut harness = Harness::new();
    let paths = harness.project.paths().clone();
    harness.project.write_active(&[queued("DOC-1")]).expect("write");
    harness.worker = ScriptedWorker::new(vec![WorkerOutcome::Blocked {
        reason: "needs the design tokens file".to_string(),
        category: Some(blocker_category::AGENT_REPORTED.to_string()),
    }]);

    let outcome = harness.cycle(false);
    assert!(matches!(outcome, CycleOutcome::Ran { result: RunResult::Blocked, .. }));
    assert!(harness.validator.requests().is_empty());
    let queue = load_queue(&paths).expect("queue");
    let blocked = queue.blocked.iter().find(|i| i.id == "DOC-1").expect("blocked");
    assert_eq!(blocked.blocker_reason.as_deref(), Some("needs the design tokens file"));
    assert_eq!(blocked.retry_count, 0);
}

#[test]
fn refused_primary_model_runs_on_fallback() {
    let mut harness = Harness::new();
    let paths = harness.project.paths().clone();
    harness.write(&paths.model_policy, "fallback_model: spare\n");
    harness.probe = StaticModelProbe::inaccessible(&["model-backend"]);
    harness.project.write_active(&[queued("FB-1")]).expect("write");

    let outcome = harness.cycle(false);
    assert!(matches!(outcome, CycleOutcome::Ran { result: RunResult::Completed, .. }));
    assert_eq!(harness.worker.calls(), vec![("FB-1".to_string(), "spare".to_string())]);
    let history = load_run_history(&paths).expect("history");
    assert_eq!(history[0].model_requested.as_deref(), Some("model-backend"));
    assert_eq!(history[0].model_used.as_deref(), Some("spare"));
    assert!(history[0].fallback_used);
}

#[test]
fn unroutable_item_is_blocked_with_routing_category() {
    let harness = Harness::new();
    let paths = harness.project.paths();
    let mut orphan = queued("ART-1");
    orphan.owner_role = "art".to_string();
    harness.project.write_active(&[orphan]).expect("write");

    assert_eq!(
        harness.cycle(false),
        CycleOutcome::Unroutable {
            item_id: "ART-1".to_string()
        }
    );
    assert!(harness.worker.calls().is_empty());
    let queue = load_queue(paths).expect("queue");
    let blocked = queue.blocked.iter().find(|i| i.id == "ART-1").expect("blocked");
    assert_eq!(blocked.blocker_category.as_deref(), Some(blocker_category::ROUTING));
    assert!(load_agent_stats(paths).expect("stats").agents.is_empty());
}

#[test]
fn duplicate_archive_entries_are_folded_before_work_runs() {
    let harness = Harness::new();
    let completed = |summary: &str, updated_at: &str| {
        let mut done = queued("A");
        done.status = ItemStatus::Completed;
        done.result_summary = Some(summary.to_string());
        done.updated_at = updated_at.to_string();
        done
    };
    harness
        .project
        .write_completed(&[completed("first pass", T1), completed("second pass", T2)])
        .expect("write");
    harness
        .project
        .write_active(&[item("B", Priority::Normal, &["A"])])
        .expect("write");

    let outcome = harness.cycle(false);
    assert!(matches!(
        outcome,
        CycleOutcome::Ran {
            ref item_id,
            result: RunResult::Completed,
            ..
        } if item_id == "B"
    ));

    let queue = load_queue(harness.project.paths()).expect("queue");
    let copies: Vec<_> = queue.completed.iter().filter(|done| done.id == "A").collect();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].updated_at, T2);
    assert_eq!(copies[0].result_summary.as_deref(), Some("second pass"));
    assert!(queue.completed.iter().any(|done| done.id == "B"));
}
