//! Orchestration for a single head-loop cycle.
//!
//! preflight, heal, select, route, run the worker, validate, optionally
//! commit, then write back queue, stats, progress summary, daemon state and
//! finally the run-history record.

use std::io::IsTerminal;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::{ValidationVerdict, classify_validation};
use crate::core::clock;
use crate::core::commands::compose_validation_commands;
use crate::core::event_log::{Event, format_event};
use crate::core::policy::Policies;
use crate::core::queue::Queue;
use crate::core::retry::{RetryDecision, apply_retry};
use crate::core::routing::{ModelProfile, lead_agent_id, resolve_profile, route_agent};
use crate::core::scheduler::select_next;
use crate::core::stats::{AgentStats, RunRecord, RunSample, estimate_tokens, progress_summary};
use crate::core::types::{
    AgentEntry, ModelAccess, RunResult, ValidationResult, WorkItem, WorkerOutcome, blocker_category,
};
use crate::heal::{heal_backlog, persist_healing};
use crate::io::backlog::{load_queue, save_queue};
use crate::io::config::DaemonConfig;
use crate::io::git::{CommitOutcome, Git, commit_message};
use crate::io::paths::CoordinationPaths;
use crate::io::policy::{EnvOverrides, load_catalog, load_policies};
use crate::io::preflight::{PreflightFailedError, run_preflight};
use crate::io::probe::ModelProbe;
use crate::io::process::tail_chars;
use crate::io::prompt::PromptBuilder;
use crate::io::state::{
    DaemonPhase, DaemonState, append_run_record, load_agent_stats, load_daemon_state, load_model_stats,
    save_agent_stats, save_daemon_state, save_model_stats, save_progress_summary, update_daemon_state,
};
use crate::io::validation::{ValidationRequest, ValidationRunner, clear_visual_report, load_visual_report};
use crate::io::worker::{Worker, WorkerRequest, WorkerRun};

/// Agent id recorded when no catalog agent can take an item.
pub const UNROUTED_AGENT: &str = "unrouted";

/// Trait seams a cycle runs against.
#[derive(Clone, Copy)]
pub struct CycleDeps<'a> {
    pub worker: &'a dyn Worker,
    pub validator: &'a dyn ValidationRunner,
    pub probe: &'a dyn ModelProbe,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOptions {
    /// Select and route, but do not run the worker.
    pub dry_run: bool,
    /// Colour role names in event lines.
    pub color: bool,
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was ready.
    Idle,
    DryRun { item_id: String, agent_id: String },
    /// Selected item had no agent; it is now blocked.
    Unroutable { item_id: String },
    Ran {
        item_id: String,
        agent_id: String,
        result: RunResult,
    },
}

/// Colour event lines unless `NO_COLOR` is set; forced on by
/// `REDKEEPERS_COLOR_LOGS`, otherwise only on a terminal.
pub fn event_color(env: &EnvOverrides) -> bool {
    !env.no_color && (env.color_logs || std::io::stdout().is_terminal())
}

/// Run one cycle.
///
/// Returns [`PreflightFailedError`] (after recording the error state) when
/// preflight finds problems. Failures of the selected item are recorded in
/// the backlog and never surface as errors.
#[instrument(skip_all, fields(dry_run = options.dry_run))]
pub fn run_cycle(
    paths: &CoordinationPaths,
    env: &EnvOverrides,
    config: &DaemonConfig,
    deps: CycleDeps<'_>,
    options: CycleOptions,
) -> Result<CycleOutcome> {
    let errors = run_preflight(paths, env, deps.probe);
    if !errors.is_empty() {
        update_daemon_state(paths, |state| {
            state.state = DaemonPhase::Error;
            state.active_item = None;
            state.last_error = Some(errors.join("; "));
            state.updated_at = Some(clock::stamp(Utc::now()));
        })?;
        return Err(PreflightFailedError { errors }.into());
    }

    let policies = load_policies(paths)?;
    let catalog = load_catalog(paths)?;
    let mut queue = load_queue(paths)?;
    let mut agent_stats = load_agent_stats(paths)?;
    let mut daemon = load_daemon_state(paths)?;
    let lead = lead_agent_id(&policies.routing, &catalog);
    let cycle = Cycle {
        paths,
        env,
        config,
        deps,
        policies: &policies,
        lead: &lead,
        color: options.color,
    };

    let now = Utc::now();
    let heal = heal_backlog(
        paths,
        &mut queue,
        &mut daemon.stall_recovery,
        &policies,
        &catalog,
        config.stall_recovery_cooldown_seconds,
        deps.probe,
        now,
    )?;
    persist_healing(paths, &queue, &heal)?;
    for notice in heal.notices() {
        cycle.emit("queue_health", "lead", &lead, &notice.title, &notice.description);
    }
    daemon.model_policy_fingerprint = Some(policies.model_fingerprint.clone());
    daemon.last_error = None;

    let stamp = clock::stamp(now);
    let Some(item) = select_next(&queue, &policies.routing, &agent_stats) else {
        debug!("no ready item");
        daemon.state = DaemonPhase::Idle;
        daemon.active_item = None;
        daemon.updated_at = Some(stamp.clone());
        save_progress_summary(paths, &progress_summary(&queue, &stamp))?;
        save_daemon_state(paths, &daemon)?;
        return Ok(CycleOutcome::Idle);
    };

    let routed = route_agent(&item, &policies.routing, &catalog).map(|(id, entry)| (id.to_string(), entry.clone()));
    let Some((agent_id, agent)) = routed else {
        let reason = format!("no agent in the catalog can take owner role '{}'", item.owner_role);
        warn!(item = %item.id, "unroutable item");
        queue.mark_blocked(&item.id, &reason, Some(blocker_category::ROUTING), &stamp)?;
        let settled = Settled {
            blocker_category: Some(blocker_category::ROUTING.to_string()),
            ..Settled::new(UNROUTED_AGENT, &item.owner_role, RunResult::Blocked, "blocked", reason)
        };
        cycle.settle(&queue, &mut agent_stats, &mut daemon, &item, settled)?;
        return Ok(CycleOutcome::Unroutable { item_id: item.id });
    };
    let role = if agent.role.is_empty() { item.owner_role.clone() } else { agent.role.clone() };

    if options.dry_run {
        info!(item = %item.id, agent = %agent_id, "dry run selection");
        daemon.state = DaemonPhase::DryRun;
        daemon.active_item = Some(item.id.clone());
        daemon.last_run_summary = Some(format!("dry run: {} -> {agent_id}", item.id));
        daemon.updated_at = Some(stamp.clone());
        save_progress_summary(paths, &progress_summary(&queue, &stamp))?;
        save_daemon_state(paths, &daemon)?;
        cycle.emit("dry_run", &role, &agent_id, &item.title, &item.description);
        let settled = Settled::new(&agent_id, &role, RunResult::DryRun, "dry_run", "dry run".to_string());
        append_run_record(paths, &settled.record(&item, &stamp, None))?;
        return Ok(CycleOutcome::DryRun {
            item_id: item.id,
            agent_id,
        });
    }

    queue.mark_assigned(&item.id, &agent_id, &stamp)?;
    queue.mark_running(&item.id, &stamp)?;
    save_queue(paths, &queue)?;
    daemon.state = DaemonPhase::Running;
    daemon.active_item = Some(item.id.clone());
    daemon.updated_at = Some(stamp.clone());
    save_daemon_state(paths, &daemon)?;
    cycle.emit("started", &role, &agent_id, &item.title, &item.description);

    let profile = resolve_profile(&agent_id, &agent, &policies.model, &item);
    let settled = match choose_model(&profile, deps.probe) {
        ModelChoice::Unusable(reason) => {
            warn!(item = %item.id, model = %profile.model, "no usable model");
            queue.mark_blocked(&item.id, &reason, Some(blocker_category::MODEL_ACCESS), &stamp)?;
            Settled {
                model_requested: Some(profile.model.clone()),
                blocker_category: Some(blocker_category::MODEL_ACCESS.to_string()),
                ..Settled::new(&agent_id, &role, RunResult::Blocked, "blocked", reason)
            }
        }
        ModelChoice::Use { model, fallback } => {
            let assignment = Assignment {
                item: &item,
                agent_id: &agent_id,
                agent: &agent,
                role: &role,
                profile: &profile,
                model: &model,
                fallback: fallback.as_deref(),
            };
            cycle.execute(&mut queue, &mut daemon, &assignment)?
        }
    };

    let result = settled.result;
    cycle.settle(&queue, &mut agent_stats, &mut daemon, &item, settled)?;
    Ok(CycleOutcome::Ran {
        item_id: item.id,
        agent_id,
        result,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ModelChoice {
    Use { model: String, fallback: Option<String> },
    Unusable(String),
}

/// Skip straight to the fallback when the primary model is definitively
/// refused; give up when the fallback is refused too.
fn choose_model(profile: &ModelProfile, probe: &dyn ModelProbe) -> ModelChoice {
    let fallback = profile
        .fallback_model
        .clone()
        .filter(|fallback| !fallback.trim().is_empty() && *fallback != profile.model);
    let ModelAccess::Inaccessible(reason) = probe.probe(&profile.model) else {
        return ModelChoice::Use {
            model: profile.model.clone(),
            fallback,
        };
    };
    match fallback {
        Some(fallback) if !probe.probe(&fallback).is_definitively_inaccessible() => ModelChoice::Use {
            model: fallback,
            fallback: None,
        },
        Some(fallback) => ModelChoice::Unusable(format!(
            "model '{}' is inaccessible ({reason}); fallback '{fallback}' is inaccessible",
            profile.model
        )),
        None => ModelChoice::Unusable(format!(
            "model '{}' is inaccessible ({reason}); no fallback configured",
            profile.model
        )),
    }
}

struct Assignment<'a> {
    item: &'a WorkItem,
    agent_id: &'a str,
    agent: &'a AgentEntry,
    role: &'a str,
    profile: &'a ModelProfile,
    model: &'a str,
    fallback: Option<&'a str>,
}

/// Final disposition of the selected item, before it is written out.
#[derive(Debug, Clone)]
struct Settled {
    agent_id: String,
    role: String,
    result: RunResult,
    event_kind: &'static str,
    summary: String,
    commit_sha: Option<String>,
    validation_results: Vec<ValidationResult>,
    exit_code: Option<i32>,
    model_requested: Option<String>,
    model_used: Option<String>,
    fallback_used: bool,
    runtime_seconds: f64,
    blocker_category: Option<String>,
    tokens_in: u64,
    tokens_out: u64,
}

impl Settled {
    fn new(agent_id: &str, role: &str, result: RunResult, event_kind: &'static str, summary: String) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            role: role.to_string(),
            result,
            event_kind,
            summary,
            commit_sha: None,
            validation_results: Vec::new(),
            exit_code: None,
            model_requested: None,
            model_used: None,
            fallback_used: false,
            runtime_seconds: 0.0,
            blocker_category: None,
            tokens_in: 0,
            tokens_out: 0,
        }
    }

    fn record(&self, item: &WorkItem, ts: &str, retry_count: Option<u32>) -> RunRecord {
        RunRecord {
            ts: ts.to_string(),
            item_id: item.id.clone(),
            agent_id: self.agent_id.clone(),
            result: self.result,
            summary: self.summary.clone(),
            commit_sha: self.commit_sha.clone(),
            validation_results: self.validation_results.clone(),
            exit_code: self.exit_code,
            model_requested: self.model_requested.clone(),
            model_used: self.model_used.clone(),
            fallback_used: self.fallback_used,
            runtime_seconds: self.runtime_seconds,
            blocker_category: self.blocker_category.clone(),
            retry_count,
        }
    }
}

struct Cycle<'a> {
    paths: &'a CoordinationPaths,
    env: &'a EnvOverrides,
    config: &'a DaemonConfig,
    deps: CycleDeps<'a>,
    policies: &'a Policies,
    lead: &'a str,
    color: bool,
}

impl Cycle<'_> {
    fn emit(&self, kind: &str, role: &str, agent_id: &str, title: &str, description: &str) {
        let event = Event {
            kind,
            role,
            agent_id,
            title,
            description,
        };
        println!("{}", format_event(&event, Utc::now(), self.color));
    }

    #[instrument(skip_all, fields(item = %assignment.item.id, agent = assignment.agent_id, model = assignment.model))]
    fn execute(&self, queue: &mut Queue, daemon: &mut DaemonState, assignment: &Assignment<'_>) -> Result<Settled> {
        let item = assignment.item;
        let builder = PromptBuilder::new(
            self.config.prompt_file_char_limit,
            self.config.prompt_input_preview_count,
            self.config.prompt_input_char_limit,
        );
        let prompt = builder.build(self.paths, assignment.agent_id, assignment.agent, item)?;
        let request = WorkerRequest {
            project_root: &self.paths.root,
            item_id: &item.id,
            agent_id: assignment.agent_id,
            prompt: &prompt,
            model: assignment.model,
            fallback_model: assignment.fallback,
            timeout: Duration::from_secs(self.policies.retry.worker_timeout_seconds),
        };
        let run = self.deps.worker.run_agent(&request).unwrap_or_else(|err| {
            warn!(err = %format!("{err:#}"), "worker invocation failed");
            WorkerRun {
                outcome: WorkerOutcome::Failed {
                    reason: format!("worker invocation failed: {err:#}"),
                    category: None,
                },
                stdout: String::new(),
                model_used: assignment.model.to_string(),
                fallback_used: false,
                exit_code: None,
                runtime: Duration::ZERO,
            }
        });

        let stamp = clock::stamp(Utc::now());
        let mut settled = Settled {
            model_requested: Some(assignment.profile.model.clone()),
            model_used: Some(run.model_used.clone()),
            fallback_used: run.fallback_used || assignment.model != assignment.profile.model,
            exit_code: run.exit_code,
            runtime_seconds: run.runtime.as_secs_f64(),
            tokens_in: estimate_tokens(&prompt),
            tokens_out: estimate_tokens(&run.stdout),
            ..Settled::new(
                assignment.agent_id,
                assignment.role,
                RunResult::Failed,
                "failed",
                String::new(),
            )
        };

        match run.outcome {
            WorkerOutcome::Blocked { reason, category } => {
                queue.mark_blocked(&item.id, &reason, category.as_deref(), &stamp)?;
                settled.result = RunResult::Blocked;
                settled.event_kind = "blocked";
                settled.summary = reason;
                settled.blocker_category = category;
            }
            WorkerOutcome::Failed { reason, category } => {
                settled.blocker_category = category;
                self.retry(queue, item, reason, RunResult::Failed, "failed", &mut settled, &stamp)?;
            }
            WorkerOutcome::Completed { summary } => {
                queue.mark_validating(&item.id, &stamp)?;
                save_queue(self.paths, queue)?;
                daemon.state = DaemonPhase::Validating;
                daemon.updated_at = Some(stamp.clone());
                save_daemon_state(self.paths, daemon)?;
                self.validate(queue, assignment, summary, &mut settled)?;
            }
        }
        Ok(settled)
    }

    fn validate(
        &self,
        queue: &mut Queue,
        assignment: &Assignment<'_>,
        summary: String,
        settled: &mut Settled,
    ) -> Result<()> {
        let item = assignment.item;
        let commit = &self.policies.commit;
        let options = self.env.command_options(self.policies);
        let commands = compose_validation_commands(item, commit, &options);
        let report_path = self.paths.resolve(&commit.frontend_visual_qa.report_path);
        clear_visual_report(&report_path)?;

        let validation = self.deps.validator.run(&ValidationRequest {
            project_root: &self.paths.root,
            item_id: &item.id,
            commands: &commands,
            python_launcher: options.python_launcher.as_deref(),
            tail_chars: self.config.validation_tail_chars,
            output_limit_bytes: self.config.worker_output_limit_bytes,
        })?;
        let mut results = validation.results;
        let mut commit_sha = None;
        if validation.passed && commit.commit_enabled {
            let message = commit_message(&item.id, &item.title, assignment.agent_id);
            let tail = self.config.validation_tail_chars;
            match Git::new(&self.paths.root).commit_on_branch(&commit.commit_branch, &message, tail) {
                Ok(CommitOutcome::Skipped { reason }) => info!(reason = %reason, "commit skipped"),
                Ok(CommitOutcome::Committed { result, sha }) => {
                    results.push(result);
                    commit_sha = Some(sha);
                }
                Ok(CommitOutcome::Failed { result }) => results.push(result),
                Err(err) => results.push(ValidationResult {
                    command: "git commit".to_string(),
                    exit_code: 1,
                    stdout_tail: String::new(),
                    stderr_tail: tail_chars(&format!("{err:#}"), tail),
                    runtime_seconds: 0.0,
                }),
            }
        }

        let visual = load_visual_report(&report_path);
        let verdict = classify_validation(&results, visual.as_ref());
        settled.validation_results = results;
        let stamp = clock::stamp(Utc::now());
        match verdict {
            ValidationVerdict::Passed => {
                queue.mark_completed(&item.id, &summary, commit_sha.as_deref(), &stamp)?;
                settled.result = RunResult::Completed;
                settled.event_kind = "completed";
                settled.summary = summary;
                settled.commit_sha = commit_sha;
            }
            ValidationVerdict::EnvironmentBlocked { reason } => {
                queue.mark_blocked(&item.id, &reason, Some(blocker_category::ENVIRONMENT), &stamp)?;
                settled.result = RunResult::Blocked;
                settled.event_kind = "environment_blocked";
                settled.summary = reason;
                settled.blocker_category = Some(blocker_category::ENVIRONMENT.to_string());
            }
            ValidationVerdict::Failed { kind, reason } => {
                self.retry(queue, item, reason, kind.run_result(), kind.event_kind(), settled, &stamp)?;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn retry(
        &self,
        queue: &mut Queue,
        item: &WorkItem,
        reason: String,
        result: RunResult,
        event_kind: &'static str,
        settled: &mut Settled,
        stamp: &str,
    ) -> Result<()> {
        let max_retries = self.policies.retry.max_retries_per_item_per_agent;
        let decision = apply_retry(queue, &item.id, &reason, max_retries, self.lead, stamp)?;
        settled.result = result;
        match decision {
            RetryDecision::Requeued { retry_count } => {
                debug!(retry_count, "requeued for retry");
                settled.event_kind = event_kind;
                settled.summary = reason;
            }
            RetryDecision::Escalated {
                retry_count,
                escalation_id,
            } => {
                info!(retry_count, escalation = ?escalation_id, "retry threshold reached");
                settled.event_kind = "escalated";
                settled.blocker_category = Some(blocker_category::RETRY_THRESHOLD.to_string());
                settled.summary = match escalation_id {
                    Some(id) => format!("{reason}. Escalated to {id} after {retry_count} attempts"),
                    None => format!("{reason}. Retry threshold reached after {retry_count} attempts"),
                };
            }
        }
        Ok(())
    }

    /// Write back everything the cycle touched. The run record goes last.
    fn settle(
        &self,
        queue: &Queue,
        agent_stats: &mut AgentStats,
        daemon: &mut DaemonState,
        item: &WorkItem,
        settled: Settled,
    ) -> Result<()> {
        let stamp = clock::stamp(Utc::now());
        save_queue(self.paths, queue)?;

        if let Some(model_used) = settled.model_used.as_deref() {
            let sample = RunSample {
                agent_id: &settled.agent_id,
                model_used,
                result: settled.result,
                fallback_used: settled.fallback_used,
                tokens_in: settled.tokens_in,
                tokens_out: settled.tokens_out,
                runtime_seconds: settled.runtime_seconds,
            };
            agent_stats.record_run(&sample, &stamp);
            save_agent_stats(self.paths, agent_stats)?;
            let mut model_stats = load_model_stats(self.paths)?;
            model_stats.record(daemon.session_id.as_deref(), &sample);
            save_model_stats(self.paths, &model_stats)?;
        }

        save_progress_summary(self.paths, &progress_summary(queue, &stamp))?;
        daemon.state = if settled.result == RunResult::Blocked {
            DaemonPhase::Blocked
        } else {
            DaemonPhase::Idle
        };
        daemon.active_item = None;
        daemon.last_run_summary = Some(format!("{} {}: {}", item.id, settled.result.as_str(), settled.summary));
        daemon.updated_at = Some(stamp.clone());
        save_daemon_state(self.paths, daemon)?;

        self.emit(
            settled.event_kind,
            &settled.role,
            &settled.agent_id,
            &item.title,
            &settled.summary,
        );
        let retry_count = queue.find(&item.id).map(|current| current.retry_count);
        append_run_record(self.paths, &settled.record(item, &stamp, retry_count))
    }
}
