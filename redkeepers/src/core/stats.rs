//! Agent, model, and progress statistics folded from cycle outcomes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::queue::Queue;
use crate::core::types::{ItemStatus, RunResult, ValidationResult};

/// Telemetry-only token estimate: one token per four characters, at least one.
pub fn estimate_tokens(text: &str) -> u64 {
    ((text.chars().count() / 4) as u64).max(1)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCounters {
    pub total_runs: u64,
    pub completed_items: u64,
    pub blocked_items: u64,
    pub failed_runs: u64,
    pub total_runtime_seconds: f64,
    pub avg_runtime_seconds: f64,
    pub estimated_tokens_in: u64,
    pub estimated_tokens_out: u64,
    pub last_active_at: Option<String>,
    pub current_load_score: f64,
}

impl AgentCounters {
    fn refresh_derived(&mut self) {
        self.avg_runtime_seconds = if self.total_runs == 0 {
            0.0
        } else {
            self.total_runtime_seconds / self.total_runs as f64
        };
        self.current_load_score = self.completed_items as f64
            + 0.5 * self.failed_runs as f64
            + self.total_runtime_seconds / 600.0;
    }
}

/// `coordination/runtime/agent-stats.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentStats {
    pub agents: BTreeMap<String, AgentCounters>,
    pub updated_at: Option<String>,
}

impl AgentStats {
    /// Scheduler tie-break load for `agent_id`: `(current_load_score, total_runs)`.
    pub fn load_of(&self, agent_id: Option<&str>) -> (f64, u64) {
        agent_id
            .and_then(|id| self.agents.get(id))
            .map(|c| (c.current_load_score, c.total_runs))
            .unwrap_or((0.0, 0))
    }

    pub fn record_run(&mut self, sample: &RunSample<'_>, now: &str) {
        if sample.result == RunResult::DryRun {
            return;
        }
        let counters = self.agents.entry(sample.agent_id.to_string()).or_default();
        counters.total_runs += 1;
        match sample.result {
            RunResult::Completed => counters.completed_items += 1,
            RunResult::Blocked => counters.blocked_items += 1,
            RunResult::Failed | RunResult::FailedValidation | RunResult::FailedCommit => {
                counters.failed_runs += 1;
            }
            RunResult::DryRun => {}
        }
        counters.total_runtime_seconds += sample.runtime_seconds;
        counters.estimated_tokens_in += sample.tokens_in;
        counters.estimated_tokens_out += sample.tokens_out;
        counters.last_active_at = Some(now.to_string());
        counters.refresh_derived();
        self.updated_at = Some(now.to_string());
    }
}

/// One cycle's contribution to agent and model statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSample<'a> {
    pub agent_id: &'a str,
    pub model_used: &'a str,
    pub result: RunResult,
    pub fallback_used: bool,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub runtime_seconds: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelCounters {
    pub runs: u64,
    pub completed: u64,
    pub blocked: u64,
    pub failed: u64,
    pub fallback_runs: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub runtime_seconds: f64,
}

impl ModelCounters {
    fn add(&mut self, sample: &RunSample<'_>) {
        self.runs += 1;
        match sample.result {
            RunResult::Completed => self.completed += 1,
            RunResult::Blocked => self.blocked += 1,
            RunResult::Failed | RunResult::FailedValidation | RunResult::FailedCommit => {
                self.failed += 1;
            }
            RunResult::DryRun => {}
        }
        if sample.fallback_used {
            self.fallback_runs += 1;
        }
        self.tokens_in += sample.tokens_in;
        self.tokens_out += sample.tokens_out;
        self.runtime_seconds += sample.runtime_seconds;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelUsage {
    pub totals: ModelCounters,
    pub agents: BTreeMap<String, ModelCounters>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelBucket {
    pub totals: ModelCounters,
    pub by_model: BTreeMap<String, ModelUsage>,
}

impl ModelBucket {
    fn add(&mut self, sample: &RunSample<'_>) {
        self.totals.add(sample);
        let usage = self.by_model.entry(sample.model_used.to_string()).or_default();
        usage.totals.add(sample);
        usage
            .agents
            .entry(sample.agent_id.to_string())
            .or_default()
            .add(sample);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionBucket {
    pub started_at: String,
    pub ended_at: Option<String>,
    #[serde(flatten)]
    pub bucket: ModelBucket,
}

/// `coordination/runtime/model-stats.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelStats {
    pub lifetime: ModelBucket,
    pub sessions: BTreeMap<String, SessionBucket>,
    pub session_order: Vec<String>,
}

impl ModelStats {
    /// Open a session, dropping the oldest ones beyond `retention`.
    pub fn begin_session(&mut self, session_id: &str, now: &str, retention: usize) {
        self.sessions.insert(
            session_id.to_string(),
            SessionBucket {
                started_at: now.to_string(),
                ..SessionBucket::default()
            },
        );
        self.session_order.retain(|id| id != session_id);
        self.session_order.push(session_id.to_string());
        let retention = retention.max(1);
        while self.session_order.len() > retention {
            let dropped = self.session_order.remove(0);
            self.sessions.remove(&dropped);
        }
    }

    pub fn end_session(&mut self, session_id: &str, now: &str) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.ended_at = Some(now.to_string());
        }
    }

    pub fn record(&mut self, session_id: Option<&str>, sample: &RunSample<'_>) {
        if sample.result == RunResult::DryRun {
            return;
        }
        self.lifetime.add(sample);
        if let Some(session) = session_id.and_then(|id| self.sessions.get_mut(id)) {
            session.bucket.add(sample);
        }
    }
}

/// One line of `coordination/runtime/run-history.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub ts: String,
    pub item_id: String,
    pub agent_id: String,
    pub result: RunResult,
    pub summary: String,
    pub commit_sha: Option<String>,
    pub validation_results: Vec<ValidationResult>,
    pub exit_code: Option<i32>,
    pub model_requested: Option<String>,
    pub model_used: Option<String>,
    pub fallback_used: bool,
    pub runtime_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocker_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueCounts {
    pub active: usize,
    pub queued: usize,
    pub ready: usize,
    pub assigned: usize,
    pub running: usize,
    pub validating: usize,
    pub completed: usize,
    pub blocked: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MilestoneRollup {
    pub active: usize,
    pub completed: usize,
    pub blocked: usize,
}

/// `coordination/runtime/progress-summary.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressSummary {
    pub generated_at: String,
    pub counts: QueueCounts,
    pub milestones: BTreeMap<String, MilestoneRollup>,
}

pub fn progress_summary(queue: &Queue, now: &str) -> ProgressSummary {
    let mut counts = QueueCounts {
        active: queue.active.len(),
        ready: queue.ready_items().len(),
        completed: queue.completed.len(),
        blocked: queue.blocked.len(),
        ..QueueCounts::default()
    };
    for item in &queue.active {
        match item.status {
            ItemStatus::Queued => counts.queued += 1,
            ItemStatus::Assigned => counts.assigned += 1,
            ItemStatus::Running => counts.running += 1,
            ItemStatus::Validating => counts.validating += 1,
            _ => {}
        }
    }

    let mut milestones: BTreeMap<String, MilestoneRollup> = BTreeMap::new();
    for item in &queue.active {
        milestones.entry(item.milestone.clone()).or_default().active += 1;
    }
    for item in &queue.completed {
        milestones.entry(item.milestone.clone()).or_default().completed += 1;
    }
    for item in &queue.blocked {
        milestones.entry(item.milestone.clone()).or_default().blocked += 1;
    }

    ProgressSummary {
        generated_at: now.to_string(),
        counts,
        milestones,
    }
}
