//! Shared deterministic types for the daemon core.
//!
//! These types define the on-disk contract for backlog documents and the
//! in-memory contract between core components. They must not depend on
//! external state or I/O.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Work-item priority. Declaration order is rank order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    /// Scheduler base rank (lower runs first).
    pub fn rank(self) -> u32 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    /// Weight a dependant contributes to the unlock value of its dependency.
    pub fn unlock_weight(self) -> u64 {
        match self {
            Priority::Critical => 8,
            Priority::High => 4,
            Priority::Normal => 2,
            Priority::Low => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Queued,
    Assigned,
    Running,
    Validating,
    Completed,
    Blocked,
    FailedEscalated,
    Canceled,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Queued => "queued",
            ItemStatus::Assigned => "assigned",
            ItemStatus::Running => "running",
            ItemStatus::Validating => "validating",
            ItemStatus::Completed => "completed",
            ItemStatus::Blocked => "blocked",
            ItemStatus::FailedEscalated => "failed_escalated",
            ItemStatus::Canceled => "canceled",
        }
    }
}

/// Blocker categories recorded on `blocker_category`.
pub mod blocker_category {
    pub const MODEL_ACCESS: &str = "model_access";
    pub const MODEL_POLICY_DRIFT: &str = "model_policy_drift";
    pub const WORKER_CLI_MISSING: &str = "worker_cli_missing";
    pub const WORKER_TIMEOUT: &str = "worker_timeout";
    pub const ENVIRONMENT: &str = "environment_blocker";
    pub const RETRY_THRESHOLD: &str = "retry_threshold";
    pub const ROUTING: &str = "routing";
    pub const AGENT_REPORTED: &str = "agent_reported";
}

/// Tags stored on `auto_generated` for synthesised items.
pub mod auto_tag {
    pub const ESCALATION: &str = "escalation";
    pub const QUEUE_STALL_RECOVERY: &str = "queue_stall_recovery";
    pub const NON_ACTIONABLE_TRIAGE: &str = "non_actionable_blocker_triage";
    pub const PLATFORM_BOOTSTRAP: &str = "platform_bootstrap";
    pub const HUMAN_INBOX: &str = "human_inbox";
}

/// A durable unit of work in the backlog.
///
/// Field names are the on-disk JSON keys. Optional result fields are
/// omitted from the document while unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    pub description: String,
    pub milestone: String,
    #[serde(rename = "type")]
    pub item_type: String,
    pub priority: Priority,
    pub owner_role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,
    pub dependencies: Vec<String>,
    pub inputs: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    pub validation_commands: Vec<String>,
    pub status: ItemStatus,
    pub retry_count: u32,
    pub blocked_revisit_count: u32,
    pub created_at: String,
    pub updated_at: String,
    pub estimated_effort: String,
    pub token_budget: u64,
    pub escalation_target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocker_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocker_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_unblocked_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_generated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_instruction_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_policy_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stall_snapshot: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub non_actionable_blocked_snapshot: Option<Value>,
}

impl WorkItem {
    /// New queued item with empty lists and zeroed counters.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        owner_role: impl Into<String>,
        priority: Priority,
        now: &str,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            milestone: "unscheduled".to_string(),
            item_type: "feature".to_string(),
            priority,
            owner_role: owner_role.into(),
            preferred_agent: None,
            assigned_agent: None,
            dependencies: Vec::new(),
            inputs: Vec::new(),
            acceptance_criteria: Vec::new(),
            validation_commands: Vec::new(),
            status: ItemStatus::Queued,
            retry_count: 0,
            blocked_revisit_count: 0,
            created_at: now.to_string(),
            updated_at: now.to_string(),
            estimated_effort: "medium".to_string(),
            token_budget: 0,
            escalation_target: "lead".to_string(),
            result_summary: None,
            commit_sha: None,
            blocker_reason: None,
            blocker_category: None,
            last_failure_reason: None,
            last_unblocked_reason: None,
            auto_generated: None,
            human_instruction_file: None,
            model_policy_fingerprint: None,
            stall_snapshot: Vec::new(),
            non_actionable_blocked_snapshot: None,
        }
    }

    pub fn is_escalation(&self) -> bool {
        self.id.ends_with("-ESC")
    }
}

/// Agent catalog entry (`coordination/state/agents.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentEntry {
    pub display_name: String,
    pub role: String,
    pub model: String,
    pub reasoning: String,
}

impl Default for AgentEntry {
    fn default() -> Self {
        Self {
            display_name: String::new(),
            role: String::new(),
            model: String::new(),
            reasoning: "medium".to_string(),
        }
    }
}

/// Agent id to catalog entry, ordered for deterministic iteration.
pub type AgentCatalog = BTreeMap<String, AgentEntry>;

/// Result of one worker invocation, as a tagged record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed {
        summary: String,
    },
    Blocked {
        reason: String,
        category: Option<String>,
    },
    Failed {
        reason: String,
        category: Option<String>,
    },
}

impl WorkerOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            WorkerOutcome::Completed { .. } => "completed",
            WorkerOutcome::Blocked { .. } => "blocked",
            WorkerOutcome::Failed { .. } => "failed",
        }
    }

    pub fn category(&self) -> Option<&str> {
        match self {
            WorkerOutcome::Completed { .. } => None,
            WorkerOutcome::Blocked { category, .. } | WorkerOutcome::Failed { category, .. } => {
                category.as_deref()
            }
        }
    }
}

/// Result label written to run history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    Completed,
    Blocked,
    Failed,
    FailedValidation,
    FailedCommit,
    DryRun,
}

impl RunResult {
    pub fn as_str(self) -> &'static str {
        match self {
            RunResult::Completed => "completed",
            RunResult::Blocked => "blocked",
            RunResult::Failed => "failed",
            RunResult::FailedValidation => "failed_validation",
            RunResult::FailedCommit => "failed_commit",
            RunResult::DryRun => "dry_run",
        }
    }
}

/// One executed validation (or commit) command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout_tail: String,
    pub stderr_tail: String,
    #[serde(default)]
    pub runtime_seconds: f64,
}

impl ValidationResult {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Model accessibility verdict from a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelAccess {
    Accessible,
    /// Definitive refusal (unsupported, unauthorized, unknown model).
    Inaccessible(String),
    /// Transport or other inconclusive error.
    Unknown(String),
}

impl ModelAccess {
    pub fn is_definitively_inaccessible(&self) -> bool {
        matches!(self, ModelAccess::Inaccessible(_))
    }
}
