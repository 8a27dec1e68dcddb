//! Runtime documents owned by the head loop: daemon state, stats, history.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::healing::StallLedger;
use crate::core::stats::{AgentStats, ModelStats, ProgressSummary, RunRecord};
use crate::io::paths::CoordinationPaths;
use crate::io::store::{append_record, load_document, read_records, save_document};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonPhase {
    #[default]
    Idle,
    Running,
    Validating,
    Blocked,
    Error,
    DryRun,
    Stopped,
}

impl DaemonPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            DaemonPhase::Idle => "idle",
            DaemonPhase::Running => "running",
            DaemonPhase::Validating => "validating",
            DaemonPhase::Blocked => "blocked",
            DaemonPhase::Error => "error",
            DaemonPhase::DryRun => "dry_run",
            DaemonPhase::Stopped => "stopped",
        }
    }
}

/// `coordination/runtime/daemon-state.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonState {
    pub state: DaemonPhase,
    pub updated_at: Option<String>,
    pub active_item: Option<String>,
    pub last_error: Option<String>,
    pub last_run_summary: Option<String>,
    pub lock_held: bool,
    pub model_policy_fingerprint: Option<String>,
    pub session_id: Option<String>,
    pub stall_recovery: StallLedger,
}

pub fn load_daemon_state(paths: &CoordinationPaths) -> Result<DaemonState> {
    load_document(&paths.daemon_state, DaemonState::default())
}

pub fn save_daemon_state(paths: &CoordinationPaths, state: &DaemonState) -> Result<()> {
    debug!(state = state.state.as_str(), active_item = ?state.active_item, "writing daemon state");
    save_document(&paths.daemon_state, state)
}

/// Load, modify, and save daemon state in one step.
pub fn update_daemon_state<F>(paths: &CoordinationPaths, apply: F) -> Result<DaemonState>
where
    F: FnOnce(&mut DaemonState),
{
    let mut state = load_daemon_state(paths)?;
    apply(&mut state);
    save_daemon_state(paths, &state)?;
    Ok(state)
}

pub fn load_agent_stats(paths: &CoordinationPaths) -> Result<AgentStats> {
    load_document(&paths.agent_stats, AgentStats::default())
}

pub fn save_agent_stats(paths: &CoordinationPaths, stats: &AgentStats) -> Result<()> {
    save_document(&paths.agent_stats, stats)
}

pub fn load_model_stats(paths: &CoordinationPaths) -> Result<ModelStats> {
    load_document(&paths.model_stats, ModelStats::default())
}

pub fn save_model_stats(paths: &CoordinationPaths, stats: &ModelStats) -> Result<()> {
    save_document(&paths.model_stats, stats)
}

pub fn save_progress_summary(paths: &CoordinationPaths, summary: &ProgressSummary) -> Result<()> {
    save_document(&paths.progress_summary, summary)
}

pub fn load_progress_summary(paths: &CoordinationPaths) -> Result<Option<ProgressSummary>> {
    load_document(&paths.progress_summary, None)
}

pub fn append_run_record(paths: &CoordinationPaths, record: &RunRecord) -> Result<()> {
    append_record(&paths.run_history, record)
}

pub fn load_run_history(paths: &CoordinationPaths) -> Result<Vec<RunRecord>> {
    read_records(&paths.run_history)
}
