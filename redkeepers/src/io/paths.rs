//! Locations of every coordination document under a project root.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationPaths {
    pub root: PathBuf,
    pub work_items: PathBuf,
    pub completed_items: PathBuf,
    pub blocked_items: PathBuf,
    pub blocked_archived_items: PathBuf,
    pub agents: PathBuf,
    pub agents_dir: PathBuf,
    pub style_guide: PathBuf,
    pub policies_dir: PathBuf,
    pub routing_policy: PathBuf,
    pub retry_policy: PathBuf,
    pub model_policy: PathBuf,
    pub commit_policy: PathBuf,
    pub runtime_policy: PathBuf,
    pub daemon_config: PathBuf,
    pub lock_file: PathBuf,
    pub locks: PathBuf,
    pub runtime_dir: PathBuf,
    pub daemon_state: PathBuf,
    pub agent_stats: PathBuf,
    pub model_stats: PathBuf,
    pub progress_summary: PathBuf,
    pub run_history: PathBuf,
}

impl CoordinationPaths {
    pub fn new(root: &Path) -> Self {
        let coordination = root.join("coordination");
        let backlog = coordination.join("backlog");
        let state = coordination.join("state");
        let policies = coordination.join("policies");
        let runtime = coordination.join("runtime");
        Self {
            root: root.to_path_buf(),
            work_items: backlog.join("work-items.json"),
            completed_items: backlog.join("completed-items.json"),
            blocked_items: backlog.join("blocked-items.json"),
            blocked_archived_items: backlog.join("blocked-archived-items.json"),
            agents: state.join("agents.json"),
            agents_dir: coordination.join("agents"),
            style_guide: coordination.join("style").join("ui-style-guide.md"),
            routing_policy: policies.join("routing.yaml"),
            retry_policy: policies.join("retry.yaml"),
            model_policy: policies.join("model.yaml"),
            commit_policy: policies.join("commit.yaml"),
            runtime_policy: policies.join("runtime.yaml"),
            policies_dir: policies,
            daemon_config: state.join("daemon.toml"),
            lock_file: state.join("daemon.lock"),
            locks: state.join("locks.json"),
            daemon_state: runtime.join("daemon-state.json"),
            agent_stats: runtime.join("agent-stats.json"),
            model_stats: runtime.join("model-stats.json"),
            progress_summary: runtime.join("progress-summary.json"),
            run_history: runtime.join("run-history.jsonl"),
            runtime_dir: runtime,
        }
    }

    /// Documents that must exist before a cycle may run.
    pub fn required_documents(&self) -> [&Path; 9] {
        [
            self.work_items.as_path(),
            self.completed_items.as_path(),
            self.blocked_items.as_path(),
            self.agents.as_path(),
            self.routing_policy.as_path(),
            self.retry_policy.as_path(),
            self.model_policy.as_path(),
            self.commit_policy.as_path(),
            self.runtime_policy.as_path(),
        ]
    }

    pub fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.agents_dir.join(agent_id)
    }

    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Project-relative display form of `path`.
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}
