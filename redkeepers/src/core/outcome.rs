//! Classification of a finished worker invocation.

use crate::core::types::{WorkerOutcome, blocker_category};

pub const STATUS_COMPLETED: &str = "STATUS: COMPLETED";
pub const STATUS_BLOCKED: &str = "STATUS: BLOCKED";
pub const TIMEOUT_REASON: &str = "Agent execution timeout";

/// How the worker subprocess ended, before interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Finished {
        code: i32,
        stdout: String,
        stderr: String,
    },
    TimedOut {
        stdout: String,
        stderr: String,
    },
    /// The executable could not be resolved or spawned.
    CliMissing { detail: String },
}

/// True if `text` carries any model-access marker (case-insensitive).
pub fn has_model_access_marker(text: &str, markers: &[String]) -> bool {
    let lowered = text.to_lowercase();
    markers
        .iter()
        .filter(|marker| !marker.trim().is_empty())
        .any(|marker| lowered.contains(&marker.to_lowercase()))
}

/// Map a worker exit onto completed / blocked / failed.
pub fn classify_worker(exit: &WorkerExit, markers: &[String]) -> WorkerOutcome {
    match exit {
        WorkerExit::CliMissing { detail } => WorkerOutcome::Failed {
            reason: detail.clone(),
            category: Some(blocker_category::WORKER_CLI_MISSING.to_string()),
        },
        WorkerExit::TimedOut { .. } => WorkerOutcome::Failed {
            reason: TIMEOUT_REASON.to_string(),
            category: Some(blocker_category::WORKER_TIMEOUT.to_string()),
        },
        WorkerExit::Finished {
            code: 0,
            stdout,
            stderr,
        } => classify_status(stdout).unwrap_or_else(|| WorkerOutcome::Failed {
            reason: format!(
                "worker exited 0 without a STATUS line: {}",
                last_line(stdout).or_else(|| last_line(stderr)).unwrap_or("(no output)")
            ),
            category: None,
        }),
        WorkerExit::Finished {
            code,
            stdout,
            stderr,
        } => {
            let combined = format!("{stdout}\n{stderr}");
            let detail = last_line(stderr)
                .or_else(|| last_line(stdout))
                .unwrap_or("(no output)");
            if has_model_access_marker(&combined, markers) {
                WorkerOutcome::Blocked {
                    reason: format!("model access error: {detail}"),
                    category: Some(blocker_category::MODEL_ACCESS.to_string()),
                }
            } else {
                WorkerOutcome::Failed {
                    reason: format!("worker exited with code {code}: {detail}"),
                    category: None,
                }
            }
        }
    }
}

/// Find the last `STATUS:` line in stdout and interpret it.
fn classify_status(stdout: &str) -> Option<WorkerOutcome> {
    let lines: Vec<&str> = stdout.lines().collect();
    let (idx, status) = lines.iter().enumerate().rev().find_map(|(idx, line)| {
        let trimmed = line.trim();
        if trimmed.starts_with(STATUS_COMPLETED) {
            Some((idx, STATUS_COMPLETED))
        } else if trimmed.starts_with(STATUS_BLOCKED) {
            Some((idx, STATUS_BLOCKED))
        } else {
            None
        }
    })?;

    let after = lines[idx + 1..]
        .iter()
        .map(|line| line.trim())
        .find(|line| !line.is_empty());

    if status == STATUS_BLOCKED {
        return Some(WorkerOutcome::Blocked {
            reason: after.unwrap_or("").to_string(),
            category: Some(blocker_category::AGENT_REPORTED.to_string()),
        });
    }

    let summary = after
        .or_else(|| {
            lines[..idx]
                .iter()
                .rev()
                .map(|line| line.trim())
                .find(|line| !line.is_empty())
        })
        .unwrap_or("completed")
        .to_string();
    Some(WorkerOutcome::Completed { summary })
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rev().find(|line| !line.is_empty())
}

/// True when a fallback model should be tried after `outcome`.
pub fn wants_fallback(outcome: &WorkerOutcome) -> bool {
    outcome.category() == Some(blocker_category::MODEL_ACCESS)
}
