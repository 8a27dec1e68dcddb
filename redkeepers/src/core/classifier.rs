//! Interpretation of validation (and commit) results.
//!
//! Environment blockers are host problems (no browser sandbox, missing
//! Playwright, wrapper toolchain absent). They block the item without
//! consuming a retry.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::core::commands::FRONTEND_VISUAL_MARKER;
use crate::core::outcome::STATUS_BLOCKED;
use crate::core::types::{RunResult, ValidationResult};

static PLAYWRIGHT_MISSING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(no module named ['\x22]?playwright|modulenotfounderror:.*playwright|cannot find module ['\x22]?playwright|playwright (is )?not installed|executable doesn't exist)",
    )
    .expect("playwright regex")
});

/// Which stage of the pipeline failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Validation,
    Commit,
}

impl FailureKind {
    pub fn event_kind(self) -> &'static str {
        match self {
            FailureKind::Validation => "validation_failed",
            FailureKind::Commit => "commit_failed",
        }
    }

    pub fn run_result(self) -> RunResult {
        match self {
            FailureKind::Validation => RunResult::FailedValidation,
            FailureKind::Commit => RunResult::FailedCommit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationVerdict {
    Passed,
    EnvironmentBlocked { reason: String },
    Failed { kind: FailureKind, reason: String },
}

pub fn is_commit_command(command: &str) -> bool {
    command.trim_start().starts_with("git commit")
}

/// Classify results from one run. `visual_report` is the parsed side-file
/// the visual smoke writes, when present.
pub fn classify_validation(results: &[ValidationResult], visual_report: Option<&Value>) -> ValidationVerdict {
    let Some(failed) = results.iter().find(|result| !result.passed()) else {
        return ValidationVerdict::Passed;
    };

    if let Some(reason) = environment_blocker(failed, visual_report) {
        return ValidationVerdict::EnvironmentBlocked { reason };
    }

    let kind = if is_commit_command(&failed.command) {
        FailureKind::Commit
    } else {
        FailureKind::Validation
    };
    let detail = last_line(&failed.stderr_tail)
        .or_else(|| last_line(&failed.stdout_tail))
        .unwrap_or("(no output)");
    let label = match kind {
        FailureKind::Validation => "validation",
        FailureKind::Commit => "commit",
    };
    ValidationVerdict::Failed {
        kind,
        reason: format!(
            "{label} command failed (exit {}): {}: {detail}",
            failed.exit_code, failed.command
        ),
    }
}

fn environment_blocker(failed: &ValidationResult, visual_report: Option<&Value>) -> Option<String> {
    let output = format!("{}\n{}", failed.stdout_tail, failed.stderr_tail);

    if failed.command.contains(FRONTEND_VISUAL_MARKER) {
        if output.contains(STATUS_BLOCKED) {
            return Some(format!(
                "frontend visual QA blocked by environment: {}",
                blocked_detail(&output)
            ));
        }
        if let Some(report) = visual_report
            && report.get("status").and_then(Value::as_str) == Some("blocked")
        {
            let reason = report
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("visual smoke reported status blocked");
            return Some(format!("frontend visual QA blocked by environment: {reason}"));
        }
    }

    let lowered = failed.command.to_lowercase();
    if lowered.contains("wrapper") && output.contains(STATUS_BLOCKED) {
        return Some(format!(
            "platform wrapper prepare blocked by environment: {}",
            blocked_detail(&output)
        ));
    }

    if let Some(found) = PLAYWRIGHT_MISSING_RE.find(&output) {
        return Some(format!("playwright unavailable in validation interpreter: {}", found.as_str()));
    }
    None
}

/// Text after `STATUS: BLOCKED` on the same line, else the next non-empty line.
fn blocked_detail(output: &str) -> String {
    let mut lines = output.lines().map(str::trim);
    while let Some(line) = lines.next() {
        if let Some(pos) = line.find(STATUS_BLOCKED) {
            let same = line[pos + STATUS_BLOCKED.len()..]
                .trim_start_matches([':', '-', ' '])
                .trim();
            if !same.is_empty() {
                return same.to_string();
            }
            if let Some(next) = lines.find(|l| !l.is_empty()) {
                return next.to_string();
            }
        }
    }
    STATUS_BLOCKED.to_string()
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rev().find(|line| !line.is_empty())
}
