//! Git adapter for committing completed work.
//!
//! Commits only happen on the configured branch; the commit itself is
//! reported as a `git commit ...` validation result so commit failures flow
//! through the same classifier as validation failures.

use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::types::ValidationResult;
use crate::io::process::tail_chars;

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

/// Result of [`Git::commit_on_branch`].
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// Not on the commit branch, or nothing to commit.
    Skipped { reason: String },
    Committed { result: ValidationResult, sha: String },
    Failed { result: ValidationResult },
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Return the current branch name (errors on detached HEAD).
    pub fn current_branch(&self) -> Result<String> {
        let out = self
            .run_capture(&["symbolic-ref", "--short", "-q", "HEAD"])
            .context("detached HEAD")?;
        Ok(out.trim().to_string())
    }

    pub fn head_short_sha(&self, len: usize) -> Result<String> {
        let arg = format!("--short={len}");
        let out = self.run_capture(&["rev-parse", &arg, "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Stage everything and commit on `branch`.
    #[instrument(skip_all, fields(branch = branch))]
    pub fn commit_on_branch(&self, branch: &str, message: &str, tail: usize) -> Result<CommitOutcome> {
        let current = match self.current_branch() {
            Ok(current) => current,
            Err(err) => {
                warn!(err = %err, "cannot determine branch; skipping commit");
                return Ok(CommitOutcome::Skipped {
                    reason: format!("branch unknown: {err}"),
                });
            }
        };
        if current != branch {
            debug!(current = %current, "not on commit branch");
            return Ok(CommitOutcome::Skipped {
                reason: format!("on branch '{current}', commits only on '{branch}'"),
            });
        }
        self.add_all()?;
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(CommitOutcome::Skipped {
                reason: "nothing to commit".to_string(),
            });
        }

        let started = Instant::now();
        let output = self.run(&["commit", "-m", message])?;
        let result = ValidationResult {
            command: format!("git commit -m {message:?}"),
            exit_code: output.status.code().unwrap_or(-1),
            stdout_tail: tail_chars(&String::from_utf8_lossy(&output.stdout), tail),
            stderr_tail: tail_chars(&String::from_utf8_lossy(&output.stderr), tail),
            runtime_seconds: started.elapsed().as_secs_f64(),
        };
        if !output.status.success() {
            warn!(exit_code = result.exit_code, "git commit failed");
            return Ok(CommitOutcome::Failed { result });
        }
        let sha = self.head_short_sha(12)?;
        info!(sha = %sha, "committed");
        Ok(CommitOutcome::Committed { result, sha })
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Commit message for a completed item.
pub fn commit_message(item_id: &str, title: &str, agent_id: &str) -> String {
    format!("{item_id}: {title}\n\nCompleted by {agent_id}.")
}
