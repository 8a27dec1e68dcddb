//! Validation command execution.

use std::fs;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::ValidationResult;
use crate::io::process::{RunOptions, apply_launcher_env, run_command, shell_command, tail_chars};
use crate::io::store::load_value;

/// Parameters for one validation run.
#[derive(Debug, Clone)]
pub struct ValidationRequest<'a> {
    pub project_root: &'a Path,
    pub item_id: &'a str,
    pub commands: &'a [String],
    pub python_launcher: Option<&'a str>,
    pub tail_chars: usize,
    pub output_limit_bytes: usize,
}

/// Outcome of running the composed command list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationRun {
    pub passed: bool,
    pub results: Vec<ValidationResult>,
}

/// Abstraction over validation execution.
pub trait ValidationRunner {
    fn run(&self, request: &ValidationRequest<'_>) -> Result<ValidationRun>;
}

/// Runs each command through the platform shell in the project root,
/// stopping at the first non-zero exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellValidationRunner;

impl ValidationRunner for ShellValidationRunner {
    #[instrument(skip_all, fields(item = request.item_id, commands = request.commands.len()))]
    fn run(&self, request: &ValidationRequest<'_>) -> Result<ValidationRun> {
        let mut results = Vec::with_capacity(request.commands.len());
        for command in request.commands {
            info!(command = %command, "running validation command");
            let started = Instant::now();
            let mut cmd = shell_command(command);
            cmd.current_dir(request.project_root);
            apply_launcher_env(&mut cmd, request.python_launcher);
            let result = match run_command(
                cmd,
                RunOptions {
                    stdin: None,
                    timeout: None,
                    output_limit_bytes: request.output_limit_bytes,
                    on_tick: None,
                },
            ) {
                Ok(output) => ValidationResult {
                    command: command.clone(),
                    exit_code: output.exit_code(),
                    stdout_tail: tail_chars(&output.stdout_text(), request.tail_chars),
                    stderr_tail: tail_chars(&output.stderr_text(), request.tail_chars),
                    runtime_seconds: output.elapsed.as_secs_f64(),
                },
                Err(err) => {
                    warn!(err = %err, "validation command could not start");
                    ValidationResult {
                        command: command.clone(),
                        exit_code: 127,
                        stdout_tail: String::new(),
                        stderr_tail: tail_chars(&format!("{err:#}"), request.tail_chars),
                        runtime_seconds: started.elapsed().as_secs_f64(),
                    }
                }
            };
            let passed = result.passed();
            debug!(exit_code = result.exit_code, "validation command finished");
            results.push(result);
            if !passed {
                return Ok(ValidationRun {
                    passed: false,
                    results,
                });
            }
        }
        Ok(ValidationRun {
            passed: true,
            results,
        })
    }
}

/// Remove a visual-QA report left over from an earlier run.
pub fn clear_visual_report(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

/// Read the visual-QA side-file. Unreadable reports count as absent.
pub fn load_visual_report(path: &Path) -> Option<Value> {
    match load_value(path) {
        Ok(report) => report,
        Err(err) => {
            warn!(err = %err, path = %path.display(), "ignoring unreadable visual report");
            None
        }
    }
}
