//! Worker abstraction for agent invocation.
//!
//! The [`Worker`] trait decouples the cycle from the code-generation CLI
//! (`codex exec` by default). Tests use scripted workers that return
//! predetermined outcomes without spawning processes.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::event_log::format_heartbeat;
use crate::core::outcome::{WorkerExit, classify_worker, wants_fallback};
use crate::core::types::WorkerOutcome;
use crate::io::process::{RunOptions, apply_launcher_env, find_program, is_not_found, run_command};

pub const DEFAULT_WORKER_COMMAND: &str = "codex exec";

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct WorkerRequest<'a> {
    pub project_root: &'a Path,
    pub item_id: &'a str,
    pub agent_id: &'a str,
    pub prompt: &'a str,
    pub model: &'a str,
    pub fallback_model: Option<&'a str>,
    pub timeout: Duration,
}

/// Interpreted result of one invocation (including any fallback retry).
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerRun {
    pub outcome: WorkerOutcome,
    pub stdout: String,
    pub model_used: String,
    pub fallback_used: bool,
    pub exit_code: Option<i32>,
    pub runtime: Duration,
}

/// Abstraction over agent execution backends.
pub trait Worker {
    fn run_agent(&self, request: &WorkerRequest<'_>) -> Result<WorkerRun>;
}

/// Split a configured command line into program and arguments.
///
/// Whitespace separates tokens; single or double quotes group.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_token = false;
    for ch in line.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None if ch == '"' || ch == '\'' => {
                quote = Some(ch);
                in_token = true;
            }
            None if ch.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(ch);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

/// True if `args` already select a model explicitly.
pub fn has_model_flag(args: &[String]) -> bool {
    args.iter().any(|arg| {
        let lowered = arg.to_ascii_lowercase();
        lowered == "--model" || lowered.starts_with("--model=")
    })
}

/// Resolve the worker executable. On Windows a bare name that does not
/// resolve is retried with a `.cmd` shim suffix.
pub fn resolve_worker_program(program: &str) -> Option<PathBuf> {
    if let Some(found) = find_program(program) {
        return Some(found);
    }
    let bare = Path::new(program).components().count() == 1;
    if cfg!(windows) && bare && !program.to_ascii_lowercase().ends_with(".cmd") {
        return find_program(&format!("{program}.cmd"));
    }
    None
}

/// Guidance appended to worker-CLI resolution errors.
pub fn worker_cli_hint(program: &str) -> String {
    format!(
        "worker CLI '{program}' was not found on PATH; install it or set REDKEEPERS_CODEX_COMMAND \
         (or REDKEEPERS_WORKER_MODE=mock for a dry pipeline)"
    )
}

/// Worker that spawns the configured code-generation CLI.
#[derive(Debug, Clone)]
pub struct CodexWorker {
    command: Vec<String>,
    python_launcher: Option<String>,
    model_access_markers: Vec<String>,
    output_limit_bytes: usize,
    heartbeat: Duration,
}

impl CodexWorker {
    pub fn new(
        command_line: Option<&str>,
        python_launcher: Option<String>,
        model_access_markers: Vec<String>,
        output_limit_bytes: usize,
        heartbeat: Duration,
    ) -> Self {
        let mut command = split_command_line(command_line.unwrap_or(DEFAULT_WORKER_COMMAND));
        if command.is_empty() {
            command = split_command_line(DEFAULT_WORKER_COMMAND);
        }
        Self {
            command,
            python_launcher,
            model_access_markers,
            output_limit_bytes,
            heartbeat,
        }
    }

    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or("codex")
    }

    /// Program and arguments for `model`, honouring an explicit `--model`.
    pub fn argv(&self, model: &str) -> Vec<String> {
        let mut argv = self.command.clone();
        if !model.trim().is_empty() && !has_model_flag(&argv[1..]) {
            argv.push("--model".to_string());
            argv.push(model.to_string());
        }
        argv
    }

    #[instrument(skip_all, fields(agent = request.agent_id, model = model))]
    fn invoke(&self, request: &WorkerRequest<'_>, model: &str) -> Result<(WorkerExit, Option<i32>)> {
        let argv = self.argv(model);
        let program = self.program();
        let Some(resolved) = resolve_worker_program(program) else {
            warn!(program, "worker CLI not found");
            return Ok((
                WorkerExit::CliMissing {
                    detail: worker_cli_hint(program),
                },
                None,
            ));
        };

        let mut cmd = Command::new(&resolved);
        cmd.args(&argv[1..]).current_dir(request.project_root);
        apply_launcher_env(&mut cmd, self.python_launcher.as_deref());

        let agent_id = request.agent_id;
        let mut heartbeat = |elapsed: Duration| {
            println!("{}", format_heartbeat(agent_id, elapsed.as_secs(), Utc::now()));
        };
        let on_tick: Option<(Duration, &mut dyn FnMut(Duration))> = if self.heartbeat.is_zero() {
            None
        } else {
            Some((self.heartbeat, &mut heartbeat))
        };

        info!(program = %resolved.display(), "starting worker");
        let output = match run_command(
            cmd,
            RunOptions {
                stdin: Some(request.prompt.as_bytes()),
                timeout: Some(request.timeout),
                output_limit_bytes: self.output_limit_bytes,
                on_tick,
            },
        ) {
            Ok(output) => output,
            Err(err) if is_not_found(&err) => {
                return Ok((
                    WorkerExit::CliMissing {
                        detail: worker_cli_hint(program),
                    },
                    None,
                ));
            }
            Err(err) => return Err(err.context("run worker")),
        };

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "worker timed out");
            return Ok((
                WorkerExit::TimedOut {
                    stdout: output.stdout_text(),
                    stderr: output.stderr_text(),
                },
                None,
            ));
        }
        let code = output.exit_code();
        debug!(exit_code = code, "worker finished");
        Ok((
            WorkerExit::Finished {
                code,
                stdout: output.stdout_text(),
                stderr: output.stderr_text(),
            },
            Some(code),
        ))
    }
}

fn exit_stdout(exit: &WorkerExit) -> String {
    match exit {
        WorkerExit::Finished { stdout, .. } | WorkerExit::TimedOut { stdout, .. } => stdout.clone(),
        WorkerExit::CliMissing { .. } => String::new(),
    }
}

impl Worker for CodexWorker {
    fn run_agent(&self, request: &WorkerRequest<'_>) -> Result<WorkerRun> {
        let started = Instant::now();
        let (exit, exit_code) = self.invoke(request, request.model)?;
        let outcome = classify_worker(&exit, &self.model_access_markers);
        let first = WorkerRun {
            stdout: exit_stdout(&exit),
            outcome,
            model_used: request.model.to_string(),
            fallback_used: false,
            exit_code,
            runtime: started.elapsed(),
        };

        let fallback = request
            .fallback_model
            .filter(|fallback| !fallback.trim().is_empty() && *fallback != request.model);
        let Some(fallback) = fallback.filter(|_| wants_fallback(&first.outcome)) else {
            return Ok(first);
        };
        info!(model = request.model, fallback, "model refused; retrying with fallback");
        let (exit, exit_code) = self.invoke(request, fallback)?;
        Ok(WorkerRun {
            outcome: classify_worker(&exit, &self.model_access_markers),
            stdout: exit_stdout(&exit),
            model_used: fallback.to_string(),
            fallback_used: true,
            exit_code,
            runtime: started.elapsed(),
        })
    }
}

/// Worker used in mock mode: synthetic success, nothing spawned.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockWorker;

impl Worker for MockWorker {
    fn run_agent(&self, request: &WorkerRequest<'_>) -> Result<WorkerRun> {
        let summary = format!("mock worker completed {}", request.item_id);
        Ok(WorkerRun {
            stdout: format!("{summary}\nSTATUS: COMPLETED\n"),
            outcome: WorkerOutcome::Completed { summary },
            model_used: request.model.to_string(),
            fallback_used: false,
            exit_code: Some(0),
            runtime: Duration::ZERO,
        })
    }
}

/// Pick the worker for the configured mode.
pub fn select_worker(mock: bool, codex: CodexWorker) -> Box<dyn Worker> {
    if mock { Box::new(MockWorker) } else { Box::new(codex) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_quoted_command_lines() {
        assert_eq!(split_command_line("codex exec"), vec!["codex", "exec"]);
        assert_eq!(
            split_command_line(r#""C:\Program Files\codex.cmd" exec  --model 'gpt x'"#),
            vec![r"C:\Program Files\codex.cmd", "exec", "--model", "gpt x"]
        );
        assert_eq!(split_command_line("a ''"), vec!["a", ""]);
        assert!(split_command_line("   ").is_empty());
    }

    #[test]
    fn model_flag_is_appended_unless_present() {
        let worker = CodexWorker::new(None, None, Vec::new(), 1024, Duration::ZERO);
        assert_eq!(worker.argv("m1"), vec!["codex", "exec", "--model", "m1"]);

        let pinned = CodexWorker::new(Some("codex exec --MODEL pinned"), None, Vec::new(), 1024, Duration::ZERO);
        assert_eq!(pinned.argv("m1"), vec!["codex", "exec", "--MODEL", "pinned"]);

        let eq_form = CodexWorker::new(Some("codex exec --model=pinned"), None, Vec::new(), 1024, Duration::ZERO);
        assert!(!eq_form.argv("m1").contains(&"m1".to_string()));
    }

    #[test]
    fn missing_cli_fails_with_override_guidance() {
        let temp = tempfile::tempdir().expect("tempdir");
        let worker = CodexWorker::new(
            Some("definitely-not-a-real-worker-xyz exec"),
            None,
            Vec::new(),
            1024,
            Duration::ZERO,
        );
        let run = worker
            .run_agent(&WorkerRequest {
                project_root: temp.path(),
                item_id: "A",
                agent_id: "backend-1",
                prompt: "do it",
                model: "m1",
                fallback_model: Some("m2"),
                timeout: Duration::from_secs(5),
            })
            .expect("run");
        match &run.outcome {
            WorkerOutcome::Failed { reason, category } => {
                assert!(reason.contains("REDKEEPERS_CODEX_COMMAND"));
                assert_eq!(category.as_deref(), Some("worker_cli_missing"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!run.fallback_used);
    }

    #[cfg(unix)]
    #[test]
    fn model_refusal_retries_with_fallback() {
        use std::fs;
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("fake-codex.sh");
        fs::write(
            &script,
            "#!/bin/sh\ncat >/dev/null\nif [ \"$2\" = \"bad\" ]; then echo 'unsupported model' >&2; exit 1; fi\necho done\necho 'STATUS: COMPLETED'\n",
        )
        .expect("write script");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");

        let worker = CodexWorker::new(
            Some(&script.display().to_string()),
            None,
            vec!["unsupported model".to_string()],
            4096,
            Duration::ZERO,
        );
        let run = worker
            .run_agent(&WorkerRequest {
                project_root: temp.path(),
                item_id: "A",
                agent_id: "backend-1",
                prompt: "do it",
                model: "bad",
                fallback_model: Some("good"),
                timeout: Duration::from_secs(10),
            })
            .expect("run");
        assert!(run.fallback_used);
        assert_eq!(run.model_used, "good");
        assert_eq!(
            run.outcome,
            WorkerOutcome::Completed {
                summary: "done".to_string()
            }
        );
        assert_eq!(run.exit_code, Some(0));
    }

    #[test]
    fn mock_worker_completes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run = MockWorker
            .run_agent(&WorkerRequest {
                project_root: temp.path(),
                item_id: "A-1",
                agent_id: "lead-1",
                prompt: "",
                model: "m",
                fallback_model: None,
                timeout: Duration::from_secs(1),
            })
            .expect("run");
        assert_eq!(run.outcome.label(), "completed");
        assert!(run.stdout.ends_with("STATUS: COMPLETED\n"));
    }
}
