//! Helpers for running child processes with optional deadlines and bounded output.

use std::env;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Exit code, or -1 when the child was killed by a signal.
    pub fn exit_code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }
}

/// Options for one child invocation.
pub struct RunOptions<'a> {
    pub stdin: Option<&'a [u8]>,
    /// `None` waits for the child however long it takes.
    pub timeout: Option<Duration>,
    pub output_limit_bytes: usize,
    /// Called every `tick` while the child is still running, with the elapsed time.
    pub on_tick: Option<(Duration, &'a mut dyn FnMut(Duration))>,
}

/// True when `err` came from spawning a program that does not exist.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound)
}

/// Run a command and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = options.timeout.map(|t| t.as_secs()), output_limit_bytes = options.output_limit_bytes))]
pub fn run_command(mut cmd: Command, options: RunOptions<'_>) -> Result<CommandOutput> {
    let RunOptions {
        stdin,
        timeout,
        output_limit_bytes,
        mut on_tick,
    } = options;
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // A child that exits without reading stdin closes the pipe early.
        if let Err(e) = child_stdin.write_all(input) {
            warn!(err = %e, "failed to write child stdin");
        }
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let tick = on_tick
        .as_ref()
        .map(|(every, _)| *every)
        .filter(|every| !every.is_zero());
    let mut timed_out = false;
    let status = loop {
        let elapsed = started.elapsed();
        let remaining = timeout.map(|limit| limit.saturating_sub(elapsed));
        if remaining.is_some_and(|r| r.is_zero()) {
            warn!(timeout_secs = timeout.map(|t| t.as_secs()), "command timed out, killing");
            timed_out = true;
            child.kill().context("kill command")?;
            break child.wait().context("wait command after kill")?;
        }
        let wait_for = match (remaining, tick) {
            (Some(r), Some(t)) => r.min(t),
            (Some(r), None) => r,
            (None, Some(t)) => t,
            (None, None) => break child.wait().context("wait for command")?,
        };
        if let Some(status) = child.wait_timeout(wait_for).context("wait for command")? {
            break status;
        }
        if let Some((_, callback)) = on_tick.as_mut() {
            callback(started.elapsed());
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        elapsed: started.elapsed(),
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

/// Last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

/// Platform shell invocation for a command string.
pub fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// Resolve `program` the way the OS would when spawning it.
///
/// Names containing a path separator are checked as given; bare names are
/// searched on `PATH` (with `PATHEXT` suffixes on Windows).
pub fn find_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = env::var_os("PATH")?;
    let suffixes: Vec<String> = if cfg!(windows) {
        let pathext = env::var("PATHEXT").unwrap_or_else(|_| ".EXE;.CMD;.BAT;.COM".to_string());
        std::iter::once(String::new())
            .chain(pathext.split(';').map(|ext| ext.to_ascii_lowercase()))
            .collect()
    } else {
        vec![String::new()]
    };
    env::split_paths(&path).find_map(|dir| {
        suffixes
            .iter()
            .map(|suffix| dir.join(format!("{program}{suffix}")))
            .find(|full| full.is_file())
    })
}

/// Export the validation launcher to a child: `REDKEEPERS_PYTHON_CMD` plus
/// the launcher's directory at the front of `PATH`.
pub fn apply_launcher_env(cmd: &mut Command, launcher: Option<&str>) {
    let Some(launcher) = launcher.map(str::trim).filter(|l| !l.is_empty()) else {
        return;
    };
    cmd.env("REDKEEPERS_PYTHON_CMD", launcher);
    let program = launcher.split_whitespace().next().unwrap_or(launcher);
    let Some(dir) = find_program(program).and_then(|p| p.parent().map(Path::to_path_buf)) else {
        return;
    };
    let mut dirs = vec![dir];
    if let Some(existing) = env::var_os("PATH") {
        dirs.extend(env::split_paths(&existing));
    }
    match env::join_paths(dirs) {
        Ok(joined) => {
            cmd.env("PATH", joined);
        }
        Err(err) => debug!(err = %err, "could not prefix PATH with launcher directory"),
    }
}
