//! Lock-holding entry points for `once` and `run`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::core::clock;
use crate::cycle::{CycleDeps, CycleOptions, CycleOutcome, run_cycle};
use crate::io::config::DaemonConfig;
use crate::io::lock::DaemonLock;
use crate::io::paths::CoordinationPaths;
use crate::io::policy::EnvOverrides;
use crate::io::state::{DaemonPhase, load_model_stats, save_model_stats, update_daemon_state};

const SLEEP_SLICE: Duration = Duration::from_millis(200);

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// No ready item is left.
    Drained,
    /// `max_cycles` cycles ran.
    MaxCycles { cycles: u32 },
    /// Dry runs select the same item every time, so one is enough.
    DryRun,
    Interrupted,
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub session_id: String,
    pub cycles: u32,
    pub stop: LoopStop,
}

/// `session-<UTC>-<pid>`.
pub fn session_id(now: DateTime<Utc>, pid: u32) -> String {
    format!("session-{}-{pid}", now.format("%Y%m%dT%H%M%SZ"))
}

/// Acquire the lock, open a model-stats session, run `body`, then close
/// the session and release the lock whether or not `body` failed.
fn with_session<T, F>(paths: &CoordinationPaths, config: &DaemonConfig, command: &str, body: F) -> Result<T>
where
    F: FnOnce(&str) -> Result<T>,
{
    let lock = DaemonLock::acquire(paths, command)?;
    let now = Utc::now();
    let id = session_id(now, std::process::id());
    let opened = begin_session(paths, config, &id, now);
    let result = opened.and_then(|()| body(&id));
    let closed = end_session(paths, &id);
    let released = lock.release();
    let value = result?;
    closed?;
    released?;
    Ok(value)
}

fn begin_session(paths: &CoordinationPaths, config: &DaemonConfig, id: &str, now: DateTime<Utc>) -> Result<()> {
    let mut stats = load_model_stats(paths)?;
    stats.begin_session(id, &clock::stamp(now), config.session_retention);
    save_model_stats(paths, &stats)?;
    update_daemon_state(paths, |state| state.session_id = Some(id.to_string()))?;
    info!(session = id, "session opened");
    Ok(())
}

fn end_session(paths: &CoordinationPaths, id: &str) -> Result<()> {
    let mut stats = load_model_stats(paths)?;
    stats.end_session(id, &clock::stamp(Utc::now()));
    save_model_stats(paths, &stats)?;
    update_daemon_state(paths, |state| state.session_id = None)?;
    Ok(())
}

/// `once`: one cycle under the lock.
///
/// Returns `None` when `interrupt` was already set once the lock was taken;
/// the cycle is skipped and the lock released as usual.
pub fn run_once(
    paths: &CoordinationPaths,
    env: &EnvOverrides,
    config: &DaemonConfig,
    deps: CycleDeps<'_>,
    options: CycleOptions,
    interrupt: &AtomicBool,
) -> Result<Option<CycleOutcome>> {
    with_session(paths, config, "once", |_| {
        if interrupt.load(Ordering::SeqCst) {
            warn!("interrupted before the cycle started");
            return Ok(None);
        }
        run_cycle(paths, env, config, deps, options).map(Some)
    })
}

/// `run`: cycles until the queue drains, `max_cycles` is reached, or
/// `interrupt` is set. Any cycle error (including preflight) ends the loop.
#[instrument(skip_all, fields(max_cycles = config.max_cycles))]
pub fn run_loop<F: FnMut(&CycleOutcome)>(
    paths: &CoordinationPaths,
    env: &EnvOverrides,
    config: &DaemonConfig,
    deps: CycleDeps<'_>,
    options: CycleOptions,
    interrupt: &AtomicBool,
    mut on_cycle: F,
) -> Result<LoopOutcome> {
    with_session(paths, config, "run", |session| {
        let mut cycles = 0u32;
        let stop = loop {
            if interrupt.load(Ordering::SeqCst) {
                break LoopStop::Interrupted;
            }
            let outcome = run_cycle(paths, env, config, deps, options)?;
            cycles += 1;
            on_cycle(&outcome);
            match outcome {
                CycleOutcome::Idle => break LoopStop::Drained,
                CycleOutcome::DryRun { .. } => break LoopStop::DryRun,
                CycleOutcome::Unroutable { .. } | CycleOutcome::Ran { .. } => {}
            }
            if config.max_cycles > 0 && cycles >= config.max_cycles {
                break LoopStop::MaxCycles { cycles };
            }
            if interruptible_sleep(Duration::from_secs(config.sleep_seconds), interrupt) {
                break LoopStop::Interrupted;
            }
        };
        if stop == LoopStop::Interrupted {
            warn!(cycles, "interrupted");
        }
        update_daemon_state(paths, |state| {
            if state.state != DaemonPhase::Error {
                state.state = DaemonPhase::Stopped;
            }
            state.active_item = None;
            state.updated_at = Some(clock::stamp(Utc::now()));
        })?;
        info!(cycles, stop = ?stop, "loop finished");
        Ok(LoopOutcome {
            session_id: session.to_string(),
            cycles,
            stop,
        })
    })
}

/// Sleep up to `total`, returning early (true) once `interrupt` is set.
fn interruptible_sleep(total: Duration, interrupt: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if interrupt.load(Ordering::SeqCst) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ItemStatus, RunResult};
    use crate::io::backlog::load_queue;
    use crate::io::lock::LockHeldError;
    use crate::io::state::{load_daemon_state, load_model_stats, load_progress_summary, load_run_history};
    use crate::io::worker::MockWorker;
    use crate::test_support::{ScriptedValidationRunner, StaticModelProbe, TestProject, queued};
    use chrono::TimeZone;
    use std::fs;

    fn config() -> DaemonConfig {
        DaemonConfig {
            sleep_seconds: 0,
            ..DaemonConfig::default()
        }
    }

    #[test]
    fn session_ids_carry_time_and_pid() {
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(session_id(now, 42), "session-20260102T030405Z-42");
    }

    #[test]
    fn loop_drains_queue_and_closes_session() {
        let project = TestProject::new().expect("project");
        project.write_active(&[queued("A"), queued("B")]).expect("write");
        let validator = ScriptedValidationRunner::passing();
        let probe = StaticModelProbe::default();
        let deps = CycleDeps {
            worker: &MockWorker,
            validator: &validator,
            probe: &probe,
        };
        let interrupt = AtomicBool::new(false);
        let mut seen = Vec::new();
        let outcome = run_loop(
            project.paths(),
            &project.mock_env(),
            &config(),
            deps,
            CycleOptions::default(),
            &interrupt,
            |cycle| seen.push(cycle.clone()),
        )
        .expect("loop");

        assert_eq!(outcome.stop, LoopStop::Drained);
        assert_eq!(outcome.cycles, 3);
        assert!(matches!(
            &seen[0],
            CycleOutcome::Ran {
                result: RunResult::Completed,
                ..
            }
        ));
        let queue = load_queue(project.paths()).expect("queue");
        assert!(queue.active.is_empty());
        assert!(queue.completed.iter().all(|item| item.status == ItemStatus::Completed));
        assert_eq!(load_run_history(project.paths()).expect("history").len(), 2);
        let summary = load_progress_summary(project.paths()).expect("summary").expect("written");
        assert_eq!(summary.counts.completed, 2);
        assert_eq!(summary.counts.active, 0);

        let paths = project.paths();
        assert!(!paths.lock_file.exists());
        let state = load_daemon_state(paths).expect("state");
        assert_eq!(state.state, DaemonPhase::Stopped);
        assert!(!state.lock_held);
        assert!(state.session_id.is_none());
        let stats = load_model_stats(paths).expect("stats");
        let session = stats.sessions.get(&outcome.session_id).expect("session");
        assert!(session.ended_at.is_some());
        assert_eq!(session.bucket.totals.completed, 2);
    }

    #[test]
    fn max_cycles_and_interrupt_stop_the_loop() {
        let project = TestProject::new().expect("project");
        project.write_active(&[queued("A"), queued("B")]).expect("write");
        let validator = ScriptedValidationRunner::passing();
        let probe = StaticModelProbe::default();
        let deps = CycleDeps {
            worker: &MockWorker,
            validator: &validator,
            probe: &probe,
        };
        let limited = DaemonConfig {
            max_cycles: 1,
            ..config()
        };
        let interrupt = AtomicBool::new(false);
        let outcome = run_loop(
            project.paths(),
            &project.mock_env(),
            &limited,
            deps,
            CycleOptions::default(),
            &interrupt,
            |_| {},
        )
        .expect("loop");
        assert_eq!(outcome.stop, LoopStop::MaxCycles { cycles: 1 });

        interrupt.store(true, Ordering::SeqCst);
        let outcome = run_loop(
            project.paths(),
            &project.mock_env(),
            &config(),
            deps,
            CycleOptions::default(),
            &interrupt,
            |_| {},
        )
        .expect("loop");
        assert_eq!(outcome.stop, LoopStop::Interrupted);
        assert_eq!(outcome.cycles, 0);
        assert!(!project.paths().lock_file.exists());
    }

    #[test]
    fn held_lock_fails_fast_without_touching_the_backlog() {
        let project = TestProject::new().expect("project");
        project.write_active(&[queued("A")]).expect("write");
        let paths = project.paths();
        fs::write(&paths.lock_file, "999\n").expect("lock");
        let before = fs::read_to_string(&paths.work_items).expect("read");

        let validator = ScriptedValidationRunner::passing();
        let probe = StaticModelProbe::default();
        let deps = CycleDeps {
            worker: &MockWorker,
            validator: &validator,
            probe: &probe,
        };
        let interrupt = AtomicBool::new(false);
        let err = run_once(paths, &project.mock_env(), &config(), deps, CycleOptions::default(), &interrupt)
            .unwrap_err();
        let held = err.downcast_ref::<LockHeldError>().expect("typed");
        assert_eq!(held.holder_pid.as_deref(), Some("999"));
        assert_eq!(fs::read_to_string(&paths.work_items).expect("read"), before);
        assert!(paths.lock_file.exists());
    }

    #[test]
    fn interrupted_once_skips_the_cycle_and_releases_the_lock() {
        let project = TestProject::new().expect("project");
        project.write_active(&[queued("A")]).expect("write");
        let validator = ScriptedValidationRunner::passing();
        let probe = StaticModelProbe::default();
        let deps = CycleDeps {
            worker: &MockWorker,
            validator: &validator,
            probe: &probe,
        };
        let interrupt = AtomicBool::new(true);
        let outcome = run_once(
            project.paths(),
            &project.mock_env(),
            &config(),
            deps,
            CycleOptions::default(),
            &interrupt,
        )
        .expect("once");
        assert_eq!(outcome, None);

        let paths = project.paths();
        assert!(!paths.lock_file.exists());
        assert!(!load_daemon_state(paths).expect("state").lock_held);
        let queue = load_queue(paths).expect("queue");
        assert_eq!(queue.find("A").map(|item| item.status), Some(ItemStatus::Queued));
        assert!(load_run_history(paths).expect("history").is_empty());
    }
}
