//! Single-writer lock (`coordination/state/daemon.lock`).
//!
//! `acquire` creates the lock file with `O_CREAT | O_EXCL` semantics and
//! writes the pid. Whoever holds the [`DaemonLock`] guard is the only writer
//! of backlog and stats documents; dropping the guard releases the lock.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::clock;
use crate::io::paths::CoordinationPaths;
use crate::io::state::update_daemon_state;
use crate::io::store::{load_document, save_document};

/// Another process holds `daemon.lock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHeldError {
    pub path: PathBuf,
    pub holder_pid: Option<String>,
}

impl fmt::Display for LockHeldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock already held: {}", self.path.display())?;
        if let Some(pid) = &self.holder_pid {
            write!(f, " (pid {pid})")?;
        }
        Ok(())
    }
}

impl std::error::Error for LockHeldError {}

/// `coordination/state/locks.json`: advisory acquire/release metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockRecord {
    pub held: bool,
    pub pid: Option<u32>,
    pub command: Option<String>,
    pub acquired_at: Option<String>,
    pub released_at: Option<String>,
}

pub fn load_lock_record(paths: &CoordinationPaths) -> Result<LockRecord> {
    load_document(&paths.locks, LockRecord::default())
}

/// Held lock. Released explicitly with [`DaemonLock::release`] or on drop.
#[derive(Debug)]
pub struct DaemonLock {
    paths: CoordinationPaths,
    released: bool,
}

impl DaemonLock {
    pub fn acquire(paths: &CoordinationPaths, command: &str) -> Result<Self> {
        let path = &paths.lock_file;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder_pid = fs::read_to_string(path)
                    .ok()
                    .map(|pid| pid.trim().to_string())
                    .filter(|pid| !pid.is_empty());
                warn!(path = %path.display(), holder = ?holder_pid, "lock already held");
                return Err(LockHeldError {
                    path: path.clone(),
                    holder_pid,
                }
                .into());
            }
            Err(err) => return Err(err).with_context(|| format!("create lock {}", path.display())),
        };
        let pid = std::process::id();
        file.write_all(format!("{pid}\n").as_bytes())
            .with_context(|| format!("write lock {}", path.display()))?;

        let lock = Self {
            paths: paths.clone(),
            released: false,
        };
        let now = clock::stamp(Utc::now());
        save_document(
            &paths.locks,
            &LockRecord {
                held: true,
                pid: Some(pid),
                command: Some(command.to_string()),
                acquired_at: Some(now),
                released_at: None,
            },
        )?;
        update_daemon_state(paths, |state| state.lock_held = true)?;
        info!(pid, command, "lock acquired");
        Ok(lock)
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        release_files(&self.paths)
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = release_files(&self.paths) {
            warn!(err = %err, "failed to release lock");
        }
    }
}

fn release_files(paths: &CoordinationPaths) -> Result<()> {
    let now = clock::stamp(Utc::now());
    let mut record = load_lock_record(paths).unwrap_or_default();
    record.held = false;
    record.released_at = Some(now);
    save_document(&paths.locks, &record)?;
    update_daemon_state(paths, |state| state.lock_held = false)?;
    match fs::remove_file(&paths.lock_file) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("remove lock {}", paths.lock_file.display()));
        }
    }
    debug!("lock released");
    Ok(())
}
