//! Daemon tuning stored under `coordination/state/daemon.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::store::write_atomic;

/// Daemon configuration (TOML).
///
/// Edited by humans; missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Pause between cycles of `run`.
    pub sleep_seconds: u64,

    /// Stop `run` after this many cycles (0 = until the queue drains).
    pub max_cycles: u32,

    /// Truncate each agent prompt file beyond this many characters.
    pub prompt_file_char_limit: usize,

    /// Number of item inputs previewed in the prompt.
    pub prompt_input_preview_count: usize,

    /// Characters shown per input preview.
    pub prompt_input_char_limit: usize,

    /// Truncate worker stdout/stderr beyond this many bytes.
    pub worker_output_limit_bytes: usize,

    /// Characters of stdout/stderr kept per validation command.
    pub validation_tail_chars: usize,

    /// Window in which an identical stall snapshot is not handled twice.
    pub stall_recovery_cooldown_seconds: u64,

    /// Interval between worker heartbeat lines (0 disables).
    pub heartbeat_seconds: u64,

    /// Model-stats sessions kept.
    pub session_retention: usize,

    /// Timeout for one model-access probe.
    pub model_probe_timeout_seconds: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            sleep_seconds: 5,
            max_cycles: 0,
            prompt_file_char_limit: 12_000,
            prompt_input_preview_count: 8,
            prompt_input_char_limit: 2_000,
            worker_output_limit_bytes: 1_000_000,
            validation_tail_chars: 1_000,
            stall_recovery_cooldown_seconds: 30 * 60,
            heartbeat_seconds: 60,
            session_retention: 20,
            model_probe_timeout_seconds: 45,
        }
    }
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<()> {
        if self.prompt_file_char_limit == 0 {
            return Err(anyhow!("prompt_file_char_limit must be > 0"));
        }
        if self.worker_output_limit_bytes == 0 {
            return Err(anyhow!("worker_output_limit_bytes must be > 0"));
        }
        if self.validation_tail_chars == 0 {
            return Err(anyhow!("validation_tail_chars must be > 0"));
        }
        if self.session_retention == 0 {
            return Err(anyhow!("session_retention must be > 0"));
        }
        if self.model_probe_timeout_seconds == 0 {
            return Err(anyhow!("model_probe_timeout_seconds must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `DaemonConfig::default()`.
pub fn load_config(path: &Path) -> Result<DaemonConfig> {
    if !path.exists() {
        let cfg = DaemonConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: DaemonConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk.
pub fn write_config(path: &Path, cfg: &DaemonConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, DaemonConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("daemon.toml");
        fs::write(&path, "sleep_seconds = 0\nmax_cycles = 3\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.sleep_seconds, 0);
        assert_eq!(cfg.max_cycles, 3);
        assert_eq!(cfg.validation_tail_chars, 1_000);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("daemon.toml");
        let cfg = DaemonConfig {
            session_retention: 0,
            ..DaemonConfig::default()
        };
        assert!(write_config(&path, &cfg).is_err());
        fs::write(&path, "validation_tail_chars = 0\n").expect("write");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("daemon.toml");
        let cfg = DaemonConfig {
            heartbeat_seconds: 0,
            ..DaemonConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }
}
