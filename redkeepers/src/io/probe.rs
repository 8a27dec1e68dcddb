//! Model-access probes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, warn};

use crate::core::outcome::has_model_access_marker;
use crate::core::types::ModelAccess;
use crate::io::process::{RunOptions, run_command};
use crate::io::worker::{CodexWorker, resolve_worker_program};

const PROBE_PROMPT: &str = "Reply with the single word OK.";

/// Answers whether a model can be used by the worker CLI.
pub trait ModelProbe {
    fn probe(&self, model: &str) -> ModelAccess;
}

/// Probe that runs the worker CLI with `--model X` and a one-line prompt.
#[derive(Debug, Clone)]
pub struct CodexModelProbe {
    worker: CodexWorker,
    project_root: PathBuf,
    markers: Vec<String>,
    timeout: Duration,
}

impl CodexModelProbe {
    pub fn new(worker: CodexWorker, project_root: PathBuf, markers: Vec<String>, timeout: Duration) -> Self {
        Self {
            worker,
            project_root,
            markers,
            timeout,
        }
    }
}

impl ModelProbe for CodexModelProbe {
    fn probe(&self, model: &str) -> ModelAccess {
        let argv = self.worker.argv(model);
        let Some(program) = resolve_worker_program(&argv[0]) else {
            return ModelAccess::Unknown(format!("worker CLI '{}' not found", argv[0]));
        };
        let mut cmd = Command::new(program);
        cmd.args(&argv[1..]).current_dir(&self.project_root);
        let output = match run_command(
            cmd,
            RunOptions {
                stdin: Some(PROBE_PROMPT.as_bytes()),
                timeout: Some(self.timeout),
                output_limit_bytes: 64 * 1024,
                on_tick: None,
            },
        ) {
            Ok(output) => output,
            Err(err) => return ModelAccess::Unknown(format!("{err:#}")),
        };
        if output.timed_out {
            return ModelAccess::Unknown(format!("probe timed out after {}s", self.timeout.as_secs()));
        }
        let combined = format!("{}\n{}", output.stdout_text(), output.stderr_text());
        if output.status.success() {
            debug!(model, "model accessible");
            return ModelAccess::Accessible;
        }
        if has_model_access_marker(&combined, &self.markers) {
            let line = combined
                .lines()
                .map(str::trim)
                .find(|line| has_model_access_marker(line, &self.markers))
                .unwrap_or("model refused")
                .to_string();
            warn!(model, reason = %line, "model inaccessible");
            return ModelAccess::Inaccessible(line);
        }
        ModelAccess::Unknown(format!("probe exited {}", output.exit_code()))
    }
}

/// Probe that reports every model accessible (mock mode).
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessibleProbe;

impl ModelProbe for AccessibleProbe {
    fn probe(&self, _model: &str) -> ModelAccess {
        ModelAccess::Accessible
    }
}

/// Memoises another probe for the life of the process.
pub struct CachedProbe<P> {
    inner: P,
    cache: RefCell<HashMap<String, ModelAccess>>,
}

impl<P: ModelProbe> CachedProbe<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            cache: RefCell::new(HashMap::new()),
        }
    }
}

impl<P: ModelProbe> ModelProbe for CachedProbe<P> {
    fn probe(&self, model: &str) -> ModelAccess {
        if let Some(hit) = self.cache.borrow().get(model) {
            return hit.clone();
        }
        let verdict = self.inner.probe(model);
        self.cache
            .borrow_mut()
            .insert(model.to_string(), verdict.clone());
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountingProbe {
        calls: Cell<u32>,
    }

    impl ModelProbe for CountingProbe {
        fn probe(&self, model: &str) -> ModelAccess {
            self.calls.set(self.calls.get() + 1);
            if model == "gone" {
                ModelAccess::Inaccessible("unknown model".to_string())
            } else {
                ModelAccess::Accessible
            }
        }
    }

    #[test]
    fn cache_probes_each_model_once() {
        let cached = CachedProbe::new(CountingProbe { calls: Cell::new(0) });
        assert!(cached.probe("gone").is_definitively_inaccessible());
        assert!(cached.probe("gone").is_definitively_inaccessible());
        assert_eq!(cached.probe("ok"), ModelAccess::Accessible);
        assert_eq!(cached.inner.calls.get(), 2);
    }

    #[test]
    fn missing_cli_is_inconclusive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let worker = CodexWorker::new(Some("definitely-not-a-real-worker-xyz"), None, Vec::new(), 1024, Duration::ZERO);
        let probe = CodexModelProbe::new(worker, temp.path().to_path_buf(), Vec::new(), Duration::from_secs(1));
        assert!(matches!(probe.probe("m"), ModelAccess::Unknown(_)));
    }

    #[cfg(unix)]
    #[test]
    fn refusal_with_marker_is_definitive() {
        use std::fs;
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("probe.sh");
        fs::write(&script, "#!/bin/sh\ncat >/dev/null\necho \"error: model $2 is not supported\" >&2\nexit 1\n")
            .expect("write");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");
        let worker = CodexWorker::new(Some(&script.display().to_string()), None, Vec::new(), 1024, Duration::ZERO);
        let probe = CodexModelProbe::new(
            worker,
            temp.path().to_path_buf(),
            vec!["not supported".to_string()],
            Duration::from_secs(5),
        );
        assert_eq!(
            probe.probe("old"),
            ModelAccess::Inaccessible("error: model old is not supported".to_string())
        );
    }
}
