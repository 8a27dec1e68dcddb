//! Autonomous coordination daemon.
//!
//! Works through the backlog under `coordination/` one item per cycle:
//! `status` renders the current state, `once` runs a single cycle and `run`
//! keeps cycling until nothing is ready.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use redkeepers::core::policy::Policies;
use redkeepers::cycle::{CycleDeps, CycleOptions, CycleOutcome, event_color};
use redkeepers::exit_codes;
use redkeepers::io::config::load_config;
use redkeepers::io::paths::CoordinationPaths;
use redkeepers::io::policy::{EnvOverrides, load_policies};
use redkeepers::io::preflight::PreflightFailedError;
use redkeepers::io::probe::{AccessibleProbe, CachedProbe, CodexModelProbe, ModelProbe};
use redkeepers::io::validation::ShellValidationRunner;
use redkeepers::io::worker::{CodexWorker, select_worker};
use redkeepers::logging;
use redkeepers::looping::{LoopStop, run_loop, run_once};
use redkeepers::status::render_status;

#[derive(Parser)]
#[command(
    name = "redkeepers",
    version,
    about = "Autonomous coordination daemon for code-generation agents"
)]
struct Cli {
    /// Project root holding the `coordination/` directory.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Render daemon state, queue counts, workloads and backlog health.
    Status,
    /// Run one cycle under the lock.
    Once {
        /// Select and route the next item without running the worker.
        #[arg(long)]
        dry_run: bool,
    },
    /// Cycle until the queue drains, `max_cycles` is reached, or Ctrl-C.
    Run {
        /// Select and route the next item without running the worker.
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() {
    logging::init();
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(exit_code_for(&err));
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<PreflightFailedError>().is_some() {
        exit_codes::PREFLIGHT_FAILED
    } else {
        exit_codes::FATAL
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let paths = CoordinationPaths::new(&cli.root);
    match cli.command {
        Command::Status => cmd_status(&paths),
        Command::Once { dry_run } => cmd_cycle(&paths, false, dry_run),
        Command::Run { dry_run } => cmd_cycle(&paths, true, dry_run),
    }
}

fn cmd_status(paths: &CoordinationPaths) -> Result<()> {
    print!("{}", render_status(paths)?);
    Ok(())
}

fn cmd_cycle(paths: &CoordinationPaths, looping: bool, dry_run: bool) -> Result<()> {
    let env = EnvOverrides::from_env();
    let config = load_config(&paths.daemon_config)?;
    // Broken policies surface through preflight with the proper exit code.
    let policies = load_policies(paths).unwrap_or_else(|err| {
        warn!(err = %format!("{err:#}"), "policies unreadable; preflight will report");
        Policies::default()
    });

    let codex = CodexWorker::new(
        env.codex_command.as_deref(),
        env.python_launcher(&policies.runtime),
        policies.retry.model_access_markers.clone(),
        config.worker_output_limit_bytes,
        Duration::from_secs(config.heartbeat_seconds),
    );
    let probe: Box<dyn ModelProbe> = if env.is_mock() {
        Box::new(AccessibleProbe)
    } else {
        Box::new(CachedProbe::new(CodexModelProbe::new(
            codex.clone(),
            paths.root.clone(),
            policies.retry.model_access_markers.clone(),
            Duration::from_secs(config.model_probe_timeout_seconds),
        )))
    };
    let worker = select_worker(env.is_mock(), codex);
    let validator = ShellValidationRunner;
    let deps = CycleDeps {
        worker: worker.as_ref(),
        validator: &validator,
        probe: probe.as_ref(),
    };
    let options = CycleOptions {
        dry_run,
        color: event_color(&env),
    };

    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupt);
    // SIGINT only raises the flag; the cycle finishes and the lock guard unwinds normally.
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)).context("install Ctrl-C handler")?;

    if !looping {
        match run_once(paths, &env, &config, deps, options, &interrupt)? {
            Some(outcome) => report(&outcome),
            None => println!("interrupted"),
        }
        return Ok(());
    }

    let outcome = run_loop(paths, &env, &config, deps, options, &interrupt, report)?;
    let stop = match outcome.stop {
        LoopStop::Drained => "queue drained".to_string(),
        LoopStop::MaxCycles { cycles } => format!("max_cycles reached after {cycles} cycles"),
        LoopStop::DryRun => "dry run".to_string(),
        LoopStop::Interrupted => "interrupted".to_string(),
    };
    println!("{}: {} cycles, {stop}", outcome.session_id, outcome.cycles);
    Ok(())
}

fn report(outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Idle => println!("no ready work items"),
        CycleOutcome::DryRun { item_id, agent_id } => println!("dry run: {item_id} -> {agent_id}"),
        CycleOutcome::Unroutable { item_id } => println!("{item_id}: no agent can take this item"),
        CycleOutcome::Ran {
            item_id,
            agent_id,
            result,
        } => println!("{item_id} ({agent_id}): {}", result.as_str()),
    }
}
