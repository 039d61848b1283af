//! Worker command - run one job over stdin/stdout.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context as _, Result};
use clap::{Args, Subcommand};
use runnel_worker::{CapacityProbe, Orchestrator, ScriptEngine, WorkerSettings};
use tracing::{debug, info, warn};

use super::{Context, cancel_on_signal, exit_code};

/// Prefix for private data directories the worker creates itself.
const TEMP_DIR_PREFIX: &str = "runnel_";

/// Arguments for the worker command.
#[derive(Args, Debug)]
#[command(args_conflicts_with_subcommands = true)]
pub struct WorkerArgs {
    #[command(subcommand)]
    pub command: Option<WorkerCommand>,

    /// Directory the job runs in; a fresh temp dir when omitted
    #[arg(long)]
    pub private_data_dir: Option<PathBuf>,

    /// Remove the private data directory before and after the job
    #[arg(long)]
    pub delete: bool,

    /// Interval between `running` heartbeats (0 disables)
    #[arg(long)]
    pub keepalive_seconds: Option<u64>,

    /// Extra config file layered over discovered ones
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Automation script to run
    #[arg(long, env = "RUNNEL_SCRIPT")]
    pub script: Option<PathBuf>,

    /// Print host capacity as YAML and exit
    #[arg(long)]
    pub worker_info: bool,
}

#[derive(Subcommand, Debug)]
pub enum WorkerCommand {
    /// Remove stale private data directories
    Cleanup(CleanupArgs),
}

#[derive(Args, Debug)]
pub struct CleanupArgs {
    /// Glob of directories to consider
    #[arg(long, default_value = "/tmp/runnel_*")]
    pub file_pattern: String,

    /// Only remove directories older than this many seconds
    #[arg(long, default_value_t = 3600)]
    pub grace_period: u64,

    /// List what would be removed without removing it
    #[arg(long)]
    pub dry_run: bool,
}

/// Run the worker command.
pub async fn run(args: WorkerArgs, _ctx: &Context) -> Result<ExitCode> {
    match args.command {
        Some(WorkerCommand::Cleanup(cleanup)) => cmd_cleanup(&cleanup),
        None if args.worker_info => cmd_worker_info(),
        None => cmd_worker(args).await,
    }
}

async fn cmd_worker(args: WorkerArgs) -> Result<ExitCode> {
    let private_data_dir = match &args.private_data_dir {
        Some(dir) => {
            if args.delete && dir.exists() {
                std::fs::remove_dir_all(dir)
                    .with_context(|| format!("failed to remove {}", dir.display()))?;
            }
            dir.clone()
        }
        None => tempfile::Builder::new()
            .prefix(TEMP_DIR_PREFIX)
            .tempdir()
            .context("failed to create private data directory")?
            .keep(),
    };

    let loaded = runnel_config::load_config_with_options(
        Some(&private_data_dir),
        None,
        args.config.as_deref(),
    )?;
    for warning in &loaded.warnings {
        warn!(%warning, "Ignoring config layer");
    }
    debug!(sources = ?loaded.loaded_from(), "Configuration loaded");

    let mut worker = loaded.config.worker();
    if let Some(secs) = args.keepalive_seconds {
        worker.keepalive_seconds = secs;
    }
    if let Some(script) = args.script {
        worker.script_path = script;
    }

    let engine = match &worker.interpreter {
        Some(interpreter) => ScriptEngine::new().with_interpreter(interpreter),
        None => ScriptEngine::new(),
    };
    let settings = WorkerSettings {
        private_data_dir: private_data_dir.clone(),
        worker,
        exit_codes: loaded.config.exit_codes(),
    };
    let orchestrator =
        Orchestrator::new(Arc::new(engine), settings).with_cancel_token(cancel_on_signal());

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let outcome = orchestrator
        .run(&mut stdin.lock(), &mut stdout.lock())
        .await;
    info!(
        state = %outcome.state,
        exit_code = outcome.exit_code,
        dir = %private_data_dir.display(),
        "Worker finished"
    );

    if args.delete
        && let Err(e) = std::fs::remove_dir_all(&private_data_dir)
    {
        warn!(error = %e, dir = %private_data_dir.display(), "Failed to remove private data dir");
    }

    Ok(exit_code(outcome.exit_code))
}

fn cmd_worker_info() -> Result<ExitCode> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match CapacityProbe::new().probe() {
        Ok(info) => {
            serde_yaml::to_writer(&mut out, &info)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            let report = serde_json::json!({ "errors": [e.to_string()] });
            serde_yaml::to_writer(&mut out, &report)?;
            out.flush()?;
            Ok(ExitCode::FAILURE)
        }
    }
}

fn cmd_cleanup(args: &CleanupArgs) -> Result<ExitCode> {
    let grace = Duration::from_secs(args.grace_period);
    let now = SystemTime::now();
    let entries = glob::glob(&args.file_pattern)
        .with_context(|| format!("invalid file pattern {}", args.file_pattern))?;

    let mut removed = 0usize;
    for entry in entries {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable path");
                continue;
            }
        };
        if !is_stale(&path, now, grace) {
            continue;
        }
        if args.dry_run {
            println!("{}", path.display());
            removed += 1;
            continue;
        }
        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                println!("{}", path.display());
                removed += 1;
            }
            Err(e) => warn!(error = %e, path = %path.display(), "Failed to remove"),
        }
    }
    info!(removed, dry_run = args.dry_run, "Cleanup finished");
    Ok(ExitCode::SUCCESS)
}

/// A directory whose mtime is older than `grace`.
fn is_stale(path: &Path, now: SystemTime, grace: Duration) -> bool {
    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return false;
    };
    if !meta.is_dir() {
        return false;
    }
    meta.modified()
        .ok()
        .and_then(|mtime| now.duration_since(mtime).ok())
        .is_some_and(|age| age > grace)
}
