//! Runnel - streaming automation worker
//!
//! Main entry point for the runnel CLI.

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use runnel_config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{playbook, worker};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Runnel - streaming automation worker
#[derive(Parser)]
#[command(name = "runnel")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose logging on stderr
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one job from the frame stream on stdin
    Worker(worker::WorkerArgs),

    /// Run a script locally and print its events
    Playbook(playbook::PlaybookArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Logging settings come from the user config only; job-local layers are
    // read later by the worker.
    let (logging, warnings) = match runnel_config::load_config(None) {
        Ok(loaded) => (loaded.config.logging(), loaded.warnings),
        Err(e) => (LoggingConfig::default(), vec![e.to_string()]),
    };
    let _guard = init_tracing(cli.verbose, &logging);
    for warning in warnings {
        tracing::warn!(%warning, "Ignoring config layer");
    }

    let ctx = commands::Context {
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Worker(args) => worker::run(args, &ctx).await,
        Commands::Playbook(args) => playbook::run(args, &ctx).await,
    }
}

/// Console (human-readable, stderr) + rolling file log.
///
/// stdout carries the frame protocol, so nothing here may write to it.
fn init_tracing(verbose: bool, logging: &LoggingConfig) -> Option<WorkerGuard> {
    use tracing_subscriber::prelude::*;

    let filter = if verbose {
        "runnel=debug,runnel_worker=debug,runnel_config=debug,info"
    } else {
        "runnel=info,runnel_worker=info,runnel_config=info,warn"
    };
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let log_dir = logging
        .dir
        .clone()
        .or_else(|| runnel_config::user_config_dir().map(|d| d.join("logs")));
    let appender = log_dir.and_then(|dir| {
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(&logging.file_prefix)
            .build(&dir)
            .ok()
    });
    let (writer, guard) = match appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };
    let file_filter = || EnvFilter::new("runnel=trace,runnel_worker=trace,runnel_config=trace,info");

    let json_layer = writer.clone().filter(|_| logging.json).map(|writer| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_filter(file_filter())
    });
    let text_layer = writer.filter(|_| !logging.json).map(|writer| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .with_filter(file_filter())
    });

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .with(json_layer)
        .with(text_layer)
        .init();

    guard
}
