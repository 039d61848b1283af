//! Playbook command - run a script locally and print its events.
//!
//! Each event is written as an invisible ANSI-encoded header, the visible
//! rendered text, and an invisible footer carrying the event uuid, so a
//! terminal shows plain output while a reader of the raw stream can recover
//! every event.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use runnel_config::DEFAULT_QUEUE_CAPACITY;
use runnel_worker::translator::ANSI_CHUNK_WIDTH;
use runnel_worker::{
    AutomationEngine, EventTranslator, ExecutionEvent, Invocation, Notification,
    NotificationSink, ScriptEngine, effective_rc, encode_event_ansi,
};
use serde_json::{Map, Value, json};
use tracing::{error, warn};

use super::{Context, cancel_on_signal, exit_code};

/// Identifier used for local runs.
const LOCAL_IDENT: &str = "local";

/// Arguments for the playbook command.
#[derive(Args, Debug)]
pub struct PlaybookArgs {
    /// Script to run
    pub script: PathBuf,

    /// Inventory directory handed to the script
    #[arg(short, long)]
    pub inventory: Option<PathBuf>,

    /// Extra variables: `@file`, a JSON object, or `key=value` pairs
    #[arg(short = 'e', long = "extra-vars")]
    pub extra_vars: Vec<String>,

    /// Increase rendering verbosity
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Interpreter to run the script with
    #[arg(long)]
    pub interpreter: Option<PathBuf>,
}

/// Run the playbook command.
pub async fn run(args: PlaybookArgs, _ctx: &Context) -> Result<ExitCode> {
    let mut extravars = Map::new();
    for spec in &args.extra_vars {
        extravars.extend(parse_extra_vars(spec)?);
    }

    let codes = runnel_config::load_config(None)
        .map(|loaded| loaded.config.exit_codes())
        .unwrap_or_default();

    let invocation = Invocation {
        ident: LOCAL_IDENT.to_string(),
        script: args.script.clone(),
        working_dir: std::env::current_dir().context("cannot determine working directory")?,
        inventory: args.inventory.clone(),
        extravars,
        verbosity: args.verbosity,
    };

    let engine = match args.interpreter {
        Some(interpreter) => ScriptEngine::new().with_interpreter(interpreter),
        None => ScriptEngine::new(),
    };
    let engine: Arc<dyn AutomationEngine> = Arc::new(engine);
    let (sink, mut rx) = NotificationSink::channel(DEFAULT_QUEUE_CAPACITY);
    let cancel = cancel_on_signal();
    let task = tokio::spawn({
        let engine = Arc::clone(&engine);
        let cancel = cancel.clone();
        async move { engine.run(invocation, sink, cancel).await }
    });

    let mut translator = EventTranslator::new(LOCAL_IDENT, args.verbosity);
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    while let Some(notification) = rx.recv().await {
        if let Notification::Stderr(line) = &notification {
            eprintln!("{line}");
            continue;
        }
        for event in translator.translate(notification) {
            write_event(&mut out, &event)?;
        }
    }

    let rc = match task.await {
        Ok(Ok(rc)) => rc,
        Ok(Err(e)) if cancel.is_cancelled() => {
            warn!(error = %e, "Run cancelled");
            codes.canceled
        }
        Ok(Err(e)) => {
            error!(error = %e, "Engine failed");
            codes.engine_error
        }
        Err(e) => {
            error!(error = %e, "Engine task failed");
            codes.engine_error
        }
    };
    for event in translator.finish() {
        write_event(&mut out, &event)?;
    }
    out.flush()?;

    Ok(exit_code(effective_rc(rc, translator.has_failures(), &codes)))
}

/// Header, visible text, footer.
fn write_event<W: Write>(out: &mut W, event: &ExecutionEvent) -> Result<()> {
    out.write_all(encode_event_ansi(&event.header(), ANSI_CHUNK_WIDTH).as_bytes())?;
    if !event.stdout.is_empty() {
        out.write_all(event.stdout.as_bytes())?;
        out.write_all(b"\n")?;
    }
    let footer = json!({ "uuid": event.uuid.to_string() });
    out.write_all(encode_event_ansi(&footer, ANSI_CHUNK_WIDTH).as_bytes())?;
    out.flush()?;
    Ok(())
}

/// One `-e` argument as a variable map.
fn parse_extra_vars(spec: &str) -> Result<Map<String, Value>> {
    if let Some(path) = spec.strip_prefix('@') {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("cannot read {path}"))?;
        // JSON files parse as YAML too.
        let value: Value =
            serde_yaml::from_str(&contents).with_context(|| format!("cannot parse {path}"))?;
        return match value {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(Map::new()),
            _ => bail!("{path} must contain a mapping"),
        };
    }

    let trimmed = spec.trim_start();
    if trimmed.starts_with('{') {
        return match serde_json::from_str(trimmed)
            .with_context(|| format!("invalid JSON extra vars: {spec}"))?
        {
            Value::Object(map) => Ok(map),
            _ => bail!("extra vars must be a JSON object"),
        };
    }

    let mut vars = Map::new();
    for pair in spec.split_whitespace() {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("expected key=value, got {pair:?}");
        };
        vars.insert(key.to_string(), Value::String(value.to_string()));
    }
    Ok(vars)
}
