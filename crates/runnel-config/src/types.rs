//! Configuration types mapping to the TOML schema.
//!
//! ```toml
//! [worker]
//! script_path = "/opt/runnel/main"
//! keepalive_seconds = 0
//! timeout_seconds = 3600
//!
//! [exit_codes]
//! timeout = 254
//! canceled = 130
//!
//! [logging]
//! dir = "/var/log/runnel"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Default location of the automation script baked into the execution image.
pub const DEFAULT_SCRIPT_PATH: &str = "/opt/runnel/main";

/// Default capacity of the single-writer notification queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default time the engine gets to wind down after a cancel signal.
pub const DEFAULT_DRAIN_GRACE_SECS: u64 = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g. a job-local
/// override carrying only `[exit_codes]`) can be loaded and merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnelConfig {
    /// Worker defaults.
    pub worker: Option<WorkerConfig>,

    /// Process exit-code table.
    pub exit_codes: Option<ExitCodes>,

    /// Log file settings.
    pub logging: Option<LoggingConfig>,
}

impl RunnelConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> crate::Result<Self> {
        let config: RunnelConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: RunnelConfig) {
        if other.worker.is_some() {
            self.worker = other.worker;
        }

        if other.exit_codes.is_some() {
            self.exit_codes = other.exit_codes;
        }

        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    /// Worker section, or defaults when absent.
    pub fn worker(&self) -> WorkerConfig {
        self.worker.clone().unwrap_or_default()
    }

    /// Exit-code table, or defaults when absent.
    pub fn exit_codes(&self) -> ExitCodes {
        self.exit_codes.unwrap_or_default()
    }

    /// Logging section, or defaults when absent.
    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    fn validate(&self) -> crate::Result<()> {
        if let Some(ref worker) = self.worker
            && worker.event_queue_capacity == 0
        {
            return Err(ConfigError::InvalidValue {
                field: "worker.event_queue_capacity".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker
// ─────────────────────────────────────────────────────────────────────────────

/// `[worker]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Automation script executed for every job.
    pub script_path: PathBuf,
    /// Interpreter the script is passed to; unset runs it directly.
    pub interpreter: Option<PathBuf>,
    /// Interval between `running` heartbeats; 0 disables them.
    pub keepalive_seconds: u64,
    /// Deadline for the running phase.
    pub timeout_seconds: Option<u64>,
    /// Bound on queued engine notifications awaiting translation.
    pub event_queue_capacity: usize,
    /// How long a cancelled engine may keep producing before it is aborted.
    pub drain_grace_seconds: u64,
    /// Rendering verbosity; 0 renders one-line status annotations.
    pub verbosity: u8,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            script_path: PathBuf::from(DEFAULT_SCRIPT_PATH),
            interpreter: None,
            keepalive_seconds: 0,
            timeout_seconds: None,
            event_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            drain_grace_seconds: DEFAULT_DRAIN_GRACE_SECS,
            verbosity: 0,
        }
    }
}

impl WorkerConfig {
    /// Keepalive interval, if enabled.
    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_seconds > 0).then(|| Duration::from_secs(self.keepalive_seconds))
    }

    /// Running-phase deadline, if configured.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Grace period for a cancelled engine.
    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_seconds)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Exit codes
// ─────────────────────────────────────────────────────────────────────────────

/// `[exit_codes]` section: the process exit code for each terminal outcome.
///
/// A successful run exits 0 and a non-zero engine return code passes through
/// unchanged; everything else is looked up here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitCodes {
    /// Engine returned 0 but hosts failed or were unreachable.
    pub failures: i32,
    /// The engine could not proceed.
    pub engine_error: i32,
    /// Malformed inbound stream.
    pub protocol_error: i32,
    /// The artifact journal could not be written.
    pub artifact_error: i32,
    /// The running phase exceeded its deadline.
    pub timeout: i32,
    /// The job was cancelled from outside.
    pub canceled: i32,
}

impl Default for ExitCodes {
    fn default() -> Self {
        Self {
            failures: 2,
            engine_error: 1,
            protocol_error: 3,
            artifact_error: 4,
            timeout: 254,
            canceled: 130,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging
// ─────────────────────────────────────────────────────────────────────────────

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for rolling log files. Defaults to `<config dir>/logs`.
    pub dir: Option<PathBuf>,
    /// File name prefix for the rolling appender.
    pub file_prefix: String,
    /// Write the file log as JSON lines.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            file_prefix: "runnel.log".to_string(),
            json: true,
        }
    }
}
