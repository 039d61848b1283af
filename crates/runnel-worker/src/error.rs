//! Error types for worker operations.

use runnel_config::ExitCodes;
use thiserror::Error;

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Error type for worker operations.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The inbound frame stream is malformed, short, or oversized.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The automation script faulted. Recovered into a failure event.
    #[error("script error: {0}")]
    Script(String),

    /// The automation engine cannot proceed.
    #[error("engine error: {0}")]
    Engine(String),

    /// The running phase exceeded its deadline.
    #[error("job timed out after {0}s")]
    Timeout(u64),

    /// The job was cancelled from outside.
    #[error("job canceled")]
    Canceled,

    /// The artifact journal could not be written.
    #[error("artifact error: {0}")]
    ArtifactIo(String),

    /// Host introspection failed.
    #[error("capacity probe failed: {0}")]
    Probe(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WorkerError {
    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a script error.
    pub fn script(msg: impl Into<String>) -> Self {
        Self::Script(msg.into())
    }

    /// Create an engine error.
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    /// Create an artifact error.
    pub fn artifact(msg: impl Into<String>) -> Self {
        Self::ArtifactIo(msg.into())
    }

    /// Create a probe error.
    pub fn probe(msg: impl Into<String>) -> Self {
        Self::Probe(msg.into())
    }

    /// Process exit code for this error when it ends the job.
    pub fn exit_code(&self, codes: &ExitCodes) -> i32 {
        match self {
            Self::Protocol(_) | Self::Json(_) => codes.protocol_error,
            Self::ArtifactIo(_) => codes.artifact_error,
            Self::Timeout(_) => codes.timeout,
            Self::Canceled => codes.canceled,
            Self::Script(_) | Self::Engine(_) | Self::Probe(_) | Self::Io(_) => codes.engine_error,
        }
    }

    /// Whether this error should be surfaced before any job state exists.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}
