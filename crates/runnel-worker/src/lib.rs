//! Streaming job worker compatible with the ansible-runner worker protocol.
//!
//! A job arrives on stdin as newline-delimited JSON control frames (kwargs,
//! an optional base64 zip of the private data directory, eof). The worker
//! runs the automation engine, turns its notifications into runner-style
//! execution events, journals every event to disk, and streams status
//! frames, events, and a final artifact archive back on stdout.
//!
//! # Architecture
//!
//! ```text
//! stdin ──► codec::read_input ──► Job::resolve
//!                                     │
//!                     ┌───────────────┴──────────────┐
//!                     ▼                              │
//!          AutomationEngine (task)                   │
//!                     │ Notification                 │
//!                     ▼                              ▼
//!          bounded queue ──► EventTranslator ──► Journal ──► FrameWriter ──► stdout
//!                                 │
//!                          StatsAggregator
//! ```
//!
//! The [`Orchestrator`] is the single consumer of the queue; it alone owns
//! the translator, the journal, and the output stream.

pub mod archive;
pub mod capacity;
pub mod codec;
pub mod engine;
pub mod error;
pub mod event;
pub mod job;
pub mod journal;
pub mod notification;
pub mod orchestrator;
pub mod stats;
pub mod translator;

pub use capacity::{CapacityProbe, WorkerInfo};
pub use codec::{ControlFrame, FrameWriter, InboundJob, read_input};
pub use engine::{AutomationEngine, Invocation, NotificationSink, ScriptEngine};
pub use error::{Result, WorkerError};
pub use event::{EventKind, ExecutionEvent};
pub use job::Job;
pub use journal::{CommandRecord, Journal};
pub use notification::{Notification, TaskOutcome, TaskRef};
pub use orchestrator::{JobOutcome, JobState, Orchestrator, WorkerSettings, effective_rc};
pub use stats::{HostStat, StatsAggregator, TransposedStats};
pub use translator::{EventTranslator, HierarchyIndex, JobContext, encode_event_ansi};
