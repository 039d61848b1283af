//! Native execution notifications produced by the automation engine.
//!
//! The engine speaks a small JSON vocabulary tagged by `event`. Parsing is
//! total: anything that does not fit a known shape becomes
//! [`Notification::Unrecognized`] so the translator can still record it.

use serde::Deserialize;
use serde_json::{Map, Value};

/// Play name used when the engine does not name one.
pub const DEFAULT_PLAY: &str = "runnel";

/// Host used for notifications that are not tied to an inventory host.
pub const LOCALHOST: &str = "localhost";

/// Identifies the (host, play, task) a notification refers to.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRef {
    pub host: String,
    pub module: String,
    pub play: Option<String>,
    pub task: Option<String>,
}

impl TaskRef {
    pub fn new(host: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            module: module.into(),
            play: None,
            task: None,
        }
    }

    /// Display name of the task, falling back to the module name.
    pub fn task_name(&self) -> &str {
        self.task.as_deref().unwrap_or(&self.module)
    }

    /// Display name of the play, falling back to [`DEFAULT_PLAY`].
    pub fn play_name(&self) -> &str {
        self.play.as_deref().unwrap_or(DEFAULT_PLAY)
    }
}

/// Result payload carried by success and failure notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub target: TaskRef,
    pub changed: bool,
    pub output: Value,
    pub duration: Option<f64>,
}

/// One native notification, in engine emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    TaskStart(TaskRef),
    TaskSuccess(TaskOutcome),
    TaskFailure(TaskOutcome),
    TaskSkipped { target: TaskRef, msg: Option<String> },
    HostUnreachable { target: TaskRef, msg: Option<String> },
    RunComplete,
    /// Anything the engine said that has no dedicated mapping.
    Unrecognized { kind: String, payload: Value },
    /// A line the engine wrote to its error stream. Consumes no counter.
    Stderr(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawNotification {
    event: Option<String>,
    host: Option<String>,
    module: Option<String>,
    play: Option<String>,
    task: Option<String>,
    success: Option<bool>,
    changed: Option<bool>,
    output: Option<Value>,
    result: Option<Value>,
    duration: Option<f64>,
    msg: Option<String>,
}

impl Notification {
    /// Parse one line of engine output.
    ///
    /// Non-JSON text is kept verbatim as an unrecognized `raw` notification.
    pub fn from_line(line: &str) -> Self {
        match serde_json::from_str::<Value>(line) {
            Ok(value) => Self::from_value(value),
            Err(_) => Self::Unrecognized {
                kind: "raw".to_string(),
                payload: Value::String(line.to_string()),
            },
        }
    }

    /// Interpret a decoded JSON value.
    pub fn from_value(value: Value) -> Self {
        let Some(kind) = value.get("event").and_then(Value::as_str).map(str::to_string) else {
            return Self::Unrecognized {
                kind: "unknown".to_string(),
                payload: value,
            };
        };

        let raw: RawNotification = match serde_json::from_value(value.clone()) {
            Ok(raw) => raw,
            Err(_) => return Self::Unrecognized { kind, payload: value },
        };

        if kind == "run_complete" {
            return Self::RunComplete;
        }

        let Some(host) = raw.host.clone() else {
            return Self::Unrecognized { kind, payload: value };
        };
        let target = TaskRef {
            host,
            module: raw.module.clone().unwrap_or_else(|| "unknown".to_string()),
            play: raw.play.clone(),
            task: raw.task.clone(),
        };

        match kind.as_str() {
            "module_start" => Self::TaskStart(target),
            "module_complete" => {
                let success = raw.success.unwrap_or(false);
                let outcome = TaskOutcome {
                    target,
                    changed: raw.changed.unwrap_or(false),
                    output: result_payload(raw.output, raw.result),
                    duration: raw.duration,
                };
                if success {
                    Self::TaskSuccess(outcome)
                } else {
                    Self::TaskFailure(outcome)
                }
            }
            "module_skipped" => Self::TaskSkipped {
                target,
                msg: raw.msg,
            },
            "host_unreachable" => Self::HostUnreachable {
                target,
                msg: raw.msg,
            },
            _ => Self::Unrecognized { kind, payload: value },
        }
    }

    /// Build a failure outcome carrying only a message.
    pub fn failure(target: TaskRef, msg: impl Into<String>) -> Self {
        let mut output = Map::new();
        output.insert("msg".to_string(), Value::String(msg.into()));
        Self::TaskFailure(TaskOutcome {
            target,
            changed: false,
            output: Value::Object(output),
            duration: None,
        })
    }

    /// Host and task this notification refers to, if any.
    pub fn target(&self) -> Option<&TaskRef> {
        match self {
            Self::TaskStart(target) => Some(target),
            Self::TaskSuccess(outcome) | Self::TaskFailure(outcome) => Some(&outcome.target),
            Self::TaskSkipped { target, .. } | Self::HostUnreachable { target, .. } => Some(target),
            Self::RunComplete | Self::Unrecognized { .. } | Self::Stderr(_) => None,
        }
    }

    /// Whether this notification closes a (host, task) pair.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::TaskSuccess(_)
                | Self::TaskFailure(_)
                | Self::TaskSkipped { .. }
                | Self::HostUnreachable { .. }
        )
    }
}

/// `output` wins; `result` is accepted for older scripts. Empty or null
/// payloads normalise to an empty object.
fn result_payload(output: Option<Value>, result: Option<Value>) -> Value {
    let present = |v: &Value| match v {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        _ => true,
    };
    output
        .filter(present)
        .or(result.filter(present))
        .unwrap_or_else(|| Value::Object(Map::new()))
}
