//! Translated execution events: the schema-stable unit that is journaled and
//! streamed to the controller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Output event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PlaybookOnStart,
    PlaybookOnPlayStart,
    PlaybookOnTaskStart,
    RunnerOnStart,
    RunnerOnOk,
    RunnerOnFailed,
    RunnerOnSkipped,
    RunnerOnUnreachable,
    PlaybookOnStats,
    /// Fallback for engine output with no dedicated mapping.
    Verbose,
}

impl EventKind {
    /// Wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlaybookOnStart => "playbook_on_start",
            Self::PlaybookOnPlayStart => "playbook_on_play_start",
            Self::PlaybookOnTaskStart => "playbook_on_task_start",
            Self::RunnerOnStart => "runner_on_start",
            Self::RunnerOnOk => "runner_on_ok",
            Self::RunnerOnFailed => "runner_on_failed",
            Self::RunnerOnSkipped => "runner_on_skipped",
            Self::RunnerOnUnreachable => "runner_on_unreachable",
            Self::PlaybookOnStats => "playbook_on_stats",
            Self::Verbose => "verbose",
        }
    }

    /// Terminal per-host result kinds.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunnerOnOk | Self::RunnerOnFailed | Self::RunnerOnSkipped | Self::RunnerOnUnreachable
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single translated event. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub uuid: Uuid,
    pub counter: u64,
    pub created: DateTime<Utc>,
    pub runner_ident: String,
    pub event: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_uuid: Option<Uuid>,
    pub event_data: Map<String, Value>,
    pub stdout: String,
    pub start_line: u64,
    pub end_line: u64,
}

impl ExecutionEvent {
    /// Host named in `event_data`, if any.
    pub fn host(&self) -> Option<&str> {
        self.event_data.get("host").and_then(Value::as_str)
    }

    /// Whether `event_data.changed` is set.
    pub fn changed(&self) -> bool {
        self.event_data
            .get("changed")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// File name under `job_events/`.
    pub fn file_name(&self) -> String {
        format!("{:06}-{}.json", self.counter, self.uuid)
    }

    /// Header used for ANSI-embedded transport: everything except the
    /// rendered text and line range.
    pub fn header(&self) -> Value {
        let mut header = Map::new();
        header.insert("uuid".into(), Value::String(self.uuid.to_string()));
        header.insert("counter".into(), Value::from(self.counter));
        header.insert("created".into(), Value::String(self.created.to_rfc3339()));
        header.insert("runner_ident".into(), Value::String(self.runner_ident.clone()));
        header.insert("event".into(), Value::String(self.event.as_str().to_string()));
        if let Some(parent) = self.parent_uuid {
            header.insert("parent_uuid".into(), Value::String(parent.to_string()));
        }
        header.insert("event_data".into(), Value::Object(self.event_data.clone()));
        Value::Object(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ExecutionEvent {
        let mut data = Map::new();
        data.insert("host".into(), json!("web1"));
        data.insert("changed".into(), json!(true));
        ExecutionEvent {
            uuid: Uuid::new_v4(),
            counter: 7,
            created: Utc::now(),
            runner_ident: "42".into(),
            event: EventKind::RunnerOnOk,
            parent_uuid: None,
            event_data: data,
            stdout: "changed: [web1]".into(),
            start_line: 3,
            end_line: 4,
        }
    }

    #[test]
    fn test_kind_wire_names_match_serde() {
        for kind in [
            EventKind::PlaybookOnStart,
            EventKind::PlaybookOnPlayStart,
            EventKind::PlaybookOnTaskStart,
            EventKind::RunnerOnStart,
            EventKind::RunnerOnOk,
            EventKind::RunnerOnFailed,
            EventKind::RunnerOnSkipped,
            EventKind::RunnerOnUnreachable,
            EventKind::PlaybookOnStats,
            EventKind::Verbose,
        ] {
            assert_eq!(serde_json::to_value(kind).unwrap(), json!(kind.as_str()));
        }
    }

    #[test]
    fn test_serialized_shape() {
        let event = sample();
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "runner_on_ok");
        assert_eq!(value["counter"], 7);
        assert!(value.get("parent_uuid").is_none());
        assert_eq!(value["event_data"]["host"], "web1");
    }

    #[test]
    fn test_file_name_is_padded() {
        let event = sample();
        assert!(event.file_name().starts_with("000007-"));
        assert!(event.file_name().ends_with(".json"));
    }

    #[test]
    fn test_accessors() {
        let event = sample();
        assert_eq!(event.host(), Some("web1"));
        assert!(event.changed());
        assert!(event.header().get("stdout").is_none());
    }
}
