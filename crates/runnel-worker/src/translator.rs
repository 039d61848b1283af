//! Event translation and hierarchy building.
//!
//! One [`EventTranslator`] exists per job. It consumes native notifications
//! strictly in queue order and produces [`ExecutionEvent`]s, synthesising the
//! job, play and task scope events that the engine never emits itself.

use std::collections::{HashMap, HashSet};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use console::Style;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::{EventKind, ExecutionEvent};
use crate::notification::{Notification, TaskOutcome, TaskRef};
use crate::stats::StatsAggregator;

/// Playbook name reported on the job scope event.
pub const JOB_PLAYBOOK_NAME: &str = "runnel_script";

/// Width play/task/recap banners are padded to.
const BANNER_WIDTH: usize = 76;

/// Width of base64 chunks in ANSI-encoded event headers.
pub const ANSI_CHUNK_WIDTH: usize = 78;

// ─────────────────────────────────────────────────────────────────────────────
// Job context
// ─────────────────────────────────────────────────────────────────────────────

/// Lookup table from emitted event uuid to its counter.
///
/// Entries are added once, when the event is emitted, and never change.
#[derive(Debug, Default)]
pub struct HierarchyIndex {
    counters: HashMap<Uuid, u64>,
}

impl HierarchyIndex {
    fn insert(&mut self, uuid: Uuid, counter: u64) {
        self.counters.entry(uuid).or_insert(counter);
    }

    /// Counter of an emitted event.
    pub fn counter_of(&self, uuid: &Uuid) -> Option<u64> {
        self.counters.get(uuid).copied()
    }

    /// `parent` if it names an emitted event older than `counter`.
    pub fn resolve_parent(&self, parent: Uuid, counter: u64) -> Option<Uuid> {
        match self.counter_of(&parent) {
            Some(c) if c < counter => Some(parent),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

/// Per-job sequencing state: counters, line offsets, and the parent index.
#[derive(Debug)]
pub struct JobContext {
    ident: String,
    next_counter: u64,
    line: u64,
    last_created: Option<DateTime<Utc>>,
    index: HierarchyIndex,
}

impl JobContext {
    pub fn new(ident: impl Into<String>) -> Self {
        Self {
            ident: ident.into(),
            next_counter: 1,
            line: 0,
            last_created: None,
            index: HierarchyIndex::default(),
        }
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    /// Number of events emitted so far.
    pub fn emitted(&self) -> u64 {
        self.next_counter - 1
    }

    pub fn index(&self) -> &HierarchyIndex {
        &self.index
    }

    fn build(
        &mut self,
        uuid: Uuid,
        event: EventKind,
        parent: Option<Uuid>,
        event_data: Map<String, Value>,
        stdout: String,
    ) -> ExecutionEvent {
        let counter = self.next_counter;
        self.next_counter += 1;

        let parent_uuid = parent.and_then(|p| {
            let resolved = self.index.resolve_parent(p, counter);
            if resolved.is_none() {
                warn!(%p, counter, "Dropping parent link to an unknown event");
            }
            resolved
        });

        let now = Utc::now();
        let created = match self.last_created {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_created = Some(created);

        let lines = line_count(&stdout);
        let start_line = self.line;
        self.line += lines;

        self.index.insert(uuid, counter);

        ExecutionEvent {
            uuid,
            counter,
            created,
            runner_ident: self.ident.clone(),
            event,
            parent_uuid,
            event_data,
            stdout,
            start_line,
            end_line: self.line,
        }
    }
}

/// Lines a rendered fragment occupies in the cumulative stdout artifact.
pub fn line_count(fragment: &str) -> u64 {
    if fragment.is_empty() {
        0
    } else {
        fragment.matches('\n').count() as u64 + 1
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Translator
// ─────────────────────────────────────────────────────────────────────────────

/// Latest task scope opened for a (play, task) pair.
#[derive(Debug)]
struct TaskScope {
    uuid: Uuid,
    /// Hosts with a terminal event in this scope.
    finished: HashSet<String>,
}

type TaskKey = (String, String);
type HostTaskKey = (String, String, String);

/// Translates native notifications into execution events.
#[derive(Debug)]
pub struct EventTranslator {
    ctx: JobContext,
    stats: StatsAggregator,
    verbosity: u8,
    job_scope: Option<Uuid>,
    plays: HashMap<String, Uuid>,
    tasks: HashMap<TaskKey, TaskScope>,
    /// Started, not yet finished: (host, play, task) to its task scope.
    started: HashMap<HostTaskKey, Uuid>,
    /// Most recently opened play or task scope.
    latest_scope: Option<Uuid>,
    summarized: bool,
}

impl EventTranslator {
    pub fn new(ident: impl Into<String>, verbosity: u8) -> Self {
        Self {
            ctx: JobContext::new(ident),
            stats: StatsAggregator::new(),
            verbosity,
            job_scope: None,
            plays: HashMap::new(),
            tasks: HashMap::new(),
            started: HashMap::new(),
            latest_scope: None,
            summarized: false,
        }
    }

    pub fn context(&self) -> &JobContext {
        &self.ctx
    }

    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    pub fn has_failures(&self) -> bool {
        self.stats.has_failures()
    }

    /// Whether the terminal stats event has been emitted.
    pub fn is_summarized(&self) -> bool {
        self.summarized
    }

    /// Translate one notification into zero or more events, in emission order.
    pub fn translate(&mut self, notification: Notification) -> Vec<ExecutionEvent> {
        let mut out = Vec::new();
        match notification {
            Notification::TaskStart(target) => {
                let key = host_task_key(&target);
                let parent = match self.started.get(&key).copied() {
                    Some(uuid) => uuid,
                    None => {
                        let uuid = self.open_task_scope(&target, &mut out);
                        self.started.insert(key, uuid);
                        uuid
                    }
                };
                self.stats.observe_host(&target.host);
                let data = runner_data(&target);
                out.push(self.ctx.build(
                    Uuid::new_v4(),
                    EventKind::RunnerOnStart,
                    Some(parent),
                    data,
                    String::new(),
                ));
            }
            Notification::TaskSuccess(outcome) => {
                self.terminal(EventKind::RunnerOnOk, outcome, &mut out);
            }
            Notification::TaskFailure(outcome) => {
                self.terminal(EventKind::RunnerOnFailed, outcome, &mut out);
            }
            Notification::TaskSkipped { target, msg } => {
                let outcome = message_outcome(target, msg);
                self.terminal(EventKind::RunnerOnSkipped, outcome, &mut out);
            }
            Notification::HostUnreachable { target, msg } => {
                let outcome = message_outcome(target, msg);
                self.terminal(EventKind::RunnerOnUnreachable, outcome, &mut out);
            }
            Notification::RunComplete => {
                if self.summarized {
                    debug!("Ignoring repeated run completion");
                } else {
                    self.summarize(&mut out);
                }
            }
            Notification::Unrecognized { kind, payload } => {
                warn!(kind = %kind, "Unrecognized engine notification");
                self.verbose(kind, payload, &mut out);
            }
            Notification::Stderr(_) => {}
        }
        out
    }

    /// Emit the stats event if the engine never reported completion.
    pub fn finish(&mut self) -> Vec<ExecutionEvent> {
        self.translate(Notification::RunComplete)
    }

    fn open_job_scope(&mut self, out: &mut Vec<ExecutionEvent>) -> Uuid {
        if let Some(uuid) = self.job_scope {
            return uuid;
        }
        let uuid = Uuid::new_v4();
        let mut data = Map::new();
        data.insert("playbook".into(), json!(JOB_PLAYBOOK_NAME));
        data.insert("uuid".into(), json!(uuid.to_string()));
        out.push(
            self.ctx
                .build(uuid, EventKind::PlaybookOnStart, None, data, String::new()),
        );
        self.job_scope = Some(uuid);
        uuid
    }

    fn open_play_scope(&mut self, name: &str, out: &mut Vec<ExecutionEvent>) -> Uuid {
        let job = self.open_job_scope(out);
        if let Some(uuid) = self.plays.get(name) {
            return *uuid;
        }

        let uuid = Uuid::new_v4();
        let mut data = Map::new();
        data.insert("playbook".into(), json!(JOB_PLAYBOOK_NAME));
        data.insert("play".into(), json!({"name": name, "id": uuid.to_string()}));
        let stdout = banner("PLAY", name);
        out.push(
            self.ctx
                .build(uuid, EventKind::PlaybookOnPlayStart, Some(job), data, stdout),
        );
        self.plays.insert(name.to_string(), uuid);
        self.latest_scope = Some(uuid);
        uuid
    }

    /// Task scope a new execution of `target` belongs to: the open scope for
    /// its (play, task) pair unless the host already finished there, else a
    /// fresh one. Opens ancestors as needed.
    fn open_task_scope(&mut self, target: &TaskRef, out: &mut Vec<ExecutionEvent>) -> Uuid {
        let play_name = target.play_name().to_string();
        let task_name = target.task_name().to_string();
        let play = self.open_play_scope(&play_name, out);

        let key = (play_name.clone(), task_name.clone());
        if let Some(task) = self.tasks.get(&key)
            && !task.finished.contains(&target.host)
        {
            return task.uuid;
        }

        let uuid = Uuid::new_v4();
        let mut data = Map::new();
        data.insert("task".into(), json!({"name": task_name, "id": uuid.to_string()}));
        data.insert("task_action".into(), json!(target.module));
        data.insert("play".into(), json!(play_name));
        let stdout = banner("TASK", &task_name);
        out.push(
            self.ctx
                .build(uuid, EventKind::PlaybookOnTaskStart, Some(play), data, stdout),
        );
        self.tasks.insert(
            key,
            TaskScope {
                uuid,
                finished: HashSet::new(),
            },
        );
        self.latest_scope = Some(uuid);
        uuid
    }

    fn terminal(&mut self, kind: EventKind, outcome: TaskOutcome, out: &mut Vec<ExecutionEvent>) {
        // Parented to the scope its start joined; synthesized when none was seen.
        let parent = match self.started.remove(&host_task_key(&outcome.target)) {
            Some(uuid) => uuid,
            None => self.open_task_scope(&outcome.target, out),
        };

        let mut data = runner_data(&outcome.target);
        data.insert("res".into(), outcome.output.clone());
        data.insert("changed".into(), json!(outcome.changed));
        if let Some(duration) = outcome.duration {
            data.insert("duration".into(), json!(duration));
        }
        let stdout = self.render_result(kind, &outcome);

        let event = self
            .ctx
            .build(Uuid::new_v4(), kind, Some(parent), data, stdout);
        self.stats.record(&event);
        let key = (
            outcome.target.play_name().to_string(),
            outcome.target.task_name().to_string(),
        );
        if let Some(task) = self.tasks.get_mut(&key)
            && task.uuid == parent
        {
            task.finished.insert(outcome.target.host.clone());
        }
        out.push(event);
    }

    fn summarize(&mut self, out: &mut Vec<ExecutionEvent>) {
        let job = self.open_job_scope(out);
        let summary = self.stats.transposed();
        let summary_value = serde_json::to_value(&summary).unwrap_or_else(|_| json!({}));

        let mut data = Map::new();
        data.insert("playbook".into(), json!(JOB_PLAYBOOK_NAME));
        data.insert("stats".into(), summary_value.clone());
        // Controllers that read buckets at the top level see the same numbers.
        if let Value::Object(buckets) = summary_value {
            data.extend(buckets);
        }

        let stdout = self.render_recap();
        out.push(
            self.ctx
                .build(Uuid::new_v4(), EventKind::PlaybookOnStats, Some(job), data, stdout),
        );
        self.summarized = true;
    }

    fn verbose(&mut self, kind: String, payload: Value, out: &mut Vec<ExecutionEvent>) {
        let parent = self.latest_scope.or(self.job_scope);

        let stdout = match &payload {
            Value::String(text) => text.clone(),
            other if self.verbosity > 0 => other.to_string(),
            _ => String::new(),
        };

        let mut data = Map::new();
        data.insert("original_event".into(), json!(kind));
        data.insert("payload".into(), payload);
        out.push(
            self.ctx
                .build(Uuid::new_v4(), EventKind::Verbose, parent, data, stdout),
        );
    }

    // ── Rendering ───────────────────────────────────────────────────────────

    fn render_result(&self, kind: EventKind, outcome: &TaskOutcome) -> String {
        let host = &outcome.target.host;
        let res = &outcome.output;
        match kind {
            EventKind::RunnerOnOk => {
                let (label, style) = if outcome.changed {
                    ("changed", Style::new().yellow())
                } else {
                    ("ok", Style::new().green())
                };
                let mut line = format!("{label}: [{host}]");
                if self.verbosity > 0 {
                    line.push_str(" => ");
                    line.push_str(&pretty(res));
                }
                paint(style, line)
            }
            EventKind::RunnerOnFailed => {
                let mut line = format!("fatal: [{host}]: FAILED!");
                if self.verbosity > 0 {
                    line.push_str(" => ");
                    line.push_str(&pretty(res));
                } else if let Some(msg) = res.get("msg") {
                    line.push_str(" => ");
                    line.push_str(&json!({ "msg": msg }).to_string());
                }
                paint(Style::new().red(), line)
            }
            EventKind::RunnerOnUnreachable => {
                let mut line = format!("fatal: [{host}]: UNREACHABLE!");
                if let Some(msg) = res.get("msg") {
                    line.push_str(" => ");
                    line.push_str(&json!({ "msg": msg }).to_string());
                }
                paint(Style::new().red(), line)
            }
            EventKind::RunnerOnSkipped => paint(Style::new().cyan(), format!("skipping: [{host}]")),
            _ => String::new(),
        }
    }

    fn render_recap(&self) -> String {
        let mut lines = vec![format!("\nPLAY RECAP {}", "*".repeat(BANNER_WIDTH - 11))];
        for (host, stat) in self.stats.hosts() {
            lines.push(format!(
                "{host:<26}: ok={:<4} changed={:<4} unreachable={:<4} failed={:<4} skipped={:<4}",
                stat.ok, stat.changed, stat.dark, stat.failures, stat.skipped
            ));
        }
        lines.join("\n")
    }
}

fn host_task_key(target: &TaskRef) -> HostTaskKey {
    (
        target.host.clone(),
        target.play_name().to_string(),
        target.task_name().to_string(),
    )
}

fn runner_data(target: &TaskRef) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("host".into(), json!(target.host));
    data.insert("task".into(), json!(target.task_name()));
    data.insert("task_action".into(), json!(target.module));
    data.insert("play".into(), json!(target.play_name()));
    data
}

fn message_outcome(target: TaskRef, msg: Option<String>) -> TaskOutcome {
    let output = match msg {
        Some(msg) => json!({ "msg": msg }),
        None => json!({}),
    };
    TaskOutcome {
        target,
        changed: false,
        output,
        duration: None,
    }
}

fn banner(label: &str, name: &str) -> String {
    let header = format!("\n{label} [{name}] ");
    let pad = BANNER_WIDTH.saturating_sub(header.chars().count());
    format!("{header}{}", "*".repeat(pad))
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn paint(style: Style, text: String) -> String {
    style.force_styling(true).apply_to(text).to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// ANSI transport encoding
// ─────────────────────────────────────────────────────────────────────────────

/// Encode an event header so it can ride invisibly inside terminal output.
///
/// The JSON is base64'd and split into `max_width` chunks; each chunk is
/// followed by a cursor-back sequence of its own length, and the whole run is
/// bracketed by erase-line sequences.
pub fn encode_event_ansi(header: &Value, max_width: usize) -> String {
    let encoded = STANDARD.encode(header.to_string());
    let mut out = String::from("\x1b[K");
    let width = max_width.max(1);
    for chunk in encoded.as_bytes().chunks(width) {
        // base64 output is ASCII.
        let chunk = String::from_utf8_lossy(chunk);
        out.push_str(&chunk);
        out.push_str(&format!("\x1b[{}D", chunk.len()));
    }
    out.push_str("\x1b[K");
    out
}
