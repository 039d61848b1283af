//! Job orchestration: decode, run the engine, translate, journal, stream.
//!
//! ```text
//! Unstarted → Starting → Running → Successful | Failed | TimedOut | Canceled
//!                  └────────────→ Failed
//! ```
//!
//! All notifications flow through one bounded queue with a single consumer,
//! which owns the translator, the journal, and the output stream.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use runnel_config::{ExitCodes, WorkerConfig};
use serde_json::{Map, Value, json};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{self, FrameWriter};
use crate::engine::{AutomationEngine, NotificationSink};
use crate::job::Job;
use crate::journal::{CommandRecord, Journal};
use crate::notification::Notification;
use crate::translator::EventTranslator;
use crate::{Result, WorkerError};

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Unstarted,
    Starting,
    Running,
    Successful,
    Failed,
    TimedOut,
    Canceled,
}

impl JobState {
    /// Status string used in frames and the `status` artifact.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Successful => "successful",
            Self::Failed => "failed",
            Self::TimedOut => "timeout",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Successful | Self::Failed | Self::TimedOut | Self::Canceled
        )
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(self, next: JobState) -> Result<JobState> {
        let allowed = match (self, next) {
            (Self::Unstarted, Self::Starting | Self::Failed) => true,
            (Self::Starting, Self::Running | Self::Failed) => true,
            (Self::Running, next) => next.is_terminal(),
            _ => false,
        };
        if allowed {
            Ok(next)
        } else {
            Err(WorkerError::engine(format!(
                "invalid job state transition {} -> {}",
                self.as_str(),
                next.as_str()
            )))
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Settings & outcome
// ─────────────────────────────────────────────────────────────────────────────

/// Process-level settings for one worker invocation.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub private_data_dir: PathBuf,
    pub worker: WorkerConfig,
    pub exit_codes: ExitCodes,
}

impl WorkerSettings {
    pub fn new(private_data_dir: impl Into<PathBuf>) -> Self {
        Self {
            private_data_dir: private_data_dir.into(),
            worker: WorkerConfig::default(),
            exit_codes: ExitCodes::default(),
        }
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub state: JobState,
    /// Value written to the `rc` artifact.
    pub rc: i32,
    /// Process exit code.
    pub exit_code: i32,
    pub has_failures: bool,
    pub events: u64,
    pub error: Option<String>,
}

/// Why the running phase stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Deadline,
    Cancel,
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────────────────────────

/// Drives one job from inbound frames to the final `eof`.
pub struct Orchestrator {
    engine: Arc<dyn AutomationEngine>,
    settings: WorkerSettings,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(engine: Arc<dyn AutomationEngine>, settings: WorkerSettings) -> Self {
        Self {
            engine,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned token to cancel the job (e.g. on SIGTERM).
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run a job: read frames from `input`, write frames to `output`.
    pub async fn run<R: BufRead, W: Write>(&self, input: &mut R, output: &mut W) -> JobOutcome {
        let codes = self.settings.exit_codes;
        let mut writer = FrameWriter::new(output);
        let pdd = self.settings.private_data_dir.clone();

        let inbound = match codec::read_input(input, &pdd) {
            Ok(inbound) => inbound,
            Err(e) => {
                error!(error = %e, "Rejecting job input");
                return reject(&mut writer, e, &codes);
            }
        };

        let state = JobState::Unstarted;
        let state = match state.transition(JobState::Starting) {
            Ok(s) => s,
            Err(e) => return reject(&mut writer, e, &codes),
        };
        emit_status(&mut writer, state.as_str(), None);

        let job = Job::resolve(&pdd, &inbound.kwargs, &self.settings.worker);
        info!(ident = %job.ident, script = %job.script.display(), "Job starting");

        let mut journal = match Journal::create(&pdd, &job.ident) {
            Ok(journal) => journal,
            Err(e) => {
                error!(error = %e, "Cannot create artifact journal");
                return reject(&mut writer, e, &codes);
            }
        };

        let invocation = job.invocation();
        let record = CommandRecord {
            command: self.engine.argv(&invocation),
            cwd: pdd.display().to_string(),
            env: Default::default(),
        };
        let mut translator = EventTranslator::new(job.ident.clone(), job.verbosity);

        let (state, run) = match journal
            .write_command(&record)
            .and_then(|()| state.transition(JobState::Running))
        {
            Ok(state) => {
                emit_status(&mut writer, state.as_str(), None);
                let run = self
                    .running(&job, &mut translator, &mut journal, &mut writer)
                    .await;
                (state, run)
            }
            Err(e) => (state, RunResult::Failed(e)),
        };

        self.finish(state, run, &mut translator, &mut journal, &mut writer)
    }

    /// The `Running` phase: spawn the engine and consume its queue.
    async fn running<W: Write>(
        &self,
        job: &Job,
        translator: &mut EventTranslator,
        journal: &mut Journal,
        writer: &mut FrameWriter<W>,
    ) -> RunResult {
        let (sink, mut rx) = NotificationSink::channel(self.settings.worker.event_queue_capacity);
        let engine_cancel = self.cancel.child_token();
        let engine_task = spawn_engine(
            Arc::clone(&self.engine),
            job,
            sink,
            engine_cancel.clone(),
        );

        let mut keepalive = job.keepalive.map(keepalive_interval);
        let deadline = job.timeout.map(|t| Instant::now() + t);
        let grace = self.settings.worker.drain_grace();
        let mut interrupt: Option<Interrupt> = None;
        let mut abort_at: Option<Instant> = None;
        let mut fatal: Option<WorkerError> = None;

        // Control signals come first so a busy queue cannot starve the
        // deadline; the queue keeps draining after they fire.
        loop {
            tokio::select! {
                biased;
                _ = sleep_until(deadline), if interrupt.is_none() && deadline.is_some() => {
                    warn!(ident = %job.ident, "Job deadline reached, cancelling engine");
                    interrupt = Some(Interrupt::Deadline);
                    engine_cancel.cancel();
                    abort_at = Some(Instant::now() + grace);
                }
                _ = self.cancel.cancelled(), if interrupt.is_none() => {
                    warn!(ident = %job.ident, "Job cancelled");
                    interrupt = Some(Interrupt::Cancel);
                    engine_cancel.cancel();
                    abort_at = Some(Instant::now() + grace);
                }
                _ = sleep_until(abort_at), if abort_at.is_some() => {
                    warn!(grace_secs = grace.as_secs(), "Engine still running after cancel, aborting");
                    engine_task.abort();
                    abort_at = None;
                }
                notification = rx.recv() => match notification {
                    Some(notification) => {
                        if let Err(e) = dispatch(notification, translator, journal, writer) {
                            error!(error = %e, "Journal write failed, stopping job");
                            fatal = Some(e);
                            engine_cancel.cancel();
                            engine_task.abort();
                            break;
                        }
                    }
                    None => break,
                },
                _ = tick(&mut keepalive), if keepalive.is_some() => {
                    emit_status(writer, JobState::Running.as_str(), None);
                }
            }
        }

        let engine_result = match engine_task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(WorkerError::Canceled),
            Err(e) => Err(WorkerError::engine(format!("engine task failed: {e}"))),
        };
        debug!(?interrupt, ok = engine_result.is_ok(), "Engine finished");

        match (fatal, interrupt) {
            (Some(e), _) => RunResult::Failed(e),
            (None, Some(Interrupt::Deadline)) => RunResult::Interrupted(WorkerError::Timeout(
                job.timeout.map(|t| t.as_secs()).unwrap_or_default(),
            )),
            (None, Some(Interrupt::Cancel)) => RunResult::Interrupted(WorkerError::Canceled),
            (None, None) => match engine_result {
                Ok(rc) => RunResult::Completed(rc),
                Err(WorkerError::Canceled) => RunResult::Interrupted(WorkerError::Canceled),
                Err(e) => RunResult::Failed(e),
            },
        }
    }

    /// Summarize, finalize the journal, and send the closing frames.
    fn finish<W: Write>(
        &self,
        from: JobState,
        run: RunResult,
        translator: &mut EventTranslator,
        journal: &mut Journal,
        writer: &mut FrameWriter<W>,
    ) -> JobOutcome {
        let codes = self.settings.exit_codes;
        let (mut failure, ended) = match run {
            RunResult::Failed(e) => (Some(e), None),
            other => (None, Some(other)),
        };

        // Exactly one stats event per job, even after an interruption.
        if !matches!(failure, Some(WorkerError::ArtifactIo(_))) {
            for event in translator.finish() {
                if let Err(e) = journal.record(&event) {
                    error!(error = %e, "Failed to journal stats event");
                    failure = Some(e);
                    break;
                }
                emit_event(writer, &event);
            }
        }

        let has_failures = translator.has_failures();
        let (target, mut rc) = match (&failure, &ended) {
            (Some(e), _) => (JobState::Failed, e.exit_code(&codes)),
            (None, Some(RunResult::Interrupted(e))) => {
                let state = match e {
                    WorkerError::Timeout(_) => JobState::TimedOut,
                    _ => JobState::Canceled,
                };
                (state, e.exit_code(&codes))
            }
            (None, Some(RunResult::Completed(rc))) => {
                let rc = effective_rc(*rc, has_failures, &codes);
                let state = if rc == 0 {
                    JobState::Successful
                } else {
                    JobState::Failed
                };
                (state, rc)
            }
            (None, _) => (JobState::Failed, codes.engine_error),
        };
        let mut state = from.transition(target).unwrap_or_else(|e| {
            error!(error = %e, "Unexpected job state");
            JobState::Failed
        });

        if let Err(e) = journal.finalize(rc, state.as_str()) {
            error!(error = %e, "Failed to finalize artifacts");
            state = JobState::Failed;
            rc = e.exit_code(&codes);
            if failure.is_none() {
                failure = Some(e);
            }
        }

        let extra = failure.as_ref().map(traceback);
        emit_status(writer, state.as_str(), extra);

        if let Err(e) = writer.archive(journal.root()) {
            error!(error = %e, "Failed to send artifact archive");
            if failure.is_none() {
                state = JobState::Failed;
                rc = e.exit_code(&codes);
                failure = Some(e);
            }
        }
        if let Err(e) = writer.eof() {
            warn!(error = %e, "Failed to write eof frame");
        }

        let events = translator.context().emitted();
        info!(state = %state, rc, events, has_failures, "Job finished");
        JobOutcome {
            state,
            rc,
            exit_code: rc,
            has_failures,
            events,
            error: failure.map(|e| e.to_string()),
        }
    }
}

/// Engine outcome of the running phase.
#[derive(Debug)]
enum RunResult {
    Completed(i32),
    Interrupted(WorkerError),
    Failed(WorkerError),
}

/// Engine return code, with task failures overriding a clean exit.
pub fn effective_rc(engine_rc: i32, has_failures: bool, codes: &ExitCodes) -> i32 {
    if engine_rc == 0 && has_failures {
        codes.failures
    } else {
        engine_rc
    }
}

fn spawn_engine(
    engine: Arc<dyn AutomationEngine>,
    job: &Job,
    sink: NotificationSink,
    cancel: CancellationToken,
) -> JoinHandle<Result<i32>> {
    let invocation = job.invocation();
    tokio::spawn(async move { engine.run(invocation, sink, cancel).await })
}

/// Translate, journal, then stream. Journal failures are fatal.
fn dispatch<W: Write>(
    notification: Notification,
    translator: &mut EventTranslator,
    journal: &mut Journal,
    writer: &mut FrameWriter<W>,
) -> Result<()> {
    if let Notification::Stderr(line) = &notification {
        return journal.append_stderr(line);
    }
    for event in translator.translate(notification) {
        journal.record(&event)?;
        emit_event(writer, &event);
    }
    Ok(())
}

/// Terminal frames for input that never became a job.
fn reject<W: Write>(writer: &mut FrameWriter<W>, e: WorkerError, codes: &ExitCodes) -> JobOutcome {
    emit_status(writer, JobState::Failed.as_str(), Some(traceback(&e)));
    if let Err(err) = writer.eof() {
        warn!(error = %err, "Failed to write eof frame");
    }
    let exit_code = e.exit_code(codes);
    JobOutcome {
        state: JobState::Failed,
        rc: exit_code,
        exit_code,
        has_failures: false,
        events: 0,
        error: Some(e.to_string()),
    }
}

fn traceback(e: &WorkerError) -> Map<String, Value> {
    let mut extra = Map::new();
    extra.insert("result_traceback".into(), json!(e.to_string()));
    extra
}

// Output stream failures are logged; the journal remains the durable record.
fn emit_status<W: Write>(writer: &mut FrameWriter<W>, status: &str, extra: Option<Map<String, Value>>) {
    if let Err(e) = writer.status(status, extra) {
        warn!(status, error = %e, "Failed to write status frame");
    }
}

fn emit_event<W: Write>(writer: &mut FrameWriter<W>, event: &crate::event::ExecutionEvent) {
    if let Err(e) = writer.event(event) {
        warn!(counter = event.counter, error = %e, "Failed to stream event");
    }
}

fn keepalive_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let s = JobState::Unstarted.transition(JobState::Starting).unwrap();
        let s = s.transition(JobState::Running).unwrap();
        assert_eq!(s.transition(JobState::TimedOut).unwrap(), JobState::TimedOut);
        assert!(JobState::Starting.transition(JobState::Failed).is_ok());
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(JobState::Unstarted.transition(JobState::Running).is_err());
        assert!(JobState::Successful.transition(JobState::Running).is_err());
        assert!(JobState::Running.transition(JobState::Starting).is_err());
        assert!(JobState::Starting.transition(JobState::Canceled).is_err());
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(JobState::TimedOut.as_str(), "timeout");
        assert_eq!(JobState::Canceled.to_string(), "canceled");
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn test_effective_rc() {
        let codes = ExitCodes::default();
        assert_eq!(effective_rc(0, false, &codes), 0);
        assert_eq!(effective_rc(0, true, &codes), 2);
        assert_eq!(effective_rc(5, true, &codes), 5);
        assert_eq!(effective_rc(7, false, &codes), 7);
    }
}
