//! The automation engine seam and the production script engine.
//!
//! An engine receives an [`Invocation`], pushes native notifications into a
//! [`NotificationSink`], and returns its return code. However many producers
//! the engine runs internally, every notification passes through the sink's
//! single ordered queue.
//!
//! ## Script protocol
//!
//! **stdin** (JSON): [`ScriptInput`], then closed.
//!
//! **stdout**: one JSON notification per line (`{"event": "module_start", ...}`).
//! Lines that are not JSON are kept as unrecognized output.
//!
//! **stderr**: forwarded line by line to the `stderr` artifact.
//!
//! **exit code**: returned as the engine return code.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::notification::{LOCALHOST, Notification, TaskOutcome, TaskRef};
use crate::{Result, WorkerError};

/// Module name used for notifications the worker synthesizes itself.
pub const WORKER_MODULE: &str = "runnel";

/// Stderr lines kept for failure messages.
const STDERR_TAIL_LINES: usize = 20;

/// Everything an engine needs to run one job.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub ident: String,
    pub script: PathBuf,
    pub working_dir: PathBuf,
    pub inventory: Option<PathBuf>,
    pub extravars: Map<String, Value>,
    pub verbosity: u8,
}

/// Producer handle onto the single-writer notification queue.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    tx: mpsc::Sender<Notification>,
}

impl NotificationSink {
    /// Create a bounded queue and its producer handle.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue a notification, waiting while the queue is full.
    pub async fn send(&self, notification: Notification) -> Result<()> {
        self.tx
            .send(notification)
            .await
            .map_err(|_| WorkerError::engine("notification queue closed"))
    }
}

/// A black-box automation engine.
#[async_trait]
pub trait AutomationEngine: Send + Sync {
    /// Run the job to completion, returning the engine's return code.
    ///
    /// Implementations must stop producing notifications promptly once
    /// `cancel` fires.
    async fn run(
        &self,
        invocation: Invocation,
        sink: NotificationSink,
        cancel: CancellationToken,
    ) -> Result<i32>;

    /// Command line recorded in the `command` artifact.
    fn argv(&self, invocation: &Invocation) -> Vec<String> {
        vec![invocation.script.display().to_string()]
    }
}

/// JSON handed to the script on stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptInput {
    pub ident: String,
    pub inventory_path: Option<PathBuf>,
    pub extravars: Map<String, Value>,
    pub verbosity: u8,
}

/// Runs an executable script as a child process.
#[derive(Debug, Clone, Default)]
pub struct ScriptEngine {
    interpreter: Option<PathBuf>,
}

impl ScriptEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the script through an interpreter instead of executing it directly.
    pub fn with_interpreter(mut self, interpreter: impl Into<PathBuf>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    fn command(&self, script: &Path) -> Command {
        match &self.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(script);
                cmd
            }
            None => Command::new(script),
        }
    }
}

#[async_trait]
impl AutomationEngine for ScriptEngine {
    async fn run(
        &self,
        invocation: Invocation,
        sink: NotificationSink,
        cancel: CancellationToken,
    ) -> Result<i32> {
        if !invocation.script.exists() {
            info!(script = %invocation.script.display(), "No script found, reporting success");
            return report_missing_script(&invocation.script, &sink).await;
        }

        let input = serde_json::to_vec(&ScriptInput {
            ident: invocation.ident.clone(),
            inventory_path: invocation.inventory.clone(),
            extravars: invocation.extravars.clone(),
            verbosity: invocation.verbosity,
        })?;

        let mut child = self
            .command(&invocation.script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&invocation.working_dir)
            .env("RUNNEL_IDENT", &invocation.ident)
            .env("RUNNEL_PRIVATE_DATA_DIR", &invocation.working_dir)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                WorkerError::engine(format!(
                    "failed to spawn script '{}': {}",
                    invocation.script.display(),
                    e
                ))
            })?;
        debug!(pid = child.id(), script = %invocation.script.display(), "Script started");

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                let _ = stdin.write_all(&input).await;
                let _ = stdin.shutdown().await;
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::engine("script stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| WorkerError::engine("script stderr unavailable"))?;
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut stdout_open = true;
        let mut stderr_open = true;

        let mut open_tasks: Vec<TaskRef> = Vec::new();
        let mut stderr_tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);

        while stdout_open || stderr_open {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return stop_child(&mut child).await;
                }
                line = stdout_lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let notification = Notification::from_line(&line);
                        track_open(&mut open_tasks, &notification);
                        sink.send(notification).await?;
                    }
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        let _ = child.start_kill();
                        return Err(WorkerError::engine(format!("reading script output: {e}")));
                    }
                },
                line = stderr_lines.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => {
                        if stderr_tail.len() == STDERR_TAIL_LINES {
                            stderr_tail.pop_front();
                        }
                        stderr_tail.push_back(line.clone());
                        sink.send(Notification::Stderr(line)).await?;
                    }
                    Ok(None) => stderr_open = false,
                    Err(e) => {
                        warn!(error = %e, "Script stderr unreadable");
                        stderr_open = false;
                    }
                },
            }
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => return stop_child(&mut child).await,
            status = child.wait() => status
                .map_err(|e| WorkerError::engine(format!("waiting for script: {e}")))?,
        };

        let rc = status.code().unwrap_or(1);
        let signalled = status.code().is_none();
        if signalled || (rc != 0 && !open_tasks.is_empty()) {
            let msg = describe_exit(status, &stderr_tail);
            warn!(rc, error = %WorkerError::script(msg.clone()), "Script faulted");
            if open_tasks.is_empty() {
                open_tasks.push(TaskRef::new(LOCALHOST, "script"));
            }
            for target in open_tasks {
                sink.send(Notification::failure(target, msg.clone())).await?;
            }
        }

        debug!(rc, "Script finished");
        Ok(rc)
    }

    fn argv(&self, invocation: &Invocation) -> Vec<String> {
        let mut argv = Vec::new();
        if let Some(interpreter) = &self.interpreter {
            argv.push(interpreter.display().to_string());
        }
        argv.push(invocation.script.display().to_string());
        argv
    }
}

async fn report_missing_script(script: &Path, sink: &NotificationSink) -> Result<i32> {
    let target = TaskRef::new(LOCALHOST, WORKER_MODULE);
    sink.send(Notification::TaskStart(target.clone())).await?;
    sink.send(Notification::TaskSuccess(TaskOutcome {
        target,
        changed: false,
        output: json!({ "msg": format!("No script found at {}", script.display()) }),
        duration: None,
    }))
    .await?;
    Ok(0)
}

async fn stop_child(child: &mut tokio::process::Child) -> Result<i32> {
    debug!("Cancelling script");
    let _ = child.start_kill();
    let _ = child.wait().await;
    Err(WorkerError::Canceled)
}

/// Keep the list of (host, task) pairs that have started but not finished.
fn track_open(open: &mut Vec<TaskRef>, notification: &Notification) {
    let Some(target) = notification.target() else {
        return;
    };
    let same = |t: &TaskRef| t.host == target.host && t.task_name() == target.task_name();
    if notification.is_terminal() {
        if let Some(pos) = open.iter().position(same) {
            open.remove(pos);
        }
    } else if !open.iter().any(same) {
        open.push(target.clone());
    }
}

fn describe_exit(status: ExitStatus, stderr_tail: &VecDeque<String>) -> String {
    let mut msg = match status.code() {
        Some(code) => format!("script exited with code {code}"),
        None => describe_signal(status),
    };
    if !stderr_tail.is_empty() {
        msg.push_str(": ");
        msg.push_str(&stderr_tail.iter().cloned().collect::<Vec<_>>().join("\n"));
    }
    msg
}

#[cfg(unix)]
fn describe_signal(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => format!("script killed by signal {signal}"),
        None => "script terminated abnormally".to_string(),
    }
}

#[cfg(not(unix))]
fn describe_signal(_status: ExitStatus) -> String {
    "script terminated abnormally".to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("main.sh");
        fs::write(&path, body).unwrap();
        path
    }

    fn invocation(dir: &Path, script: PathBuf) -> Invocation {
        Invocation {
            ident: "5".into(),
            script,
            working_dir: dir.to_path_buf(),
            inventory: None,
            extravars: Map::new(),
            verbosity: 0,
        }
    }

    async fn run_script(
        body: &str,
    ) -> (Result<i32>, Vec<Notification>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), body);
        let engine = ScriptEngine::new().with_interpreter("/bin/sh");
        let (sink, mut rx) = NotificationSink::channel(64);
        let rc = engine
            .run(invocation(dir.path(), script), sink, CancellationToken::new())
            .await;
        let mut seen = Vec::new();
        while let Ok(n) = rx.try_recv() {
            seen.push(n);
        }
        (rc, seen, dir)
    }

    #[tokio::test]
    async fn test_forwards_notifications() {
        let (rc, seen, _dir) = run_script(
            r#"
echo '{"event": "module_start", "host": "web1", "module": "ping"}'
echo '{"event": "module_complete", "host": "web1", "module": "ping", "success": true}'
"#,
        )
        .await;
        assert_eq!(rc.unwrap(), 0);
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[0], Notification::TaskStart(_)));
        assert!(matches!(seen[1], Notification::TaskSuccess(_)));
    }

    #[tokio::test]
    async fn test_reads_input_from_stdin() {
        let (rc, _seen, dir) = run_script("cat > input.json\n").await;
        assert_eq!(rc.unwrap(), 0);
        let input: ScriptInput =
            serde_json::from_str(&fs::read_to_string(dir.path().join("input.json")).unwrap())
                .unwrap();
        assert_eq!(input.ident, "5");
    }

    #[tokio::test]
    async fn test_stderr_is_forwarded() {
        let (_rc, seen, _dir) = run_script("echo 'careful' >&2\n").await;
        assert_eq!(seen, vec![Notification::Stderr("careful".into())]);
    }

    #[tokio::test]
    async fn test_fault_with_open_task_synthesizes_failure() {
        let (rc, seen, _dir) = run_script(
            r#"
echo '{"event": "module_start", "host": "db", "module": "shell"}'
echo 'traceback here' >&2
exit 3
"#,
        )
        .await;
        assert_eq!(rc.unwrap(), 3);
        let Some(Notification::TaskFailure(outcome)) = seen.last() else {
            panic!("expected synthesized failure, got {seen:?}");
        };
        assert_eq!(outcome.target.host, "db");
        let msg = outcome.output["msg"].as_str().unwrap();
        assert!(msg.contains("code 3"));
        assert!(msg.contains("traceback here"));
    }

    #[tokio::test]
    async fn test_nonzero_without_open_task_passes_through() {
        let (rc, seen, _dir) = run_script("exit 4\n").await;
        assert_eq!(rc.unwrap(), 4);
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn test_signal_synthesizes_script_failure() {
        let (rc, seen, _dir) = run_script("kill -9 $$\n").await;
        assert_eq!(rc.unwrap(), 1);
        let Some(Notification::TaskFailure(outcome)) = seen.last() else {
            panic!("expected synthesized failure, got {seen:?}");
        };
        assert_eq!(outcome.target.host, LOCALHOST);
        assert_eq!(outcome.target.module, "script");
    }

    #[tokio::test]
    async fn test_missing_script_reports_success() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, mut rx) = NotificationSink::channel(8);
        let rc = ScriptEngine::new()
            .run(
                invocation(dir.path(), dir.path().join("absent")),
                sink,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(rc, 0);
        assert!(matches!(rx.recv().await, Some(Notification::TaskStart(_))));
        let Some(Notification::TaskSuccess(outcome)) = rx.recv().await else {
            panic!("expected success");
        };
        assert_eq!(outcome.target.module, WORKER_MODULE);
        assert!(
            outcome.output["msg"]
                .as_str()
                .unwrap()
                .starts_with("No script found at")
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_script() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "sleep 30\n");
        let engine = ScriptEngine::new().with_interpreter("/bin/sh");
        let (sink, _rx) = NotificationSink::channel(8);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            engine.run(invocation(dir.path(), script), sink, cancel),
        )
        .await
        .expect("engine did not stop after cancel");
        assert!(matches!(result, Err(WorkerError::Canceled)));
    }

    #[test]
    fn test_track_open() {
        let mut open = Vec::new();
        track_open(&mut open, &Notification::TaskStart(TaskRef::new("a", "ping")));
        track_open(&mut open, &Notification::TaskStart(TaskRef::new("b", "ping")));
        assert_eq!(open.len(), 2);
        track_open(&mut open, &Notification::failure(TaskRef::new("a", "ping"), "x"));
        assert_eq!(open, vec![TaskRef::new("b", "ping")]);
    }

    #[test]
    fn test_argv() {
        let inv = invocation(Path::new("/runner"), PathBuf::from("/opt/main"));
        let engine = ScriptEngine::new().with_interpreter("/bin/sh");
        assert_eq!(engine.argv(&inv), vec!["/bin/sh", "/opt/main"]);
        assert_eq!(ScriptEngine::new().argv(&inv), vec!["/opt/main"]);
    }
}
