//! Durable per-job artifact journal.
//!
//! Layout: `{private_data_dir}/artifacts/{ident}/`
//!
//! ```text
//! job_events/000001-<uuid>.json   one file per event, write-once
//! stdout                          concatenated rendered fragments
//! stderr                          engine error stream
//! command                         what was run, written at start
//! rc                              final return code
//! status                          final job status
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::event::ExecutionEvent;
use crate::{Result, WorkerError};

/// Contents of the `command` artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: Vec<String>,
    pub cwd: String,
    pub env: BTreeMap<String, String>,
}

/// Append/write-once store for one job's artifacts.
#[derive(Debug)]
pub struct Journal {
    root: PathBuf,
    events_dir: PathBuf,
    stdout: File,
    stderr: File,
    finalized: bool,
}

impl Journal {
    /// Create the artifact tree for `ident` under `private_data_dir`.
    pub fn create(private_data_dir: &Path, ident: &str) -> Result<Self> {
        let root = artifact_dir(private_data_dir, ident);
        let events_dir = root.join("job_events");
        create_private_dir(&events_dir).map_err(io_context("create", &events_dir))?;
        restrict_dir(&root).map_err(io_context("chmod", &root))?;

        let stdout = open_append(&root.join("stdout"))?;
        let stderr = open_append(&root.join("stderr"))?;
        debug!(path = %root.display(), "Artifact journal created");

        Ok(Self {
            root,
            events_dir,
            stdout,
            stderr,
            finalized: false,
        })
    }

    /// Root of the artifact tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Write the `command` artifact.
    pub fn write_command(&self, record: &CommandRecord) -> Result<()> {
        let body = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.root.join("command"), &body)
    }

    /// Persist one event and append its rendered text to `stdout`.
    ///
    /// An event file that already exists is an error.
    pub fn record(&mut self, event: &ExecutionEvent) -> Result<()> {
        let path = self.events_dir.join(event.file_name());
        let mut tmp = NamedTempFile::new_in(&self.events_dir).map_err(io_context("create", &path))?;
        serde_json::to_writer(tmp.as_file_mut(), event)?;
        tmp.as_file().sync_all().map_err(io_context("sync", &path))?;
        tmp.persist_noclobber(&path).map_err(|e| {
            if e.error.kind() == io::ErrorKind::AlreadyExists {
                WorkerError::artifact(format!("event file already exists: {}", path.display()))
            } else {
                io_context("persist", &path)(e.error)
            }
        })?;

        if !event.stdout.is_empty() {
            let stdout_path = self.root.join("stdout");
            self.stdout
                .write_all(event.stdout.as_bytes())
                .and_then(|_| self.stdout.write_all(b"\n"))
                .map_err(io_context("append", &stdout_path))?;
        }
        Ok(())
    }

    /// Append one line of engine error output.
    pub fn append_stderr(&mut self, line: &str) -> Result<()> {
        let path = self.root.join("stderr");
        self.stderr
            .write_all(line.as_bytes())
            .and_then(|_| self.stderr.write_all(b"\n"))
            .map_err(io_context("append", &path))
    }

    /// Write `rc` and `status`. Allowed exactly once.
    pub fn finalize(&mut self, rc: i32, status: &str) -> Result<()> {
        if self.finalized {
            return Err(WorkerError::artifact("journal already finalized"));
        }
        self.finalized = true;

        let stdout_path = self.root.join("stdout");
        self.stdout.sync_all().map_err(io_context("sync", &stdout_path))?;
        let stderr_path = self.root.join("stderr");
        self.stderr.sync_all().map_err(io_context("sync", &stderr_path))?;

        write_atomic(&self.root.join("rc"), rc.to_string().as_bytes())?;
        write_atomic(&self.root.join("status"), status.as_bytes())?;
        debug!(rc, status, "Artifact journal finalized");
        Ok(())
    }
}

/// `{private_data_dir}/artifacts/{ident}`
pub fn artifact_dir(private_data_dir: &Path, ident: &str) -> PathBuf {
    private_data_dir.join("artifacts").join(ident)
}

/// Write through a temp file in the same directory, then rename into place.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_context("create", path))?;
    tmp.write_all(contents).map_err(io_context("write", path))?;
    tmp.as_file().sync_all().map_err(io_context("sync", path))?;
    tmp.persist(path)
        .map_err(|e| io_context("persist", path)(e.error))?;
    Ok(())
}

fn open_append(path: &Path) -> Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path).map_err(io_context("open", path))
}

fn create_private_dir(path: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)
}

fn restrict_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn io_context(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> WorkerError {
    let path = path.display().to_string();
    move |e| WorkerError::artifact(format!("failed to {action} {path}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use chrono::Utc;
    use serde_json::Map;
    use uuid::Uuid;

    fn event(counter: u64, stdout: &str) -> ExecutionEvent {
        ExecutionEvent {
            uuid: Uuid::new_v4(),
            counter,
            created: Utc::now(),
            runner_ident: "1".into(),
            event: EventKind::RunnerOnOk,
            parent_uuid: None,
            event_data: Map::new(),
            stdout: stdout.into(),
            start_line: 0,
            end_line: 0,
        }
    }

    fn temp_journal() -> (tempfile::TempDir, Journal) {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::create(dir.path(), "42").unwrap();
        (dir, journal)
    }

    #[test]
    fn test_layout() {
        let (dir, journal) = temp_journal();
        let root = dir.path().join("artifacts/42");
        assert_eq!(journal.root(), root);
        assert!(root.join("job_events").is_dir());
        assert!(root.join("stdout").is_file());
        assert!(root.join("stderr").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn test_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let (_dir, mut journal) = temp_journal();
        journal.record(&event(1, "")).unwrap();

        let mode = fs::metadata(journal.root()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        let entry = fs::read_dir(journal.root().join("job_events"))
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        let mode = entry.metadata().unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_record_writes_event_and_stdout() {
        let (_dir, mut journal) = temp_journal();
        let first = event(1, "");
        let second = event(2, "ok: [web1]");
        journal.record(&first).unwrap();
        journal.record(&second).unwrap();

        let path = journal.root().join("job_events").join(second.file_name());
        let stored: ExecutionEvent =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(stored, second);

        let stdout = fs::read_to_string(journal.root().join("stdout")).unwrap();
        assert_eq!(stdout, "ok: [web1]\n");
    }

    #[test]
    fn test_event_files_are_write_once() {
        let (_dir, mut journal) = temp_journal();
        let e = event(1, "");
        journal.record(&e).unwrap();
        let err = journal.record(&e).unwrap_err();
        assert!(matches!(err, WorkerError::ArtifactIo(_)));
    }

    #[test]
    fn test_stderr_append() {
        let (_dir, mut journal) = temp_journal();
        journal.append_stderr("warning: a").unwrap();
        journal.append_stderr("warning: b").unwrap();
        let stderr = fs::read_to_string(journal.root().join("stderr")).unwrap();
        assert_eq!(stderr, "warning: a\nwarning: b\n");
    }

    #[test]
    fn test_finalize_once() {
        let (_dir, mut journal) = temp_journal();
        journal.finalize(2, "failed").unwrap();
        assert!(journal.is_finalized());
        assert_eq!(fs::read_to_string(journal.root().join("rc")).unwrap(), "2");
        assert_eq!(
            fs::read_to_string(journal.root().join("status")).unwrap(),
            "failed"
        );
        assert!(journal.finalize(0, "successful").is_err());
        assert_eq!(fs::read_to_string(journal.root().join("rc")).unwrap(), "2");
    }

    #[test]
    fn test_command_record() {
        let (_dir, journal) = temp_journal();
        let record = CommandRecord {
            command: vec!["/opt/runnel/main".into()],
            cwd: "/runner".into(),
            env: BTreeMap::new(),
        };
        journal.write_command(&record).unwrap();
        let stored: CommandRecord =
            serde_json::from_str(&fs::read_to_string(journal.root().join("command")).unwrap())
                .unwrap();
        assert_eq!(stored, record);
    }
}
