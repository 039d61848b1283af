//! Framed stdin/stdout transport.
//!
//! Inbound:
//!
//! ```text
//! {"kwargs": {...}}
//! {"zipfile": N}          optional
//! <base64 of N bytes>     present iff zipfile present
//! {"eof": true}
//! ```
//!
//! Outbound: status frames, one JSON line per event, a terminal status, the
//! zipped artifact directory, then `{"eof": true}`.

use std::io::{self, BufRead, Read, Seek, SeekFrom, Write};
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::read::DecoderReader;
use base64::write::EncoderWriter;
use serde_json::{Map, Value, json};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::archive;
use crate::event::ExecutionEvent;
use crate::{Result, WorkerError};

/// Inbound control frames.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    Kwargs(Map<String, Value>),
    Zipfile(u64),
    Eof,
}

impl ControlFrame {
    /// Classify a decoded control line.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut obj) = value else {
            return Err(WorkerError::protocol("control frame is not a JSON object"));
        };
        if let Some(kwargs) = obj.remove("kwargs") {
            return match kwargs {
                Value::Object(map) => Ok(Self::Kwargs(map)),
                Value::Null => Ok(Self::Kwargs(Map::new())),
                _ => Err(WorkerError::protocol("kwargs frame must carry an object")),
            };
        }
        if let Some(size) = obj.remove("zipfile") {
            return size
                .as_u64()
                .map(Self::Zipfile)
                .ok_or_else(|| WorkerError::protocol(format!("invalid zipfile length: {size}")));
        }
        if obj.contains_key("eof") {
            return Ok(Self::Eof);
        }
        let keys: Vec<_> = obj.keys().cloned().collect();
        Err(WorkerError::protocol(format!("unexpected frame with keys {keys:?}")))
    }
}

/// Result of decoding the inbound stream.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundJob {
    pub kwargs: Map<String, Value>,
    /// Declared archive size, when an archive was received.
    pub archive_bytes: Option<u64>,
}

/// Decode the inbound frame sequence, extracting any archive into
/// `private_data_dir`.
///
/// Without an archive frame the directory must already exist.
pub fn read_input<R: BufRead>(reader: &mut R, private_data_dir: &Path) -> Result<InboundJob> {
    let kwargs = match next_frame(reader)? {
        Some(ControlFrame::Kwargs(kwargs)) => kwargs,
        Some(other) => {
            return Err(WorkerError::protocol(format!(
                "expected kwargs as the first frame, got {other:?}"
            )));
        }
        None => return Err(WorkerError::protocol("input ended before kwargs frame")),
    };

    let mut archive_bytes = None;
    loop {
        match next_frame(reader)? {
            Some(ControlFrame::Zipfile(size)) if archive_bytes.is_none() => {
                read_archive(reader, size, private_data_dir)?;
                archive_bytes = Some(size);
            }
            Some(ControlFrame::Zipfile(_)) => {
                return Err(WorkerError::protocol("more than one zipfile frame"));
            }
            Some(ControlFrame::Eof) => break,
            Some(ControlFrame::Kwargs(_)) => {
                return Err(WorkerError::protocol("duplicate kwargs frame"));
            }
            None => return Err(WorkerError::protocol("input ended before eof frame")),
        }
    }

    if archive_bytes.is_none() && !private_data_dir.is_dir() {
        return Err(WorkerError::protocol(format!(
            "no archive received and {} does not exist",
            private_data_dir.display()
        )));
    }

    Ok(InboundJob {
        kwargs,
        archive_bytes,
    })
}

/// Next non-blank control line, or `None` at end of input.
fn next_frame<R: BufRead>(reader: &mut R) -> Result<Option<ControlFrame>> {
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader
            .read_until(b'\n', &mut line)
            .map_err(|e| WorkerError::protocol(format!("read failed: {e}")))?;
        if n == 0 {
            return Ok(None);
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let value: Value = serde_json::from_slice(&line).map_err(|e| {
            WorkerError::protocol(format!(
                "malformed control frame ({e}): {}",
                String::from_utf8_lossy(&line).trim_end()
            ))
        })?;
        return ControlFrame::from_value(value).map(Some);
    }
}

/// Number of base64 characters that encode `size` bytes.
pub fn encoded_len(size: u64) -> u64 {
    size.div_ceil(3) * 4
}

fn read_archive<R: BufRead>(reader: &mut R, size: u64, dest: &Path) -> Result<()> {
    let mut tmp = NamedTempFile::new()?;
    let payload = PayloadReader {
        inner: reader,
        remaining: encoded_len(size),
    };
    let mut decoder = DecoderReader::new(payload, &STANDARD);
    let written = io::copy(&mut decoder, tmp.as_file_mut())
        .map_err(|e| WorkerError::protocol(format!("archive payload: {e}")))?;
    if written != size {
        return Err(WorkerError::protocol(format!(
            "declared {size} archive bytes, read {written}"
        )));
    }
    debug!(bytes = size, "Archive payload received");

    let file = tmp.as_file_mut();
    file.seek(SeekFrom::Start(0))?;
    archive::unpack(file, dest)
}

/// Yields exactly `remaining` base64 characters from the underlying reader,
/// skipping line breaks.
struct PayloadReader<'a, R> {
    inner: &'a mut R,
    remaining: u64,
}

impl<R: BufRead> Read for PayloadReader<'_, R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < out.len() && self.remaining > 0 {
            let buf = self.inner.fill_buf()?;
            if buf.is_empty() {
                break;
            }
            let mut scanned = 0;
            for &byte in buf {
                if filled == out.len() || self.remaining == 0 {
                    break;
                }
                scanned += 1;
                if byte == b'\n' || byte == b'\r' {
                    continue;
                }
                out[filled] = byte;
                filled += 1;
                self.remaining -= 1;
            }
            self.inner.consume(scanned);
        }
        Ok(filled)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

/// Writes outbound frames, flushing after each one.
#[derive(Debug)]
pub struct FrameWriter<W: Write> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// `{"status": ..., ...extra}`
    pub fn status(&mut self, status: &str, extra: Option<Map<String, Value>>) -> Result<()> {
        let mut frame = Map::new();
        frame.insert("status".into(), Value::String(status.to_string()));
        if let Some(extra) = extra {
            frame.extend(extra);
        }
        self.line(&Value::Object(frame))
    }

    /// One event per line.
    pub fn event(&mut self, event: &ExecutionEvent) -> Result<()> {
        serde_json::to_writer(&mut self.inner, event)?;
        self.inner.write_all(b"\n")?;
        self.inner.flush()?;
        Ok(())
    }

    /// Zip `dir`, then emit `{"zipfile": M}` and the base64 payload line.
    pub fn archive(&mut self, dir: &Path) -> Result<u64> {
        let tmp = NamedTempFile::new()?;
        let mut file = archive::pack_dir(dir, tmp.reopen()?)?;
        let size = file.stream_position()?;
        file.seek(SeekFrom::Start(0))?;

        self.line(&json!({ "zipfile": size }))?;
        {
            let mut encoder = EncoderWriter::new(&mut self.inner, &STANDARD);
            io::copy(&mut file, &mut encoder)?;
            encoder.finish()?;
        }
        self.inner.write_all(b"\n")?;
        self.inner.flush()?;
        debug!(bytes = size, "Artifact archive sent");
        Ok(size)
    }

    /// `{"eof": true}`
    pub fn eof(&mut self) -> Result<()> {
        self.line(&json!({ "eof": true }))
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn line(&mut self, value: &Value) -> Result<()> {
        serde_json::to_writer(&mut self.inner, value)?;
        self.inner.write_all(b"\n")?;
        self.inner.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use std::fs;
    use std::io::Cursor;

    fn zip_of(files: &[(&str, &str)]) -> Vec<u8> {
        let src = tempfile::tempdir().unwrap();
        for (name, body) in files {
            let path = src.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, body).unwrap();
        }
        archive::pack_dir(src.path(), Cursor::new(Vec::new()))
            .unwrap()
            .into_inner()
    }

    fn framed(zip: &[u8], wrap: Option<usize>) -> Vec<u8> {
        let mut encoded = STANDARD.encode(zip);
        if let Some(width) = wrap {
            encoded = encoded
                .as_bytes()
                .chunks(width)
                .map(|c| String::from_utf8_lossy(c).into_owned())
                .collect::<Vec<_>>()
                .join("\n");
        }
        format!(
            "{{\"kwargs\": {{\"ident\": \"9\"}}}}\n{{\"zipfile\": {}}}\n{}\n{{\"eof\": true}}\n",
            zip.len(),
            encoded
        )
        .into_bytes()
    }

    #[test]
    fn test_read_with_archive() {
        let zip = zip_of(&[("env/extravars", r#"{"a": 1}"#), ("inventory/hosts", "web1")]);
        let dest = tempfile::tempdir().unwrap();
        let job = read_input(&mut Cursor::new(framed(&zip, None)), dest.path()).unwrap();

        assert_eq!(job.kwargs["ident"], "9");
        assert_eq!(job.archive_bytes, Some(zip.len() as u64));
        assert_eq!(
            fs::read_to_string(dest.path().join("env/extravars")).unwrap(),
            r#"{"a": 1}"#
        );
    }

    #[test]
    fn test_payload_line_breaks_are_tolerated() {
        let zip = zip_of(&[("project/site", "echo hi")]);
        let dest = tempfile::tempdir().unwrap();
        read_input(&mut Cursor::new(framed(&zip, Some(76))), dest.path()).unwrap();
        assert!(dest.path().join("project/site").is_file());
    }

    #[test]
    fn test_without_archive_requires_existing_dir() {
        let input = b"{\"kwargs\": {}}\n{\"eof\": true}\n";
        let dest = tempfile::tempdir().unwrap();
        let job = read_input(&mut Cursor::new(input.to_vec()), dest.path()).unwrap();
        assert!(job.archive_bytes.is_none());

        let missing = dest.path().join("nope");
        let err = read_input(&mut Cursor::new(input.to_vec()), &missing).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_short_payload_is_protocol_error() {
        let payload = STANDARD.encode([7u8; 50]);
        let input = format!("{{\"kwargs\": {{}}}}\n{{\"zipfile\": 100}}\n{payload}\n{{\"eof\": true}}\n");
        let dest = tempfile::tempdir().unwrap();
        let err = read_input(&mut Cursor::new(input.into_bytes()), dest.path()).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_oversized_payload_is_protocol_error() {
        let zip = zip_of(&[("a", "b")]);
        let mut encoded = STANDARD.encode(&zip);
        encoded.push_str("QUJD");
        let input = format!(
            "{{\"kwargs\": {{}}}}\n{{\"zipfile\": {}}}\n{encoded}\n{{\"eof\": true}}\n",
            zip.len()
        );
        let dest = tempfile::tempdir().unwrap();
        let err = read_input(&mut Cursor::new(input.into_bytes()), dest.path()).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_missing_eof_is_protocol_error() {
        let dest = tempfile::tempdir().unwrap();
        let err = read_input(&mut Cursor::new(b"{\"kwargs\": {}}\n".to_vec()), dest.path())
            .unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_kwargs_must_come_first() {
        let dest = tempfile::tempdir().unwrap();
        let err = read_input(&mut Cursor::new(b"{\"eof\": true}\n".to_vec()), dest.path())
            .unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_garbage_line_is_protocol_error() {
        let dest = tempfile::tempdir().unwrap();
        let input = b"{\"kwargs\": {}}\nhello\n{\"eof\": true}\n";
        let err = read_input(&mut Cursor::new(input.to_vec()), dest.path()).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_blank_lines_skipped() {
        let dest = tempfile::tempdir().unwrap();
        let input = b"\n{\"kwargs\": {\"x\": 1}}\n\n\r\n{\"eof\": true}\n";
        let job = read_input(&mut Cursor::new(input.to_vec()), dest.path()).unwrap();
        assert_eq!(job.kwargs["x"], 1);
    }

    #[test]
    fn test_encoded_len() {
        assert_eq!(encoded_len(0), 0);
        assert_eq!(encoded_len(1), 4);
        assert_eq!(encoded_len(3), 4);
        assert_eq!(encoded_len(100), 136);
    }

    #[test]
    fn test_writer_frames() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.status("starting", None).unwrap();
        let mut extra = Map::new();
        extra.insert("result_traceback".into(), json!("boom"));
        writer.status("failed", Some(extra)).unwrap();
        writer.eof().unwrap();

        let out = String::from_utf8(writer.into_inner()).unwrap();
        let lines: Vec<Value> = out.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines[0], json!({"status": "starting"}));
        assert_eq!(lines[1], json!({"status": "failed", "result_traceback": "boom"}));
        assert_eq!(lines[2], json!({"eof": true}));
    }

    #[test]
    fn test_archive_frame_round_trips_through_reader() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("rc"), "0").unwrap();

        let mut writer = FrameWriter::new(b"{\"kwargs\": {}}\n".to_vec());
        let size = writer.archive(src.path()).unwrap();
        writer.eof().unwrap();
        let bytes = writer.into_inner();

        let dest = tempfile::tempdir().unwrap();
        let job = read_input(&mut Cursor::new(bytes), dest.path()).unwrap();
        assert_eq!(job.archive_bytes, Some(size));
        assert_eq!(fs::read_to_string(dest.path().join("rc")).unwrap(), "0");
    }
}
