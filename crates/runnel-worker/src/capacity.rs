//! Static snapshot of host resources for `--worker-info`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Result, WorkerError};

/// Reported when total memory cannot be determined.
pub const FALLBACK_MEM_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Default location of the persistent node identifier.
pub const DEFAULT_UUID_PATH: &str = "/etc/runnel-uuid";

const MEMINFO_PATH: &str = "/proc/meminfo";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub cpu_count: usize,
    pub mem_in_bytes: u64,
    pub runner_version: String,
    pub uuid: String,
}

/// Reads host facts. Paths are overridable for tests.
#[derive(Debug, Clone)]
pub struct CapacityProbe {
    meminfo_path: PathBuf,
    uuid_path: PathBuf,
}

impl Default for CapacityProbe {
    fn default() -> Self {
        Self {
            meminfo_path: PathBuf::from(MEMINFO_PATH),
            uuid_path: PathBuf::from(DEFAULT_UUID_PATH),
        }
    }
}

impl CapacityProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_meminfo_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.meminfo_path = path.into();
        self
    }

    pub fn with_uuid_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.uuid_path = path.into();
        self
    }

    pub fn probe(&self) -> Result<WorkerInfo> {
        let cpu_count = std::thread::available_parallelism()
            .map_err(|e| WorkerError::probe(format!("cpu count: {e}")))?
            .get();
        Ok(WorkerInfo {
            cpu_count,
            mem_in_bytes: mem_total(&self.meminfo_path).unwrap_or(FALLBACK_MEM_BYTES),
            runner_version: env!("CARGO_PKG_VERSION").to_string(),
            uuid: node_uuid(&self.uuid_path),
        })
    }
}

/// `MemTotal` from a meminfo file, in bytes.
fn mem_total(path: &Path) -> Option<u64> {
    let contents = std::fs::read_to_string(path).ok()?;
    let kib = contents
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))?
        .split_whitespace()
        .next()?
        .parse::<u64>()
        .ok()?;
    Some(kib * 1024)
}

fn node_uuid(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(contents) if !contents.trim().is_empty() => contents.trim().to_string(),
        _ => {
            debug!(path = %path.display(), "No node uuid file, generating one");
            uuid::Uuid::new_v4().to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_reads_host_files() {
        let dir = tempfile::tempdir().unwrap();
        let meminfo = dir.path().join("meminfo");
        fs::write(&meminfo, "MemTotal:       16318412 kB\nMemFree:  1 kB\n").unwrap();
        let uuid = dir.path().join("uuid");
        fs::write(&uuid, "node-1234\n").unwrap();

        let info = CapacityProbe::new()
            .with_meminfo_path(&meminfo)
            .with_uuid_path(&uuid)
            .probe()
            .unwrap();
        assert_eq!(info.mem_in_bytes, 16318412 * 1024);
        assert_eq!(info.uuid, "node-1234");
        assert!(info.cpu_count >= 1);
        assert_eq!(info.runner_version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_fallbacks() {
        let info = CapacityProbe::new()
            .with_meminfo_path("/nonexistent/meminfo")
            .with_uuid_path("/nonexistent/uuid")
            .probe()
            .unwrap();
        assert_eq!(info.mem_in_bytes, FALLBACK_MEM_BYTES);
        assert!(uuid::Uuid::parse_str(&info.uuid).is_ok());
    }

    #[test]
    fn test_malformed_meminfo_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let meminfo = dir.path().join("meminfo");
        fs::write(&meminfo, "MemTotal: lots\n").unwrap();
        assert_eq!(mem_total(&meminfo), None);
    }
}
