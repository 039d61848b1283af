//! Job identity and per-job settings resolved from the private data
//! directory and the inbound kwargs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use runnel_config::WorkerConfig;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::engine::Invocation;

/// Identifier used when neither kwargs nor the directory name provide one.
pub const FALLBACK_IDENT: &str = "1";

/// Directory-name prefix stripped when deriving an identifier.
const DIR_IDENT_PREFIX: &str = "awx_";

/// One job, fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub ident: String,
    pub private_data_dir: PathBuf,
    pub script: PathBuf,
    pub extravars: Map<String, Value>,
    pub inventory: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub keepalive: Option<Duration>,
    pub verbosity: u8,
}

impl Job {
    /// Combine file configuration, the working directory, and kwargs.
    ///
    /// Kwargs win over configuration for timeout, keepalive, and verbosity.
    pub fn resolve(private_data_dir: &Path, kwargs: &Map<String, Value>, config: &WorkerConfig) -> Self {
        let mut worker = config.clone();
        if let Some(secs) = kwarg_u64(kwargs, "timeout").or_else(|| kwarg_u64(kwargs, "job_timeout")) {
            worker.timeout_seconds = Some(secs);
        }
        if let Some(secs) = kwarg_u64(kwargs, "keepalive_seconds") {
            worker.keepalive_seconds = secs;
        }
        if let Some(level) = kwarg_u64(kwargs, "verbosity") {
            worker.verbosity = u8::try_from(level).unwrap_or(u8::MAX);
        }

        let script = playbook_override(private_data_dir, kwargs).unwrap_or(worker.script_path.clone());

        let job = Self {
            ident: resolve_ident(private_data_dir, kwargs),
            private_data_dir: private_data_dir.to_path_buf(),
            script,
            extravars: load_extravars(private_data_dir),
            inventory: inventory_path(private_data_dir),
            timeout: worker.timeout(),
            keepalive: worker.keepalive(),
            verbosity: worker.verbosity,
        };
        debug!(ident = %job.ident, script = %job.script.display(), "Job resolved");
        job
    }

    /// What the engine receives.
    pub fn invocation(&self) -> Invocation {
        Invocation {
            ident: self.ident.clone(),
            script: self.script.clone(),
            working_dir: self.private_data_dir.clone(),
            inventory: self.inventory.clone(),
            extravars: self.extravars.clone(),
            verbosity: self.verbosity,
        }
    }
}

/// `kwargs.ident`, else the directory name without its `awx_` prefix,
/// else [`FALLBACK_IDENT`].
pub fn resolve_ident(private_data_dir: &Path, kwargs: &Map<String, Value>) -> String {
    match kwargs.get("ident") {
        Some(Value::String(s)) if !s.is_empty() => return s.clone(),
        Some(Value::Number(n)) => return n.to_string(),
        _ => {}
    }
    private_data_dir
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_prefix(DIR_IDENT_PREFIX))
        .filter(|ident| !ident.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| FALLBACK_IDENT.to_string())
}

/// `env/extravars` as a JSON object; missing or invalid yields an empty map.
pub fn load_extravars(private_data_dir: &Path) -> Map<String, Value> {
    let path = private_data_dir.join("env").join("extravars");
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return Map::new();
    };
    match serde_json::from_str::<Value>(&contents) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            warn!(path = %path.display(), "extravars is not a JSON object, ignoring");
            Map::new()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Invalid extravars, ignoring");
            Map::new()
        }
    }
}

/// `inventory/` when it is a directory.
pub fn inventory_path(private_data_dir: &Path) -> Option<PathBuf> {
    let path = private_data_dir.join("inventory");
    path.is_dir().then_some(path)
}

/// `project/<kwargs.playbook>` when that file exists.
fn playbook_override(private_data_dir: &Path, kwargs: &Map<String, Value>) -> Option<PathBuf> {
    let name = kwargs.get("playbook")?.as_str()?;
    let path = private_data_dir.join("project").join(name);
    if path.is_file() {
        Some(path)
    } else {
        debug!(playbook = name, "Requested playbook not found, using configured script");
        None
    }
}

/// Integer kwarg, accepting numeric strings.
fn kwarg_u64(kwargs: &Map<String, Value>, key: &str) -> Option<u64> {
    match kwargs.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn kwargs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("kwargs must be an object"),
        }
    }

    #[test]
    fn test_ident_from_kwargs() {
        let dir = Path::new("/tmp/awx_77");
        assert_eq!(resolve_ident(dir, &kwargs(json!({"ident": "abc"}))), "abc");
        assert_eq!(resolve_ident(dir, &kwargs(json!({"ident": 12}))), "12");
    }

    #[test]
    fn test_ident_from_dir_name() {
        assert_eq!(resolve_ident(Path::new("/tmp/awx_77"), &Map::new()), "77");
        assert_eq!(resolve_ident(Path::new("/tmp/runner"), &Map::new()), FALLBACK_IDENT);
    }

    #[test]
    fn test_extravars() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_extravars(dir.path()).is_empty());

        fs::create_dir_all(dir.path().join("env")).unwrap();
        fs::write(dir.path().join("env/extravars"), r#"{"region": "eu"}"#).unwrap();
        assert_eq!(load_extravars(dir.path())["region"], "eu");

        fs::write(dir.path().join("env/extravars"), "region: eu").unwrap();
        assert!(load_extravars(dir.path()).is_empty());
    }

    #[test]
    fn test_inventory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(inventory_path(dir.path()).is_none());
        fs::create_dir(dir.path().join("inventory")).unwrap();
        assert_eq!(inventory_path(dir.path()), Some(dir.path().join("inventory")));
    }

    #[test]
    fn test_kwargs_override_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkerConfig {
            keepalive_seconds: 30,
            timeout_seconds: Some(600),
            ..Default::default()
        };
        let job = Job::resolve(
            dir.path(),
            &kwargs(json!({"job_timeout": "5", "keepalive_seconds": 0, "verbosity": 2})),
            &config,
        );
        assert_eq!(job.timeout, Some(Duration::from_secs(5)));
        assert_eq!(job.keepalive, None);
        assert_eq!(job.verbosity, 2);
        assert_eq!(job.script, config.script_path);
    }

    #[test]
    fn test_playbook_override() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("project")).unwrap();
        fs::write(dir.path().join("project/site.sh"), "exit 0").unwrap();

        let config = WorkerConfig::default();
        let job = Job::resolve(dir.path(), &kwargs(json!({"playbook": "site.sh"})), &config);
        assert_eq!(job.script, dir.path().join("project/site.sh"));

        let job = Job::resolve(dir.path(), &kwargs(json!({"playbook": "absent.sh"})), &config);
        assert_eq!(job.script, config.script_path);
    }
}
