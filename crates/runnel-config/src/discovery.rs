//! Config file discovery and layered merging.
//!
//! Resolution order (later overrides earlier):
//! 1. `~/.config/runnel/config.toml` (user config, or `RUNNEL_CONFIG_DIR`)
//! 2. `<private_data_dir>/env/runnel.toml` (job-local)
//! 3. CLI arguments and inbound kwargs (handled externally)

use std::path::{Path, PathBuf};

use crate::{ConfigError, Result, RunnelConfig};

/// Config filename within the user config directory.
const USER_CONFIG_FILE: &str = "config.toml";

/// Job-local config, relative to the private data directory.
const JOB_CONFIG_FILE: &str = "env/runnel.toml";

/// Application name for platform directory resolution.
const APP_NAME: &str = "runnel";

/// Environment variable to override the config directory.
const CONFIG_DIR_ENV: &str = "RUNNEL_CONFIG_DIR";

/// Tracks where each config layer was loaded from.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    /// Path to the config file.
    pub path: PathBuf,
    /// Whether the file was found and loaded.
    pub loaded: bool,
}

/// Result of config discovery and loading.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The merged configuration.
    pub config: RunnelConfig,
    /// Sources that were checked, lowest precedence first.
    pub sources: Vec<ConfigSource>,
    /// Problems with individual layers that did not stop loading.
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    /// Get paths of sources that were actually loaded.
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| s.loaded)
            .map(|s| s.path.as_path())
            .collect()
    }
}

/// Load configuration by discovering and merging all config layers.
pub fn load_config(job_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(job_dir, None, None)
}

/// Load configuration with explicit control over each layer.
///
/// `config_dir` overrides both `RUNNEL_CONFIG_DIR` and the platform default.
/// `explicit` is a file named on the command line; unlike discovered layers,
/// failing to read or parse it is an error.
pub fn load_config_with_options(
    job_dir: Option<&Path>,
    config_dir: Option<&Path>,
    explicit: Option<&Path>,
) -> Result<LoadedConfig> {
    let mut config = RunnelConfig::new();
    let mut sources = Vec::new();
    let mut warnings = Vec::new();

    let user_path = match config_dir {
        Some(dir) => Some(dir.join(USER_CONFIG_FILE)),
        None => user_config_path(),
    };
    if let Some(path) = user_path {
        sources.push(load_layer(&mut config, &path, &mut warnings));
    }

    if let Some(dir) = job_dir {
        let path = dir.join(JOB_CONFIG_FILE);
        sources.push(load_layer(&mut config, &path, &mut warnings));
    }

    if let Some(path) = explicit {
        config.merge(load_config_file(path)?);
        sources.push(ConfigSource {
            path: path.to_path_buf(),
            loaded: true,
        });
    }

    Ok(LoadedConfig {
        config,
        sources,
        warnings,
    })
}

/// Load config from a specific file path (no discovery).
pub fn load_config_file(path: &Path) -> Result<RunnelConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    RunnelConfig::from_toml(&contents)
}

/// Path of the user config file.
pub fn user_config_path() -> Option<PathBuf> {
    user_config_dir().map(|d| d.join(USER_CONFIG_FILE))
}

/// The user config directory for runnel.
///
/// Checks `RUNNEL_CONFIG_DIR` first, then falls back to the platform default.
pub fn user_config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

/// Try to load a config file and merge it into the existing config.
fn load_layer(config: &mut RunnelConfig, path: &Path, warnings: &mut Vec<String>) -> ConfigSource {
    if !path.is_file() {
        return ConfigSource {
            path: path.to_path_buf(),
            loaded: false,
        };
    }

    match load_config_file(path) {
        Ok(layer) => {
            config.merge(layer);
            ConfigSource {
                path: path.to_path_buf(),
                loaded: true,
            }
        }
        Err(e) => {
            warnings.push(format!("Failed to load {}: {}", path.display(), e));
            ConfigSource {
                path: path.to_path_buf(),
                loaded: false,
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_job_config(job_dir: &Path, contents: &str) {
        let env_dir = job_dir.join("env");
        fs::create_dir_all(&env_dir).unwrap();
        fs::write(env_dir.join("runnel.toml"), contents).unwrap();
    }

    #[test]
    fn test_load_config_file_not_found() {
        let err = load_config_file(Path::new("/nonexistent/runnel.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();

        let err = load_config_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_no_files_yields_defaults() {
        let job_dir = TempDir::new().unwrap();
        let config_dir = TempDir::new().unwrap();
        let loaded =
            load_config_with_options(Some(job_dir.path()), Some(config_dir.path()), None).unwrap();
        assert!(loaded.config.worker.is_none());
        assert!(loaded.loaded_from().is_empty());
        assert!(loaded.warnings.is_empty());
    }

    #[test]
    fn test_job_layer_overrides_user_layer() {
        let config_dir = TempDir::new().unwrap();
        let job_dir = TempDir::new().unwrap();

        fs::write(
            config_dir.path().join("config.toml"),
            r#"
[worker]
keepalive_seconds = 30

[exit_codes]
timeout = 200
"#,
        )
        .unwrap();
        write_job_config(
            job_dir.path(),
            r#"
[worker]
keepalive_seconds = 2
"#,
        );

        let loaded =
            load_config_with_options(Some(job_dir.path()), Some(config_dir.path()), None).unwrap();
        assert_eq!(loaded.config.worker().keepalive_seconds, 2);
        assert_eq!(loaded.config.exit_codes().timeout, 200);
        assert_eq!(loaded.loaded_from().len(), 2);
    }

    #[test]
    fn test_malformed_job_layer_warns_but_continues() {
        let config_dir = TempDir::new().unwrap();
        let job_dir = TempDir::new().unwrap();
        write_job_config(job_dir.path(), "not valid toml {{{{");

        let loaded =
            load_config_with_options(Some(job_dir.path()), Some(config_dir.path()), None).unwrap();
        assert_eq!(loaded.warnings.len(), 1);
        assert!(loaded.warnings[0].contains("Failed to load"));
    }

    #[test]
    fn test_explicit_file_must_parse() {
        let config_dir = TempDir::new().unwrap();
        let bad = config_dir.path().join("explicit.toml");
        fs::write(&bad, "[worker\n").unwrap();

        let result = load_config_with_options(None, Some(config_dir.path()), Some(&bad));
        assert!(result.is_err());
    }

    #[test]
    fn test_explicit_file_wins() {
        let config_dir = TempDir::new().unwrap();
        let job_dir = TempDir::new().unwrap();
        write_job_config(job_dir.path(), "[exit_codes]\ncanceled = 9\n");
        let explicit = config_dir.path().join("explicit.toml");
        fs::write(&explicit, "[exit_codes]\ncanceled = 143\n").unwrap();

        let loaded = load_config_with_options(
            Some(job_dir.path()),
            Some(config_dir.path()),
            Some(&explicit),
        )
        .unwrap();
        assert_eq!(loaded.config.exit_codes().canceled, 143);
    }
}
