//! Configuration system for the runnel streaming worker.
//!
//! Provides TOML-based configuration with:
//! - Worker defaults (`[worker]`): script location, keepalive, timeout, queue sizing
//! - The process exit-code table (`[exit_codes]`)
//! - Log file settings (`[logging]`)
//! - Config file layering (user config dir + job-local overrides)
//!
//! Per-job values arriving in the inbound kwargs frame are applied on top of
//! the merged file configuration by the worker itself.

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    load_config, load_config_file, load_config_with_options, user_config_dir, user_config_path,
    ConfigSource, LoadedConfig,
};
pub use error::{ConfigError, Result};
pub use types::*;
