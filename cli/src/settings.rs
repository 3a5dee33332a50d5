//! CLI settings: `~/.config/workbench/cli.toml` overlaid with `WORKBENCH_*`
//! environment variables

use crate::error::{CliError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_AGENT_URL: &str = "http://localhost:4500";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliSettings {
    /// Control plane queried when `--url` is not given
    pub agent_url: String,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    /// Interval between probes in `wait`, in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for CliSettings {
    fn default() -> Self {
        Self {
            agent_url: DEFAULT_AGENT_URL.to_string(),
            timeout_secs: 30,
            poll_interval_ms: 1000,
        }
    }
}

/// `<config dir>/workbench`
pub fn get_config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("workbench"))
        .ok_or_else(|| CliError::Config(config::ConfigError::Message("Unable to determine config directory".to_string())))
}

pub fn get_config_file() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("cli.toml"))
}

impl CliSettings {
    /// Defaults, then the file (if present), then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => get_config_file()?,
        };

        let defaults = CliSettings::default();
        let settings = Config::builder()
            .set_default("agent_url", defaults.agent_url)?
            .set_default("timeout_secs", defaults.timeout_secs)?
            .set_default("poll_interval_ms", defaults.poll_interval_ms)?
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix("WORKBENCH").try_parsing(true))
            .build()?;

        let settings: CliSettings = settings.try_deserialize()?;
        if settings.timeout_secs == 0 {
            return Err(CliError::Validation("timeout_secs must be greater than zero".to_string()));
        }
        Ok(settings)
    }
}
