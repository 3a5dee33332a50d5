//! Configuration management for the Workbench agent
//!
//! This module handles loading, parsing, and validating configuration
//! from TOML files and environment variables.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Main configuration structure for the agent
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Identity of this agent within a run
    pub agent: AgentConfig,

    /// Control-plane server configuration
    pub api: ApiConfig,

    /// Profile execution defaults
    pub execution: ExecutionConfig,

    /// Retry policies used at the client/server seams
    pub retry: RetryPolicies,

    /// Well-known directories
    pub paths: PathsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Agent identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Name matched against the environment layout
    pub agent_id: String,

    /// Correlation id for all telemetry of a run
    pub experiment_id: String,
}

/// Control-plane server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Host the control plane during `run`
    pub enabled: bool,

    /// Bind address
    pub bind_address: String,

    /// Port shared by every agent in a layout
    pub port: u16,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,

    /// Maximum accepted request body in bytes
    pub max_request_bytes: usize,
}

/// Profile execution defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Grace period for monitors and cleanup after actions finish
    pub exit_wait_secs: u64,

    /// Stop remaining actions of an iteration on the first failure
    pub fail_fast: bool,

    /// Minimum time between the starts of two iterations
    pub min_execution_interval_secs: Option<u64>,

    /// Interval between control-plane polls
    pub polling_interval_ms: u64,

    /// How long a client waits for a peer heartbeat
    pub heartbeat_timeout_secs: u64,

    /// How long a client waits for a peer to report online
    pub online_timeout_secs: u64,
}

/// Named retry policies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicies {
    /// Guards a single server start against port and bind races
    pub server_start: RetryPolicyConfig,

    /// Guards the whole client-to-server synchronization flow
    pub client_sync: RetryPolicyConfig,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicyConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,

    /// Backoff curve
    pub backoff: BackoffKind,

    /// Base delay in milliseconds
    pub base_delay_ms: u64,

    /// Upper bound for exponential delays in milliseconds
    pub max_delay_ms: u64,
}

/// Backoff curves supported by retry policies
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Linear,
    Exponential,
}

/// Well-known directories
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding installed workload packages
    pub packages_dir: PathBuf,

    /// Scratch directory for component state
    pub state_dir: PathBuf,

    /// Directory for log files and the metrics journal
    pub logs_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,

    /// Log format (plain or json)
    pub format: String,

    /// Optional daily-rolled log file
    pub file_path: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let agent_id = sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string());

        Self {
            agent_id,
            experiment_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0".to_string(),
            port: 4500,
            request_timeout_secs: 30,
            max_request_bytes: 1024 * 1024, // 1MB
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            exit_wait_secs: 10,
            fail_fast: false,
            min_execution_interval_secs: None,
            polling_interval_ms: 1000,
            heartbeat_timeout_secs: 600,  // 10 minutes
            online_timeout_secs: 3600,    // 1 hour
        }
    }
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            server_start: RetryPolicyConfig {
                max_attempts: 3,
                backoff: BackoffKind::Linear,
                base_delay_ms: 2000,
                max_delay_ms: 10_000,
            },
            client_sync: RetryPolicyConfig {
                max_attempts: 10,
                backoff: BackoffKind::Exponential,
                base_delay_ms: 1000,
                max_delay_ms: 30_000,
            },
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir()
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp")))
            .join("workbench");

        Self {
            packages_dir: base.join("packages"),
            state_dir: base.join("state"),
            logs_dir: base.join("logs"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "plain".to_string(),
            file_path: None,
        }
    }
}

impl RetryPolicyConfig {
    fn validate(&self, field: &str) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.max_attempts", field),
                value: "0".to_string(),
            });
        }

        if self.backoff == BackoffKind::Exponential && self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.max_delay_ms", field),
                value: self.max_delay_ms.to_string(),
            });
        }

        Ok(())
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound { path: path.to_string_lossy().to_string() })?;

        let config: EngineConfig = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError { reason: e.to_string() })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        if let Ok(agent_id) = std::env::var("WORKBENCH_AGENT_ID") {
            self.agent.agent_id = agent_id;
        }

        if let Ok(port) = std::env::var("WORKBENCH_API_PORT") {
            self.api.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                field: "WORKBENCH_API_PORT".to_string(),
                value: port,
            })?;
        }

        if let Ok(packages_dir) = std::env::var("WORKBENCH_PACKAGES_DIR") {
            self.paths.packages_dir = PathBuf::from(packages_dir);
        }

        if let Ok(log_level) = std::env::var("WORKBENCH_LOG_LEVEL") {
            self.logging.level = log_level;
        }

        if let Ok(fail_fast) = std::env::var("WORKBENCH_FAIL_FAST") {
            self.execution.fail_fast = fail_fast.parse().map_err(|_| ConfigError::InvalidValue {
                field: "WORKBENCH_FAIL_FAST".to_string(),
                value: fail_fast,
            })?;
        }

        Ok(())
    }

    /// Load configuration from environment variables over defaults
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = EngineConfig::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with fallback order: defaults -> file -> env
    pub fn load_with_fallback<P: AsRef<Path>>(config_path: Option<P>) -> ConfigResult<Self> {
        let mut config = EngineConfig::default();

        if let Some(path) = config_path {
            if path.as_ref().exists() {
                config = EngineConfig::from_file(path)?;
            }
        }

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.agent.agent_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "agent.agent_id".to_string(),
                value: String::new(),
            });
        }

        if self.api.enabled && self.api.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "api.port".to_string(),
                value: "0".to_string(),
            });
        }

        if self.execution.polling_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "execution.polling_interval_ms".to_string(),
                value: "0".to_string(),
            });
        }

        self.retry.server_start.validate("retry.server_start")?;
        self.retry.client_sync.validate("retry.client_sync")?;

        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> ConfigResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("workbench").join("agent.toml"))
            .ok_or_else(|| ConfigError::ValidationFailed {
                reason: "Unable to determine config directory".to_string(),
            })
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|_| ConfigError::ValidationFailed {
                reason: format!("Unable to create config directory: {}", parent.display()),
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ValidationFailed { reason: e.to_string() })?;

        fs::write(path, content)
            .map_err(|e| ConfigError::ValidationFailed { reason: format!("{}: {}", path.display(), e) })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.api.port, 4500);
        assert_eq!(config.retry.server_start.backoff, BackoffKind::Linear);
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();

        config.api.port = 0;
        assert!(config.validate().is_err());

        // Port 0 is fine when the API is not hosted
        config.api.enabled = false;
        assert!(config.validate().is_ok());

        config.retry.client_sync.max_attempts = 0;
        assert!(config.validate().is_err());

        config.retry.client_sync.max_attempts = 3;
        config.retry.client_sync.max_delay_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = EngineConfig::default();
        config.agent.agent_id = "server-01".to_string();
        config.execution.fail_fast = true;
        let temp_file = NamedTempFile::new().unwrap();

        config.save_to_file(temp_file.path()).unwrap();
        let loaded = EngineConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(loaded.agent.agent_id, "server-01");
        assert!(loaded.execution.fail_fast);
        assert_eq!(loaded.retry.client_sync, config.retry.client_sync);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "[api]\nport = 5500\n\n[agent]\nagent_id = \"client-01\"").unwrap();

        let config = EngineConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.api.port, 5500);
        assert_eq!(config.agent.agent_id, "client-01");
        assert_eq!(config.execution.exit_wait_secs, 10);
    }

    #[test]
    fn test_missing_file() {
        let result = EngineConfig::from_file("/nonexistent/workbench/agent.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }
}
