//! Error handling for the Workbench engine
//!
//! Every failure the engine can surface is an [`EngineError`]. Errors are
//! grouped by the subsystem that raised them, and each one classifies itself
//! into an [`ErrorKind`] so the executor and the retry layer can decide
//! whether to abort, retry or attribute the failure to a workload.

use std::io;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// The main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Bad or missing configuration and component parameters
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A package, file or executable the workload needs is absent
    #[error("Dependency missing: {0}")]
    Dependency(#[from] DependencyError),

    /// Process creation, waiting and output capture
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// Control-plane requests against this or a peer agent
    #[error("Control plane error: {0}")]
    Api(#[from] ApiError),

    /// Tool output that does not match its parser's contract
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// A workload ran but signalled failure
    #[error("Workload failed: {0}")]
    Workload(#[from] WorkloadError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The run or operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic errors
    #[error("{0}")]
    Generic(String),
}

/// Configuration and parameter errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid configuration format: {reason}")]
    InvalidFormat { reason: String },

    #[error("Missing required parameter: {name}")]
    MissingParameter { name: String },

    #[error("Invalid value for '{field}': {value}")]
    InvalidValue { field: String, value: String },

    #[error("Parameter '{name}' contains an unresolved reference: {value}")]
    UnresolvedReference { name: String, value: String },

    #[error("Unknown component type: {type_name}")]
    UnknownComponent { type_name: String },

    #[error("Local agent '{agent_id}' is not part of the environment layout")]
    AgentNotInLayout { agent_id: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Configuration parsing error: {reason}")]
    ParseError { reason: String },
}

/// Missing prerequisites
#[derive(Error, Debug)]
pub enum DependencyError {
    #[error("Package '{name}' not found at {path}")]
    PackageNotFound { name: String, path: String },

    #[error("Required file not found: {path}")]
    FileNotFound { path: String },

    #[error("Command not found: {command}")]
    CommandNotFound { command: String },
}

/// Process harness errors
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to start '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("Process '{command}' did not exit within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Expected output matching '{pattern}' not seen within {timeout:?}")]
    OutputTimeout { pattern: String, timeout: Duration },

    #[error("Process '{command}' exited before expected output matching '{pattern}' appeared")]
    ExitedBeforeOutput { command: String, pattern: String },

    #[error("Failed to kill process {pid}: {reason}")]
    KillFailed { pid: u32, reason: String },

    #[error("Invalid core affinity '{spec}': {reason}")]
    InvalidAffinity { spec: String, reason: String },
}

/// Control-plane errors
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Agent at {uri} is unreachable: {reason}")]
    Unreachable { uri: String, reason: String },

    #[error("Request to {uri} returned HTTP {status}: {body}")]
    Status { uri: String, status: u16, body: String },

    #[error("Polling {what} at {uri} timed out after {timeout:?}")]
    PollingTimeout { what: String, uri: String, timeout: Duration },

    #[error("State '{name}' has not been published at {uri}")]
    MissingState { uri: String, name: String },

    #[error("Unexpected response from {uri}: {reason}")]
    InvalidResponse { uri: String, reason: String },

    #[error("Control plane server failed: {reason}")]
    ServerFailed { reason: String },
}

/// Metrics parser errors
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("{parser}: output does not match the expected schema: {reason}")]
    Schema { parser: String, reason: String },

    #[error("Unknown metrics parser: {name}")]
    UnknownParser { name: String },
}

/// Workload failures attributed to a specific component
#[derive(Error, Debug)]
pub enum WorkloadError {
    #[error("{component}: '{command}' exited with code {exit_code}: {detail}")]
    ExitCode {
        component: String,
        command: String,
        exit_code: i32,
        detail: String,
    },

    #[error("{component}: expected output marker '{marker}' missing")]
    MissingMarker { component: String, marker: String },

    #[error("{component}: {reason}")]
    Failed { component: String, reason: String },
}

/// Classification of errors used for retry and reporting decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    DependencyMissing,
    TransientInfrastructure,
    WorkloadFailure,
    Cancellation,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::DependencyMissing => "dependency_missing",
            ErrorKind::TransientInfrastructure => "transient_infrastructure",
            ErrorKind::WorkloadFailure => "workload_failure",
            ErrorKind::Cancellation => "cancellation",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Configuration => 2,
            ErrorKind::DependencyMissing => 3,
            ErrorKind::TransientInfrastructure => 4,
            ErrorKind::WorkloadFailure => 5,
            ErrorKind::Cancellation => 130,
            ErrorKind::Internal => 1,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, EngineError>;

/// A specialized result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// A specialized result type for parser operations
pub type ParseResult<T> = std::result::Result<T, ParseError>;

impl EngineError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Config(_) => ErrorKind::Configuration,
            EngineError::Dependency(_) => ErrorKind::DependencyMissing,
            EngineError::Process(error) => match error {
                ProcessError::SpawnFailed { .. } => ErrorKind::TransientInfrastructure,
                ProcessError::OutputTimeout { .. } => ErrorKind::TransientInfrastructure,
                ProcessError::ExitedBeforeOutput { .. } => ErrorKind::TransientInfrastructure,
                ProcessError::Timeout { .. } => ErrorKind::WorkloadFailure,
                ProcessError::KillFailed { .. } => ErrorKind::Internal,
                ProcessError::InvalidAffinity { .. } => ErrorKind::Configuration,
            },
            EngineError::Api(error) => match error {
                ApiError::Unreachable { .. } | ApiError::PollingTimeout { .. } | ApiError::MissingState { .. } => {
                    ErrorKind::TransientInfrastructure
                }
                ApiError::Status { status, .. } if *status >= 500 => ErrorKind::TransientInfrastructure,
                ApiError::Status { .. } => ErrorKind::Internal,
                ApiError::InvalidResponse { .. } => ErrorKind::WorkloadFailure,
                ApiError::ServerFailed { .. } => ErrorKind::Internal,
            },
            EngineError::Parse(ParseError::UnknownParser { .. }) => ErrorKind::Configuration,
            EngineError::Parse(_) => ErrorKind::WorkloadFailure,
            EngineError::Workload(_) => ErrorKind::WorkloadFailure,
            EngineError::Io(error) => match error.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                    ErrorKind::TransientInfrastructure
                }
                _ => ErrorKind::Internal,
            },
            EngineError::Serialization(_) => ErrorKind::Internal,
            EngineError::Cancelled => ErrorKind::Cancellation,
            EngineError::Generic(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error may succeed when attempted again
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientInfrastructure
    }

    /// Check if this error is a cancellation rather than a failure
    pub fn is_cancellation(&self) -> bool {
        self.kind() == ErrorKind::Cancellation
    }

    /// Get the error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config",
            EngineError::Dependency(_) => "dependency",
            EngineError::Process(_) => "process",
            EngineError::Api(_) => "api",
            EngineError::Parse(_) => "parse",
            EngineError::Workload(_) => "workload",
            EngineError::Io(_) => "io",
            EngineError::Serialization(_) => "serialization",
            EngineError::Cancelled => "cancelled",
            EngineError::Generic(_) => "generic",
        }
    }

    /// Process exit code for the agent binary
    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }
}

impl From<String> for EngineError {
    fn from(msg: String) -> Self {
        EngineError::Generic(msg)
    }
}

impl From<&str> for EngineError {
    fn from(msg: &str) -> Self {
        EngineError::Generic(msg.to_string())
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(error: reqwest::Error) -> Self {
        let uri = error
            .url()
            .map(|url| url.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());

        if error.is_decode() {
            ApiError::InvalidResponse { uri, reason: error.to_string() }
        } else if let Some(status) = error.status() {
            ApiError::Status { uri, status: status.as_u16(), body: error.to_string() }
        } else {
            ApiError::Unreachable { uri, reason: error.to_string() }
        }
    }
}
