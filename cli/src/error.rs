use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {message}")]
    Api { message: String },

    #[error("State '{name}' not found")]
    StateNotFound { name: String },

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("Operation timed out")]
    Timeout,

    #[error("Agent unavailable at {url}")]
    ServiceUnavailable { url: String },
}

impl CliError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CliError::ServiceUnavailable { .. } | CliError::Timeout)
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) => 2,
            CliError::Validation(_) => 2,
            CliError::StateNotFound { .. } => 3,
            CliError::Api { .. } => 8,
            CliError::ServiceUnavailable { .. } => 10,
            CliError::Cancelled => 130,
            CliError::Timeout => 124,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, CliError>;

/// Format error for user-friendly display
pub fn format_error(error: &CliError) -> String {
    match error {
        CliError::Config(e) => {
            format!("Configuration Error: {}\n\nCheck ~/.config/workbench/cli.toml and WORKBENCH_* variables.", e)
        }
        CliError::ServiceUnavailable { url } => {
            format!(
                "Agent Unavailable: nothing answered at {}.\n\nCheck that workbench-agent is running with its control plane enabled.",
                url
            )
        }
        CliError::StateNotFound { name } => {
            format!("State Not Found: '{}'.\n\nThe server workload may not have published it yet.", name)
        }
        CliError::Timeout => "Operation timed out.\n\nRaise --timeout or check the agent's network reachability.".to_string(),
        CliError::Cancelled => "Operation cancelled by user.".to_string(),
        _ => error.to_string(),
    }
}
