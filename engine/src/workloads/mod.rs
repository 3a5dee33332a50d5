//! Built-in components
//!
//! Single-machine building blocks ([`ExecuteCommand`], [`RequirePackage`],
//! [`WorkloadExecutor`], [`SystemMonitor`]) and the multi-role pair
//! ([`ServerWorkload`], [`ClientWorkload`]) that other client/server
//! workloads are modelled on.

pub mod client;
pub mod execute_command;
pub mod require_package;
pub mod server;
pub mod system_monitor;
pub mod workload_executor;

use std::path::PathBuf;

pub use client::ClientWorkload;
pub use execute_command::ExecuteCommand;
pub use require_package::RequirePackage;
pub use server::ServerWorkload;
pub use system_monitor::SystemMonitor;
pub use workload_executor::WorkloadExecutor;

use crate::component::RunContext;
use crate::error::{ConfigError, ConfigResult, Result};
use crate::profile::Parameters;

/// Parse `SuccessExitCodes` (`"0,3010"`); defaults to `[0]`
pub(crate) fn success_codes(parameters: &Parameters) -> ConfigResult<Vec<i32>> {
    let Some(raw) = parameters.get_optional_string("SuccessExitCodes") else {
        return Ok(vec![0]);
    };

    raw.split(',')
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(|code| {
            code.parse::<i32>().map_err(|_| ConfigError::InvalidValue {
                field: "SuccessExitCodes".to_string(),
                value: raw.clone(),
            })
        })
        .collect()
}

/// Scenario name under which a component's metrics are published
pub(crate) fn metric_scenario(parameters: &Parameters, component_type: &str) -> String {
    parameters
        .get_optional_string("MetricScenario")
        .or_else(|| parameters.get_optional_string("Scenario"))
        .unwrap_or_else(|| component_type.to_string())
}

/// Working directory: explicit `WorkingDirectory`, else the package root, else none
pub(crate) fn working_directory(
    context: &RunContext,
    working_dir: Option<&str>,
    package: Option<&str>,
) -> Result<Option<PathBuf>> {
    if let Some(dir) = working_dir {
        return Ok(Some(PathBuf::from(dir)));
    }
    match package {
        Some(package) => Ok(Some(context.packages.get_platform_path(package)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_codes() {
        assert_eq!(success_codes(&Parameters::new()).unwrap(), vec![0]);
        assert_eq!(success_codes(&Parameters::new().with("SuccessExitCodes", "0, 3010")).unwrap(), vec![0, 3010]);
        assert!(success_codes(&Parameters::new().with("SuccessExitCodes", "zero")).is_err());
    }

    #[test]
    fn test_metric_scenario_precedence() {
        let parameters = Parameters::new().with("Scenario", "zstd").with("MetricScenario", "compression_zstd");
        assert_eq!(metric_scenario(&parameters, "WorkloadExecutor"), "compression_zstd");
        assert_eq!(metric_scenario(&Parameters::new(), "WorkloadExecutor"), "WorkloadExecutor");
    }
}
