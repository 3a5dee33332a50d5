//! `WorkloadExecutor`: run one benchmark tool locally and publish its metrics

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{metric_scenario, success_codes, working_directory};
use crate::component::{Component, RunContext};
use crate::error::{ConfigError, Result};
use crate::parser::{parser_for, MetricsParser};
use crate::process::{CpuAffinity, ProcessSpec, WorkloadExpectation};
use crate::profile::ProfileElement;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(4 * 3600);

pub struct WorkloadExecutor {
    name: String,
    command: String,
    arguments: String,
    package: Option<String>,
    working_dir: Option<String>,
    elevated: bool,
    timeout: Duration,
    affinity: Option<CpuAffinity>,
    parser: Box<dyn MetricsParser>,
    scenario: String,
    expectation: WorkloadExpectation,
}

impl std::fmt::Debug for WorkloadExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadExecutor")
            .field("name", &self.name)
            .field("command", &self.command)
            .field("arguments", &self.arguments)
            .field("parser", &self.parser.name())
            .field("scenario", &self.scenario)
            .finish()
    }
}

impl WorkloadExecutor {
    pub fn from_element(element: &ProfileElement) -> Result<Self> {
        let parameters = &element.parameters;

        let affinity = parameters
            .get_optional_string("CoreAffinity")
            .map(|spec| spec.parse::<CpuAffinity>())
            .transpose()?;

        let required_markers = parameters
            .get_optional_string("SuccessMarker")
            .map(|marker| {
                Regex::new(&marker).map_err(|e| ConfigError::InvalidValue {
                    field: "SuccessMarker".to_string(),
                    value: e.to_string(),
                })
            })
            .transpose()?
            .into_iter()
            .collect();

        Ok(Self {
            name: element.display_name(),
            command: parameters.get_string("Command")?,
            arguments: parameters.get_string_or("CommandArguments", ""),
            package: parameters.get_optional_string("PackageName"),
            working_dir: parameters.get_optional_string("WorkingDirectory"),
            elevated: parameters.get_bool_or("RunElevated", false)?,
            timeout: parameters.get_duration_or("Timeout", DEFAULT_TIMEOUT)?,
            affinity,
            parser: parser_for(&parameters.get_string("MetricsParser")?)?,
            scenario: metric_scenario(parameters, &element.component_type),
            expectation: WorkloadExpectation {
                success_codes: success_codes(parameters)?,
                required_markers,
                fail_on_stderr: parameters.get_bool_or("FailOnStandardError", false)?,
            },
        })
    }
}

#[async_trait]
impl Component for WorkloadExecutor {
    async fn initialize(&mut self, _context: &RunContext, _cancel: &CancellationToken) -> Result<()> {
        if let Some(affinity) = &self.affinity {
            affinity.validate_against(num_cpus::get())?;
        }
        Ok(())
    }

    async fn execute(&mut self, context: &RunContext, cancel: &CancellationToken) -> Result<()> {
        let mut spec = ProcessSpec::with_argument_line(&self.command, &self.arguments).elevated(self.elevated);
        if let Some(dir) = working_directory(context, self.working_dir.as_deref(), self.package.as_deref())? {
            spec = spec.working_dir(dir);
        }

        let mut handle = context.processes.start(&spec)?;
        if let Some(affinity) = &self.affinity {
            handle.apply_affinity(affinity);
        }

        handle.wait_for_exit(Some(self.timeout), cancel).await?;
        handle.throw_if_workload_failed(&self.name, &self.expectation)?;
        debug!(component = %self.name, bytes = handle.stdout().len(), "Workload output captured");

        let metrics = context
            .publisher
            .parse_and_publish(&self.scenario, &self.command, self.parser.as_ref(), &handle.stdout().contents())
            .await?;

        info!(component = %self.name, scenario = %self.scenario, metrics = metrics.len(), "Workload completed");
        Ok(())
    }
}
