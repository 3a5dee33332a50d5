//! `ExecuteCommand`: run a command line as a dependency or action

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{success_codes, working_directory};
use crate::component::{Component, RunContext};
use crate::error::Result;
use crate::process::{split_arguments, ProcessSpec};
use crate::profile::ProfileElement;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Parameters: `Command` (full command line), `WorkingDirectory`,
/// `PackageName`, `RunElevated`, `Timeout`, `SuccessExitCodes`
#[derive(Debug, Clone)]
pub struct ExecuteCommand {
    name: String,
    command_line: String,
    working_dir: Option<String>,
    package: Option<String>,
    elevated: bool,
    timeout: Duration,
    success_codes: Vec<i32>,
}

impl ExecuteCommand {
    pub fn from_element(element: &ProfileElement) -> Result<Self> {
        let parameters = &element.parameters;
        Ok(Self {
            name: element.display_name(),
            command_line: parameters.get_string("Command")?,
            working_dir: parameters.get_optional_string("WorkingDirectory"),
            package: parameters.get_optional_string("PackageName"),
            elevated: parameters.get_bool_or("RunElevated", false)?,
            timeout: parameters.get_duration_or("Timeout", DEFAULT_TIMEOUT)?,
            success_codes: success_codes(parameters)?,
        })
    }

    fn spec(&self) -> ProcessSpec {
        let mut tokens = split_arguments(&self.command_line).into_iter();
        let command = tokens.next().unwrap_or_default();
        ProcessSpec::new(&command).args(tokens).elevated(self.elevated)
    }
}

#[async_trait]
impl Component for ExecuteCommand {
    async fn execute(&mut self, context: &RunContext, cancel: &CancellationToken) -> Result<()> {
        let mut spec = self.spec();
        if let Some(dir) = working_directory(context, self.working_dir.as_deref(), self.package.as_deref())? {
            spec = spec.working_dir(dir);
        }

        let handle = context.processes.execute(&spec, Some(self.timeout), cancel).await?;
        handle.throw_if_errored(&self.name, &self.success_codes)?;

        info!(component = %self.name, command = %handle.command_line(), "Command completed");
        Ok(())
    }
}
