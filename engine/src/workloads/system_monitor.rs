//! `SystemMonitor`: periodic CPU and memory samples

use std::time::Duration;

use async_trait::async_trait;
use sysinfo::System;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::metric_scenario;
use crate::component::{Component, RunContext};
use crate::error::{ConfigError, Result};
use crate::parser::{Metric, MetricRelativity};
use crate::profile::ProfileElement;

const DEFAULT_FREQUENCY: Duration = Duration::from_secs(5);
const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;
const TOOL: &str = "sysinfo";

#[derive(Debug, Clone)]
pub struct SystemMonitor {
    frequency: Duration,
    scenario: String,
}

impl SystemMonitor {
    pub fn from_element(element: &ProfileElement) -> Result<Self> {
        let parameters = &element.parameters;
        Ok(Self {
            frequency: parameters.get_duration_or("MonitorFrequency", DEFAULT_FREQUENCY)?,
            scenario: metric_scenario(parameters, &element.component_type),
        })
    }

    fn sample(system: &mut System) -> Vec<Metric> {
        system.refresh_cpu();
        system.refresh_memory();

        vec![
            Metric::new("cpu_usage", f64::from(system.global_cpu_info().cpu_usage()), "%", MetricRelativity::Undefined),
            Metric::new("memory_used", system.used_memory() as f64 / BYTES_PER_MIB, "MiB", MetricRelativity::Undefined),
            Metric::new(
                "memory_available",
                system.available_memory() as f64 / BYTES_PER_MIB,
                "MiB",
                MetricRelativity::Undefined,
            ),
        ]
    }
}

#[async_trait]
impl Component for SystemMonitor {
    fn validate(&self) -> Result<()> {
        if self.frequency.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "MonitorFrequency".to_string(),
                value: "0".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Samples until cancelled; cancellation ends monitoring normally
    async fn execute(&mut self, context: &RunContext, cancel: &CancellationToken) -> Result<()> {
        let mut system = System::new();
        system.refresh_cpu();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.frequency) => {}
            }

            let metrics = Self::sample(&mut system);
            context.publisher.publish(&self.scenario, TOOL, &metrics).await?;
        }

        debug!(scenario = %self.scenario, "System monitor stopped");
        Ok(())
    }
}
