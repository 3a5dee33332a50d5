//! Service metrics for the agent
//!
//! Counters describing what the engine itself did (components run, processes
//! started, retries, metrics emitted). These are operational metrics of the
//! agent, distinct from the benchmark [`Metric`](crate::parser::Metric)s that
//! workloads produce. With the `metrics` feature disabled every recording call
//! is a no-op and [`EngineMetrics::export`] returns an empty document.

#[cfg(feature = "metrics")]
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

#[cfg(feature = "metrics")]
use crate::error::EngineError;
use crate::error::Result;

/// Operational counters registered in a private registry
#[cfg(feature = "metrics")]
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    components_executed: IntCounterVec,
    processes_started: IntCounter,
    retry_attempts: IntCounter,
    metrics_published: IntCounter,
    parser_failures: IntCounter,
}

#[cfg(feature = "metrics")]
impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics")
            .field("processes_started", &self.processes_started.get())
            .field("metrics_published", &self.metrics_published.get())
            .finish()
    }
}

#[cfg(feature = "metrics")]
impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let register_error = |e: prometheus::Error| EngineError::Generic(format!("metrics registration failed: {}", e));

        let components_executed = IntCounterVec::new(
            Opts::new("workbench_components_executed_total", "Component executions by stage and outcome"),
            &["stage", "outcome"],
        )
        .map_err(register_error)?;
        let processes_started =
            IntCounter::new("workbench_processes_started_total", "Processes started by the harness").map_err(register_error)?;
        let retry_attempts =
            IntCounter::new("workbench_retry_attempts_total", "Retries performed under a retry policy").map_err(register_error)?;
        let metrics_published =
            IntCounter::new("workbench_metrics_published_total", "Workload metrics emitted").map_err(register_error)?;
        let parser_failures =
            IntCounter::new("workbench_parser_failures_total", "Tool outputs rejected by a parser").map_err(register_error)?;

        registry.register(Box::new(components_executed.clone())).map_err(register_error)?;
        registry.register(Box::new(processes_started.clone())).map_err(register_error)?;
        registry.register(Box::new(retry_attempts.clone())).map_err(register_error)?;
        registry.register(Box::new(metrics_published.clone())).map_err(register_error)?;
        registry.register(Box::new(parser_failures.clone())).map_err(register_error)?;

        Ok(Self {
            registry,
            components_executed,
            processes_started,
            retry_attempts,
            metrics_published,
            parser_failures,
        })
    }

    pub fn component_executed(&self, stage: &str, outcome: &str) {
        self.components_executed.with_label_values(&[stage, outcome]).inc();
    }

    pub fn process_started(&self) {
        self.processes_started.inc();
    }

    pub fn retry_attempted(&self) {
        self.retry_attempts.inc();
    }

    pub fn metrics_published(&self, count: usize) {
        self.metrics_published.inc_by(count as u64);
    }

    pub fn parser_failed(&self) {
        self.parser_failures.inc();
    }

    /// Prometheus text exposition of every counter
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| EngineError::Generic(format!("metrics export failed: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| EngineError::Generic(e.to_string()))
    }
}

#[cfg(not(feature = "metrics"))]
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics;

#[cfg(not(feature = "metrics"))]
impl EngineMetrics {
    pub fn new() -> Result<Self> {
        Ok(Self)
    }

    pub fn component_executed(&self, _stage: &str, _outcome: &str) {}

    pub fn process_started(&self) {}

    pub fn retry_attempted(&self) {}

    pub fn metrics_published(&self, _count: usize) {}

    pub fn parser_failed(&self) {}

    pub fn export(&self) -> Result<String> {
        Ok(String::new())
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_counters() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.component_executed("action", "succeeded");
        metrics.process_started();
        metrics.metrics_published(3);

        let exported = metrics.export().unwrap();
        assert!(exported.contains("workbench_components_executed_total{outcome=\"succeeded\",stage=\"action\"} 1"));
        assert!(exported.contains("workbench_processes_started_total 1"));
        assert!(exported.contains("workbench_metrics_published_total 3"));
    }
}
