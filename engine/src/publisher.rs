//! Metrics publication
//!
//! Parsed workload metrics are logged under the `metrics` tracing target,
//! appended to a JSON-lines journal when a logs directory is configured, and
//! kept in memory for the run report. Concurrent fan-out tasks that emit for
//! the same scenario serialise their parse+publish step through a per-scenario
//! lock so aggregate records never interleave.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::error::Result;
use crate::parser::{Metric, MetricsParser};
use crate::telemetry::EngineMetrics;

/// File name of the metrics journal inside the logs directory
pub const METRICS_JOURNAL: &str = "metrics.jsonl";

/// A published metric with its run context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRecord {
    pub timestamp: DateTime<Utc>,
    pub experiment_id: String,
    pub agent_id: String,
    pub scenario: String,
    pub tool: String,
    #[serde(flatten)]
    pub metric: Metric,
}

pub struct MetricsPublisher {
    experiment_id: String,
    agent_id: String,
    journal: Option<PathBuf>,
    scenario_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    records: Mutex<Vec<MetricRecord>>,
    service_metrics: Option<Arc<EngineMetrics>>,
}

impl std::fmt::Debug for MetricsPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsPublisher")
            .field("experiment_id", &self.experiment_id)
            .field("journal", &self.journal)
            .finish()
    }
}

impl MetricsPublisher {
    pub fn new(experiment_id: &str, agent_id: &str) -> Self {
        Self {
            experiment_id: experiment_id.to_string(),
            agent_id: agent_id.to_string(),
            journal: None,
            scenario_locks: Mutex::new(HashMap::new()),
            records: Mutex::new(Vec::new()),
            service_metrics: None,
        }
    }

    /// Append every published metric to `<logs_dir>/metrics.jsonl`
    pub fn with_journal_dir(mut self, logs_dir: &Path) -> Self {
        self.journal = Some(logs_dir.join(METRICS_JOURNAL));
        self
    }

    pub fn with_service_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.service_metrics = Some(metrics);
        self
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal.as_deref()
    }

    /// Exclusive access to the critical section of `scenario`
    pub async fn lock_scenario(&self, scenario: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.scenario_locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(scenario.to_lowercase()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Parse `output` and publish the result as one critical section per scenario
    pub async fn parse_and_publish(
        &self,
        scenario: &str,
        tool: &str,
        parser: &dyn MetricsParser,
        output: &str,
    ) -> Result<Vec<Metric>> {
        let _guard = self.lock_scenario(scenario).await;

        let metrics = match parser.parse(output) {
            Ok(metrics) => metrics,
            Err(e) => {
                if let Some(service) = &self.service_metrics {
                    service.parser_failed();
                }
                warn!(scenario, tool, parser = parser.name(), "Failed to parse workload output: {}", e);
                return Err(e.into());
            }
        };

        self.publish_unlocked(scenario, tool, &metrics).await?;
        Ok(metrics)
    }

    /// Publish already-produced metrics under the scenario lock
    pub async fn publish(&self, scenario: &str, tool: &str, metrics: &[Metric]) -> Result<()> {
        let _guard = self.lock_scenario(scenario).await;
        self.publish_unlocked(scenario, tool, metrics).await
    }

    async fn publish_unlocked(&self, scenario: &str, tool: &str, metrics: &[Metric]) -> Result<()> {
        let timestamp = Utc::now();
        let records: Vec<MetricRecord> = metrics
            .iter()
            .map(|metric| MetricRecord {
                timestamp,
                experiment_id: self.experiment_id.clone(),
                agent_id: self.agent_id.clone(),
                scenario: scenario.to_string(),
                tool: tool.to_string(),
                metric: metric.clone(),
            })
            .collect();

        for record in &records {
            info!(
                target: "metrics",
                scenario = %record.scenario,
                tool = %record.tool,
                metric = %record.metric.name,
                value = record.metric.value,
                unit = %record.metric.unit,
                "Metric"
            );
        }

        if let Some(path) = &self.journal {
            Self::append_journal(path, &records).await?;
        }

        if let Some(service) = &self.service_metrics {
            service.metrics_published(records.len());
        }

        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).extend(records);
        Ok(())
    }

    async fn append_journal(path: &Path, records: &[MetricRecord]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut buffer = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buffer, record)?;
            buffer.push(b'\n');
        }

        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
        file.write_all(&buffer).await?;
        file.flush().await?;
        Ok(())
    }

    /// Every record published so far
    pub fn records(&self) -> Vec<MetricRecord> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn records_for(&self, scenario: &str) -> Vec<MetricRecord> {
        self.records()
            .into_iter()
            .filter(|record| record.scenario.eq_ignore_ascii_case(scenario))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{CompressionCsvParser, KeyValueParser};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_publish_writes_journal() {
        let dir = TempDir::new().unwrap();
        let publisher = MetricsPublisher::new("exp-1", "vm-01").with_journal_dir(dir.path());

        let metrics = publisher
            .parse_and_publish(
                "compression_zstd",
                "lzbench",
                &CompressionCsvParser,
                "zstd 1.5.5 -1,512.30,1580.12,211938580,73654000,34.75,silesia.tar",
            )
            .await
            .unwrap();
        assert_eq!(metrics.len(), 3);

        let journal = std::fs::read_to_string(dir.path().join(METRICS_JOURNAL)).unwrap();
        let lines: Vec<&str> = journal.lines().collect();
        assert_eq!(lines.len(), 3);
        let first: MetricRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.scenario, "compression_zstd");
        assert_eq!(first.metric.name, "Compression Speed");
        assert_eq!(first.experiment_id, "exp-1");
    }

    #[tokio::test]
    async fn test_parse_failure_publishes_nothing() {
        let publisher = MetricsPublisher::new("exp-1", "vm-01");
        let result = publisher.parse_and_publish("s", "tool", &KeyValueParser, "").await;
        assert!(result.is_err());
        assert!(publisher.records().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_publishers_do_not_interleave() {
        let publisher = Arc::new(MetricsPublisher::new("exp-1", "vm-01"));

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let publisher = publisher.clone();
                tokio::spawn(async move {
                    let output = format!("a: {i}\nb: {i}\nc: {i}\n");
                    publisher.parse_and_publish("fanout", "tool", &KeyValueParser, &output).await.unwrap();
                })
            })
            .collect();
        for task in futures::future::join_all(tasks).await {
            task.unwrap();
        }

        let records = publisher.records_for("fanout");
        assert_eq!(records.len(), 24);
        for chunk in records.chunks(3) {
            assert!(chunk.iter().all(|r| r.metric.value == chunk[0].metric.value));
            let names: Vec<&str> = chunk.iter().map(|r| r.metric.name.as_str()).collect();
            assert_eq!(names, vec!["a", "b", "c"]);
        }
    }
}
