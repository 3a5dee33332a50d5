use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use workbench_engine::api::{AgentState, ControlPlaneClient, ControlPlaneServer};
use workbench_engine::config::{ApiConfig, BackoffKind, RetryPolicyConfig};
use workbench_engine::{EngineConfig, EnvironmentLayout, RunContext};

/// Isolated agent environment rooted in a temporary directory
///
/// Every agent built from one harness shares the experiment id and the
/// packages directory, the way machines in one layout share a package
/// feed.
pub struct TestHarness {
    temp_dir: TempDir,
    experiment_id: String,
}

impl TestHarness {
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        for dir in ["packages", "state", "logs"] {
            std::fs::create_dir_all(temp_dir.path().join(dir))?;
        }

        Ok(Self {
            temp_dir,
            experiment_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Configuration with short polling intervals and fast retries
    pub fn config(&self, agent_id: &str) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.agent.agent_id = agent_id.to_string();
        config.agent.experiment_id = self.experiment_id.clone();

        config.api.bind_address = "127.0.0.1".to_string();
        config.api.request_timeout_secs = 5;

        config.execution.exit_wait_secs = 1;
        config.execution.polling_interval_ms = 50;
        config.execution.heartbeat_timeout_secs = 10;
        config.execution.online_timeout_secs = 20;

        config.retry.server_start = RetryPolicyConfig {
            max_attempts: 2,
            backoff: BackoffKind::Fixed,
            base_delay_ms: 50,
            max_delay_ms: 50,
        };
        config.retry.client_sync = RetryPolicyConfig {
            max_attempts: 3,
            backoff: BackoffKind::Fixed,
            base_delay_ms: 100,
            max_delay_ms: 100,
        };

        config.paths.packages_dir = self.root().join("packages");
        config.paths.state_dir = self.root().join("state").join(agent_id);
        config.paths.logs_dir = self.root().join("logs").join(agent_id);
        config
    }

    /// Context for `agent_id` with its own logs directory, so its metrics
    /// journal is separate from other agents in the same harness
    pub fn context(&self, agent_id: &str, layout: EnvironmentLayout) -> Result<RunContext> {
        self.context_with_agent(agent_id, layout, Arc::new(AgentState::new(agent_id)))
    }

    pub fn context_with_agent(
        &self,
        agent_id: &str,
        layout: EnvironmentLayout,
        agent: Arc<AgentState>,
    ) -> Result<RunContext> {
        let config = self.config(agent_id);
        std::fs::create_dir_all(&config.paths.logs_dir)?;
        Ok(RunContext::with_agent_state(config, layout, agent)?)
    }

    /// Context for a single-machine run
    pub fn single_node(&self, agent_id: &str) -> Result<RunContext> {
        self.context(agent_id, EnvironmentLayout::single_node(agent_id))
    }

    /// Create `packages/<name>` with the given `(relative path, contents)` files
    pub fn install_package(&self, name: &str, files: &[(&str, &str)]) -> Result<PathBuf> {
        let root = self.root().join("packages").join(name);
        std::fs::create_dir_all(&root)?;
        for (relative, contents) in files {
            let path = root.join(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, contents).with_context(|| format!("writing {}", path.display()))?;
        }
        Ok(root)
    }

    /// Records appended to the metrics journal of `context`
    pub fn journal(&self, context: &RunContext) -> Result<Vec<Value>> {
        let Some(path) = context.publisher.journal_path() else {
            return Ok(Vec::new());
        };
        if !path.exists() {
            return Ok(Vec::new());
        }

        std::fs::read_to_string(path)?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("invalid journal line"))
            .collect()
    }
}

/// A control plane served on an ephemeral loopback port
pub struct ControlPlaneFixture {
    pub agent: Arc<AgentState>,
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<workbench_engine::Result<()>>>,
}

impl ControlPlaneFixture {
    pub async fn start(agent_id: &str) -> Result<Self> {
        Self::serve(Arc::new(AgentState::new(agent_id))).await
    }

    /// Serve an existing agent state, e.g. one shared with a run context
    pub async fn serve(agent: Arc<AgentState>) -> Result<Self> {
        let address: SocketAddr = "127.0.0.1:0".parse()?;
        let server = ControlPlaneServer::bind(address, agent.clone(), None, &ApiConfig::default()).await?;
        let addr = server.local_addr();

        let shutdown = CancellationToken::new();
        let handle = server.spawn(shutdown.clone());

        Ok(Self { agent, addr, shutdown, handle: Some(handle) })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn client(&self) -> Result<ControlPlaneClient> {
        Ok(ControlPlaneClient::new(&self.url(), Duration::from_secs(5))?)
    }

    /// Stop serving and wait for the listener to close
    pub async fn stop(mut self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await??;
        }
        Ok(())
    }
}

impl Drop for ControlPlaneFixture {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
