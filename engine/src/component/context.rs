//! Run-scoped context handed to every component

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::api::{AgentState, ApiClientManager};
use crate::config::EngineConfig;
use crate::error::{ConfigResult, Result};
use crate::firewall::{FirewallManager, LoggingFirewall};
use crate::layout::{ClientInstance, EnvironmentLayout, Role};
use crate::packages::PackageStore;
use crate::process::ProcessManager;
use crate::publisher::MetricsPublisher;
use crate::retry::RetryPolicy;
use crate::telemetry::EngineMetrics;

/// Everything a component may use during a run.
///
/// Replaces process-wide mutable flags: the reboot request lives here and is
/// cleared only by the executor when a run starts.
pub struct RunContext {
    pub agent_id: String,
    pub experiment_id: String,
    pub layout: EnvironmentLayout,
    pub config: EngineConfig,
    pub api: Arc<ApiClientManager>,
    pub processes: Arc<ProcessManager>,
    pub packages: PackageStore,
    pub firewall: Arc<dyn FirewallManager>,
    pub publisher: Arc<MetricsPublisher>,
    pub service_metrics: Arc<EngineMetrics>,
    reboot_requested: AtomicBool,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("agent_id", &self.agent_id)
            .field("experiment_id", &self.experiment_id)
            .field("layout", &self.layout)
            .finish()
    }
}

impl RunContext {
    /// Context with a fresh local agent state
    pub fn new(config: EngineConfig, layout: EnvironmentLayout) -> Result<Self> {
        let agent = Arc::new(AgentState::new(&config.agent.agent_id));
        Self::with_agent_state(config, layout, agent)
    }

    /// Context sharing `agent` with a control-plane server
    pub fn with_agent_state(config: EngineConfig, layout: EnvironmentLayout, agent: Arc<AgentState>) -> Result<Self> {
        let service_metrics = Arc::new(EngineMetrics::new()?);
        let api = Arc::new(ApiClientManager::new(
            agent,
            config.api.port,
            Duration::from_secs(config.api.request_timeout_secs),
        ));

        let mut publisher = MetricsPublisher::new(&config.agent.experiment_id, &config.agent.agent_id)
            .with_service_metrics(service_metrics.clone());
        if config.paths.logs_dir.is_dir() {
            publisher = publisher.with_journal_dir(&config.paths.logs_dir);
        }

        Ok(Self {
            agent_id: config.agent.agent_id.clone(),
            experiment_id: config.agent.experiment_id.clone(),
            packages: PackageStore::new(&config.paths.packages_dir),
            processes: Arc::new(ProcessManager::new().with_metrics(service_metrics.clone())),
            firewall: Arc::new(LoggingFirewall::new()),
            publisher: Arc::new(publisher),
            service_metrics,
            api,
            layout,
            config,
            reboot_requested: AtomicBool::new(false),
        })
    }

    pub fn with_firewall(mut self, firewall: Arc<dyn FirewallManager>) -> Self {
        self.firewall = firewall;
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<MetricsPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_service_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.service_metrics = metrics;
        self
    }

    /// The layout entry for this machine
    pub fn local_instance(&self) -> ConfigResult<ClientInstance> {
        self.layout.get_self(&self.agent_id)
    }

    pub fn is_role(&self, role: Role) -> ConfigResult<bool> {
        self.layout.is_role(&self.agent_id, role)
    }

    /// Flip the readiness signal served on `/status/online`
    pub fn set_server_online(&self, online: bool) {
        self.api.local_state().set_online(online);
    }

    pub fn request_reboot(&self) {
        info!(agent_id = %self.agent_id, "Reboot requested");
        self.reboot_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_reboot_requested(&self) -> bool {
        self.reboot_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_reboot_request(&self) {
        self.reboot_requested.store(false, Ordering::SeqCst);
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.config.execution.polling_interval_ms.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.config.execution.heartbeat_timeout_secs)
    }

    pub fn online_timeout(&self) -> Duration {
        Duration::from_secs(self.config.execution.online_timeout_secs)
    }

    /// Short policy guarding a single server start
    pub fn server_start_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config("server_start", &self.config.retry.server_start)
            .with_metrics(self.service_metrics.clone())
    }

    /// Longer policy guarding the client-to-server synchronization flow
    pub fn client_sync_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config("client_sync", &self.config.retry.client_sync)
            .with_metrics(self.service_metrics.clone())
    }
}
