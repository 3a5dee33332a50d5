//! `ClientWorkload`: the load-generating side of a client/server benchmark
//!
//! For every server in the layout, concurrently and each under the client
//! sync retry policy:
//!
//! 1. poll the server's heartbeat, then its application readiness
//! 2. register for exit notification (multi-role only, best-effort). A
//!    registration is kept for dispose whatever the tool's outcome.
//! 3. fetch the server's state document when `ServerStateName` is set
//! 4. run `ClientInstances` copies of the tool per published port
//! 5. parse and publish each copy's output under the scenario lock
//!
//! The execution completes once every target has finished or failed.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{metric_scenario, success_codes, working_directory};
use crate::api::{poll_for_heartbeat, poll_for_server_online, ControlPlane};
use crate::component::{Component, RunContext};
use crate::error::{ApiError, ConfigError, EngineError, Result};
use crate::layout::{ClientInstance, Role};
use crate::parser::{parser_for, MetricsParser};
use crate::process::ProcessSpec;
use crate::profile::ProfileElement;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

pub struct ClientWorkload {
    name: String,
    command: String,
    command_line: String,
    package: Option<String>,
    client_instances: u32,
    server_state_name: Option<String>,
    parser: Option<Box<dyn MetricsParser>>,
    scenario: String,
    timeout: Duration,
    warm_up: bool,
    elevated: bool,
    success_codes: Vec<i32>,
    warmed_up: bool,
    /// Servers holding an exit-notification registration for this agent
    registered: Mutex<Vec<ClientInstance>>,
}

impl std::fmt::Debug for ClientWorkload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientWorkload")
            .field("name", &self.name)
            .field("command", &self.command)
            .field("command_line", &self.command_line)
            .field("client_instances", &self.client_instances)
            .field("warm_up", &self.warm_up)
            .finish()
    }
}

/// Substitute the target into a command-line template. `{0}` and
/// `{ServerIp}` are the server address.
fn render(template: &str, server: &ClientInstance, port: Option<u16>, client: u32) -> String {
    let address = server.ip_address.to_string();
    let mut rendered = template
        .replace("{0}", &address)
        .replace("{ServerIp}", &address)
        .replace("{ServerName}", &server.name)
        .replace("{ClientInstance}", &client.to_string());

    if let Some(port) = port {
        rendered = rendered.replace("{Port}", &port.to_string());
    }
    rendered
}

/// Read `Ports` (`"9092,9093"` or a single number) from a server state document
fn ports_from_state(endpoint: &str, document: &Value) -> Result<Vec<u16>> {
    let invalid = |reason: String| ApiError::InvalidResponse { uri: endpoint.to_string(), reason };

    let raw = match document.get("Ports") {
        Some(Value::String(ports)) => ports.clone(),
        Some(Value::Number(port)) => port.to_string(),
        Some(other) => return Err(invalid(format!("unexpected Ports value {}", other)).into()),
        None => return Err(invalid("state document has no Ports field".to_string()).into()),
    };

    let ports = raw
        .split(',')
        .map(str::trim)
        .filter(|port| !port.is_empty())
        .map(|port| port.parse::<u16>().map_err(|_| invalid(format!("invalid port '{}'", port))))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if ports.is_empty() {
        return Err(invalid("state document lists no ports".to_string()).into());
    }
    Ok(ports)
}

impl ClientWorkload {
    pub fn from_element(element: &ProfileElement) -> Result<Self> {
        let parameters = &element.parameters;

        let client_instances = u32::try_from(parameters.get_u64_or("ClientInstances", 1)?).map_err(|_| {
            ConfigError::InvalidValue {
                field: "ClientInstances".to_string(),
                value: parameters.get_string_or("ClientInstances", ""),
            }
        })?;

        let parser = parameters
            .get_optional_string("MetricsParser")
            .map(|name| parser_for(&name))
            .transpose()?;

        Ok(Self {
            name: element.display_name(),
            command: parameters.get_string("Command")?,
            command_line: parameters.get_string_or("CommandLine", ""),
            package: parameters.get_optional_string("PackageName"),
            client_instances,
            server_state_name: parameters.get_optional_string("ServerStateName"),
            parser,
            scenario: metric_scenario(parameters, &element.component_type),
            timeout: parameters.get_duration_or("Timeout", DEFAULT_TIMEOUT)?,
            warm_up: parameters.get_bool_or("WarmUp", false)?,
            elevated: parameters.get_bool_or("RunElevated", false)?,
            success_codes: success_codes(parameters)?,
            warmed_up: false,
            registered: Mutex::new(Vec::new()),
        })
    }

    /// Copies of the tool to run per port; a warm-up runs one
    fn copies_per_port(&self) -> u32 {
        if self.warm_up {
            1
        } else {
            self.client_instances
        }
    }

    fn is_registered(&self, server: &ClientInstance) -> bool {
        self.registered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .any(|known| known.name == server.name)
    }

    /// Synchronize with one server and run the tool against it
    async fn run_against(
        &self,
        context: &RunContext,
        server: &ClientInstance,
        local: &ClientInstance,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let plane = context.api.for_instance(server)?;
        let interval = context.polling_interval();

        poll_for_heartbeat(plane.as_ref(), context.heartbeat_timeout(), interval, cancel).await?;
        poll_for_server_online(plane.as_ref(), context.online_timeout(), interval, cancel).await?;
        debug!(component = %self.name, server = %server.name, "Server online");

        if context.layout.is_multi_role() {
            self.register_exit(plane.as_ref(), server, local).await;
        }

        let ports = match &self.server_state_name {
            Some(state_name) => {
                let document = plane.get_state(state_name).await?.ok_or_else(|| ApiError::MissingState {
                    uri: plane.endpoint(),
                    name: state_name.clone(),
                })?;
                ports_from_state(&plane.endpoint(), &document)?.into_iter().map(Some).collect()
            }
            None => vec![None],
        };

        let root = working_directory(context, None, self.package.as_deref())?;
        let mut specs = Vec::new();
        for port in ports {
            for client in 0..self.copies_per_port() {
                let arguments = render(&self.command_line, server, port, client);
                let mut spec = ProcessSpec::with_argument_line(&self.command, &arguments).elevated(self.elevated);
                if let Some(root) = &root {
                    spec = spec.working_dir(root);
                }
                specs.push(spec);
            }
        }

        let mut handles = specs
            .iter()
            .map(|spec| context.processes.start(spec))
            .collect::<Result<Vec<_>>>()?;

        try_join_all(handles.iter_mut().map(|handle| handle.wait_for_exit(Some(self.timeout), cancel))).await?;

        for handle in &handles {
            handle.throw_if_errored(&self.name, &self.success_codes)?;
        }

        if self.warm_up {
            info!(component = %self.name, server = %server.name, "Warm-up run completed");
        } else if let Some(parser) = &self.parser {
            for handle in &handles {
                context
                    .publisher
                    .parse_and_publish(&self.scenario, &self.command, parser.as_ref(), &handle.stdout().contents())
                    .await?;
            }
        }

        info!(component = %self.name, server = %server.name, processes = handles.len(), "Client workload completed");
        Ok(())
    }

    async fn register_exit(&self, plane: &dyn ControlPlane, server: &ClientInstance, local: &ClientInstance) {
        if self.is_registered(server) {
            return;
        }

        match plane.register_exit_notification(&local.name).await {
            Ok(()) => {
                let mut registered = self.registered.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if !registered.iter().any(|known| known.name == server.name) {
                    registered.push(server.clone());
                }
            }
            Err(e) => {
                warn!(component = %self.name, server = %server.name, "Exit notification registration failed: {}", e);
            }
        }
    }
}

#[async_trait]
impl Component for ClientWorkload {
    fn validate(&self) -> Result<()> {
        if self.client_instances == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ClientInstances".to_string(),
                value: "0".to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn execute(&mut self, context: &RunContext, cancel: &CancellationToken) -> Result<()> {
        if !context.is_role(Role::Client)? {
            debug!(component = %self.name, "Not a client in this layout; skipping");
            return Ok(());
        }

        if self.warm_up && self.warmed_up {
            info!(component = %self.name, "Server already warmed up; skipping");
            return Ok(());
        }

        let servers = context.layout.get_instances(Role::Server);
        if servers.is_empty() {
            return Err(ConfigError::ValidationFailed { reason: "layout has no server instances".to_string() }.into());
        }

        let local = context.local_instance()?;
        let policy = context.client_sync_policy();

        let this = &*self;
        let results = join_all(servers.iter().map(|server| {
            let local = &local;
            let policy = &policy;
            async move {
                let outcome = policy
                    .execute(cancel, |attempt| {
                        debug!(component = %this.name, server = %server.name, attempt, "Synchronizing with server");
                        this.run_against(context, server, local, cancel)
                    })
                    .await;
                (server, outcome)
            }
        }))
        .await;

        let mut first_error: Option<EngineError> = None;
        for (server, outcome) in results {
            if let Err(e) = outcome {
                warn!(component = %self.name, server = %server.name, "Client workload failed: {}", e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }

        if self.warm_up {
            self.warmed_up = true;
        }
        Ok(())
    }

    async fn dispose(&mut self, context: &RunContext) -> Result<()> {
        let registered = std::mem::take(self.registered.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner()));
        if registered.is_empty() {
            return Ok(());
        }

        let local = context.local_instance()?;
        for server in registered {
            let result = match context.api.for_instance(&server) {
                Ok(plane) => plane.notify_exit(&local.name).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(component = %self.name, server = %server.name, "Exit notification failed: {}", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;
    use tempfile::TempDir;

    use crate::api::{AgentState, LocalControlPlane};
    use crate::config::EngineConfig;
    use crate::error::ErrorKind;
    use crate::layout::EnvironmentLayout;

    const LAYOUT: &str = r#"{ "clients": [
        { "name": "client-01", "ipAddress": "10.0.0.4", "role": "Client" },
        { "name": "server-01", "ipAddress": "10.0.0.5", "role": "Server" }
    ] }"#;

    fn config(dir: &TempDir, agent_id: &str) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.agent.agent_id = agent_id.to_string();
        config.paths.packages_dir = dir.path().to_path_buf();
        config.execution.polling_interval_ms = 10;
        config.execution.online_timeout_secs = 1;
        config.retry.client_sync.max_attempts = 2;
        config.retry.client_sync.base_delay_ms = 10;
        config
    }

    /// Multi-role context whose only server is served by an in-process agent
    fn multi_role(dir: &TempDir) -> (RunContext, Arc<AgentState>) {
        let context =
            RunContext::new(config(dir, "client-01"), EnvironmentLayout::from_json(LAYOUT).unwrap()).unwrap();
        let server = Arc::new(AgentState::new("server-01"));
        server.set_online(true);
        context.api.register_override("server-01", Arc::new(LocalControlPlane::new(server.clone())));
        (context, server)
    }

    #[test]
    fn test_render() {
        let server = ClientInstance::new("server-01", "10.0.0.5".parse().unwrap(), Role::Server);
        assert_eq!(render("--connect {0}", &server, None, 0), "--connect 10.0.0.5");
        assert_eq!(
            render("-s {ServerIp} -p {Port} --id {ClientInstance}", &server, Some(6379), 2),
            "-s 10.0.0.5 -p 6379 --id 2"
        );
    }

    #[test]
    fn test_ports_from_state() {
        assert_eq!(ports_from_state("local://s", &json!({ "Ports": "9092,9093,9094" })).unwrap(), vec![9092, 9093, 9094]);
        assert_eq!(ports_from_state("local://s", &json!({ "Ports": 6379 })).unwrap(), vec![6379]);
        assert!(ports_from_state("local://s", &json!({ "Port": 1 })).is_err());
        assert!(ports_from_state("local://s", &json!({ "Ports": "a,b" })).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_executes_template_once_per_client() {
        let dir = TempDir::new().unwrap();
        let (context, server) = multi_role(&dir);
        let element = ProfileElement::new("ClientWorkload")
            .with_parameter("Command", "echo")
            .with_parameter("CommandLine", "--connect {0}")
            .with_parameter("ClientInstances", 2i64);

        let mut client = ClientWorkload::from_element(&element).unwrap();
        client.execute(&context, &CancellationToken::new()).await.unwrap();

        let history = context.processes.history();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|record| record.command_line == "echo --connect 10.0.0.5"));
        assert_eq!(server.exit_registrations().len(), 1);

        client.dispose(&context).await.unwrap();
        assert!(server.all_exits_notified());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_per_published_port_and_publishes() {
        let dir = TempDir::new().unwrap();
        let (context, server) = multi_role(&dir);
        server.update_state("ServerState", json!({ "Ports": "9092,9093" }));

        let element = ProfileElement::new("ClientWorkload")
            .with_parameter("Command", "sh")
            .with_parameter("CommandLine", r#"-c "echo port {Port}; echo 'requests (+): 1000 req/s'""#)
            .with_parameter("ServerStateName", "ServerState")
            .with_parameter("MetricsParser", "key-value")
            .with_parameter("MetricScenario", "kafka_produce");

        let mut client = ClientWorkload::from_element(&element).unwrap();
        client.execute(&context, &CancellationToken::new()).await.unwrap();

        let history = context.processes.history();
        assert_eq!(history.len(), 2);
        assert!(history[0].command_line.contains("9092"));
        assert!(history[1].command_line.contains("9093"));
        assert_eq!(context.publisher.records_for("kafka_produce").len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_state_is_retried_then_reported() {
        let dir = TempDir::new().unwrap();
        let (context, _server) = multi_role(&dir);
        let element = ProfileElement::new("ClientWorkload")
            .with_parameter("Command", "echo")
            .with_parameter("ServerStateName", "ServerState");

        let mut client = ClientWorkload::from_element(&element).unwrap();
        let error = client.execute(&context, &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(error, EngineError::Api(ApiError::MissingState { .. })));
        assert_eq!(error.kind(), ErrorKind::TransientInfrastructure);
        assert!(context.processes.history().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_warm_up_runs_once() {
        let dir = TempDir::new().unwrap();
        let (context, _server) = multi_role(&dir);
        let element = ProfileElement::new("ClientWorkload")
            .with_parameter("Command", "sh")
            .with_parameter("CommandLine", r#"-c "echo 'requests: 10'""#)
            .with_parameter("ClientInstances", 4i64)
            .with_parameter("MetricsParser", "key-value")
            .with_parameter("WarmUp", true);

        let mut client = ClientWorkload::from_element(&element).unwrap();
        let cancel = CancellationToken::new();
        client.execute(&context, &cancel).await.unwrap();
        client.execute(&context, &cancel).await.unwrap();

        assert_eq!(context.processes.history().len(), 1);
        assert!(context.publisher.records().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_warm_up_is_attempted_again() {
        let dir = TempDir::new().unwrap();
        let (context, _server) = multi_role(&dir);
        let element = ProfileElement::new("ClientWorkload")
            .with_parameter("Command", "sh")
            .with_parameter("CommandLine", r#"-c "exit 2""#)
            .with_parameter("WarmUp", true);

        let mut client = ClientWorkload::from_element(&element).unwrap();
        let cancel = CancellationToken::new();
        let error = client.execute(&context, &cancel).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::WorkloadFailure);

        assert!(client.execute(&context, &cancel).await.is_err());
        assert_eq!(context.processes.history().len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_client_still_notifies_exit_on_dispose() {
        let dir = TempDir::new().unwrap();
        let (context, server) = multi_role(&dir);
        let element = ProfileElement::new("ClientWorkload")
            .with_parameter("Command", "sh")
            .with_parameter("CommandLine", r#"-c "exit 2""#);

        let mut client = ClientWorkload::from_element(&element).unwrap();
        let error = client.execute(&context, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::WorkloadFailure);
        assert_eq!(server.exit_registrations().get("client-01"), Some(&false));

        client.dispose(&context).await.unwrap();
        assert!(server.all_exits_notified());
    }

    #[tokio::test]
    async fn test_offline_server_times_out() {
        let dir = TempDir::new().unwrap();
        let (context, server) = multi_role(&dir);
        server.set_online(false);

        let element = ProfileElement::new("ClientWorkload").with_parameter("Command", "echo");
        let mut client = ClientWorkload::from_element(&element).unwrap();
        let error = client.execute(&context, &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(error, EngineError::Api(ApiError::PollingTimeout { .. })));
        assert!(context.processes.history().is_empty());
    }

    #[tokio::test]
    async fn test_server_machine_skips() {
        let dir = TempDir::new().unwrap();
        let context =
            RunContext::new(config(&dir, "server-01"), EnvironmentLayout::from_json(LAYOUT).unwrap()).unwrap();
        let element = ProfileElement::new("ClientWorkload").with_parameter("Command", "echo");

        let mut client = ClientWorkload::from_element(&element).unwrap();
        client.execute(&context, &CancellationToken::new()).await.unwrap();
        assert!(context.processes.history().is_empty());
    }
}
