//! `ServerWorkload`: the server side of a client/server benchmark
//!
//! ```text
//! Offline -> StartingDependencies -> StartingSubordinate -> WaitForSubordinateReady
//!         -> StartingInstances -> PublishState -> Online
//!         -> (multi-role) WaitAllInstancesExited -> StoppingInstances -> Offline
//! ```
//!
//! Configuration files and firewall rules are written once in `initialize`.
//! Each execution starts from Offline and only reports Online after the
//! subordinate service, every instance and the state document are in place.
//! A failure anywhere before Online returns the agent to Offline, kills what
//! was started and is raised to the executor unchanged.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use regex::Regex;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::component::{Component, RunContext};
use crate::error::{ConfigError, EngineError, Result};
use crate::firewall::{FirewallEntry, Protocol};
use crate::layout::Role;
use crate::process::{ProcessHandle, ProcessSpec};
use crate::profile::{Parameters, ProfileElement};

const DEFAULT_STATE_NAME: &str = "ServerState";
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// A service the server instances depend on (e.g. a coordination service)
#[derive(Debug, Clone)]
struct Subordinate {
    command: String,
    arguments: String,
    ready_marker: Option<Regex>,
    ready_timeout: Duration,
}

enum ServeOutcome {
    InstanceExited,
    ClientsExited,
    Cancelled,
}

pub struct ServerWorkload {
    name: String,
    package: Option<String>,
    config_template: Option<String>,
    port: u16,
    instance_count: u16,
    subordinate: Option<Subordinate>,
    command: String,
    arguments: String,
    ready_marker: Option<Regex>,
    ready_timeout: Duration,
    stop_command: Option<String>,
    process_name: Option<String>,
    state_name: String,
    elevated: bool,
    config_files: Vec<PathBuf>,
    firewall_entries: Vec<FirewallEntry>,
    subordinate_handle: Option<ProcessHandle>,
    instances: Vec<ProcessHandle>,
}

impl std::fmt::Debug for ServerWorkload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerWorkload")
            .field("name", &self.name)
            .field("port", &self.port)
            .field("instance_count", &self.instance_count)
            .field("running", &self.instances.len())
            .finish()
    }
}

fn optional_regex(parameters: &Parameters, name: &str) -> Result<Option<Regex>> {
    let regex = parameters
        .get_optional_string(name)
        .map(|pattern| {
            Regex::new(&pattern)
                .map_err(|e| ConfigError::InvalidValue { field: name.to_string(), value: e.to_string() })
        })
        .transpose()?;
    Ok(regex)
}

/// Substitute `{Port}`, `{Instance}` and `{ConfigFile}`
fn render(template: &str, port: u16, instance: u16, config_file: Option<&Path>) -> String {
    let rendered = template
        .replace("{Port}", &port.to_string())
        .replace("{Instance}", &instance.to_string());

    match config_file {
        Some(path) => rendered.replace("{ConfigFile}", &path.to_string_lossy()),
        None => rendered,
    }
}

/// `server.properties` -> `server-2.properties`
fn instance_file_name(template: &Path, instance: u16) -> PathBuf {
    let stem = template.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
    let name = match template.extension() {
        Some(extension) => format!("{}-{}.{}", stem, instance, extension.to_string_lossy()),
        None => format!("{}-{}", stem, instance),
    };
    template.with_file_name(name)
}

/// Start a process and wait for its readiness marker, retrying transient
/// start failures under the server start policy
async fn start_until_ready(
    context: &RunContext,
    spec: &ProcessSpec,
    marker: Option<&Regex>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ProcessHandle> {
    context
        .server_start_policy()
        .execute(cancel, |attempt| async move {
            debug!(attempt, command = %spec.command_line(), "Starting server process");
            let mut handle = context.processes.start(spec)?;
            if let Some(marker) = marker {
                handle.wait_for_output(marker, timeout, cancel).await?;
            }
            Ok(handle)
        })
        .await
}

async fn wait_for_any_exit(handles: &mut [ProcessHandle], interval: Duration) {
    loop {
        if handles.iter_mut().any(|handle| handle.has_exited()) {
            return;
        }
        tokio::time::sleep(interval).await;
    }
}

impl ServerWorkload {
    pub fn from_element(element: &ProfileElement) -> Result<Self> {
        let parameters = &element.parameters;

        let port = u16::try_from(parameters.get_i64("Port")?).map_err(|_| ConfigError::InvalidValue {
            field: "Port".to_string(),
            value: parameters.get_string_or("Port", ""),
        })?;
        let instance_count = u16::try_from(parameters.get_u64_or("ServerInstances", 1)?).map_err(|_| {
            ConfigError::InvalidValue {
                field: "ServerInstances".to_string(),
                value: parameters.get_string_or("ServerInstances", ""),
            }
        })?;

        let subordinate = match parameters.get_optional_string("SubordinateCommand") {
            Some(command) => Some(Subordinate {
                command,
                arguments: parameters.get_string_or("SubordinateArguments", ""),
                ready_marker: optional_regex(parameters, "SubordinateReadyMarker")?,
                ready_timeout: parameters.get_duration_or("SubordinateReadyTimeout", DEFAULT_READY_TIMEOUT)?,
            }),
            None => None,
        };

        Ok(Self {
            name: element.display_name(),
            package: parameters.get_optional_string("PackageName"),
            config_template: parameters.get_optional_string("ConfigTemplate"),
            port,
            instance_count,
            subordinate,
            command: parameters.get_string("Command")?,
            arguments: parameters.get_string_or("CommandArguments", ""),
            ready_marker: optional_regex(parameters, "ReadyMarker")?,
            ready_timeout: parameters.get_duration_or("ReadyTimeout", DEFAULT_READY_TIMEOUT)?,
            stop_command: parameters.get_optional_string("StopCommand"),
            process_name: parameters.get_optional_string("ProcessName"),
            state_name: parameters.get_string_or("StateName", DEFAULT_STATE_NAME),
            elevated: parameters.get_bool_or("RunElevated", false)?,
            config_files: Vec::new(),
            firewall_entries: Vec::new(),
            subordinate_handle: None,
            instances: Vec::new(),
        })
    }

    /// One port per instance, consecutive from `Port`
    pub fn ports(&self) -> Vec<u16> {
        (0..self.instance_count).map(|instance| self.port + instance).collect()
    }

    fn needs_reset(&mut self) -> bool {
        self.instances.is_empty() || self.instances.iter_mut().any(|handle| handle.has_exited())
    }

    fn package_root(&self, context: &RunContext) -> Result<Option<PathBuf>> {
        self.package
            .as_deref()
            .map(|package| context.packages.get_platform_path(package))
            .transpose()
    }

    fn instance_spec(&self, root: Option<&Path>, instance: u16, port: u16) -> ProcessSpec {
        let config_file = self.config_files.get(usize::from(instance)).map(PathBuf::as_path);
        let arguments = render(&self.arguments, port, instance, config_file);

        let mut spec = ProcessSpec::with_argument_line(&self.command, &arguments).elevated(self.elevated);
        if let Some(root) = root {
            spec = spec.working_dir(root);
        }
        spec
    }

    async fn write_config_files(&mut self, context: &RunContext) -> Result<()> {
        let Some(template) = &self.config_template else {
            return Ok(());
        };

        let mut template_path = PathBuf::from(template);
        if template_path.is_relative() {
            if let Some(root) = self.package_root(context)? {
                template_path = root.join(template_path);
            }
        }

        let content = tokio::fs::read_to_string(&template_path).await.map_err(|e| ConfigError::InvalidValue {
            field: "ConfigTemplate".to_string(),
            value: format!("{}: {}", template_path.display(), e),
        })?;

        let mut files = Vec::with_capacity(usize::from(self.instance_count));
        for (instance, port) in self.ports().into_iter().enumerate() {
            let instance = instance as u16;
            let path = instance_file_name(&template_path, instance);
            tokio::fs::write(&path, render(&content, port, instance, None)).await?;
            debug!(component = %self.name, path = %path.display(), port, "Wrote instance configuration");
            files.push(path);
        }

        self.config_files = files;
        Ok(())
    }

    async fn stop_instances(&mut self) {
        for handle in &mut self.instances {
            handle.kill().await;
        }
        self.instances.clear();

        if let Some(mut handle) = self.subordinate_handle.take() {
            handle.kill().await;
        }
    }

    async fn start_server(&mut self, context: &RunContext, cancel: &CancellationToken) -> Result<()> {
        let local = context.api.local();

        if self.needs_reset() {
            info!(component = %self.name, "Starting server from a clean state");
            local.delete_state(&self.state_name).await?;
            self.stop_instances().await;

            let root = self.package_root(context)?;

            if let Some(subordinate) = &self.subordinate {
                let mut spec = ProcessSpec::with_argument_line(&subordinate.command, &subordinate.arguments)
                    .elevated(self.elevated);
                if let Some(root) = &root {
                    spec = spec.working_dir(root);
                }

                let handle = start_until_ready(
                    context,
                    &spec,
                    subordinate.ready_marker.as_ref(),
                    subordinate.ready_timeout,
                    cancel,
                )
                .await?;
                info!(component = %self.name, pid = handle.id(), "Subordinate service ready");
                self.subordinate_handle = Some(handle);
            }

            let specs: Vec<ProcessSpec> = self
                .ports()
                .into_iter()
                .enumerate()
                .map(|(instance, port)| self.instance_spec(root.as_deref(), instance as u16, port))
                .collect();

            let marker = self.ready_marker.as_ref();
            let timeout = self.ready_timeout;
            self.instances = try_join_all(
                specs.iter().map(|spec| start_until_ready(context, spec, marker, timeout, cancel)),
            )
            .await?;
        }

        let ports = self.ports().iter().map(u16::to_string).collect::<Vec<_>>().join(",");
        let document = json!({
            "Ports": ports,
            "ServerInstances": self.instance_count,
        });
        local.update_state(&self.state_name, &document).await?;

        context.set_server_online(true);
        info!(component = %self.name, ports = %ports, "Server online");
        Ok(())
    }

    /// Hold the server up until an instance exits, every registered client
    /// has exited, or the run is cancelled; then stop the instances
    async fn serve_until_exit(&mut self, context: &RunContext, cancel: &CancellationToken) -> Result<()> {
        let agent = context.api.local_state().clone();
        let interval = context.polling_interval();

        let outcome = tokio::select! {
            _ = wait_for_any_exit(&mut self.instances, interval) => ServeOutcome::InstanceExited,
            result = agent.wait_for_exit_notifications(cancel) => match result {
                Ok(()) => ServeOutcome::ClientsExited,
                Err(_) => ServeOutcome::Cancelled,
            },
            _ = cancel.cancelled() => ServeOutcome::Cancelled,
        };

        match outcome {
            ServeOutcome::InstanceExited => info!(component = %self.name, "Server instance exited"),
            ServeOutcome::ClientsExited => info!(component = %self.name, "All registered clients exited"),
            ServeOutcome::Cancelled => return Err(EngineError::Cancelled),
        }

        context.set_server_online(false);
        self.stop_instances().await;
        agent.clear_exit_registrations();
        info!(component = %self.name, "Server instances stopped");
        Ok(())
    }

    async fn run_stop_command(&self, context: &RunContext, command_line: &str) {
        let mut tokens = crate::process::split_arguments(command_line).into_iter();
        let Some(command) = tokens.next() else { return };
        let spec = ProcessSpec::new(&command).args(tokens).elevated(self.elevated);

        match context.processes.execute(&spec, Some(STOP_COMMAND_TIMEOUT), &CancellationToken::new()).await {
            Ok(handle) => debug!(component = %self.name, code = ?handle.exit_code(), "Stop command finished"),
            Err(e) => warn!(component = %self.name, "Stop command failed: {}", e),
        }
    }
}

#[async_trait]
impl Component for ServerWorkload {
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue { field: "Port".to_string(), value: "0".to_string() }.into());
        }
        if self.instance_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ServerInstances".to_string(),
                value: "0".to_string(),
            }
            .into());
        }
        if u32::from(self.port) + u32::from(self.instance_count) - 1 > u32::from(u16::MAX) {
            return Err(ConfigError::ValidationFailed {
                reason: format!("{} instances from port {} exceed the port range", self.instance_count, self.port),
            }
            .into());
        }
        Ok(())
    }

    async fn initialize(&mut self, context: &RunContext, _cancel: &CancellationToken) -> Result<()> {
        if !context.is_role(Role::Server)? {
            return Ok(());
        }
        self.write_config_files(context).await?;

        let last_port = self.port + (self.instance_count - 1);
        self.firewall_entries = vec![FirewallEntry::port_range(&self.name, Protocol::Tcp, self.port, last_port)];
        context.firewall.enable_inbound_connections(&self.firewall_entries).await?;
        Ok(())
    }

    async fn execute(&mut self, context: &RunContext, cancel: &CancellationToken) -> Result<()> {
        if !context.is_role(Role::Server)? {
            debug!(component = %self.name, "Not a server in this layout; skipping");
            return Ok(());
        }

        context.set_server_online(false);

        if let Err(e) = self.start_server(context, cancel).await {
            context.set_server_online(false);
            self.stop_instances().await;
            return Err(e);
        }

        if context.layout.is_multi_role() {
            if let Err(e) = self.serve_until_exit(context, cancel).await {
                context.set_server_online(false);
                self.stop_instances().await;
                return Err(e);
            }
        }

        Ok(())
    }

    async fn dispose(&mut self, context: &RunContext) -> Result<()> {
        context.set_server_online(false);

        if let Some(stop_command) = self.stop_command.clone() {
            self.run_stop_command(context, &stop_command).await;
        }
        self.stop_instances().await;

        if let Some(name) = &self.process_name {
            context.processes.kill_processes_by_name(name);
        }

        if let Err(e) = context.api.local().delete_state(&self.state_name).await {
            warn!(component = %self.name, "Failed to delete server state: {}", e);
        }

        if !self.firewall_entries.is_empty() {
            context.firewall.disable_inbound_connections(&self.firewall_entries).await?;
            self.firewall_entries.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::config::EngineConfig;
    use crate::error::ErrorKind;
    use crate::firewall::LoggingFirewall;
    use crate::layout::EnvironmentLayout;

    fn context(dir: &TempDir, firewall: Arc<LoggingFirewall>) -> RunContext {
        let mut config = EngineConfig::default();
        config.agent.agent_id = "vm-01".to_string();
        config.paths.packages_dir = dir.path().to_path_buf();
        config.retry.server_start.base_delay_ms = 10;
        RunContext::new(config, EnvironmentLayout::single_node("vm-01"))
            .unwrap()
            .with_firewall(firewall)
    }

    fn element() -> ProfileElement {
        ProfileElement::new("ServerWorkload")
            .with_parameter("Port", 9092i64)
            .with_parameter("ServerInstances", 3i64)
            .with_parameter("SubordinateCommand", "sh")
            .with_parameter("SubordinateArguments", r#"-c "echo INFO Created server; sleep 30""#)
            .with_parameter("SubordinateReadyMarker", "Created server")
            .with_parameter("Command", "sh")
            .with_parameter("CommandArguments", r#"-c "echo listening on {Port}; sleep 30""#)
            .with_parameter("ReadyMarker", "listening on")
    }

    #[test]
    fn test_ports_and_validation() {
        let server = ServerWorkload::from_element(&element()).unwrap();
        assert_eq!(server.ports(), vec![9092, 9093, 9094]);
        assert!(server.validate().is_ok());

        let overflow = ServerWorkload::from_element(&element().with_parameter("Port", 65535i64)).unwrap();
        assert!(overflow.validate().is_err());

        let zero = ServerWorkload::from_element(&element().with_parameter("ServerInstances", 0i64)).unwrap();
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_render_and_file_names() {
        assert_eq!(
            render("--override listeners=PLAINTEXT://:{Port} --id {Instance}", 9093, 1, None),
            "--override listeners=PLAINTEXT://:9093 --id 1"
        );
        assert_eq!(
            instance_file_name(Path::new("/opt/kafka/config/server.properties"), 2),
            PathBuf::from("/opt/kafka/config/server-2.properties")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_starts_subordinate_then_one_instance_per_port() {
        let dir = TempDir::new().unwrap();
        let firewall = Arc::new(LoggingFirewall::new());
        let context = context(&dir, firewall.clone());
        let cancel = CancellationToken::new();

        let mut server = ServerWorkload::from_element(&element()).unwrap();
        server.initialize(&context, &cancel).await.unwrap();
        assert_eq!(firewall.enabled_entries().len(), 1);
        assert!(firewall.enabled_entries()[0].contains(9094));

        server.execute(&context, &cancel).await.unwrap();

        let history = context.processes.history();
        assert_eq!(history.len(), 4);
        assert!(history[0].command_line.contains("Created server"));
        for (record, port) in history[1..].iter().zip(["9092", "9093", "9094"]) {
            assert!(record.command_line.contains(port), "{} missing {}", record.command_line, port);
        }

        let state = context.api.local_state().get_state("ServerState").unwrap();
        assert_eq!(state["Ports"], "9092,9093,9094");
        assert!(context.api.local_state().is_online());

        server.dispose(&context).await.unwrap();
        assert!(!context.api.local_state().is_online());
        assert!(context.api.local_state().get_state("ServerState").is_none());
        assert!(firewall.enabled_entries().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_start_stays_offline() {
        let dir = TempDir::new().unwrap();
        let context = context(&dir, Arc::new(LoggingFirewall::new()));
        let cancel = CancellationToken::new();

        let element = element()
            .with_parameter("ServerInstances", 1i64)
            .with_parameter("CommandArguments", r#"-c "echo bind failed; exit 1""#);
        let mut server = ServerWorkload::from_element(&element).unwrap();
        server.initialize(&context, &cancel).await.unwrap();

        let error = server.execute(&context, &cancel).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::TransientInfrastructure);
        assert!(!context.api.local_state().is_online());
        assert!(context.api.local_state().get_state("ServerState").is_none());

        // subordinate once, then the instance once per start attempt
        assert_eq!(context.processes.history().len(), 1 + 3);
        assert!(server.instances.is_empty());
        assert!(server.subordinate_handle.is_none());

        server.dispose(&context).await.unwrap();
    }

    #[tokio::test]
    async fn test_writes_instance_config_files() {
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join("kafka").join("config");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join("server.properties"), "listeners=PLAINTEXT://:{Port}\nbroker.id={Instance}\n")
            .unwrap();

        let context = context(&dir, Arc::new(LoggingFirewall::new()));
        let element = element()
            .with_parameter("PackageName", "kafka")
            .with_parameter("ConfigTemplate", "config/server.properties")
            .with_parameter("CommandArguments", "{ConfigFile}");
        let mut server = ServerWorkload::from_element(&element).unwrap();
        server.initialize(&context, &CancellationToken::new()).await.unwrap();

        let second = std::fs::read_to_string(config_dir.join("server-1.properties")).unwrap();
        assert_eq!(second, "listeners=PLAINTEXT://:9093\nbroker.id=1\n");
        assert_eq!(server.config_files.len(), 3);

        let root = context.packages.get_platform_path("kafka").unwrap();
        let spec = server.instance_spec(Some(root.as_path()), 2, 9094);
        assert_eq!(spec.arguments, vec![config_dir.join("server-2.properties").to_string_lossy().to_string()]);
    }
}
