//! Component lifecycle
//!
//! Every dependency, action and monitor is a [`Component`]. The engine never
//! drives a component directly; it goes through a [`ComponentHost`], which
//! owns the state machine:
//!
//! ```text
//! Created -> Validated -> Initialized -> Executing -> Completed | Failed -> Disposed
//!                                          ^______________|   (next iteration)
//! ```
//!
//! Validation rejects unresolved `$.` references, evaluates the placeholders
//! that need no I/O and builds the component from its parameters.
//! `{PackagePath:<name>}` is resolved at initialization, after dependencies
//! have had the chance to install the package. Initialization happens at
//! most once. Disposal always happens.

pub mod context;
pub mod registry;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ConfigError, EngineError, Result, WorkloadError};
use crate::profile::{ParameterValue, Parameters, ProfileElement};

pub use context::RunContext;
pub use registry::{ComponentFactory, ComponentRegistry};

/// Behaviour shared by dependencies, actions and monitors
#[async_trait]
pub trait Component: Send + Sync {
    /// Check parameters. Must not perform I/O.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// One-time setup before the first execution
    async fn initialize(&mut self, _context: &RunContext, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    /// One scheduled execution
    async fn execute(&mut self, context: &RunContext, cancel: &CancellationToken) -> Result<()>;

    /// Release processes, remote state and ports. Called on every exit path.
    async fn dispose(&mut self, _context: &RunContext) -> Result<()> {
        Ok(())
    }
}

/// Profile section a component was declared in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStage {
    Dependency,
    Action,
    Monitor,
}

impl ComponentStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentStage::Dependency => "dependency",
            ComponentStage::Action => "action",
            ComponentStage::Monitor => "monitor",
        }
    }
}

impl fmt::Display for ComponentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Created,
    Validated,
    Initialized,
    Executing,
    Completed,
    Failed,
    Disposed,
}

/// Replace `{LogicalCoreCount}`, `{PhysicalCoreCount}`, `{AgentId}` and
/// `{PackagePath:<name>}` in string parameter values
pub fn evaluate_placeholders(parameters: &mut Parameters, context: &RunContext) -> Result<()> {
    evaluate_with(parameters, context, true)
}

const PACKAGE_PATH: &str = "{PackagePath:";

fn has_package_placeholders(parameters: &Parameters) -> bool {
    parameters
        .iter()
        .any(|(_, value)| value.as_str().map(|raw| raw.contains(PACKAGE_PATH)).unwrap_or(false))
}

fn evaluate_with(parameters: &mut Parameters, context: &RunContext, resolve_packages: bool) -> Result<()> {
    for (name, value) in parameters.iter_mut() {
        let Some(raw) = value.as_str() else { continue };
        if !raw.contains('{') {
            continue;
        }

        let evaluated = evaluate_text(raw, context, resolve_packages)?;
        if evaluated != raw {
            debug!(parameter = %name, value = %evaluated, "Evaluated placeholders");
            *value = ParameterValue::parse_loose(&evaluated);
        }
    }
    Ok(())
}

fn evaluate_text(raw: &str, context: &RunContext, resolve_packages: bool) -> Result<String> {
    let mut evaluated = raw
        .replace("{LogicalCoreCount}", &num_cpus::get().to_string())
        .replace("{PhysicalCoreCount}", &num_cpus::get_physical().to_string())
        .replace("{AgentId}", &context.agent_id);
    if !resolve_packages {
        return Ok(evaluated);
    }

    while let Some(start) = evaluated.find(PACKAGE_PATH) {
        let Some(length) = evaluated[start..].find('}') else { break };
        let package = evaluated[start + PACKAGE_PATH.len()..start + length].trim().to_string();
        let path = context.packages.get_package_path(&package)?;
        evaluated.replace_range(start..start + length + 1, &path.to_string_lossy());
    }

    Ok(evaluated)
}

/// Drives one component through its lifecycle
pub struct ComponentHost {
    element: ProfileElement,
    stage: ComponentStage,
    factory: ComponentFactory,
    component: Option<Box<dyn Component>>,
    state: ComponentState,
    initialize_attempted: bool,
    executions: u64,
}

impl fmt::Debug for ComponentHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentHost")
            .field("component", &self.element.display_name())
            .field("stage", &self.stage)
            .field("state", &self.state)
            .finish()
    }
}

impl ComponentHost {
    pub fn new(element: ProfileElement, stage: ComponentStage, factory: ComponentFactory) -> Self {
        Self {
            element,
            stage,
            factory,
            component: None,
            state: ComponentState::Created,
            initialize_attempted: false,
            executions: 0,
        }
    }

    pub fn name(&self) -> String {
        self.element.display_name()
    }

    pub fn element(&self) -> &ProfileElement {
        &self.element
    }

    pub fn stage(&self) -> ComponentStage {
        self.stage
    }

    pub fn state(&self) -> ComponentState {
        self.state
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    /// Check references, evaluate I/O-free placeholders, build and validate the component
    pub fn validate(&mut self, context: &RunContext) -> Result<()> {
        if self.state != ComponentState::Created {
            return Ok(());
        }

        let result = self.build(context);
        self.state = match result {
            Ok(()) => ComponentState::Validated,
            Err(_) => ComponentState::Failed,
        };
        result
    }

    fn build(&mut self, context: &RunContext) -> Result<()> {
        if let Some((name, value)) = self.element.parameters.unresolved_references().into_iter().next() {
            return Err(ConfigError::UnresolvedReference { name, value }.into());
        }

        evaluate_with(&mut self.element.parameters, context, false)?;
        self.rebuild()
    }

    fn rebuild(&mut self) -> Result<()> {
        let component = (self.factory)(&self.element)?;
        component.validate()?;
        self.component = Some(component);
        Ok(())
    }

    /// Package paths exist only once dependencies have run
    fn resolve_package_paths(&mut self, context: &RunContext) -> Result<()> {
        if !has_package_placeholders(&self.element.parameters) {
            return Ok(());
        }
        evaluate_placeholders(&mut self.element.parameters, context)?;
        self.rebuild()
    }

    /// Initialize once; later calls return immediately
    pub async fn initialize(&mut self, context: &RunContext, cancel: &CancellationToken) -> Result<()> {
        if self.initialize_attempted {
            return match self.state {
                ComponentState::Failed if self.executions == 0 => Err(WorkloadError::Failed {
                    component: self.name(),
                    reason: "initialization failed earlier in this run".to_string(),
                }
                .into()),
                _ => Ok(()),
            };
        }

        if self.component.is_none() {
            return Err(ConfigError::ValidationFailed {
                reason: format!("{} was not validated before initialization", self.name()),
            }
            .into());
        }

        self.initialize_attempted = true;
        if let Err(e) = self.resolve_package_paths(context) {
            self.state = ComponentState::Failed;
            return Err(e);
        }

        let name = self.name();
        let component = self.component.as_mut().ok_or_else(|| ConfigError::ValidationFailed {
            reason: format!("{} was not validated before initialization", name),
        })?;
        match component.initialize(context, cancel).await {
            Ok(()) => {
                self.state = ComponentState::Initialized;
                Ok(())
            }
            Err(e) => {
                self.state = ComponentState::Failed;
                Err(e)
            }
        }
    }

    /// Initialize if needed, then run one execution
    pub async fn execute(&mut self, context: &RunContext, cancel: &CancellationToken) -> Result<()> {
        self.initialize(context, cancel).await?;

        let name = self.name();
        let component = self.component.as_mut().ok_or_else(|| ConfigError::ValidationFailed {
            reason: format!("{} was not validated before execution", name),
        })?;

        self.state = ComponentState::Executing;
        self.executions += 1;
        let result = component.execute(context, cancel).await;
        self.state = match &result {
            Ok(()) => ComponentState::Completed,
            Err(_) => ComponentState::Failed,
        };
        result
    }

    /// Dispose the component. Errors are logged and returned but the host is
    /// marked disposed either way.
    pub async fn dispose(&mut self, context: &RunContext) -> Result<()> {
        if self.state == ComponentState::Disposed {
            return Ok(());
        }

        let result = match self.component.as_mut() {
            Some(component) => component.dispose(context).await,
            None => Ok(()),
        };
        self.state = ComponentState::Disposed;

        if let Err(e) = &result {
            if !matches!(e, EngineError::Cancelled) {
                warn!(component = %self.name(), "Dispose failed: {}", e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    use crate::config::EngineConfig;
    use crate::layout::EnvironmentLayout;

    struct Counting {
        initialized: Arc<AtomicU32>,
        fail_execute: bool,
    }

    #[async_trait]
    impl Component for Counting {
        async fn initialize(&mut self, _context: &RunContext, _cancel: &CancellationToken) -> Result<()> {
            self.initialized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn execute(&mut self, _context: &RunContext, _cancel: &CancellationToken) -> Result<()> {
            if self.fail_execute {
                return Err(WorkloadError::Failed { component: "Counting".into(), reason: "boom".into() }.into());
            }
            Ok(())
        }
    }

    fn context(packages: &TempDir) -> RunContext {
        let mut config = EngineConfig::default();
        config.agent.agent_id = "vm-01".to_string();
        config.paths.packages_dir = packages.path().to_path_buf();
        RunContext::new(config, EnvironmentLayout::single_node("vm-01")).unwrap()
    }

    fn counting_factory(counter: Arc<AtomicU32>, fail_execute: bool) -> ComponentFactory {
        Arc::new(move |_element: &ProfileElement| -> Result<Box<dyn Component>> {
            Ok(Box::new(Counting { initialized: counter.clone(), fail_execute }))
        })
    }

    #[tokio::test]
    async fn test_initialize_runs_once_across_iterations() {
        let dir = TempDir::new().unwrap();
        let context = context(&dir);
        let counter = Arc::new(AtomicU32::new(0));
        let mut host = ComponentHost::new(
            ProfileElement::new("Counting"),
            ComponentStage::Action,
            counting_factory(counter.clone(), false),
        );

        host.validate(&context).unwrap();
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            host.execute(&context, &cancel).await.unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(host.executions(), 3);
        assert_eq!(host.state(), ComponentState::Completed);

        host.dispose(&context).await.unwrap();
        assert_eq!(host.state(), ComponentState::Disposed);
    }

    #[tokio::test]
    async fn test_unresolved_reference_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let context = context(&dir);
        let element = ProfileElement::new("Counting").with_parameter("Port", "$.Parameters.ServerPort");
        let mut host =
            ComponentHost::new(element, ComponentStage::Action, counting_factory(Arc::new(AtomicU32::new(0)), false));

        let error = host.validate(&context).unwrap_err();
        assert!(matches!(error, EngineError::Config(ConfigError::UnresolvedReference { .. })));
        assert_eq!(host.state(), ComponentState::Failed);
    }

    #[tokio::test]
    async fn test_failed_execution_marks_failed_and_can_rerun() {
        let dir = TempDir::new().unwrap();
        let context = context(&dir);
        let mut host = ComponentHost::new(
            ProfileElement::new("Counting"),
            ComponentStage::Action,
            counting_factory(Arc::new(AtomicU32::new(0)), true),
        );

        host.validate(&context).unwrap();
        let cancel = CancellationToken::new();
        assert!(host.execute(&context, &cancel).await.is_err());
        assert_eq!(host.state(), ComponentState::Failed);
        assert!(host.execute(&context, &cancel).await.is_err());
        assert_eq!(host.executions(), 2);
    }

    #[tokio::test]
    async fn test_package_path_resolves_after_dependencies_install() {
        let dir = TempDir::new().unwrap();
        let context = context(&dir);
        let seen = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));

        let recorded = seen.clone();
        let factory: ComponentFactory = Arc::new(move |element: &ProfileElement| -> Result<Box<dyn Component>> {
            recorded.lock().unwrap().push(element.parameters.get_string("Script")?);
            Ok(Box::new(Counting { initialized: Arc::new(AtomicU32::new(0)), fail_execute: false }))
        });
        let element = ProfileElement::new("Counting")
            .with_parameter("Script", "{PackagePath:lzbench}/run.sh")
            .with_parameter("Owner", "{AgentId}");
        let mut host = ComponentHost::new(element, ComponentStage::Action, factory);

        // package not installed yet
        host.validate(&context).unwrap();
        assert_eq!(host.element().parameters.get_string("Owner").unwrap(), "vm-01");

        std::fs::create_dir_all(dir.path().join("lzbench")).unwrap();
        host.execute(&context, &CancellationToken::new()).await.unwrap();

        let expected = format!("{}/run.sh", dir.path().join("lzbench").display());
        assert_eq!(seen.lock().unwrap().last().unwrap(), &expected);
        assert_eq!(host.element().parameters.get_string("Script").unwrap(), expected);
    }

    #[tokio::test]
    async fn test_missing_package_fails_initialization() {
        let dir = TempDir::new().unwrap();
        let context = context(&dir);
        let element = ProfileElement::new("Counting").with_parameter("Path", "{PackagePath:kafka}");
        let mut host =
            ComponentHost::new(element, ComponentStage::Action, counting_factory(Arc::new(AtomicU32::new(0)), false));

        host.validate(&context).unwrap();
        let error = host.execute(&context, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(error.kind(), crate::error::ErrorKind::DependencyMissing);
        assert_eq!(host.state(), ComponentState::Failed);
    }

    #[test]
    fn test_placeholders() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("lzbench")).unwrap();
        let context = context(&dir);

        let mut parameters = Parameters::new()
            .with("Threads", "{LogicalCoreCount}")
            .with("Owner", "{AgentId}")
            .with("Script", "{PackagePath:lzbench}/run.sh");
        evaluate_placeholders(&mut parameters, &context).unwrap();

        assert_eq!(parameters.get_i64("Threads").unwrap(), num_cpus::get() as i64);
        assert_eq!(parameters.get_string("Owner").unwrap(), "vm-01");
        assert_eq!(
            parameters.get_string("Script").unwrap(),
            format!("{}/run.sh", dir.path().join("lzbench").display())
        );

        let mut missing = Parameters::new().with("Path", "{PackagePath:kafka}");
        let error = evaluate_placeholders(&mut missing, &context).unwrap_err();
        assert_eq!(error.kind(), crate::error::ErrorKind::DependencyMissing);
    }
}
