//! Profile execution engine
//!
//! Runs a profile in three stages:
//!
//! - **Dependencies** run once each, in declared order. The first failure
//!   stops the run; nothing after it executes.
//! - **Actions** run in declared order once per iteration, as scheduled by
//!   the [`ProfileTiming`]. A failed action is recorded against that action,
//!   the rest of the iteration still runs (unless `fail_fast`), and the run
//!   stops after the iteration with the first failure as its terminal error.
//! - **Monitors** run alongside the actions of each iteration and are
//!   cancelled when the actions complete, then awaited for at most
//!   `exit_wait`.
//!
//! Every component is validated before anything executes and disposed on
//! every exit path. Disposal errors are logged and never replace a primary
//! error.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::component::{ComponentHost, ComponentRegistry, ComponentStage, RunContext};
use crate::config::ExecutionConfig;
use crate::error::{EngineError, ErrorKind, Result};
use crate::profile::{ExecutionProfile, Parameters, ProfileElement};
use crate::timing::{ProfileTiming, TimingTracker};

/// Scenario selection: `name` includes, `-name` excludes.
///
/// Includes apply to actions only; excludes apply to every stage. An include
/// wins over an exclude for the same name. Matching is case-insensitive
/// against the element's `Scenario` parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScenarioFilter {
    includes: Vec<String>,
    excludes: Vec<String>,
}

impl ScenarioFilter {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::default();
        for entry in entries {
            let entry = entry.as_ref().trim();
            match entry.strip_prefix('-') {
                Some(excluded) if !excluded.trim().is_empty() => filter.excludes.push(excluded.trim().to_lowercase()),
                Some(_) => {}
                None if !entry.is_empty() => filter.includes.push(entry.to_lowercase()),
                None => {}
            }
        }
        filter
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty() && self.excludes.is_empty()
    }

    pub fn allows(&self, element: &ProfileElement, stage: ComponentStage) -> bool {
        let scenario = element.scenario().map(|s| s.to_lowercase());
        let listed = |names: &[String]| scenario.as_ref().map(|s| names.contains(s)).unwrap_or(false);

        if listed(&self.includes) {
            return true;
        }
        if listed(&self.excludes) {
            return false;
        }
        stage != ComponentStage::Action || self.includes.is_empty()
    }
}

impl FromStr for ScenarioFilter {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::new(value.split(',')))
    }
}

/// What to run and how
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub timing: ProfileTiming,
    pub execute_dependencies: bool,
    pub execute_actions: bool,
    pub execute_monitors: bool,
    /// Stop the remaining actions of an iteration on the first failure
    pub fail_fast: bool,
    /// How long monitors may take to stop once actions complete
    pub exit_wait: Duration,
    /// Overrides the profile's minimum execution interval
    pub min_interval: Option<Duration>,
    pub scenarios: ScenarioFilter,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            timing: ProfileTiming::once(),
            execute_dependencies: true,
            execute_actions: true,
            execute_monitors: true,
            fail_fast: false,
            exit_wait: Duration::from_secs(10),
            min_interval: None,
            scenarios: ScenarioFilter::default(),
        }
    }
}

impl ExecutionOptions {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            fail_fast: config.fail_fast,
            exit_wait: Duration::from_secs(config.exit_wait_secs),
            min_interval: config.min_execution_interval_secs.map(Duration::from_secs),
            ..Self::default()
        }
    }

    pub fn with_timing(mut self, timing: ProfileTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn dependencies_only(mut self) -> Self {
        self.execute_actions = false;
        self.execute_monitors = false;
        self
    }

    pub fn actions_only(mut self) -> Self {
        self.execute_dependencies = false;
        self.execute_monitors = false;
        self
    }

    pub fn monitors_only(mut self) -> Self {
        self.execute_dependencies = false;
        self.execute_actions = false;
        self
    }
}

/// How one execution of a component ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Completed,
    Failed,
    Cancelled,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Completed => "completed",
            OutcomeStatus::Failed => "failed",
            OutcomeStatus::Cancelled => "cancelled",
        }
    }
}

/// One row of the run report
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentOutcome {
    pub component: String,
    pub stage: ComponentStage,
    /// Iteration number for actions and monitors
    pub iteration: Option<u64>,
    pub status: OutcomeStatus,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ComponentOutcome {
    fn new(
        component: &str,
        stage: ComponentStage,
        iteration: Option<u64>,
        error: Option<&EngineError>,
        elapsed: Duration,
    ) -> Self {
        let (status, error_kind, error) = match error {
            None => (OutcomeStatus::Completed, None, None),
            Some(e) if e.is_cancellation() => (OutcomeStatus::Cancelled, Some(e.kind()), None),
            Some(e) => (OutcomeStatus::Failed, Some(e.kind()), Some(e.to_string())),
        };

        Self {
            component: component.to_string(),
            stage,
            iteration,
            status,
            error_kind,
            error,
            duration_ms: elapsed.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
    /// Cancelled from outside; not a failure
    Aborted,
}

/// Result of a profile run
#[derive(Debug)]
pub struct RunReport {
    pub status: RunStatus,
    pub iterations: u64,
    pub outcomes: Vec<ComponentOutcome>,
    /// The first terminal error, when the run failed
    pub error: Option<EngineError>,
    pub reboot_requested: bool,
    /// A duration-bounded run ended at its deadline
    pub deadline_reached: bool,
    pub duration: Duration,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn failures(&self) -> impl Iterator<Item = &ComponentOutcome> {
        self.outcomes.iter().filter(|outcome| outcome.status == OutcomeStatus::Failed)
    }

    /// Agent exit code for this run
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Succeeded => 0,
            RunStatus::Aborted => EngineError::Cancelled.exit_code(),
            RunStatus::Failed => self.error.as_ref().map(EngineError::exit_code).unwrap_or(1),
        }
    }

    pub fn into_result(mut self) -> Result<RunReport> {
        match self.status {
            RunStatus::Succeeded => Ok(self),
            RunStatus::Aborted => Err(EngineError::Cancelled),
            RunStatus::Failed => Err(self
                .error
                .take()
                .unwrap_or_else(|| EngineError::Generic("profile execution failed".to_string()))),
        }
    }
}

/// Notifications delivered synchronously to observers
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    ComponentCreated {
        component: String,
        stage: ComponentStage,
    },
    /// A component is about to execute, with its resolved parameters
    ComponentExecuting {
        component: String,
        stage: ComponentStage,
        iteration: Option<u64>,
        parameters: Parameters,
        metadata: Parameters,
    },
    IterationBegin(u64),
    IterationEnd(u64),
    ActionBegin {
        component: String,
        iteration: u64,
    },
    ActionEnd {
        component: String,
        iteration: u64,
        status: OutcomeStatus,
    },
}

pub trait ExecutionObserver: Send + Sync {
    fn on_event(&self, event: &ExecutionEvent);
}

impl<F> ExecutionObserver for F
where
    F: Fn(&ExecutionEvent) + Send + Sync,
{
    fn on_event(&self, event: &ExecutionEvent) {
        self(event)
    }
}

/// Logs every event at debug level
#[derive(Debug, Default)]
pub struct LoggingObserver;

impl ExecutionObserver for LoggingObserver {
    fn on_event(&self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::ComponentExecuting { component, stage, iteration, parameters, .. } => {
                debug!(component = %component, stage = %stage, iteration = ?iteration, parameters = parameters.len(), "Executing component");
            }
            other => debug!(event = ?other, "Execution event"),
        }
    }
}

#[derive(Default)]
struct Recorder {
    outcomes: Vec<ComponentOutcome>,
    error: Option<EngineError>,
    aborted: bool,
}

impl Recorder {
    fn push(&mut self, outcome: ComponentOutcome, context: &RunContext) {
        context.service_metrics.component_executed(outcome.stage.as_str(), outcome.status.as_str());
        self.outcomes.push(outcome);
    }

    fn fail(&mut self, error: EngineError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

#[derive(Default)]
struct ActionsResult {
    outcomes: Vec<ComponentOutcome>,
    error: Option<EngineError>,
    aborted: bool,
    deadline_reached: bool,
    reboot: bool,
}

impl ActionsResult {
    fn should_stop(&self) -> bool {
        self.error.is_some() || self.aborted || self.deadline_reached || self.reboot
    }
}

async fn until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(Instant::from_std(deadline)).await,
        None => std::future::pending::<()>().await,
    }
}

/// Component hosts per stage
#[derive(Default)]
struct Hosts {
    dependencies: Vec<ComponentHost>,
    actions: Vec<ComponentHost>,
    monitors: Vec<ComponentHost>,
}

impl Hosts {
    fn all_mut(&mut self) -> impl Iterator<Item = &mut ComponentHost> {
        self.actions
            .iter_mut()
            .chain(self.monitors.iter_mut())
            .chain(self.dependencies.iter_mut())
    }
}

pub struct ProfileExecutor {
    profile: ExecutionProfile,
    registry: ComponentRegistry,
    options: ExecutionOptions,
    observers: Vec<Arc<dyn ExecutionObserver>>,
}

impl std::fmt::Debug for ProfileExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileExecutor")
            .field("options", &self.options)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl ProfileExecutor {
    pub fn new(profile: ExecutionProfile, registry: ComponentRegistry, options: ExecutionOptions) -> Self {
        Self { profile, registry, options, observers: Vec::new() }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn add_observer(&mut self, observer: Arc<dyn ExecutionObserver>) {
        self.observers.push(observer);
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    fn emit(&self, event: ExecutionEvent) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }

    fn emit_executing(&self, host: &ComponentHost, iteration: Option<u64>) {
        if self.observers.is_empty() {
            return;
        }
        self.emit(ExecutionEvent::ComponentExecuting {
            component: host.name(),
            stage: host.stage(),
            iteration,
            parameters: host.element().parameters.clone(),
            metadata: host.element().metadata.clone(),
        });
    }

    /// Run the profile to completion, cancellation or failure
    pub async fn run(&self, context: &RunContext, cancel: &CancellationToken) -> RunReport {
        let started = Instant::now();
        context.clear_reboot_request();
        info!(
            experiment_id = %context.experiment_id,
            agent_id = %context.agent_id,
            dependencies = self.profile.dependencies.len(),
            actions = self.profile.actions.len(),
            monitors = self.profile.monitors.len(),
            "Starting profile execution"
        );

        let mut recorder = Recorder::default();
        let mut iterations = 0;
        let mut deadline_reached = false;

        let min_interval = match self.profile.minimum_interval() {
            Ok(interval) => self.options.min_interval.or(interval),
            Err(e) => {
                recorder.fail(e.into());
                None
            }
        };

        let mut hosts = Hosts::default();
        if recorder.error.is_none() {
            if let Some(created) = self.create_hosts(context, &mut recorder) {
                hosts = created;
            }
        }

        if recorder.error.is_none() && self.run_dependencies(&mut hosts.dependencies, context, cancel, &mut recorder).await
        {
            (iterations, deadline_reached) = self
                .run_iterations(&mut hosts.actions, &mut hosts.monitors, min_interval, context, cancel, &mut recorder)
                .await;
        }

        for host in hosts.all_mut() {
            // failures are logged by the host
            let _ = host.dispose(context).await;
        }

        let status = if recorder.aborted {
            RunStatus::Aborted
        } else if recorder.error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };

        let report = RunReport {
            status,
            iterations,
            outcomes: recorder.outcomes,
            error: recorder.error,
            reboot_requested: context.is_reboot_requested(),
            deadline_reached,
            duration: started.elapsed(),
        };

        match report.status {
            RunStatus::Succeeded => info!(iterations, duration = ?report.duration, "Profile execution completed"),
            RunStatus::Aborted => warn!(iterations, "Profile execution aborted"),
            RunStatus::Failed => error!(
                iterations,
                kind = %report.error.as_ref().map(|e| e.kind()).unwrap_or(ErrorKind::Internal),
                "Profile execution failed"
            ),
        }
        report
    }

    fn create_hosts(&self, context: &RunContext, recorder: &mut Recorder) -> Option<Hosts> {
        let stages = [
            (ComponentStage::Dependency, &self.profile.dependencies, self.options.execute_dependencies),
            (ComponentStage::Action, &self.profile.actions, self.options.execute_actions),
            (ComponentStage::Monitor, &self.profile.monitors, self.options.execute_monitors),
        ];

        let mut hosts = Hosts::default();
        for (stage, elements, enabled) in stages {
            if !enabled {
                continue;
            }

            for element in elements {
                if !self.options.scenarios.allows(element, stage) {
                    debug!(component = %element.display_name(), stage = %stage, "Excluded by scenario filter");
                    continue;
                }

                let created = self.registry.create(element, stage).and_then(|mut host| {
                    host.validate(context)?;
                    Ok(host)
                });

                let host = match created {
                    Ok(host) => host,
                    Err(e) => {
                        error!(component = %element.display_name(), stage = %stage, "Invalid component: {}", e);
                        let outcome = ComponentOutcome::new(&element.display_name(), stage, None, Some(&e), Duration::ZERO);
                        recorder.push(outcome, context);
                        recorder.fail(e);
                        return None;
                    }
                };

                self.emit(ExecutionEvent::ComponentCreated { component: host.name(), stage });
                match stage {
                    ComponentStage::Dependency => hosts.dependencies.push(host),
                    ComponentStage::Action => hosts.actions.push(host),
                    ComponentStage::Monitor => hosts.monitors.push(host),
                }
            }
        }
        Some(hosts)
    }

    /// Returns whether the run may continue to the action stage
    async fn run_dependencies(
        &self,
        dependencies: &mut [ComponentHost],
        context: &RunContext,
        cancel: &CancellationToken,
        recorder: &mut Recorder,
    ) -> bool {
        for host in dependencies.iter_mut() {
            if cancel.is_cancelled() {
                recorder.aborted = true;
                return false;
            }

            let name = host.name();
            info!(component = %name, "Installing dependency");
            self.emit_executing(host, None);

            let started = Instant::now();
            let result = host.execute(context, cancel).await;
            recorder.push(
                ComponentOutcome::new(&name, ComponentStage::Dependency, None, result.as_ref().err(), started.elapsed()),
                context,
            );

            if let Err(e) = result {
                if e.is_cancellation() {
                    recorder.aborted = true;
                } else {
                    error!(component = %name, kind = %e.kind(), "Dependency failed: {}", e);
                    recorder.fail(e);
                }
                return false;
            }

            if context.is_reboot_requested() {
                info!(component = %name, "Reboot requested; stopping after dependency");
                return false;
            }
        }
        true
    }

    /// Returns the number of iterations run and whether the deadline ended the run
    async fn run_iterations(
        &self,
        actions: &mut [ComponentHost],
        monitors: &mut [ComponentHost],
        min_interval: Option<Duration>,
        context: &RunContext,
        cancel: &CancellationToken,
        recorder: &mut Recorder,
    ) -> (u64, bool) {
        if actions.is_empty() && monitors.is_empty() {
            return (0, false);
        }

        let tracker = self.options.timing.start();
        let mut completed = 0u64;
        let mut last_start: Option<Instant> = None;

        loop {
            if !tracker.should_start_iteration(completed) {
                return (completed, tracker.deadline().is_some());
            }
            if cancel.is_cancelled() {
                recorder.aborted = true;
                break;
            }

            if let (Some(interval), Some(previous)) = (min_interval, last_start) {
                let next = previous + interval;
                if next > Instant::now() {
                    debug!(interval = ?interval, "Waiting for the minimum execution interval");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            recorder.aborted = true;
                            break;
                        }
                        _ = tokio::time::sleep_until(next) => {}
                    }
                }
            }

            let iteration = completed + 1;
            last_start = Some(Instant::now());
            info!(iteration, "Starting iteration");
            self.emit(ExecutionEvent::IterationBegin(iteration));

            let result = self.run_iteration(iteration, actions, monitors, context, cancel, &tracker).await;
            completed = iteration;
            self.emit(ExecutionEvent::IterationEnd(iteration));

            let stop = result.should_stop() || actions.is_empty();
            let deadline_reached = result.deadline_reached;
            for outcome in result.outcomes {
                recorder.push(outcome, context);
            }
            if let Some(error) = result.error {
                recorder.fail(error);
            }
            recorder.aborted |= result.aborted;

            if deadline_reached {
                return (completed, true);
            }
            if stop {
                break;
            }
        }

        (completed, false)
    }

    async fn run_iteration(
        &self,
        iteration: u64,
        actions: &mut [ComponentHost],
        monitors: &mut [ComponentHost],
        context: &RunContext,
        cancel: &CancellationToken,
        tracker: &TimingTracker,
    ) -> ActionsResult {
        let monitor_cancel = cancel.child_token();

        let actions_run = async {
            let result = if !actions.is_empty() {
                self.run_actions(iteration, actions, context, cancel, tracker).await
            } else {
                // Monitors-only: hold the iteration open until cancelled or the run's deadline
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = until(tracker.deadline()) => {}
                }
                ActionsResult {
                    aborted: cancel.is_cancelled(),
                    deadline_reached: !cancel.is_cancelled(),
                    ..ActionsResult::default()
                }
            };
            monitor_cancel.cancel();
            result
        };

        let (mut result, monitor_outcomes) =
            tokio::join!(actions_run, self.run_monitors(iteration, monitors, context, &monitor_cancel));
        result.outcomes.extend(monitor_outcomes);
        result
    }

    async fn run_actions(
        &self,
        iteration: u64,
        actions: &mut [ComponentHost],
        context: &RunContext,
        cancel: &CancellationToken,
        tracker: &TimingTracker,
    ) -> ActionsResult {
        let action_cancel = cancel.child_token();
        let mut result = ActionsResult::default();

        for host in actions.iter_mut() {
            if cancel.is_cancelled() {
                result.aborted = true;
                break;
            }
            if !tracker.should_start_action() {
                result.deadline_reached = true;
                break;
            }

            let name = host.name();
            self.emit(ExecutionEvent::ActionBegin { component: name.clone(), iteration });
            self.emit_executing(host, Some(iteration));
            info!(component = %name, iteration, "Executing action");

            let started = Instant::now();
            let mut deadline_hit = false;
            let outcome = {
                let execution = host.execute(context, &action_cancel);
                tokio::pin!(execution);
                tokio::select! {
                    outcome = &mut execution => outcome,
                    _ = until(tracker.hard_deadline()) => {
                        info!(component = %name, "Run deadline reached; cancelling action");
                        deadline_hit = true;
                        action_cancel.cancel();
                        execution.await
                    }
                }
            };

            let component_outcome = ComponentOutcome::new(
                &name,
                ComponentStage::Action,
                Some(iteration),
                outcome.as_ref().err(),
                started.elapsed(),
            );
            self.emit(ExecutionEvent::ActionEnd { component: name.clone(), iteration, status: component_outcome.status });
            result.outcomes.push(component_outcome);

            match outcome {
                Ok(()) => {}
                Err(e) if e.is_cancellation() => {
                    if deadline_hit && !cancel.is_cancelled() {
                        result.deadline_reached = true;
                    } else {
                        result.aborted = true;
                    }
                    break;
                }
                Err(e) => {
                    error!(component = %name, iteration, kind = %e.kind(), "Action failed: {}", e);
                    if result.error.is_none() {
                        result.error = Some(e);
                    }
                    if self.options.fail_fast {
                        break;
                    }
                }
            }

            if deadline_hit {
                result.deadline_reached = true;
                break;
            }
            if context.is_reboot_requested() {
                info!(component = %name, "Reboot requested; no further actions scheduled");
                result.reboot = true;
                break;
            }
        }

        result
    }

    async fn run_monitors(
        &self,
        iteration: u64,
        monitors: &mut [ComponentHost],
        context: &RunContext,
        cancel: &CancellationToken,
    ) -> Vec<ComponentOutcome> {
        if monitors.is_empty() {
            return Vec::new();
        }

        for host in monitors.iter() {
            self.emit_executing(host, Some(iteration));
        }

        let exit_wait = self.options.exit_wait;
        let runs = join_all(monitors.iter_mut().map(|host| async move {
            let started = Instant::now();
            let result = host.execute(context, cancel).await;
            (host.name(), result, started.elapsed())
        }));
        tokio::pin!(runs);

        let results = tokio::select! {
            results = &mut runs => results,
            _ = async {
                cancel.cancelled().await;
                tokio::time::sleep(exit_wait).await;
            } => {
                warn!(exit_wait = ?exit_wait, "Monitors still running after the exit wait; abandoning them");
                return Vec::new();
            }
        };

        results
            .into_iter()
            .map(|(name, result, elapsed)| {
                // Cancellation is how monitors are stopped
                let error = result.err().filter(|e| !e.is_cancellation());
                if let Some(e) = &error {
                    warn!(component = %name, "Monitor failed: {}", e);
                }
                ComponentOutcome::new(&name, ComponentStage::Monitor, Some(iteration), error.as_ref(), elapsed)
            })
            .collect()
    }
}
