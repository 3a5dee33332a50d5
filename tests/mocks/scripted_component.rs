use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use workbench_engine::error::{ApiError, ConfigError, WorkloadError};
use workbench_engine::parser::{Metric, MetricRelativity};
use workbench_engine::{Component, ComponentRegistry, EngineError, ProfileElement, Result, RunContext};

/// Ordered record of lifecycle calls, shared between components of one run
pub type Journal = Arc<Mutex<Vec<String>>>;

/// Component whose behaviour is chosen by its `Behavior` parameter:
///
/// | Behavior    | execute                                           |
/// |-------------|---------------------------------------------------|
/// | `succeed`   | returns `Ok`                                      |
/// | `fail`      | workload failure                                  |
/// | `transient` | unreachable peer                                  |
/// | `config`    | missing parameter                                 |
/// | `sleep`     | waits `SleepMs`, or until cancelled               |
/// | `wait`      | waits until cancelled                             |
/// | `publish`   | publishes a `Value` metric under its scenario     |
/// | `reboot`    | requests a reboot                                 |
///
/// `invalid` fails validation.
pub struct ScriptedComponent {
    name: String,
    behavior: String,
    sleep: Duration,
    value: f64,
    journal: Journal,
}

impl ScriptedComponent {
    pub const TYPE_NAME: &'static str = "Scripted";

    pub fn from_element(element: &ProfileElement, journal: Journal) -> Result<Self> {
        let parameters = &element.parameters;
        let value = match parameters.get("Value") {
            Some(raw) => raw.to_string().parse::<f64>().map_err(|_| ConfigError::InvalidValue {
                field: "Value".to_string(),
                value: raw.to_string(),
            })?,
            None => 1.0,
        };

        Ok(Self {
            name: parameters.get_string_or("Name", "unnamed"),
            behavior: parameters.get_string_or("Behavior", "succeed").to_lowercase(),
            sleep: Duration::from_millis(parameters.get_u64_or("SleepMs", 0)?),
            value,
            journal,
        })
    }

    /// Registry holding only the scripted component
    pub fn registry(journal: &Journal) -> ComponentRegistry {
        let mut registry = ComponentRegistry::new();
        Self::register(&mut registry, journal);
        registry
    }

    pub fn register(registry: &mut ComponentRegistry, journal: &Journal) {
        let journal = journal.clone();
        registry.register(Self::TYPE_NAME, move |element| {
            Ok(Box::new(ScriptedComponent::from_element(element, journal.clone())?))
        });
    }

    /// Profile element for a scripted component; `name` doubles as its
    /// scenario, so reports show it as `Scripted (<name>)`
    pub fn element(name: &str, behavior: &str) -> ProfileElement {
        ProfileElement::new(Self::TYPE_NAME)
            .with_parameter("Name", name)
            .with_parameter("Scenario", name)
            .with_parameter("Behavior", behavior)
    }

    /// Journal entries with the given prefix, e.g. `execute:`
    pub fn entries(journal: &Journal, prefix: &str) -> Vec<String> {
        journal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|entry| entry.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn record(&self, entry: &str) {
        self.journal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(format!("{}:{}", entry, self.name));
    }
}

#[async_trait]
impl Component for ScriptedComponent {
    fn validate(&self) -> Result<()> {
        if self.behavior == "invalid" {
            return Err(ConfigError::MissingParameter { name: "Command".to_string() }.into());
        }
        Ok(())
    }

    async fn initialize(&mut self, _context: &RunContext, _cancel: &CancellationToken) -> Result<()> {
        self.record("initialize");
        Ok(())
    }

    async fn execute(&mut self, context: &RunContext, cancel: &CancellationToken) -> Result<()> {
        self.record("execute");

        match self.behavior.as_str() {
            "fail" => Err(WorkloadError::Failed {
                component: self.name.clone(),
                reason: "scripted failure".to_string(),
            }
            .into()),
            "transient" => Err(ApiError::Unreachable {
                uri: "http://10.0.0.9:4500".to_string(),
                reason: "connection refused".to_string(),
            }
            .into()),
            "config" => Err(ConfigError::MissingParameter { name: "Port".to_string() }.into()),
            "sleep" => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.record("cancelled");
                        Err(EngineError::Cancelled)
                    }
                    _ = tokio::time::sleep(self.sleep) => Ok(()),
                }
            }
            "wait" => {
                cancel.cancelled().await;
                self.record("cancelled");
                Err(EngineError::Cancelled)
            }
            "publish" => {
                let metric = Metric::new("Value", self.value, "count", MetricRelativity::HigherIsBetter);
                context.publisher.publish(&self.name, Self::TYPE_NAME, &[metric]).await
            }
            "reboot" => {
                context.request_reboot();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn dispose(&mut self, _context: &RunContext) -> Result<()> {
        self.record("dispose");
        Ok(())
    }
}
