//! Component type registry
//!
//! Maps the `Type` string of a profile element to a factory. Built-ins are
//! registered explicitly by [`ComponentRegistry::with_defaults`].

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{Component, ComponentHost, ComponentStage};
use crate::error::{ConfigError, Result};
use crate::profile::ProfileElement;
use crate::workloads::{
    ClientWorkload, ExecuteCommand, RequirePackage, ServerWorkload, SystemMonitor, WorkloadExecutor,
};

/// Builds a component from its (validated, placeholder-evaluated) element
pub type ComponentFactory = Arc<dyn Fn(&ProfileElement) -> Result<Box<dyn Component>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ComponentRegistry {
    factories: BTreeMap<String, (String, ComponentFactory)>,
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in component type
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("ExecuteCommand", |element| Ok(Box::new(ExecuteCommand::from_element(element)?)));
        registry.register("RequirePackage", |element| Ok(Box::new(RequirePackage::from_element(element)?)));
        registry.register("WorkloadExecutor", |element| Ok(Box::new(WorkloadExecutor::from_element(element)?)));
        registry.register("ServerWorkload", |element| Ok(Box::new(ServerWorkload::from_element(element)?)));
        registry.register("ClientWorkload", |element| Ok(Box::new(ClientWorkload::from_element(element)?)));
        registry.register("SystemMonitor", |element| Ok(Box::new(SystemMonitor::from_element(element)?)));
        registry
    }

    /// Register a factory; an existing registration under the same key is replaced
    pub fn register<F>(&mut self, type_name: &str, factory: F)
    where
        F: Fn(&ProfileElement) -> Result<Box<dyn Component>> + Send + Sync + 'static,
    {
        let key = type_name.to_lowercase();
        if self.factories.contains_key(&key) {
            warn!(component_type = type_name, "Replacing registered component factory");
        } else {
            debug!(component_type = type_name, "Registered component factory");
        }
        self.factories.insert(key, (type_name.to_string(), Arc::new(factory)));
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(&type_name.to_lowercase())
    }

    /// Registered type names, sorted
    pub fn names(&self) -> Vec<String> {
        self.factories.values().map(|(name, _)| name.clone()).collect()
    }

    /// Host for `element`; unknown types are configuration errors
    pub fn create(&self, element: &ProfileElement, stage: ComponentStage) -> Result<ComponentHost> {
        let (_, factory) = self
            .factories
            .get(&element.component_type.to_lowercase())
            .ok_or_else(|| ConfigError::UnknownComponent { type_name: element.component_type.clone() })?;

        Ok(ComponentHost::new(element.clone(), stage, factory.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    #[test]
    fn test_defaults_registered() {
        let registry = ComponentRegistry::with_defaults();
        for name in ["ExecuteCommand", "RequirePackage", "WorkloadExecutor", "ServerWorkload", "ClientWorkload", "SystemMonitor"] {
            assert!(registry.contains(name), "{} missing", name);
        }
        assert!(registry.contains("clientworkload"));
    }

    #[test]
    fn test_unknown_type() {
        let registry = ComponentRegistry::with_defaults();
        let error = registry.create(&ProfileElement::new("GeekBench"), ComponentStage::Action).unwrap_err();
        assert!(matches!(error, EngineError::Config(ConfigError::UnknownComponent { .. })));
    }

    #[test]
    fn test_duplicate_registration_replaces() {
        let mut registry = ComponentRegistry::new();
        registry.register("ExecuteCommand", |element| Ok(Box::new(ExecuteCommand::from_element(element)?)));
        registry.register("executecommand", |element| Ok(Box::new(RequirePackage::from_element(element)?)));
        assert_eq!(registry.names(), vec!["executecommand".to_string()]);
    }
}
