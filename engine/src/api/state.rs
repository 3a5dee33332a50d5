//! In-process agent state
//!
//! [`AgentState`] is what the control-plane server exposes: the online flag,
//! named state documents and exit registrations. Components on the same
//! machine reach it directly through [`LocalControlPlane`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::ControlPlane;
use crate::error::{EngineError, Result};

/// Shared state behind one agent's control plane
#[derive(Debug)]
pub struct AgentState {
    agent_id: String,
    online: AtomicBool,
    documents: RwLock<HashMap<String, Value>>,
    exits: RwLock<BTreeMap<String, bool>>,
    exit_signal: Notify,
}

impl AgentState {
    pub fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            online: AtomicBool::new(false),
            documents: RwLock::new(HashMap::new()),
            exits: RwLock::new(BTreeMap::new()),
            exit_signal: Notify::new(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous != online {
            info!(agent_id = %self.agent_id, online, "Server online state changed");
        }
    }

    // State names are matched case-insensitively.
    fn key(name: &str) -> String {
        name.to_lowercase()
    }

    pub fn get_state(&self, name: &str) -> Option<Value> {
        let documents = self.documents.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        documents.get(&Self::key(name)).cloned()
    }

    pub fn update_state(&self, name: &str, document: Value) {
        debug!(state = name, "State document updated");
        let mut documents = self.documents.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        documents.insert(Self::key(name), document);
    }

    /// Remove a document; returns whether it existed
    pub fn delete_state(&self, name: &str) -> bool {
        let mut documents = self.documents.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        documents.remove(&Self::key(name)).is_some()
    }

    pub fn state_names(&self) -> Vec<String> {
        let documents = self.documents.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut names: Vec<String> = documents.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn register_exit(&self, instance: &str) {
        info!(instance, "Registered for exit notification");
        let mut exits = self.exits.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        exits.entry(instance.to_lowercase()).or_insert(false);
    }

    /// Mark `instance` as exited; returns whether it had registered
    pub fn notify_exit(&self, instance: &str) -> bool {
        let registered = {
            let mut exits = self.exits.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            let registered = exits.contains_key(&instance.to_lowercase());
            exits.insert(instance.to_lowercase(), true);
            registered
        };

        info!(instance, registered, "Exit notification received");
        self.exit_signal.notify_waiters();
        registered
    }

    /// Instances that registered for exit notification, with whether each has exited
    pub fn exit_registrations(&self) -> BTreeMap<String, bool> {
        self.exits.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// True once at least one instance registered and every registered one exited
    pub fn all_exits_notified(&self) -> bool {
        let exits = self.exits.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        !exits.is_empty() && exits.values().all(|exited| *exited)
    }

    /// Wait until [`all_exits_notified`](Self::all_exits_notified) holds
    pub async fn wait_for_exit_notifications(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let notified = self.exit_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.all_exits_notified() {
                return Ok(());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// Forget exit registrations from a previous run
    pub fn clear_exit_registrations(&self) {
        self.exits.write().unwrap_or_else(|poisoned| poisoned.into_inner()).clear();
    }
}

/// [`ControlPlane`] served straight from this process's [`AgentState`]
#[derive(Debug, Clone)]
pub struct LocalControlPlane {
    state: Arc<AgentState>,
}

impl LocalControlPlane {
    pub fn new(state: Arc<AgentState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<AgentState> {
        &self.state
    }
}

#[async_trait]
impl ControlPlane for LocalControlPlane {
    fn endpoint(&self) -> String {
        format!("local://{}", self.state.agent_id())
    }

    async fn heartbeat(&self) -> Result<()> {
        Ok(())
    }

    async fn is_server_online(&self) -> Result<bool> {
        Ok(self.state.is_online())
    }

    async fn get_state(&self, name: &str) -> Result<Option<Value>> {
        Ok(self.state.get_state(name))
    }

    async fn update_state(&self, name: &str, document: &Value) -> Result<()> {
        self.state.update_state(name, document.clone());
        Ok(())
    }

    async fn delete_state(&self, name: &str) -> Result<()> {
        self.state.delete_state(name);
        Ok(())
    }

    async fn register_exit_notification(&self, instance: &str) -> Result<()> {
        self.state.register_exit(instance);
        Ok(())
    }

    async fn notify_exit(&self, instance: &str) -> Result<()> {
        self.state.notify_exit(instance);
        Ok(())
    }
}
