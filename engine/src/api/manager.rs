//! Hands out control-plane clients per layout instance

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::debug;

use super::{AgentState, ControlPlane, ControlPlaneClient, LocalControlPlane};
use crate::error::Result;
use crate::layout::ClientInstance;

/// Resolves a [`ClientInstance`] to the [`ControlPlane`] that reaches it.
///
/// Loopback instances resolve to the local agent. Remote instances get a
/// cached HTTP client on `http://<ip>:<port>`. Overrides registered by name
/// take precedence over both.
pub struct ApiClientManager {
    local: Arc<LocalControlPlane>,
    port: u16,
    request_timeout: Duration,
    clients: Mutex<HashMap<String, Arc<dyn ControlPlane>>>,
    overrides: RwLock<HashMap<String, Arc<dyn ControlPlane>>>,
}

impl std::fmt::Debug for ApiClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClientManager")
            .field("agent_id", &self.local.state().agent_id())
            .field("port", &self.port)
            .finish()
    }
}

impl ApiClientManager {
    pub fn new(local_state: Arc<AgentState>, port: u16, request_timeout: Duration) -> Self {
        Self {
            local: Arc::new(LocalControlPlane::new(local_state)),
            port,
            request_timeout,
            clients: Mutex::new(HashMap::new()),
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// The agent state this process serves
    pub fn local_state(&self) -> &Arc<AgentState> {
        self.local.state()
    }

    pub fn local(&self) -> Arc<dyn ControlPlane> {
        self.local.clone()
    }

    /// Route requests for the instance called `name` to `plane`
    pub fn register_override(&self, name: &str, plane: Arc<dyn ControlPlane>) {
        let mut overrides = self.overrides.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        overrides.insert(name.to_lowercase(), plane);
    }

    pub fn for_instance(&self, instance: &ClientInstance) -> Result<Arc<dyn ControlPlane>> {
        {
            let overrides = self.overrides.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(plane) = overrides.get(&instance.name.to_lowercase()) {
                return Ok(plane.clone());
            }
        }

        if instance.is_loopback() {
            return Ok(self.local());
        }

        let key = instance.ip_address.to_string();
        let mut clients = self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let host = match instance.ip_address {
            IpAddr::V6(address) => format!("[{}]", address),
            IpAddr::V4(address) => address.to_string(),
        };
        let client: Arc<dyn ControlPlane> =
            Arc::new(ControlPlaneClient::for_host(&host, self.port, self.request_timeout)?);
        debug!(instance = %instance.name, endpoint = %client.endpoint(), "Created control-plane client");
        clients.insert(key, client.clone());
        Ok(client)
    }
}
