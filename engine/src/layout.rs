//! Environment layout and role model
//!
//! A layout lists the machines taking part in a run. It is loaded once and
//! never changes. Runs without a layout get an implicit single-node layout in
//! which the local agent acts as both client and server over loopback.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Role of a machine in a multi-role scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("Client"),
            Role::Server => f.write_str("Server"),
        }
    }
}

impl FromStr for Role {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(Role::Client),
            "server" => Ok(Role::Server),
            _ => Err(ConfigError::InvalidValue {
                field: "Role".to_string(),
                value: value.to_string(),
            }),
        }
    }
}

/// One participating machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInstance {
    pub name: String,
    pub ip_address: IpAddr,
    pub role: Role,
}

impl ClientInstance {
    pub fn new(name: &str, ip_address: IpAddr, role: Role) -> Self {
        Self { name: name.to_string(), ip_address, role }
    }

    pub fn is_loopback(&self) -> bool {
        self.ip_address.is_loopback()
    }
}

#[derive(Debug, Deserialize)]
struct LayoutDocument {
    clients: Vec<ClientInstance>,
}

/// Ordered set of participating machines, unique by name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentLayout {
    instances: Vec<ClientInstance>,
    implicit: bool,
}

impl EnvironmentLayout {
    /// Build a layout, rejecting duplicate names
    pub fn new(instances: Vec<ClientInstance>) -> ConfigResult<Self> {
        if instances.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "environment layout defines no instances".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for instance in &instances {
            if !seen.insert(instance.name.to_lowercase()) {
                return Err(ConfigError::ValidationFailed {
                    reason: format!("duplicate instance name '{}' in environment layout", instance.name),
                });
            }
        }

        Ok(Self { instances, implicit: false })
    }

    /// Single-machine layout resolved to loopback
    pub fn single_node(agent_id: &str) -> Self {
        Self {
            instances: vec![ClientInstance::new(
                agent_id,
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                Role::Client,
            )],
            implicit: true,
        }
    }

    /// Load a layout document: `{ "clients": [ { "name", "ipAddress", "role" } ] }`
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound { path: path.to_string_lossy().to_string() })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> ConfigResult<Self> {
        let document: LayoutDocument = serde_json::from_str(content)
            .map_err(|e| ConfigError::ParseError { reason: e.to_string() })?;
        Self::new(document.clients)
    }

    pub fn is_implicit(&self) -> bool {
        self.implicit
    }

    /// True when client and server roles live on different machines
    pub fn is_multi_role(&self) -> bool {
        !self.implicit
            && self.instances.iter().any(|i| i.role == Role::Client)
            && self.instances.iter().any(|i| i.role == Role::Server)
    }

    pub fn instances(&self) -> &[ClientInstance] {
        &self.instances
    }

    /// All instances with the given role, in layout order
    pub fn get_instances(&self, role: Role) -> Vec<ClientInstance> {
        if self.implicit {
            return self.instances.clone();
        }

        self.instances.iter().filter(|i| i.role == role).cloned().collect()
    }

    /// The instance describing the local machine
    pub fn get_self(&self, agent_id: &str) -> ConfigResult<ClientInstance> {
        if self.implicit {
            return Ok(self.instances[0].clone());
        }

        self.instances
            .iter()
            .find(|i| i.name.eq_ignore_ascii_case(agent_id))
            .cloned()
            .ok_or_else(|| ConfigError::AgentNotInLayout { agent_id: agent_id.to_string() })
    }

    /// Whether the local machine plays `role`; the implicit layout plays every role
    pub fn is_role(&self, agent_id: &str, role: Role) -> ConfigResult<bool> {
        if self.implicit {
            return Ok(true);
        }
        Ok(self.get_self(agent_id)?.role == role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: &str = r#"{
        "clients": [
            { "name": "client-01", "ipAddress": "10.0.0.4", "role": "Client" },
            { "name": "server-01", "ipAddress": "10.0.0.5", "role": "Server" },
            { "name": "server-02", "ipAddress": "10.0.0.6", "role": "Server" }
        ]
    }"#;

    #[test]
    fn test_role_lookup_preserves_order() {
        let layout = EnvironmentLayout::from_json(LAYOUT).unwrap();
        let servers = layout.get_instances(Role::Server);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].name, "server-01");
        assert_eq!(servers[1].name, "server-02");
        assert!(layout.is_multi_role());
    }

    #[test]
    fn test_get_self() {
        let layout = EnvironmentLayout::from_json(LAYOUT).unwrap();
        let me = layout.get_self("CLIENT-01").unwrap();
        assert_eq!(me.ip_address.to_string(), "10.0.0.4");
        assert!(layout.is_role("client-01", Role::Client).unwrap());

        let missing = layout.get_self("unknown");
        assert!(matches!(missing, Err(ConfigError::AgentNotInLayout { .. })));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let duplicated = r#"{ "clients": [
            { "name": "a", "ipAddress": "10.0.0.1", "role": "Client" },
            { "name": "A", "ipAddress": "10.0.0.2", "role": "Server" }
        ] }"#;
        assert!(EnvironmentLayout::from_json(duplicated).is_err());
    }

    #[test]
    fn test_implicit_layout_plays_every_role() {
        let layout = EnvironmentLayout::single_node("my-vm");
        assert!(layout.is_implicit());
        assert!(!layout.is_multi_role());

        let servers = layout.get_instances(Role::Server);
        assert_eq!(servers.len(), 1);
        assert!(servers[0].is_loopback());
        assert_eq!(layout.get_self("anything").unwrap().name, "my-vm");
        assert!(layout.is_role("my-vm", Role::Server).unwrap());
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("server".parse::<Role>().unwrap(), Role::Server);
        assert!("observer".parse::<Role>().is_err());
    }
}
