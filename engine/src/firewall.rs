//! Inbound port management
//!
//! The engine only declares which ports a server workload needs; applying the
//! rules is up to the [`FirewallManager`] implementation for the platform.

use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// A named inbound rule over an inclusive port range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallEntry {
    pub name: String,
    pub protocol: Protocol,
    pub start_port: u16,
    pub end_port: u16,
}

impl FirewallEntry {
    pub fn port_range(name: &str, protocol: Protocol, start_port: u16, end_port: u16) -> Self {
        Self {
            name: name.to_string(),
            protocol,
            start_port,
            end_port: end_port.max(start_port),
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start_port..=self.end_port).contains(&port)
    }
}

impl fmt::Display for FirewallEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start_port == self.end_port {
            write!(f, "{} {}/{}", self.name, self.protocol, self.start_port)
        } else {
            write!(f, "{} {}/{}-{}", self.name, self.protocol, self.start_port, self.end_port)
        }
    }
}

#[async_trait]
pub trait FirewallManager: Send + Sync {
    async fn enable_inbound_connections(&self, entries: &[FirewallEntry]) -> Result<()>;

    /// Roll back rules opened by [`enable_inbound_connections`](Self::enable_inbound_connections)
    async fn disable_inbound_connections(&self, entries: &[FirewallEntry]) -> Result<()>;
}

/// Records and logs requested rules without touching the OS
#[derive(Debug, Default)]
pub struct LoggingFirewall {
    enabled: Mutex<Vec<FirewallEntry>>,
}

impl LoggingFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules currently open
    pub fn enabled_entries(&self) -> Vec<FirewallEntry> {
        self.enabled.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }
}

#[async_trait]
impl FirewallManager for LoggingFirewall {
    async fn enable_inbound_connections(&self, entries: &[FirewallEntry]) -> Result<()> {
        let mut enabled = self.enabled.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for entry in entries {
            info!(rule = %entry, "Enabling inbound connections");
            if !enabled.contains(entry) {
                enabled.push(entry.clone());
            }
        }
        Ok(())
    }

    async fn disable_inbound_connections(&self, entries: &[FirewallEntry]) -> Result<()> {
        let mut enabled = self.enabled.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for entry in entries {
            info!(rule = %entry, "Disabling inbound connections");
            enabled.retain(|existing| existing != entry);
        }
        Ok(())
    }
}
