use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which [`Registry`](crate::registry::Registry) implementation backs the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryMode {
    /// Single-writer dispatch actor.
    #[default]
    Actor,
    /// Sharded lock map.
    Shared,
}

impl FromStr for RegistryMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "actor" | "hub" => Ok(Self::Actor),
            "shared" => Ok(Self::Shared),
            other => Err(format!("unknown registry mode: {other}")),
        }
    }
}

/// Server configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Capacity of each connection's outbound queue.
    pub queue_capacity: usize,
    /// Pending requests the hub accepts before callers wait.
    pub hub_capacity: usize,
    pub registry: RegistryMode,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 4000,
            queue_capacity: 256,
            hub_capacity: 1024,
            registry: RegistryMode::Actor,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 64 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            queue_capacity: self.queue_capacity,
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs.max(1)),
        }
    }
}

/// Per-connection settings derived from [`ServerConfig`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub queue_capacity: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        ServerConfig::default().session()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:4000");
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.registry, RegistryMode::Actor);
        assert_eq!(config.session().heartbeat_timeout, Duration::from_secs(90));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"port": 9000, "registry": "shared"}"#).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.registry, RegistryMode::Shared);
        assert_eq!(config.hub_capacity, 1024);
    }

    #[test]
    fn registry_mode_parses() {
        assert_eq!("Actor".parse::<RegistryMode>().unwrap(), RegistryMode::Actor);
        assert_eq!("shared".parse::<RegistryMode>().unwrap(), RegistryMode::Shared);
        assert!("redis".parse::<RegistryMode>().is_err());
    }
}
