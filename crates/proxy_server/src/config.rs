//! Proxy configuration structures.
//!
//! All settings consumed by the core are read-only after startup. The
//! structures serialize to/from TOML for configuration files.

use std::net::SocketAddr;

use proxy_protocol::MessageKind;
use serde::{Deserialize, Serialize};

/// Root proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Network address clients connect to.
    pub bind_address: SocketAddr,

    /// Maximum number of concurrent client sessions.
    pub max_connections: usize,

    /// Enable SO_REUSEPORT and one accept loop per CPU core.
    pub use_reuse_port: bool,

    /// Backend the proxy routes new sessions to.
    pub default_backend: String,

    /// Known backends, by name.
    pub backends: Vec<BackendSettings>,

    /// Transfer handshake tuning.
    pub transfer: TransferSettings,
}

/// One backend game server the proxy can route players to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Registry name, as used in transfer requests.
    pub name: String,

    /// Address the proxy dials.
    pub address: SocketAddr,

    /// Backend to silently fall back to if a transfer here fails.
    pub fallback: Option<String>,
}

/// Settings governing the backend-transfer handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Maximum messages the quarantine queue retains before the transfer
    /// is treated as failed.
    pub queue_capacity: usize,

    /// Seconds to wait for a new backend connection before treating the
    /// transfer as failed.
    pub connect_timeout_secs: u64,

    /// High-frequency transient message kinds dropped instead of queued
    /// during a transfer; they are stale by release time.
    pub transient_denylist: Vec<MessageKind>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 8048,
            connect_timeout_secs: 15,
            transient_denylist: vec![MessageKind::Particle, MessageKind::AmbientSound],
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:25565".parse().expect("static address"),
            max_connections: 1000,
            use_reuse_port: false,
            default_backend: "lobby".to_string(),
            backends: vec![BackendSettings {
                name: "lobby".to_string(),
                address: "127.0.0.1:25566".parse().expect("static address"),
                fallback: None,
            }],
            transfer: TransferSettings::default(),
        }
    }
}

impl ProxyConfig {
    /// Validates internal consistency of the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.backends.is_empty() {
            return Err("at least one backend must be configured".to_string());
        }
        if !self.backends.iter().any(|b| b.name == self.default_backend) {
            return Err(format!(
                "default backend '{}' is not in the backend list",
                self.default_backend
            ));
        }
        for backend in &self.backends {
            if let Some(fallback) = &backend.fallback {
                if fallback == &backend.name {
                    return Err(format!(
                        "backend '{}' lists itself as its fallback",
                        backend.name
                    ));
                }
                if !self.backends.iter().any(|b| &b.name == fallback) {
                    return Err(format!(
                        "backend '{}' lists unknown fallback '{}'",
                        backend.name, fallback
                    ));
                }
            }
        }
        if self.transfer.queue_capacity == 0 {
            return Err("transfer queue capacity must be positive".to_string());
        }
        if self.transfer.connect_timeout_secs == 0 {
            return Err("transfer connect timeout must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ProxyConfig::default().validate().is_ok());
    }

    #[test]
    fn default_transfer_settings() {
        let transfer = TransferSettings::default();
        assert_eq!(transfer.queue_capacity, 8048);
        assert_eq!(transfer.connect_timeout_secs, 15);
        assert!(transfer.transient_denylist.contains(&MessageKind::Particle));
    }

    #[test]
    fn unknown_default_backend_is_rejected() {
        let mut config = ProxyConfig::default();
        config.default_backend = "missing".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn self_fallback_is_rejected() {
        let mut config = ProxyConfig::default();
        config.backends[0].fallback = Some("lobby".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip() {
        let config = ProxyConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: ProxyConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.bind_address, config.bind_address);
        assert_eq!(parsed.default_backend, config.default_backend);
        assert_eq!(
            parsed.transfer.queue_capacity,
            config.transfer.queue_capacity
        );
    }

    #[test]
    fn toml_parsing() {
        let text = r#"
bind_address = "0.0.0.0:25565"
max_connections = 500
use_reuse_port = true
default_backend = "hub"

[[backends]]
name = "hub"
address = "10.0.0.2:25566"
fallback = "overflow"

[[backends]]
name = "overflow"
address = "10.0.0.3:25566"

[transfer]
queue_capacity = 4096
connect_timeout_secs = 10
transient_denylist = ["particle", "ambient_sound"]
        "#;
        let config: ProxyConfig = toml::from_str(text).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.transfer.queue_capacity, 4096);
        assert_eq!(
            config.backends[0].fallback.as_deref(),
            Some("overflow")
        );
    }
}
