//! Configuration management for the Meridian proxy.
//!
//! Loads the application configuration from a TOML file, creating a
//! default one on first run, and applies command-line overrides.

use std::path::Path;

use proxy_server::ProxyConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Proxy core settings: bind address, backends, transfer tuning.
    pub proxy: ProxyConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Logging configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter
    pub level: String,
    /// JSON formatting
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from `path`, writing a default file if none
    /// exists yet.
    pub async fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }
}
