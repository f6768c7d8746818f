//! Server configuration management

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub protocol: ProtocolSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Address to listen on
    #[serde(default = "ServerSettings::default_bind_addr")]
    pub bind_addr: String,
    /// TCP port
    #[serde(default = "ServerSettings::default_port")]
    pub port: u16,
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "ServerSettings::default_log_level")]
    pub log_level: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: Self::default_bind_addr(),
            port: Self::default_port(),
            log_level: Self::default_log_level(),
        }
    }
}

impl ServerSettings {
    fn default_bind_addr() -> String {
        "0.0.0.0".to_string()
    }

    fn default_port() -> u16 {
        protocol::DEFAULT_PORT
    }

    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolSettings {
    /// Reject frames with bad CRCs. Turning this off is an interop
    /// debugging aid only.
    #[serde(default = "ProtocolSettings::default_verify_crc")]
    pub verify_crc: bool,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            verify_crc: Self::default_verify_crc(),
        }
    }
}

impl ProtocolSettings {
    fn default_verify_crc() -> bool {
        true
    }
}

impl ServerConfig {
    /// Load configuration from a file, or defaults when none is given
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let content = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                let config: ServerConfig = toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
                tracing::info!("Loaded configuration from: {}", path.display());
                config
            }
            None => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Full socket address to bind
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind_addr, self.server.port)
    }

    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.server.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.server.log_level,
                valid_levels.join(", ")
            ));
        }
        Ok(())
    }
}
