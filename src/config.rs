//! Operator Configuration
//!
//! Settings can come from an optional YAML file. Anything the file leaves
//! out takes its default, and command-line flags override both.

use crate::controller::ControllerConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

pub const DEFAULT_SETTINGS_NAMESPACE: &str = "longhorn-system";
pub const DEFAULT_SETTINGS_CONFIG_MAP: &str = "volume-failover-settings";

/// Where cluster-wide settings are read from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsConfig {
    pub namespace: String,
    pub config_map: String,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_SETTINGS_NAMESPACE.to_string(),
            config_map: DEFAULT_SETTINGS_CONFIG_MAP.to_string(),
        }
    }
}

/// Listen addresses of the probe and metrics endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub health_addr: String,
    pub metrics_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            health_addr: "0.0.0.0:8081".to_string(),
            metrics_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Top-level operator configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorConfig {
    pub controller: ControllerConfig,
    pub settings: SettingsConfig,
    pub server: ServerConfig,
}

impl OperatorConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Reject configurations the controller cannot run with
    pub fn validate(&self) -> Result<()> {
        let controller = &self.controller;
        if controller.driver_name.trim().is_empty() {
            return Err(Error::Configuration("driver name must not be empty".into()));
        }
        if controller.workers == 0 {
            return Err(Error::Configuration("at least one worker is required".into()));
        }
        if !(controller.rate_limiter.qps > 0.0) {
            return Err(Error::Configuration(format!(
                "rate limiter qps must be positive, got {}",
                controller.rate_limiter.qps
            )));
        }
        if controller.rate_limiter.burst == 0 {
            return Err(Error::Configuration("rate limiter burst must be positive".into()));
        }
        if self.settings.config_map.is_empty() || self.settings.namespace.is_empty() {
            return Err(Error::Configuration(
                "settings namespace and config map must be set".into(),
            ));
        }
        self.health_addr()?;
        self.metrics_addr()?;
        Ok(())
    }

    pub fn health_addr(&self) -> Result<SocketAddr> {
        parse_addr("health", &self.server.health_addr)
    }

    pub fn metrics_addr(&self) -> Result<SocketAddr> {
        parse_addr("metrics", &self.server.metrics_addr)
    }
}

fn parse_addr(what: &str, addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} server address {:?}: {}", what, addr, e)))
}
