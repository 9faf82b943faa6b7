//! Controller Configuration
//!
//! This module provides configuration structures for the Dstore
//! controller. Every field has a default, so an empty file is valid.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main controller configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Replication and protocol settings
    #[serde(default)]
    pub controller: ControllerSection,

    /// Status API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Core controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSection {
    /// Port clients and Dstores connect to
    #[serde(default = "default_port")]
    pub port: u16,

    /// Replicas required per file
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    /// Acknowledgement timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Interval between rebalance passes in milliseconds
    #[serde(default = "default_rebalance_period_ms")]
    pub rebalance_period_ms: u64,

    /// Longest accepted protocol line in bytes
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP status API
    #[serde(default)]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable permissive CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_port() -> u16 {
    12345
}

fn default_replication_factor() -> usize {
    3
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_rebalance_period_ms() -> u64 {
    30_000
}

fn default_max_line_length() -> usize {
    64 * 1024
}

fn default_api_address() -> String {
    "127.0.0.1:8081".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            replication_factor: default_replication_factor(),
            timeout_ms: default_timeout_ms(),
            rebalance_period_ms: default_rebalance_period_ms(),
            max_line_length: default_max_line_length(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ControllerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        let section = &self.controller;

        if section.port == 0 {
            return Err(crate::Error::Config("controller.port cannot be 0".into()));
        }

        if section.replication_factor == 0 {
            return Err(crate::Error::Config(
                "controller.replication_factor must be at least 1".into(),
            ));
        }

        if section.timeout_ms == 0 {
            return Err(crate::Error::Config("controller.timeout_ms must be positive".into()));
        }

        if section.rebalance_period_ms == 0 {
            return Err(crate::Error::Config(
                "controller.rebalance_period_ms must be positive".into(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(crate::Error::Config(format!(
                "logging.format must be 'pretty' or 'json', got '{}'",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Address the controller listens on
    pub fn bind_address(&self) -> String {
        format!("0.0.0.0:{}", self.controller.port)
    }

    /// Get acknowledgement timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.controller.timeout_ms)
    }

    /// Get rebalance period as Duration
    pub fn rebalance_period(&self) -> Duration {
        Duration::from_millis(self.controller.rebalance_period_ms)
    }

    /// Render as TOML, for `init`
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
