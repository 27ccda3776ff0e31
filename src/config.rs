//! TOML configuration surface.
//!
//! Loaded once at startup. Plugin tables (`[[source]]`, `[[filter]]`,
//! `[route.<id>]`) carry a mandatory `type` key plus type-specific keys and
//! are handed to the plugin registries unparsed.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::params::PluginParams;

const DEFAULT_INTERVAL_SECS: u64 = 30;
const DEFAULT_LISTEN: &str = ":19898";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Logging options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter, e.g. "info" or "klaxon=debug".
    pub level: String,
    /// Output format: "text" or "json".
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Root daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Initial seconds to pool posted alerts before processing.
    pub initial_interval: u64,

    /// Maximum pooling interval. The interval starts at
    /// `initial_interval`, doubles after every non-empty drain, and resets
    /// after an empty one.
    pub max_interval: u64,

    /// Listen address for the HTTP API.
    pub listen: String,

    /// Bearer token required by the API when non-empty.
    pub api_token: String,

    pub log: LogConfig,

    /// Alert generators.
    #[serde(rename = "source")]
    pub sources: Vec<PluginParams>,

    /// Route ID to transport list.
    #[serde(rename = "route")]
    pub routes: BTreeMap<String, Vec<PluginParams>>,

    /// Ordered filter pipeline.
    #[serde(rename = "filter")]
    pub filters: Vec<PluginParams>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_interval: DEFAULT_INTERVAL_SECS,
            max_interval: DEFAULT_INTERVAL_SECS,
            listen: DEFAULT_LISTEN.to_string(),
            api_token: String::new(),
            log: LogConfig::default(),
            sources: Vec::new(),
            routes: BTreeMap::new(),
            filters: Vec::new(),
        }
    }
}

impl Config {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }

    pub fn initial_duration(&self) -> Duration {
        Duration::from_secs(self.initial_interval)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_interval)
    }

    /// The listen address with a bare `:port` normalized to all interfaces.
    pub fn listen_addr(&self) -> String {
        if self.listen.starts_with(':') {
            format!("0.0.0.0{}", self.listen)
        } else {
            self.listen.clone()
        }
    }
}
