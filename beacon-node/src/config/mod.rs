// Configuration Module
//
// This module provides the configuration surface shared by clients and
// servers: which registry backend to use and how, the liveness duration of
// published presence, and how the local endpoint is addressed.
//
// ## Examples
//
// ```rust
// use beacon_node::config::BeaconConfig;
//
// let config = BeaconConfig::new("flat-ttl")
//     .with_liveness_seconds(60)
//     .with_host("127.0.0.1");
// ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::RpcError;
use crate::network::discovery::BackendKind;

pub use beacon_common::logging::{LogLevel, LoggingConfig};

/// Default liveness of a published provider record (one hour)
pub const DEFAULT_LIVENESS_SECONDS: u64 = 3600;
/// First port tried when no explicit port is configured
pub const DEFAULT_PORT: u16 = 7007;
/// Delay before a failed subscription is re-armed
pub const DEFAULT_RESUBSCRIBE_INTERVAL_MS: u64 = 1000;

/// Backend-specific options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendOptions {
    /// Key prefix (flat-ttl) or root folder (hierarchical). Each backend
    /// has its own default when absent.
    #[serde(default)]
    pub root: Option<String>,
    /// How long to wait before re-arming a lost subscription or watch
    #[serde(default = "default_resubscribe_interval_ms")]
    pub resubscribe_interval_ms: u64,
}

fn default_resubscribe_interval_ms() -> u64 {
    DEFAULT_RESUBSCRIBE_INTERVAL_MS
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            root: None,
            resubscribe_interval_ms: DEFAULT_RESUBSCRIBE_INTERVAL_MS,
        }
    }
}

impl BackendOptions {
    pub fn resubscribe_interval(&self) -> Duration {
        Duration::from_millis(self.resubscribe_interval_ms)
    }
}

/// Beacon Configuration
///
/// INTENTION: One configuration value for both facades. Only `backend` is
/// required; everything else has a working default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconConfig {
    /// Registry backend name: `flat-ttl` or `hierarchical`
    #[serde(default = "default_backend")]
    pub backend: String,

    #[serde(default)]
    pub backend_options: BackendOptions,

    /// Liveness duration attached to published presence
    #[serde(default = "default_liveness_seconds")]
    pub liveness_seconds: u64,

    /// How often a server re-affirms its presence. Defaults to a third of
    /// the liveness duration.
    #[serde(default)]
    pub republish_interval_secs: Option<u64>,

    /// Advertised host; auto-detected when absent
    #[serde(default)]
    pub host: Option<String>,

    /// Listening port; the first free port from `default_port` when absent
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default = "default_port")]
    pub default_port: u16,

    #[serde(default)]
    pub logging_config: Option<LoggingConfig>,
}

fn default_backend() -> String {
    BackendKind::Hierarchical.name().to_string()
}

fn default_liveness_seconds() -> u64 {
    DEFAULT_LIVENESS_SECONDS
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self::new(default_backend())
    }
}

impl BeaconConfig {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            backend_options: BackendOptions::default(),
            liveness_seconds: DEFAULT_LIVENESS_SECONDS,
            republish_interval_secs: None,
            host: None,
            port: None,
            default_port: DEFAULT_PORT,
            logging_config: None,
        }
    }

    /// Parse a JSON configuration document
    pub fn from_json_str(json: &str) -> Result<Self, RpcError> {
        serde_json::from_str(json)
            .map_err(|e| RpcError::InvalidParams(format!("invalid configuration: {e}")))
    }

    pub fn with_backend_options(mut self, options: BackendOptions) -> Self {
        self.backend_options = options;
        self
    }

    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.backend_options.root = Some(root.into());
        self
    }

    pub fn with_liveness_seconds(mut self, seconds: u64) -> Self {
        self.liveness_seconds = seconds;
        self
    }

    pub fn with_republish_interval_secs(mut self, seconds: u64) -> Self {
        self.republish_interval_secs = Some(seconds);
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    pub fn with_logging_config(mut self, config: LoggingConfig) -> Self {
        self.logging_config = Some(config);
        self
    }

    /// Resolve the backend name. Unknown names are a configuration error.
    pub fn backend_kind(&self) -> Result<BackendKind, RpcError> {
        BackendKind::from_name(&self.backend)
    }

    pub fn liveness(&self) -> Duration {
        Duration::from_secs(self.liveness_seconds)
    }

    pub fn republish_interval(&self) -> Duration {
        let secs = self
            .republish_interval_secs
            .unwrap_or(self.liveness_seconds / 3)
            .max(1);
        Duration::from_secs(secs)
    }
}

impl std::fmt::Display for BeaconConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BeaconConfig: backend:{} liveness:{}s republish:{}s",
            self.backend,
            self.liveness_seconds,
            self.republish_interval().as_secs()
        )?;
        if let Some(host) = &self.host {
            write!(f, " host:{host}")?;
        }
        match self.port {
            Some(port) => write!(f, " port:{port}"),
            None => write!(f, " port:auto(from {})", self.default_port),
        }
    }
}
