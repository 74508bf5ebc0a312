// Logging utilities for the Beacon system
//
// This module provides:
// - Component-based structured logging
// - Node identity tracking through logger inheritance
// - Alias scoping so pool and registry output can be traced per service
// - A small configuration layer over env_logger

use log::{debug, error, info, warn, LevelFilter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Arguments, Display, Formatter};
use std::sync::Once;

/// Predefined components for logging categorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Client,
    Server,
    Registry,
    Adapter,
    Pool,
    Dispatcher,
    Transport,
    Events,
    Custom(&'static str),
}

impl Component {
    /// Get the string representation of the component
    pub fn as_str(&self) -> &str {
        match self {
            Component::Client => "Client",
            Component::Server => "Server",
            Component::Registry => "Registry",
            Component::Adapter => "Adapter",
            Component::Pool => "Pool",
            Component::Dispatcher => "Dispatcher",
            Component::Transport => "Transport",
            Component::Events => "Events",
            Component::Custom(name) => name,
        }
    }
}

// Lightweight Display helpers to avoid prefix String allocations
struct ComponentPrefixDisplay {
    parent: Option<Component>,
    component: Component,
}

impl Display for ComponentPrefixDisplay {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.parent {
            Some(parent) if parent != self.component => {
                write!(f, "{}.{}", parent.as_str(), self.component.as_str())
            }
            _ => write!(f, "{}", self.component.as_str()),
        }
    }
}

struct MaybeAliasDisplay<'a>(Option<&'a str>);

impl Display for MaybeAliasDisplay<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(alias) = self.0 {
            write!(f, "|alias={alias}")
        } else {
            Ok(())
        }
    }
}

/// A helper for creating component-specific loggers with node identity tracking
#[derive(Clone, Debug)]
pub struct Logger {
    /// Component this logger is for
    component: Component,
    /// Identity of the owning process (provider id or sender id)
    node_id: String,
    /// Parent component for hierarchical logging (if any)
    parent_component: Option<Component>,
    /// Service alias this logger is scoped to
    alias: Option<String>,
}

impl Logger {
    /// Create a new root logger for a specific component and node identity.
    /// Facades create the root; everything else derives from it.
    pub fn new_root(component: Component, node_id: &str) -> Self {
        Self {
            component,
            node_id: node_id.to_string(),
            parent_component: None,
            alias: None,
        }
    }

    /// Create a child logger with the same node identity but a different component
    pub fn with_component(&self, component: Component) -> Self {
        Self {
            component,
            node_id: self.node_id.clone(),
            parent_component: Some(self.component),
            alias: self.alias.clone(),
        }
    }

    /// Create a logger scoped to a service alias
    pub fn with_alias(&self, alias: impl Into<String>) -> Self {
        Self {
            component: self.component,
            node_id: self.node_id.clone(),
            parent_component: self.parent_component,
            alias: Some(alias.into()),
        }
    }

    /// Get a reference to the node identity
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn component(&self) -> Component {
        self.component
    }

    /// Get the alias scope if available
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    fn prefix(&self) -> ComponentPrefixDisplay {
        ComponentPrefixDisplay {
            parent: self.parent_component,
            component: self.component,
        }
    }

    /// Log a debug message
    pub fn debug(&self, message: impl Into<String>) {
        if log::log_enabled!(log::Level::Debug) {
            self.debug_args(format_args!("{}", message.into()));
        }
    }

    /// Log a debug message using fmt::Arguments (avoids allocating message String)
    pub fn debug_args(&self, args: Arguments) {
        if log::log_enabled!(log::Level::Debug) {
            debug!(
                "[{}][{}{}] {}",
                self.node_id,
                self.prefix(),
                MaybeAliasDisplay(self.alias()),
                args
            );
        }
    }

    /// Log an info message
    pub fn info(&self, message: impl Into<String>) {
        if log::log_enabled!(log::Level::Info) {
            self.info_args(format_args!("{}", message.into()));
        }
    }

    /// Log an info message using fmt::Arguments (avoids allocating message String)
    pub fn info_args(&self, args: Arguments) {
        if log::log_enabled!(log::Level::Info) {
            info!(
                "[{}][{}{}] {}",
                self.node_id,
                self.prefix(),
                MaybeAliasDisplay(self.alias()),
                args
            );
        }
    }

    /// Log a warning message
    pub fn warn(&self, message: impl Into<String>) {
        if log::log_enabled!(log::Level::Warn) {
            self.warn_args(format_args!("{}", message.into()));
        }
    }

    /// Log a warning using fmt::Arguments
    pub fn warn_args(&self, args: Arguments) {
        if log::log_enabled!(log::Level::Warn) {
            warn!(
                "[{}][{}{}] {}",
                self.node_id,
                self.prefix(),
                MaybeAliasDisplay(self.alias()),
                args
            );
        }
    }

    /// Log an error message
    pub fn error(&self, message: impl Into<String>) {
        if log::log_enabled!(log::Level::Error) {
            self.error_args(format_args!("{}", message.into()));
        }
    }

    /// Log an error using fmt::Arguments
    pub fn error_args(&self, args: Arguments) {
        if log::log_enabled!(log::Level::Error) {
            error!(
                "[{}][{}{}] {}",
                self.node_id,
                self.prefix(),
                MaybeAliasDisplay(self.alias()),
                args
            );
        }
    }
}

/// Log levels understood by [`LoggingConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
    Off,
}

impl LogLevel {
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Off => LevelFilter::Off,
        }
    }
}

static LOGGER_INIT: Once = Once::new();

/// Logging configuration applied once per process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level used for every module without an explicit override
    pub default_level: LogLevel,
    /// Per-module overrides, keyed by module path (e.g. `beacon_node::network`)
    #[serde(default)]
    pub module_levels: HashMap<String, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::default_info()
    }
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default_info()
    }

    /// Info for everything
    pub fn default_info() -> Self {
        Self {
            default_level: LogLevel::Info,
            module_levels: HashMap::new(),
        }
    }

    pub fn with_default_level(mut self, level: LogLevel) -> Self {
        self.default_level = level;
        self
    }

    pub fn with_module_level(mut self, module: impl Into<String>, level: LogLevel) -> Self {
        self.module_levels.insert(module.into(), level);
        self
    }

    /// Install env_logger with this configuration.
    ///
    /// Only the first call in a process installs the backend; later calls
    /// are ignored, so tests may call this freely.
    pub fn apply(&self) {
        let config = self.clone();
        LOGGER_INIT.call_once(move || {
            let mut builder = env_logger::Builder::new();
            builder.filter_level(config.default_level.to_level_filter());
            for (module, level) in &config.module_levels {
                builder.filter_module(module, level.to_level_filter());
            }
            builder.format_timestamp_millis();
            // Another logger may already be installed (e.g. by a test harness)
            let _ = builder.try_init();
        });
    }
}
