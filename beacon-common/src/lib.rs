//! Beacon Common
//!
//! Common utilities shared by the Beacon crates.
//!
//! This crate provides:
//! - Component-based structured logging with node identity context
//! - Level-checked logging macros
//! - Provider and sender identifier helpers

pub mod logging;
pub mod macros;

pub use logging::{Component, LogLevel, Logger, LoggingConfig};

/// Identifier helpers used when a process announces or calls services
pub mod ids {
    use rand::distr::Alphanumeric;
    use rand::Rng;

    /// Length of the random suffix appended to sender identifiers
    pub const RANDOM_SUFFIX_LEN: usize = 8;

    /// Random lowercase alphanumeric string of the given length
    pub fn random_suffix(len: usize) -> String {
        rand::rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(|b| (b as char).to_ascii_lowercase())
            .collect()
    }

    /// Provider identifier for a listening endpoint.
    ///
    /// Deterministic in host and port so that re-registering the same
    /// physical endpoint overwrites its previous record.
    pub fn provider_id(host: &str, port: u16) -> String {
        format!("{host}:{port}")
    }

    /// Identifier stamped on outgoing calls: host, process id and a random suffix
    pub fn sender_id(host: &str) -> String {
        format!(
            "{host}.{pid}.{suffix}",
            pid = std::process::id(),
            suffix = random_suffix(RANDOM_SUFFIX_LEN)
        )
    }

}
