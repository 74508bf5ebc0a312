// Error taxonomy
//
// Call-scoped failures (`InvalidParams`, `NoServiceFound`, `ActionForbidden`,
// `RemoteCallError`) are returned from the `call` that triggered them.
// `RegistryUnavailable` raised by background work is reported on the event
// bus instead. `AdapterUnsupported` only ever comes out of a constructor.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::network::transport::NetworkError;

/// Wire-level error kind carried by error responses and events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidParams,
    NoServiceFound,
    ActionForbidden,
    RemoteCallError,
    RegistryUnavailable,
    AdapterUnsupported,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidParams => "InvalidParams",
            ErrorKind::NoServiceFound => "NoServiceFound",
            ErrorKind::ActionForbidden => "ActionForbidden",
            ErrorKind::RemoteCallError => "RemoteCallError",
            ErrorKind::RegistryUnavailable => "RegistryUnavailable",
            ErrorKind::AdapterUnsupported => "AdapterUnsupported",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for every public Beacon operation
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error("No service found: {0}")]
    NoServiceFound(String),
    #[error("Action forbidden: {alias}.{action}")]
    ActionForbidden { alias: String, action: String },
    #[error("Remote call error: {0}")]
    RemoteCallError(String),
    #[error("Registry unavailable: {0}")]
    RegistryUnavailable(String),
    #[error("Unsupported adapter: {0}")]
    AdapterUnsupported(String),
    #[error("Transport error: {0}")]
    Transport(#[from] NetworkError),
}

impl RpcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::InvalidParams(_) => ErrorKind::InvalidParams,
            RpcError::NoServiceFound(_) => ErrorKind::NoServiceFound,
            RpcError::ActionForbidden { .. } => ErrorKind::ActionForbidden,
            RpcError::RemoteCallError(_) => ErrorKind::RemoteCallError,
            RpcError::RegistryUnavailable(_) => ErrorKind::RegistryUnavailable,
            RpcError::AdapterUnsupported(_) => ErrorKind::AdapterUnsupported,
            // Local endpoint failures look like a failed remote call to the caller
            RpcError::Transport(_) => ErrorKind::RemoteCallError,
        }
    }

    /// Rebuild a structured error from an error response
    pub fn from_response(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::InvalidParams => RpcError::InvalidParams(message),
            ErrorKind::NoServiceFound => RpcError::NoServiceFound(message),
            ErrorKind::ActionForbidden => {
                let (alias, action) = match message.split_once('.') {
                    Some((alias, action)) => (alias.to_string(), action.to_string()),
                    None => (String::new(), message),
                };
                RpcError::ActionForbidden { alias, action }
            }
            ErrorKind::RemoteCallError => RpcError::RemoteCallError(message),
            ErrorKind::RegistryUnavailable => RpcError::RegistryUnavailable(message),
            ErrorKind::AdapterUnsupported => RpcError::AdapterUnsupported(message),
        }
    }
}

/// Errors raised by a coordination engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("node or key already exists: {0}")]
    AlreadyExists(String),
    #[error("no such node: {0}")]
    NoNode(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend error: {0}")]
    Other(String),
}

impl From<EngineError> for RpcError {
    fn from(err: EngineError) -> Self {
        RpcError::RegistryUnavailable(err.to_string())
    }
}
