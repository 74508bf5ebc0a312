// Coordination engine capabilities
//
// INTENTION: Describe the minimal command set each registry strategy needs
// from its coordination backend. A real key/value server or tree service
// is wired in by implementing one of these traits; the crate ships
// in-process implementations in `memory`.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::errors::EngineError;

/// Flat key/value store with per-key expiry and pub/sub channels
#[async_trait]
pub trait KvEngine: Send + Sync {
    /// SET with expiry; overwrites any previous value
    async fn set_with_expiry(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), EngineError>;

    /// Keys matching a glob pattern. Only a trailing `*` is required.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, EngineError>;

    /// Values for each key in order; missing or expired keys yield `None`
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, EngineError>;

    /// Delete a key, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool, EngineError>;

    /// Publish a message on a channel
    async fn publish(&self, channel: &str, message: String) -> Result<(), EngineError>;

    /// Subscribe to a channel. The receiver closes when the subscription is lost.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>, EngineError>;
}

/// Node lifetime in a tree engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Removed automatically when the creating session ends
    Ephemeral,
}

/// What fired a children watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    ChildrenChanged(String),
    SessionLost,
}

/// Session state transitions of a tree engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session ended; every ephemeral node it owned is gone
    Expired,
    /// A new session is established after an expiry
    Reconnected,
}

/// Hierarchical tree with ephemeral nodes and one-shot children watches
#[async_trait]
pub trait TreeEngine: Send + Sync {
    /// Create a node. Fails with `AlreadyExists` or, when the parent is
    /// missing, `NoNode`.
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode)
        -> Result<(), EngineError>;

    /// Names (not paths) of the direct children of `path`
    async fn get_children(&self, path: &str) -> Result<Vec<String>, EngineError>;

    /// Children plus a watch that fires once on the next change under `path`
    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, oneshot::Receiver<WatchEvent>), EngineError>;

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>, EngineError>;

    /// Delete a node; `NoNode` when it does not exist
    async fn delete(&self, path: &str) -> Result<(), EngineError>;

    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;
}
