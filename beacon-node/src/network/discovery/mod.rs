// Registry Adapter Interface
//
// INTENTION: Define one contract over the coordination backends used for
// service discovery. A server publishes its presence under
// `(alias, provider_id)`; a client looks providers up by alias, fetches
// their records and subscribes to new arrivals. The adapter does NOT keep
// connections or decide what to do with providers; that is the pool's job.
//
// Two strategies are provided:
// - `FlatTtlRegistry`: SET with expiry plus a per-alias change channel
// - `HierarchicalRegistry`: persistent alias folders with ephemeral
//   provider nodes and re-armed children watches

use async_trait::async_trait;
use beacon_common::logging::Logger;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::config::BackendOptions;
use crate::errors::RpcError;
use crate::events::EventBus;
use crate::services::PermittedActions;

pub mod engine;
pub mod flat_ttl;
pub mod hierarchical;
pub mod memory;

pub use engine::{CreateMode, KvEngine, SessionEvent, TreeEngine, WatchEvent};
pub use flat_ttl::FlatTtlRegistry;
pub use hierarchical::HierarchicalRegistry;
pub use memory::{MemoryKvEngine, MemoryTreeEngine};

/// Default key prefix of the flat strategy
pub const DEFAULT_FLAT_ROOT: &str = "beacon/services";
/// Default root folder of the hierarchical strategy
pub const DEFAULT_TREE_ROOT: &str = "/beacon/services";
/// Provider segment of a pattern key
pub const WILDCARD: &str = "*";

/// Closed set of registry strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    FlatTtl,
    Hierarchical,
}

impl BackendKind {
    /// Resolve a configured backend name
    pub fn from_name(name: &str) -> Result<Self, RpcError> {
        match name {
            "flat-ttl" => Ok(BackendKind::FlatTtl),
            "hierarchical" => Ok(BackendKind::Hierarchical),
            other => Err(RpcError::AdapterUnsupported(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::FlatTtl => "flat-ttl",
            BackendKind::Hierarchical => "hierarchical",
        }
    }

    fn default_root(&self) -> &'static str {
        match self {
            BackendKind::FlatTtl => DEFAULT_FLAT_ROOT,
            BackendKind::Hierarchical => DEFAULT_TREE_ROOT,
        }
    }
}

/// Decoded form of an opaque registry key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryKey {
    pub alias: String,
    pub provider_id: String,
}

impl RegistryKey {
    pub fn new(alias: impl Into<String>, provider_id: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            provider_id: provider_id.into(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.provider_id == WILDCARD
    }
}

/// Composes and parses `<root>/<alias>/<provider_id>` keys.
///
/// Both strategies share the layout; for the tree the key is the node path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCodec {
    root: String,
}

impl KeyCodec {
    pub fn new(root: impl Into<String>) -> Self {
        let root: String = root.into();
        Self {
            root: root.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Folder (tree) or channel (flat) for an alias
    pub fn folder(&self, alias: &str) -> String {
        format!("{}/{alias}", self.root)
    }

    pub fn key(&self, alias: &str, provider_id: &str) -> String {
        format!("{}/{alias}/{provider_id}", self.root)
    }

    pub fn wildcard(&self, alias: &str) -> String {
        self.key(alias, WILDCARD)
    }

    /// Round-trip an opaque key back into `(alias, provider_id)`
    pub fn decode(&self, key: &str) -> Option<RegistryKey> {
        let rest = key.strip_prefix(&self.root)?.strip_prefix('/')?;
        let (alias, provider_id) = rest.split_once('/')?;
        if alias.is_empty() || provider_id.is_empty() || provider_id.contains('/') {
            return None;
        }
        Some(RegistryKey::new(alias, provider_id))
    }
}

/// Aliases become key segments, so separators and wildcards are rejected
pub fn validate_alias(alias: &str) -> Result<(), RpcError> {
    if alias.trim().is_empty() {
        return Err(RpcError::InvalidParams("alias must not be empty".into()));
    }
    if alias.contains('/') || alias.contains(WILDCARD) {
        return Err(RpcError::InvalidParams(format!(
            "alias '{alias}' must not contain '/' or '*'"
        )));
    }
    Ok(())
}

/// The value a server publishes for each `(alias, provider_id)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub provider_id: String,
    pub host: String,
    pub port: u16,
    pub permitted_actions: PermittedActions,
    /// Seconds since UNIX epoch of the registration that produced the record
    pub registered_at_epoch: i64,
}

impl ProviderRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>, RpcError> {
        serde_json::to_vec(self)
            .map_err(|e| RpcError::InvalidParams(format!("unserializable provider record: {e}")))
    }

    /// Parse a raw registry value. Records without a host or port are invalid.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let record: ProviderRecord = serde_json::from_slice(bytes).ok()?;
        if record.host.is_empty() || record.port == 0 || record.provider_id.is_empty() {
            return None;
        }
        Some(record)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Async callback receiving newly seen keys (or a subscription error)
pub type ChangeListener = Arc<
    dyn Fn(Result<Vec<String>, RpcError>) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

/// Uniform contract over a coordination backend
#[async_trait]
pub trait RegistryAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Prepare the backend and emit `Ready`
    async fn connect(&self) -> Result<(), RpcError>;

    /// Publish presence. Already-existing keys/nodes count as success.
    async fn publish(
        &self,
        alias: &str,
        provider_id: &str,
        value: Vec<u8>,
        liveness: Duration,
    ) -> Result<(), RpcError>;

    /// Opaque keys of every provider currently registered for `alias`
    async fn lookup(&self, alias: &str) -> Result<Vec<String>, RpcError>;

    /// Raw values for the given keys, in order
    async fn fetch_values(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, RpcError>;

    /// Remove a provider's presence. Removing something absent is fine.
    async fn remove(&self, alias: &str, provider_id: &str) -> Result<(), RpcError>;

    /// Watch `alias` for provider arrivals
    async fn subscribe(&self, alias: &str, listener: ChangeListener) -> Result<(), RpcError>;

    fn decode_key(&self, key: &str) -> Option<RegistryKey>;

    /// Stop background subscription tasks
    async fn shutdown(&self);
}

/// Engines available to build an adapter from
#[derive(Clone, Default)]
pub struct RegistryEngines {
    pub kv: Option<Arc<dyn KvEngine>>,
    pub tree: Option<Arc<dyn TreeEngine>>,
}

impl RegistryEngines {
    pub fn with_kv(mut self, engine: Arc<dyn KvEngine>) -> Self {
        self.kv = Some(engine);
        self
    }

    pub fn with_tree(mut self, engine: Arc<dyn TreeEngine>) -> Self {
        self.tree = Some(engine);
        self
    }
}

/// Build the adapter selected by `backend`.
///
/// An unknown name fails with `AdapterUnsupported` before anything is
/// created; a known name without its engine fails with `RegistryUnavailable`.
pub fn create_adapter(
    backend: &str,
    options: &BackendOptions,
    engines: &RegistryEngines,
    events: EventBus,
    logger: Arc<Logger>,
) -> Result<Arc<dyn RegistryAdapter>, RpcError> {
    let kind = BackendKind::from_name(backend)?;
    let root = options
        .root
        .clone()
        .unwrap_or_else(|| kind.default_root().to_string());
    let codec = KeyCodec::new(root);

    match kind {
        BackendKind::FlatTtl => {
            let engine = engines.kv.clone().ok_or_else(|| {
                RpcError::RegistryUnavailable("no key/value engine supplied for flat-ttl".into())
            })?;
            Ok(Arc::new(FlatTtlRegistry::new(
                engine,
                codec,
                options.resubscribe_interval(),
                events,
                logger,
            )))
        }
        BackendKind::Hierarchical => {
            let engine = engines.tree.clone().ok_or_else(|| {
                RpcError::RegistryUnavailable("no tree engine supplied for hierarchical".into())
            })?;
            Ok(Arc::new(HierarchicalRegistry::new(
                engine,
                codec,
                options.resubscribe_interval(),
                events,
                logger,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use beacon_common::logging::Component;
    use std::collections::BTreeSet;

    #[test]
    fn keys_round_trip() {
        let codec = KeyCodec::new("/beacon/services/");
        let key = codec.key("lodash", "10.0.0.1:7007");
        assert_eq!(key, "/beacon/services/lodash/10.0.0.1:7007");
        assert_eq!(
            codec.decode(&key),
            Some(RegistryKey::new("lodash", "10.0.0.1:7007"))
        );

        let pattern = codec.wildcard("lodash");
        assert!(codec.decode(&pattern).unwrap().is_wildcard());

        assert_eq!(codec.decode("/other/lodash/x"), None);
        assert_eq!(codec.decode("/beacon/services/lodash"), None);
        assert_eq!(codec.decode("/beacon/services/lodash/a/b"), None);
    }

    #[test]
    fn alias_validation() {
        assert!(validate_alias("lodash").is_ok());
        assert_eq!(validate_alias("").unwrap_err().kind(), ErrorKind::InvalidParams);
        assert!(validate_alias("a/b").is_err());
        assert!(validate_alias("a*").is_err());
    }

    #[test]
    fn provider_records_reject_missing_address() {
        let record = ProviderRecord {
            provider_id: "h:1".into(),
            host: "h".into(),
            port: 1,
            permitted_actions: PermittedActions::Only(BTreeSet::from(["isString".to_string()])),
            registered_at_epoch: 0,
        };
        let bytes = record.to_bytes().unwrap();
        assert_eq!(ProviderRecord::from_bytes(&bytes), Some(record));

        assert_eq!(ProviderRecord::from_bytes(b"not json"), None);
        assert_eq!(
            ProviderRecord::from_bytes(
                br#"{"provider_id":"h:0","host":"h","port":0,"permitted_actions":"allow_all","registered_at_epoch":0}"#
            ),
            None
        );
    }

    #[test]
    fn unknown_backend_fails_before_construction() {
        let logger = Arc::new(Logger::new_root(Component::Adapter, "test"));
        let events = EventBus::new(logger.clone());
        let result = create_adapter(
            "mongodb",
            &BackendOptions::default(),
            &RegistryEngines::default(),
            events.clone(),
            logger.clone(),
        );
        assert_eq!(result.err().unwrap().kind(), ErrorKind::AdapterUnsupported);

        let result = create_adapter(
            "flat-ttl",
            &BackendOptions::default(),
            &RegistryEngines::default(),
            events,
            logger,
        );
        assert_eq!(result.err().unwrap().kind(), ErrorKind::RegistryUnavailable);
    }
}
