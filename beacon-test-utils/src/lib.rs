// Test utilities for Beacon crates
//
// This crate provides test-specific functionality that should not be available
// in production builds. All functions in this crate are for testing only.

use anyhow::{anyhow, Result};
use beacon_common::logging::{LogLevel, LoggingConfig};
use beacon_node::config::BackendOptions;
use beacon_node::identity::NodeIdentity;
use beacon_node::network::discovery::RegistryEngines;
use beacon_node::{
    BeaconConfig, Client, LocalService, MemoryKvEngine, MemoryNetwork, MemoryTransport,
    MemoryTreeEngine, Server,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Host every in-process server advertises
pub const TEST_HOST: &str = "127.0.0.1";

/// Re-arm delay used by tests so lost subscriptions recover quickly
pub const TEST_RESUBSCRIBE_INTERVAL_MS: u64 = 50;

/// Enable debug output when `BEACON_TEST_LOG` is set
pub fn init_test_logging() {
    if std::env::var_os("BEACON_TEST_LOG").is_some() {
        LoggingConfig::new()
            .with_default_level(LogLevel::Debug)
            .apply();
    }
}

/// Create a configuration for tests: fixed host, short liveness and quick
/// re-subscription.
pub fn create_test_config(backend: &str) -> BeaconConfig {
    BeaconConfig::new(backend)
        .with_host(TEST_HOST)
        .with_liveness_seconds(60)
        .with_backend_options(BackendOptions {
            root: None,
            resubscribe_interval_ms: TEST_RESUBSCRIBE_INTERVAL_MS,
        })
}

/// An in-process world: one shared registry engine per backend and one
/// memory network that every client and server of a test talks over.
#[derive(Clone)]
pub struct TestBackend {
    pub backend: String,
    pub network: Arc<MemoryNetwork>,
    pub kv: Arc<MemoryKvEngine>,
    pub tree: Arc<MemoryTreeEngine>,
}

impl TestBackend {
    pub fn new(backend: &str) -> Self {
        Self {
            backend: backend.to_string(),
            network: MemoryNetwork::new(),
            kv: Arc::new(MemoryKvEngine::new()),
            tree: Arc::new(MemoryTreeEngine::new()),
        }
    }

    pub fn config(&self) -> BeaconConfig {
        create_test_config(&self.backend)
    }

    pub fn engines(&self) -> RegistryEngines {
        RegistryEngines::default()
            .with_kv(self.kv.clone())
            .with_tree(self.tree.clone())
    }

    pub fn transport(&self) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport::new(self.network.clone()))
    }

    /// A server reachable at `TEST_HOST:port` on the memory network
    pub async fn server(&self, port: u16) -> Result<Server> {
        let server = Server::builder(self.config())
            .with_identity(NodeIdentity::new(TEST_HOST, port))
            .with_engines(self.engines())
            .with_transport(self.transport())
            .build()
            .await?;
        Ok(server)
    }

    pub async fn client(&self) -> Result<Client> {
        let client = Client::builder(self.config())
            .with_identity(NodeIdentity::new(TEST_HOST, 0))
            .with_engines(self.engines())
            .with_transport(self.transport())
            .build()
            .await?;
        Ok(client)
    }

    /// Address a server on `port` is reachable at
    pub fn address(port: u16) -> String {
        format!("{TEST_HOST}:{port}")
    }
}

/// Poll `condition` every few milliseconds until it holds or `limit` passes
pub async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn first_param(params: &[Value]) -> Value {
    params.first().cloned().unwrap_or(Value::Null)
}

/// String-predicate service modelled on a typical utility library
pub fn string_predicates() -> LocalService {
    LocalService::new("lodash")
        .with_sync_action("isString", |params| Ok(json!(first_param(&params).is_string())))
        .with_sync_action("isNumber", |params| Ok(json!(first_param(&params).is_number())))
        .with_sync_action("isBoolean", |params| {
            Ok(json!(first_param(&params).is_boolean()))
        })
        .with_sync_action("isArray", |params| Ok(json!(first_param(&params).is_array())))
        .with_sync_action("isEmpty", |params| {
            let empty = match first_param(&params) {
                Value::Null => true,
                Value::String(s) => s.is_empty(),
                Value::Array(a) => a.is_empty(),
                Value::Object(o) => o.is_empty(),
                _ => true,
            };
            Ok(json!(empty))
        })
        .with_sync_action("toUpper", |params| {
            let s = first_param(&params);
            let s = s
                .as_str()
                .ok_or_else(|| anyhow!("toUpper expects a string"))?;
            Ok(json!(s.to_uppercase()))
        })
}

/// Arithmetic service with one failing and one slow action
pub fn math_service() -> LocalService {
    LocalService::new("math")
        .with_sync_action("add", |params| {
            let sum: f64 = params.iter().filter_map(Value::as_f64).sum();
            Ok(json!(sum))
        })
        .with_action("divide", |params| async move {
            let a = params.first().and_then(Value::as_f64).unwrap_or(0.0);
            let b = params.get(1).and_then(Value::as_f64).unwrap_or(0.0);
            if b == 0.0 {
                return Err(anyhow!("Division by zero"));
            }
            Ok(json!(a / b))
        })
        .with_action("slowEcho", |params| async move {
            let millis = params.get(1).and_then(Value::as_u64).unwrap_or(50);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok::<_, anyhow::Error>(first_param(&params))
        })
}

/// Service answering with the port of the server it runs on, so tests can
/// see which provider served a call.
pub fn whoami_service(port: u16) -> LocalService {
    LocalService::new("whoami").with_sync_action("port", move |_| Ok(json!(port)))
}
