// Client facade
//
// INTENTION: The public entry point for callers. `Client::call` validates
// its arguments, lets the connection pool pick a provider for the alias and
// hands the round trip to the dispatcher. An alias without a live provider
// fails with `NoServiceFound` without touching the network.

use beacon_common::logging::{Component, Logger};
use beacon_common::log_info;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::BeaconConfig;
use crate::errors::RpcError;
use crate::events::{BeaconEvent, EventBus};
use crate::identity::NodeIdentity;
use crate::network::connection_pool::{ConnectionPool, PoolState};
use crate::network::discovery::{
    create_adapter, validate_alias, KvEngine, RegistryEngines, TreeEngine,
};
use crate::network::transport::{RpcTransport, TcpTransport};
use crate::services::CallDispatcher;

/// Builder for `Client`
pub struct ClientBuilder {
    config: BeaconConfig,
    transport: Option<Arc<dyn RpcTransport>>,
    engines: RegistryEngines,
    identity: Option<NodeIdentity>,
}

impl ClientBuilder {
    pub fn with_transport(mut self, transport: Arc<dyn RpcTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_kv_engine(mut self, engine: Arc<dyn KvEngine>) -> Self {
        self.engines = self.engines.with_kv(engine);
        self
    }

    pub fn with_tree_engine(mut self, engine: Arc<dyn TreeEngine>) -> Self {
        self.engines = self.engines.with_tree(engine);
        self
    }

    pub fn with_engines(mut self, engines: RegistryEngines) -> Self {
        self.engines = engines;
        self
    }

    pub fn with_identity(mut self, identity: NodeIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Connect the registry adapter and assemble the client
    pub async fn build(self) -> Result<Client, RpcError> {
        // Unknown backends fail before anything is created
        self.config.backend_kind()?;
        if let Some(logging) = &self.config.logging_config {
            logging.apply();
        }

        let identity = self
            .identity
            .unwrap_or_else(|| NodeIdentity::for_client(&self.config));
        let logger = Arc::new(Logger::new_root(Component::Client, &identity.sender_id));
        let events = EventBus::new(logger.clone());

        let adapter = create_adapter(
            &self.config.backend,
            &self.config.backend_options,
            &self.engines,
            events.clone(),
            Arc::new(logger.with_component(Component::Adapter)),
        )?;
        adapter.connect().await?;

        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(TcpTransport::new(Arc::new(
                logger.with_component(Component::Transport),
            )))
        });
        let pool = ConnectionPool::new(
            adapter,
            transport,
            events.clone(),
            Arc::new(logger.with_component(Component::Pool)),
        );
        let dispatcher = CallDispatcher::new(
            identity.sender_id.clone(),
            Arc::new(logger.with_component(Component::Dispatcher)),
        );

        log_info!(logger, "client ready ({} backend)", self.config.backend);
        Ok(Client {
            identity,
            pool,
            dispatcher,
            events,
            logger,
        })
    }
}

pub struct Client {
    identity: NodeIdentity,
    pool: Arc<ConnectionPool>,
    dispatcher: CallDispatcher,
    events: EventBus,
    logger: Arc<Logger>,
}

impl Client {
    pub fn builder(config: BeaconConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            transport: None,
            engines: RegistryEngines::default(),
            identity: None,
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn events(&self) -> broadcast::Receiver<BeaconEvent> {
        self.events.subscribe()
    }

    /// Call `action` on some provider of `alias`
    pub async fn call(
        &self,
        alias: &str,
        action: &str,
        params: Vec<Value>,
    ) -> Result<Value, RpcError> {
        validate_alias(alias)?;
        if action.trim().is_empty() {
            return Err(RpcError::InvalidParams("action must not be empty".into()));
        }

        let provider = self
            .pool
            .select(alias)
            .await?
            .ok_or_else(|| RpcError::NoServiceFound(alias.to_string()))?;

        // The provider enforces this too; checking here saves the round trip
        if !provider.permitted_actions.allows(action) {
            return Err(RpcError::ActionForbidden {
                alias: alias.to_string(),
                action: action.to_string(),
            });
        }

        self.dispatcher
            .call(provider.connection.as_ref(), alias, action, &params)
            .await
    }

    /// `call` with the result decoded into `T`
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        alias: &str,
        action: &str,
        params: Vec<Value>,
    ) -> Result<T, RpcError> {
        let value = self.call(alias, action, params).await?;
        serde_json::from_value(value).map_err(|e| {
            RpcError::RemoteCallError(format!("unexpected result of {alias}.{action}: {e}"))
        })
    }

    pub fn provider_count(&self, alias: &str) -> usize {
        self.pool.provider_count(alias)
    }

    pub fn provider_ids(&self, alias: &str) -> Vec<String> {
        self.pool.provider_ids(alias)
    }

    pub fn pool_state(&self, alias: &str) -> PoolState {
        self.pool.state(alias)
    }

    /// Close every provider connection
    pub async fn shutdown(&self) {
        log_info!(self.logger, "client shutting down");
        self.pool.shutdown().await;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("sender_id", &self.identity.sender_id)
            .field("pool", &self.pool)
            .finish()
    }
}
