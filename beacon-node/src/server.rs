// Server facade
//
// INTENTION: Expose local service objects to remote callers. The first
// registration starts the transport endpoint (exactly once) before any
// presence is published, so a client that discovers this server can
// always connect to it.

use beacon_common::logging::{Component, Logger};
use beacon_common::log_info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use crate::config::BeaconConfig;
use crate::errors::RpcError;
use crate::events::{BeaconEvent, EventBus};
use crate::identity::NodeIdentity;
use crate::network::discovery::{
    create_adapter, validate_alias, KvEngine, RegistryAdapter, RegistryEngines, TreeEngine,
};
use crate::network::transport::{
    BoxFuture, CallEnvelope, EnvelopeHandler, ResponseEnvelope, RpcListener, RpcTransport,
    TcpTransport,
};
use crate::services::{
    CallDispatcher, PermittedActions, ServiceObject, ServiceRegistration, ServiceRegistry,
};

/// Builder for `Server`
pub struct ServerBuilder {
    config: BeaconConfig,
    transport: Option<Arc<dyn RpcTransport>>,
    engines: RegistryEngines,
    identity: Option<NodeIdentity>,
}

impl ServerBuilder {
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

    /// Resolve the identity, connect the registry adapter and assemble the
    /// server. Nothing listens until the first registration.
    pub async fn build(self) -> Result<Server, RpcError> {
        self.config.backend_kind()?;
        if let Some(logging) = &self.config.logging_config {
            logging.apply();
        }

        let identity = match self.identity {
            Some(identity) => identity,
            None => NodeIdentity::resolve(&self.config)?,
        };
        // The published record carries this port; 0 could never be dialled
        if identity.port == 0 {
            return Err(RpcError::InvalidParams(format!(
                "server {} needs a concrete port",
                identity.host
            )));
        }
        let logger = Arc::new(Logger::new_root(Component::Server, &identity.provider_id));
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
        let registry = Arc::new(ServiceRegistry::new(
            identity.clone(),
            adapter.clone(),
            self.config.liveness(),
            events.clone(),
            Arc::new(logger.with_component(Component::Registry)),
        ));
        let dispatcher = Arc::new(CallDispatcher::new(
            identity.provider_id.clone(),
            Arc::new(logger.with_component(Component::Dispatcher)),
        ));

        log_info!(logger, "server ready as {identity}");
        Ok(Server {
            config: self.config,
            identity,
            adapter,
            registry,
            dispatcher,
            transport,
            listener: Mutex::new(None),
            listening: AtomicBool::new(false),
            events,
            logger,
        })
    }
}

pub struct Server {
    config: BeaconConfig,
    identity: NodeIdentity,
    adapter: Arc<dyn RegistryAdapter>,
    registry: Arc<ServiceRegistry>,
    dispatcher: Arc<CallDispatcher>,
    transport: Arc<dyn RpcTransport>,
    listener: Mutex<Option<Arc<dyn RpcListener>>>,
    listening: AtomicBool,
    events: EventBus,
    logger: Arc<Logger>,
}

impl Server {
    pub fn builder(config: BeaconConfig) -> ServerBuilder {
        ServerBuilder {
            config,
            transport: None,
            engines: RegistryEngines::default(),
            identity: None,
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn host(&self) -> &str {
        &self.identity.host
    }

    pub fn port(&self) -> u16 {
        self.identity.port
    }

    pub fn provider_id(&self) -> &str {
        &self.identity.provider_id
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> broadcast::Receiver<BeaconEvent> {
        self.events.subscribe()
    }

    pub fn aliases(&self) -> Vec<String> {
        self.registry.aliases()
    }

    /// Start the transport endpoint unless it is already running
    async fn ensure_listening(&self) -> Result<(), RpcError> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return Ok(());
        }

        let registry = self.registry.clone();
        let dispatcher = self.dispatcher.clone();
        let handler: EnvelopeHandler = Arc::new(
            move |envelope: CallEnvelope| -> BoxFuture<'static, ResponseEnvelope> {
                let registry = registry.clone();
                let dispatcher = dispatcher.clone();
                Box::pin(async move { dispatcher.handle_inbound(&registry, envelope).await })
            },
        );

        let started = self
            .transport
            .listen(&self.identity.host, self.identity.port, handler)
            .await?;
        self.events
            .ready(format!("listening on {}", started.local_address()));
        *listener = Some(started);
        self.listening.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Register a service object; the first registration starts listening
    pub async fn register(
        &self,
        registration: ServiceRegistration,
    ) -> Result<PermittedActions, RpcError> {
        // A rejected alias must not start the endpoint
        validate_alias(&registration.alias)?;
        self.ensure_listening().await?;
        let registered = self.registry.register(registration).await;
        // The entry stays in the table even when its first publish failed;
        // the republish loop keeps trying
        self.registry
            .start_republish(self.config.republish_interval());
        registered
    }

    /// Register `service` under `alias` exposing `actions` (empty: all)
    pub async fn add<I, S>(
        &self,
        alias: &str,
        service: Arc<dyn ServiceObject>,
        actions: I,
    ) -> Result<PermittedActions, RpcError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.register(
            ServiceRegistration::new(service)
                .with_alias(alias)
                .with_actions(actions),
        )
        .await
    }

    pub async fn deregister(&self, alias: &str) -> bool {
        self.registry.deregister(alias).await
    }

    /// Withdraw every alias and stop listening
    pub async fn shutdown(&self) {
        log_info!(self.logger, "server shutting down");
        self.registry.shutdown().await;
        if let Some(listener) = self.listener.lock().await.take() {
            listener.stop().await;
        }
        self.listening.store(false, Ordering::SeqCst);
        self.adapter.shutdown().await;
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("provider_id", &self.identity.provider_id)
            .field("listening", &self.is_listening())
            .field("aliases", &self.registry.aliases())
            .finish()
    }
}
