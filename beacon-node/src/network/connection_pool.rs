// ConnectionPool - per-alias round-robin pools of provider connections
//
// INTENTION: Own every client-side connection to providers. For each alias
// the pool discovers providers through the registry adapter, connects to
// them, and serves them round-robin. It reacts to subscription
// notifications by adding newly arrived providers, and prunes a provider the
// moment its connection reports failure or close.
//
// ARCHITECTURAL BOUNDARIES:
// - Only the client facade calls into the pool
// - Ring mutation happens under a synchronous lock and never across an await
// - Background failures go to the event bus, never to an unrelated call

use beacon_common::logging::Logger;
use beacon_common::{log_debug, log_info, log_warn};
use dashmap::DashMap;
use futures_util::future::join_all;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::errors::{ErrorKind, RpcError};
use crate::events::EventBus;
use crate::network::discovery::{ChangeListener, ProviderRecord, RegistryAdapter};
use crate::network::ring::RoundRobinRing;
use crate::network::transport::{ConnectionStatus, RpcConnection, RpcTransport};
use crate::services::PermittedActions;

/// Discovery state of one alias
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Undiscovered,
    Discovering,
    Populated,
}

/// A provider record plus the live connection to it
#[derive(Clone)]
struct PoolEntry {
    record: ProviderRecord,
    connection: Arc<dyn RpcConnection>,
    /// Distinguishes successive connections to the same provider id
    generation: u64,
}

/// What a selection hands to the caller
#[derive(Clone)]
pub struct SelectedProvider {
    pub provider_id: String,
    pub permitted_actions: PermittedActions,
    pub connection: Arc<dyn RpcConnection>,
}

impl std::fmt::Debug for SelectedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectedProvider")
            .field("provider_id", &self.provider_id)
            .field("permitted_actions", &self.permitted_actions)
            .finish()
    }
}

struct AliasPool {
    alias: String,
    state: Mutex<PoolState>,
    /// Serializes first-time discovery of the alias
    discovery_gate: tokio::sync::Mutex<()>,
    ring: Mutex<RoundRobinRing<PoolEntry>>,
    /// Provider ids with a connect in progress
    connecting: Mutex<HashSet<String>>,
    subscribed: AtomicBool,
    backfilling: AtomicBool,
    logger: Arc<Logger>,
}

impl AliasPool {
    fn new(alias: &str, logger: &Logger) -> Self {
        Self {
            alias: alias.to_string(),
            state: Mutex::new(PoolState::Undiscovered),
            discovery_gate: tokio::sync::Mutex::new(()),
            ring: Mutex::new(RoundRobinRing::new()),
            connecting: Mutex::new(HashSet::new()),
            subscribed: AtomicBool::new(false),
            backfilling: AtomicBool::new(false),
            logger: Arc::new(logger.with_alias(alias)),
        }
    }

    fn state(&self) -> PoolState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: PoolState) {
        *self.state.lock().unwrap() = state;
    }

    fn select(&self) -> Option<SelectedProvider> {
        let mut ring = self.ring.lock().unwrap();
        ring.select().map(|entry| SelectedProvider {
            provider_id: entry.record.provider_id.clone(),
            permitted_actions: entry.record.permitted_actions.clone(),
            connection: entry.connection.clone(),
        })
    }

    /// Claim a provider id for connecting. False when it is already pooled
    /// or another task is connecting to it.
    fn claim(&self, provider_id: &str) -> bool {
        if self.ring.lock().unwrap().contains(provider_id) {
            return false;
        }
        self.connecting
            .lock()
            .unwrap()
            .insert(provider_id.to_string())
    }

    fn release(&self, provider_id: &str) {
        self.connecting.lock().unwrap().remove(provider_id);
    }
}

/// Client-side pool of provider connections, one ring per alias
pub struct ConnectionPool {
    adapter: Arc<dyn RegistryAdapter>,
    transport: Arc<dyn RpcTransport>,
    pools: DashMap<String, Arc<AliasPool>>,
    /// Status watchers keyed by connection generation
    watchers: DashMap<u64, JoinHandle<()>>,
    next_generation: AtomicU64,
    closing: AtomicBool,
    events: EventBus,
    logger: Arc<Logger>,
}

impl ConnectionPool {
    pub fn new(
        adapter: Arc<dyn RegistryAdapter>,
        transport: Arc<dyn RpcTransport>,
        events: EventBus,
        logger: Arc<Logger>,
    ) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            transport,
            pools: DashMap::new(),
            watchers: DashMap::new(),
            next_generation: AtomicU64::new(1),
            closing: AtomicBool::new(false),
            events,
            logger,
        })
    }

    fn alias_pool(&self, alias: &str) -> Arc<AliasPool> {
        self.pools
            .entry(alias.to_string())
            .or_insert_with(|| Arc::new(AliasPool::new(alias, &self.logger)))
            .clone()
    }

    pub fn state(&self, alias: &str) -> PoolState {
        self.pools
            .get(alias)
            .map(|pool| pool.state())
            .unwrap_or(PoolState::Undiscovered)
    }

    pub fn provider_count(&self, alias: &str) -> usize {
        self.pools
            .get(alias)
            .map(|pool| pool.ring.lock().unwrap().len())
            .unwrap_or(0)
    }

    /// Provider ids currently pooled for `alias`, in ring order
    pub fn provider_ids(&self, alias: &str) -> Vec<String> {
        self.pools
            .get(alias)
            .map(|pool| pool.ring.lock().unwrap().ids())
            .unwrap_or_default()
    }

    /// Pick the next provider for `alias`, discovering it first if needed.
    ///
    /// `Ok(None)` means the alias has no live provider; the caller decides
    /// what that means.
    pub async fn select(
        self: &Arc<Self>,
        alias: &str,
    ) -> Result<Option<SelectedProvider>, RpcError> {
        let pool = self.alias_pool(alias);

        if pool.state() == PoolState::Populated {
            self.spawn_backfill(pool.clone());
        } else {
            self.discover(&pool).await?;
        }

        let selected = pool.select();
        match &selected {
            Some(provider) => log_debug!(pool.logger, "selected {}", provider.provider_id),
            None => log_debug!(pool.logger, "no provider available"),
        }
        Ok(selected)
    }

    /// UNDISCOVERED -> DISCOVERING -> POPULATED
    async fn discover(self: &Arc<Self>, pool: &Arc<AliasPool>) -> Result<(), RpcError> {
        let _gate = pool.discovery_gate.lock().await;
        if pool.state() == PoolState::Populated {
            return Ok(());
        }
        pool.set_state(PoolState::Discovering);
        log_debug!(pool.logger, "discovering providers");

        let keys = match self.adapter.lookup(&pool.alias).await {
            Ok(keys) => keys,
            Err(e) => {
                pool.set_state(PoolState::Undiscovered);
                return Err(e);
            }
        };
        if let Err(e) = self.ingest(pool, keys, false).await {
            pool.set_state(PoolState::Undiscovered);
            return Err(e);
        }

        self.ensure_subscribed(pool).await;
        pool.set_state(PoolState::Populated);
        log_info!(
            pool.logger,
            "pool populated with {} provider(s)",
            pool.ring.lock().unwrap().len()
        );
        Ok(())
    }

    /// Subscribe for arrivals once per alias. A failure is reported and
    /// retried by the next backfill.
    async fn ensure_subscribed(self: &Arc<Self>, pool: &Arc<AliasPool>) {
        if pool.subscribed.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let alias_pool = pool.clone();
        let listener: ChangeListener = Arc::new(
            move |change: Result<Vec<String>, RpcError>| -> Pin<Box<dyn Future<Output = ()> + Send>> {
            let weak = weak.clone();
            let alias_pool = alias_pool.clone();
            Box::pin(async move {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                match change {
                    Ok(keys) => {
                        if let Err(e) = this.ingest(&alias_pool, keys, false).await {
                            this.events.report("subscription update", &e);
                        }
                    }
                    // The adapter already reported the failure and re-arms itself
                    Err(e) => log_debug!(alias_pool.logger, "subscription interrupted: {e}"),
                }
            })
            },
        );

        if let Err(e) = self.adapter.subscribe(&pool.alias, listener).await {
            pool.subscribed.store(false, Ordering::SeqCst);
            self.events
                .report(&format!("subscribe to alias {}", pool.alias), &e);
        }
    }

    /// Fire-and-forget re-discovery of an already populated alias
    fn spawn_backfill(self: &Arc<Self>, pool: Arc<AliasPool>) {
        if pool.backfilling.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.ensure_subscribed(&pool).await;
            match this.adapter.lookup(&pool.alias).await {
                Ok(keys) => {
                    if let Err(e) = this.ingest(&pool, keys, true).await {
                        this.events.report("pool backfill", &e);
                    }
                }
                Err(e) => this.events.report("pool backfill", &e),
            }
            pool.backfilling.store(false, Ordering::SeqCst);
        });
    }

    /// Fetch, parse and connect the providers behind `keys`.
    ///
    /// Keys of providers already pooled are skipped unless `refresh` is set,
    /// in which case their stored record is replaced in place.
    async fn ingest(
        self: &Arc<Self>,
        pool: &Arc<AliasPool>,
        keys: Vec<String>,
        refresh: bool,
    ) -> Result<(), RpcError> {
        let keys: Vec<String> = keys
            .into_iter()
            .filter(|key| match self.adapter.decode_key(key) {
                Some(decoded) => {
                    decoded.alias == pool.alias
                        && (refresh || !pool.ring.lock().unwrap().contains(&decoded.provider_id))
                }
                None => {
                    log_warn!(pool.logger, "ignoring undecodable key {key}");
                    false
                }
            })
            .collect();
        if keys.is_empty() {
            return Ok(());
        }

        let values = self.adapter.fetch_values(&keys).await?;

        let mut fresh = Vec::new();
        for (key, value) in keys.iter().zip(values) {
            let Some(bytes) = value else {
                log_debug!(pool.logger, "key {key} vanished before it was fetched");
                continue;
            };
            let Some(record) = ProviderRecord::from_bytes(&bytes) else {
                log_warn!(pool.logger, "ignoring invalid provider record at {key}");
                continue;
            };

            {
                let mut ring = pool.ring.lock().unwrap();
                if let Some(entry) = ring.get_mut(&record.provider_id) {
                    if entry.record != record {
                        log_debug!(pool.logger, "refreshed record of {}", record.provider_id);
                        entry.record = record;
                    }
                    continue;
                }
            }
            if pool.claim(&record.provider_id) {
                fresh.push(record);
            }
        }

        join_all(fresh.into_iter().map(|record| self.connect_provider(pool, record))).await;
        Ok(())
    }

    async fn connect_provider(self: &Arc<Self>, pool: &Arc<AliasPool>, record: ProviderRecord) {
        let provider_id = record.provider_id.clone();
        let result = self.transport.connect(&record.host, record.port).await;
        pool.release(&provider_id);

        let connection = match result {
            Ok(connection) => connection,
            Err(e) => {
                self.events.error(
                    ErrorKind::RemoteCallError,
                    format!("connect to {} for alias {} failed: {e}", record.address(), pool.alias),
                );
                self.remove_from_registry(&pool.alias, &provider_id).await;
                return;
            }
        };

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let inserted = pool.ring.lock().unwrap().insert(
            provider_id.clone(),
            PoolEntry {
                record,
                connection: connection.clone(),
                generation,
            },
        );
        if !inserted {
            connection.close().await;
            return;
        }

        log_info!(pool.logger, "added provider {provider_id}");
        self.watch_connection(pool.clone(), provider_id, connection, generation);
    }

    /// Prune the entry as soon as its connection stops being open
    fn watch_connection(
        self: &Arc<Self>,
        pool: Arc<AliasPool>,
        provider_id: String,
        connection: Arc<dyn RpcConnection>,
        generation: u64,
    ) {
        let mut status = connection.status();
        drop(connection);
        let weak: Weak<Self> = Arc::downgrade(self);
        // Released once the handle is stored, so the task never removes its
        // own handle before it was inserted
        let (stored_tx, stored_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            loop {
                if !status.borrow().is_open() {
                    break;
                }
                if status.changed().await.is_err() {
                    break;
                }
            }
            let reason = match &*status.borrow() {
                ConnectionStatus::Failed(reason) => reason.clone(),
                ConnectionStatus::Closed | ConnectionStatus::Open => "closed".to_string(),
            };
            let _ = stored_rx.await;
            if let Some(this) = weak.upgrade() {
                this.watchers.remove(&generation);
                this.prune(&pool, &provider_id, generation, &reason).await;
            }
        });
        self.watchers.insert(generation, handle);
        let _ = stored_tx.send(());
    }

    async fn prune(&self, pool: &AliasPool, provider_id: &str, generation: u64, reason: &str) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        let removed = pool
            .ring
            .lock()
            .unwrap()
            .remove_if(provider_id, |entry| entry.generation == generation);
        if removed.is_none() {
            return;
        }

        self.events.info(format!(
            "pruned provider {provider_id} from alias {} ({reason})",
            pool.alias
        ));
        self.remove_from_registry(&pool.alias, provider_id).await;
    }

    /// Best effort: a failure is logged, never raised
    async fn remove_from_registry(&self, alias: &str, provider_id: &str) {
        if let Err(e) = self.adapter.remove(alias, provider_id).await {
            log_warn!(
                self.logger,
                "best-effort removal of {alias}/{provider_id} failed: {e}"
            );
        }
    }

    /// Close every connection and stop background work. Closing does not
    /// remove anything from the registry.
    pub async fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let generations: Vec<u64> = self.watchers.iter().map(|e| *e.key()).collect();
        for generation in generations {
            if let Some((_, handle)) = self.watchers.remove(&generation) {
                handle.abort();
            }
        }

        let pools: Vec<Arc<AliasPool>> = self.pools.iter().map(|e| e.value().clone()).collect();
        for pool in pools {
            let entries = pool.ring.lock().unwrap().clear();
            for entry in entries {
                entry.connection.close().await;
            }
        }
        self.adapter.shutdown().await;
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("aliases", &self.pools.len())
            .field("watchers", &self.watchers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendOptions;
    use crate::network::discovery::{create_adapter, MemoryKvEngine, RegistryEngines};
    use crate::network::transport::{
        CallEnvelope, EnvelopeHandler, NetworkError, ResponseEnvelope, RpcListener,
    };
    use async_trait::async_trait;
    use beacon_common::logging::Component;
    use std::time::Duration;
    use tokio::sync::watch;

    /// A connection that is already closed when it is handed out
    struct ClosedConnection {
        status: watch::Sender<ConnectionStatus>,
    }

    #[async_trait]
    impl RpcConnection for ClosedConnection {
        fn peer_address(&self) -> &str {
            "10.0.0.9:7007"
        }

        async fn send(&self, _envelope: CallEnvelope) -> Result<ResponseEnvelope, NetworkError> {
            Err(NetworkError::ConnectionError("closed".into()))
        }

        fn status(&self) -> watch::Receiver<ConnectionStatus> {
            self.status.subscribe()
        }

        async fn close(&self) {}
    }

    struct ClosedTransport;

    #[async_trait]
    impl RpcTransport for ClosedTransport {
        async fn connect(
            &self,
            _host: &str,
            _port: u16,
        ) -> Result<Arc<dyn RpcConnection>, NetworkError> {
            let (status, _) = watch::channel(ConnectionStatus::Closed);
            Ok(Arc::new(ClosedConnection { status }))
        }

        async fn listen(
            &self,
            _host: &str,
            _port: u16,
            _handler: EnvelopeHandler,
        ) -> Result<Arc<dyn RpcListener>, NetworkError> {
            Err(NetworkError::TransportError("not supported".into()))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn watcher_of_a_dead_connection_leaves_nothing_behind() {
        let logger = Arc::new(Logger::new_root(Component::Pool, "test"));
        let events = EventBus::new(logger.clone());
        let engines = RegistryEngines::default().with_kv(Arc::new(MemoryKvEngine::new()));
        let adapter = create_adapter(
            "flat-ttl",
            &BackendOptions::default(),
            &engines,
            events.clone(),
            logger.clone(),
        )
        .unwrap();
        adapter.connect().await.unwrap();

        for port in [7007u16, 7008, 7009] {
            let record = ProviderRecord {
                provider_id: format!("10.0.0.9:{port}"),
                host: "10.0.0.9".into(),
                port,
                permitted_actions: PermittedActions::AllowAll,
                registered_at_epoch: 0,
            };
            adapter
                .publish(
                    "whoami",
                    &record.provider_id,
                    record.to_bytes().unwrap(),
                    Duration::from_secs(60),
                )
                .await
                .unwrap();
        }

        let pool = ConnectionPool::new(adapter.clone(), Arc::new(ClosedTransport), events, logger);
        pool.select("whoami").await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while pool.provider_count("whoami") > 0 || !pool.watchers.is_empty() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "watchers left behind: {}",
                pool.watchers.len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(adapter.lookup("whoami").await.unwrap().is_empty());
    }
}
