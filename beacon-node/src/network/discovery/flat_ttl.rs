// Flat / TTL registry strategy
//
// INTENTION: Map the registry contract onto a key/value store with expiry
// and pub/sub. Presence is a key that expires after the liveness duration
// unless re-published; arrivals are announced on a per-alias channel whose
// payload is the key that changed.

use async_trait::async_trait;
use beacon_common::logging::Logger;
use beacon_common::{log_debug, log_warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{BackendKind, ChangeListener, KeyCodec, KvEngine, RegistryAdapter, RegistryKey};
use crate::errors::{EngineError, ErrorKind, RpcError};
use crate::events::EventBus;

pub struct FlatTtlRegistry {
    engine: Arc<dyn KvEngine>,
    codec: KeyCodec,
    resubscribe_interval: Duration,
    events: EventBus,
    /// Handles of the per-alias subscription loops
    subscriptions: Mutex<Vec<JoinHandle<()>>>,
    logger: Arc<Logger>,
}

impl FlatTtlRegistry {
    pub fn new(
        engine: Arc<dyn KvEngine>,
        codec: KeyCodec,
        resubscribe_interval: Duration,
        events: EventBus,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            engine,
            codec,
            resubscribe_interval,
            events,
            subscriptions: Mutex::new(Vec::new()),
            logger,
        }
    }

    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    /// Forward channel messages to the listener, re-subscribing whenever the
    /// channel is lost.
    async fn run_subscription(
        engine: Arc<dyn KvEngine>,
        channel: String,
        mut receiver: tokio::sync::mpsc::UnboundedReceiver<String>,
        listener: ChangeListener,
        resubscribe_interval: Duration,
        events: EventBus,
    ) {
        loop {
            while let Some(key) = receiver.recv().await {
                listener(Ok(vec![key])).await;
            }

            let lost = RpcError::RegistryUnavailable(format!("subscription to {channel} lost"));
            events.report("flat-ttl subscribe", &lost);
            listener(Err(lost)).await;

            loop {
                tokio::time::sleep(resubscribe_interval).await;
                match engine.subscribe(&channel).await {
                    Ok(rx) => {
                        events.debug(format!("re-subscribed to {channel}"));
                        receiver = rx;
                        break;
                    }
                    Err(e) => {
                        events.error(
                            ErrorKind::RegistryUnavailable,
                            format!("re-subscribe to {channel} failed: {e}"),
                        );
                    }
                }
            }
        }
    }
}

#[async_trait]
impl RegistryAdapter for FlatTtlRegistry {
    fn kind(&self) -> BackendKind {
        BackendKind::FlatTtl
    }

    async fn connect(&self) -> Result<(), RpcError> {
        // A scan proves the store answers; there is nothing to create up front
        self.engine
            .scan(&format!("{}/*", self.codec.root()))
            .await
            .map_err(RpcError::from)?;
        self.events
            .ready(format!("flat-ttl registry connected at {}", self.codec.root()));
        Ok(())
    }

    async fn publish(
        &self,
        alias: &str,
        provider_id: &str,
        value: Vec<u8>,
        liveness: Duration,
    ) -> Result<(), RpcError> {
        let key = self.codec.key(alias, provider_id);
        match self.engine.set_with_expiry(&key, value, liveness).await {
            Ok(()) => {}
            Err(EngineError::AlreadyExists(_)) => {
                self.events.debug(format!("key already exists: {key}"));
            }
            Err(e) => return Err(e.into()),
        }
        log_debug!(self.logger, "published {key} (ttl {}s)", liveness.as_secs());

        self.engine
            .publish(&self.codec.folder(alias), key)
            .await
            .map_err(RpcError::from)
    }

    async fn lookup(&self, alias: &str) -> Result<Vec<String>, RpcError> {
        let pattern = self.codec.wildcard(alias);
        let keys = self.engine.scan(&pattern).await?;
        // Scans are glob matches; only keep keys that decode to this alias
        Ok(keys
            .into_iter()
            .filter(|key| {
                self.codec
                    .decode(key)
                    .map(|k| k.alias == alias)
                    .unwrap_or(false)
            })
            .collect())
    }

    async fn fetch_values(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, RpcError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.engine.get_many(keys).await?)
    }

    async fn remove(&self, alias: &str, provider_id: &str) -> Result<(), RpcError> {
        let key = self.codec.key(alias, provider_id);
        let existed = self.engine.delete(&key).await?;
        if !existed {
            log_warn!(self.logger, "remove of absent key {key}");
        }
        Ok(())
    }

    async fn subscribe(&self, alias: &str, listener: ChangeListener) -> Result<(), RpcError> {
        let channel = self.codec.folder(alias);
        let receiver = self.engine.subscribe(&channel).await?;
        log_debug!(self.logger, "subscribed to channel {channel}");

        let handle = tokio::spawn(Self::run_subscription(
            self.engine.clone(),
            channel,
            receiver,
            listener,
            self.resubscribe_interval,
            self.events.clone(),
        ));
        self.subscriptions.lock().unwrap().push(handle);
        Ok(())
    }

    fn decode_key(&self, key: &str) -> Option<RegistryKey> {
        self.codec.decode(key)
    }

    async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = self.subscriptions.lock().unwrap().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
    }
}
