// Hierarchical / ephemeral registry strategy
//
// INTENTION: Map the registry contract onto a tree with ephemeral nodes.
// Each alias is a persistent folder; each provider is an ephemeral child
// that disappears with the publishing session. Subscriptions are children
// watches re-armed after every fire; only children not seen before are
// surfaced to the listener.
//
// Session expiry: every node this adapter published is remembered. When the
// engine reports `Reconnected` after an expiry, the nodes are re-created.

use async_trait::async_trait;
use beacon_common::logging::Logger;
use beacon_common::{log_debug, log_info};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::{
    BackendKind, ChangeListener, CreateMode, KeyCodec, RegistryAdapter, RegistryKey, SessionEvent,
    TreeEngine,
};
use crate::errors::{EngineError, ErrorKind, RpcError};
use crate::events::EventBus;

pub struct HierarchicalRegistry {
    engine: Arc<dyn TreeEngine>,
    codec: KeyCodec,
    resubscribe_interval: Duration,
    events: EventBus,
    /// Nodes published by this adapter: node path -> data
    owned: Arc<DashMap<String, Vec<u8>>>,
    /// Watch loops and the session monitor
    tasks: Mutex<Vec<JoinHandle<()>>>,
    logger: Arc<Logger>,
}

/// Create a node, treating "already exists" as success
async fn ensure_node(
    engine: &dyn TreeEngine,
    path: &str,
    data: Vec<u8>,
    mode: CreateMode,
    events: &EventBus,
) -> Result<(), EngineError> {
    match engine.create(path, data, mode).await {
        Ok(()) => {
            events.debug(format!("created node {path}"));
            Ok(())
        }
        Err(EngineError::AlreadyExists(_)) => {
            events.debug(format!("node already exists {path}"));
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Create the parent folder and the ephemeral provider node.
///
/// A stale node with different data is deleted first so the new permitted
/// set replaces it; identical data is left alone.
async fn place_ephemeral(
    engine: &dyn TreeEngine,
    folder: &str,
    path: &str,
    data: Vec<u8>,
    events: &EventBus,
) -> Result<(), EngineError> {
    ensure_node(engine, folder, Vec::new(), CreateMode::Persistent, events).await?;

    match engine.get_data(path).await? {
        Some(existing) if existing == data => {
            events.debug(format!("node unchanged {path}"));
            return Ok(());
        }
        Some(_) => match engine.delete(path).await {
            Ok(()) | Err(EngineError::NoNode(_)) => {}
            Err(e) => return Err(e),
        },
        None => {}
    }

    ensure_node(engine, path, data, CreateMode::Ephemeral, events).await
}

impl HierarchicalRegistry {
    pub fn new(
        engine: Arc<dyn TreeEngine>,
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
            owned: Arc::new(DashMap::new()),
            tasks: Mutex::new(Vec::new()),
            logger,
        }
    }

    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    /// Re-create every owned node after the session came back
    fn start_session_monitor(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let owned = self.owned.clone();
        let events = self.events.clone();
        let logger = self.logger.clone();
        let mut session = self.engine.session_events();

        tokio::spawn(async move {
            loop {
                match session.recv().await {
                    Ok(SessionEvent::Expired) => {
                        events.error(
                            ErrorKind::RegistryUnavailable,
                            "tree session expired; ephemeral presence lost",
                        );
                    }
                    Ok(SessionEvent::Reconnected) => {
                        let nodes: Vec<(String, Vec<u8>)> = owned
                            .iter()
                            .map(|e| (e.key().clone(), e.value().clone()))
                            .collect();
                        log_info!(logger, "session re-established, restoring {} nodes", nodes.len());
                        for (path, data) in nodes {
                            let folder = match path.rsplit_once('/') {
                                Some((folder, _)) => folder.to_string(),
                                None => continue,
                            };
                            if let Err(e) =
                                place_ephemeral(engine.as_ref(), &folder, &path, data, &events)
                                    .await
                            {
                                events.error(
                                    ErrorKind::RegistryUnavailable,
                                    format!("restoring {path} failed: {e}"),
                                );
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log_debug!(logger, "session monitor skipped {skipped} events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Children watch loop for one alias folder
    #[allow(clippy::too_many_arguments)]
    async fn run_watch(
        engine: Arc<dyn TreeEngine>,
        codec: KeyCodec,
        alias: String,
        mut known: HashSet<String>,
        mut watch: tokio::sync::oneshot::Receiver<super::WatchEvent>,
        listener: ChangeListener,
        resubscribe_interval: Duration,
        events: EventBus,
    ) {
        let folder = codec.folder(&alias);
        loop {
            // A dropped sender means the watch was lost with the session;
            // either way the list is re-read and the watch re-armed.
            let _ = (&mut watch).await;

            loop {
                match engine.watch_children(&folder).await {
                    Ok((children, next)) => {
                        let current: HashSet<String> = children.into_iter().collect();
                        let mut appeared: Vec<String> = current
                            .difference(&known)
                            .map(|child| codec.key(&alias, child))
                            .collect();
                        appeared.sort();
                        known = current;
                        watch = next;
                        if !appeared.is_empty() {
                            listener(Ok(appeared)).await;
                        }
                        break;
                    }
                    Err(e) => {
                        let err = RpcError::from(e);
                        events.report(&format!("re-arming watch on {folder}"), &err);
                        listener(Err(err)).await;
                        tokio::time::sleep(resubscribe_interval).await;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl RegistryAdapter for HierarchicalRegistry {
    fn kind(&self) -> BackendKind {
        BackendKind::Hierarchical
    }

    async fn connect(&self) -> Result<(), RpcError> {
        // Create every component of the root as a persistent node
        let mut path = String::new();
        for segment in self.codec.root().split('/').filter(|s| !s.is_empty()) {
            path.push('/');
            path.push_str(segment);
            ensure_node(
                self.engine.as_ref(),
                &path,
                Vec::new(),
                CreateMode::Persistent,
                &self.events,
            )
            .await?;
        }

        let monitor = self.start_session_monitor();
        self.tasks.lock().unwrap().push(monitor);

        self.events
            .ready(format!("hierarchical registry connected at {}", self.codec.root()));
        Ok(())
    }

    async fn publish(
        &self,
        alias: &str,
        provider_id: &str,
        value: Vec<u8>,
        _liveness: Duration,
    ) -> Result<(), RpcError> {
        // Liveness is the session itself for ephemeral nodes
        let folder = self.codec.folder(alias);
        let path = self.codec.key(alias, provider_id);
        place_ephemeral(
            self.engine.as_ref(),
            &folder,
            &path,
            value.clone(),
            &self.events,
        )
        .await?;
        self.owned.insert(path.clone(), value);
        log_debug!(self.logger, "published {path}");
        Ok(())
    }

    async fn lookup(&self, alias: &str) -> Result<Vec<String>, RpcError> {
        let folder = self.codec.folder(alias);
        match self.engine.get_children(&folder).await {
            Ok(children) => Ok(children
                .into_iter()
                .map(|child| self.codec.key(alias, &child))
                .collect()),
            // Nobody ever registered under this alias
            Err(EngineError::NoNode(_)) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_values(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, RpcError> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            match self.engine.get_data(key).await {
                Ok(value) => values.push(value),
                Err(EngineError::NoNode(_)) => values.push(None),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(values)
    }

    async fn remove(&self, alias: &str, provider_id: &str) -> Result<(), RpcError> {
        let path = self.codec.key(alias, provider_id);
        self.owned.remove(&path);
        match self.engine.delete(&path).await {
            Ok(()) | Err(EngineError::NoNode(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn subscribe(&self, alias: &str, listener: ChangeListener) -> Result<(), RpcError> {
        let folder = self.codec.folder(alias);
        ensure_node(
            self.engine.as_ref(),
            &folder,
            Vec::new(),
            CreateMode::Persistent,
            &self.events,
        )
        .await?;
        let (children, watch) = self.engine.watch_children(&folder).await?;
        log_debug!(
            self.logger,
            "watching {folder} ({} children known)",
            children.len()
        );

        let handle = tokio::spawn(Self::run_watch(
            self.engine.clone(),
            self.codec.clone(),
            alias.to_string(),
            children.into_iter().collect(),
            watch,
            listener,
            self.resubscribe_interval,
            self.events.clone(),
        ));
        self.tasks.lock().unwrap().push(handle);
        Ok(())
    }

    fn decode_key(&self, key: &str) -> Option<RegistryKey> {
        self.codec.decode(key)
    }

    async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
    }
}
