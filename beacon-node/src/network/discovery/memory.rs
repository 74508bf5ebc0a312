// In-process coordination engines
//
// INTENTION: Provide in-memory implementations of both engine capabilities
// for development and testing. Several clients and servers in one process
// share a registry by sharing one engine instance. Expiry follows the tokio
// clock so tests can advance time instead of sleeping.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use super::engine::{CreateMode, KvEngine, SessionEvent, TreeEngine, WatchEvent};
use crate::errors::EngineError;

fn offline_error() -> EngineError {
    EngineError::Unavailable("engine is offline".to_string())
}

/// Glob match supporting a single trailing `*`
fn matches_pattern(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

struct KvEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-memory key/value engine with lazy expiry and pub/sub channels
pub struct MemoryKvEngine {
    entries: RwLock<HashMap<String, KvEntry>>,
    channels: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
    offline: AtomicBool,
}

impl Default for MemoryKvEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvEngine {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
        }
    }

    /// Simulate losing the store. Going offline drops every subscription.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        if offline {
            self.channels.lock().unwrap().clear();
        }
    }

    /// Number of live subscribers on a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .unwrap()
            .get(channel)
            .map(|subs| subs.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    fn check_online(&self) -> Result<(), EngineError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(offline_error())
        } else {
            Ok(())
        }
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        self.entries
            .write()
            .unwrap()
            .retain(|_, entry| entry.expires_at > now);
    }
}

#[async_trait]
impl KvEngine for MemoryKvEngine {
    async fn set_with_expiry(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), EngineError> {
        self.check_online()?;
        let entry = KvEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().unwrap().insert(key.to_string(), entry);
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, EngineError> {
        self.check_online()?;
        self.purge_expired();
        let mut keys: Vec<String> = self
            .entries
            .read()
            .unwrap()
            .keys()
            .filter(|key| matches_pattern(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, EngineError> {
        self.check_online()?;
        self.purge_expired();
        let entries = self.entries.read().unwrap();
        Ok(keys
            .iter()
            .map(|key| entries.get(key).map(|entry| entry.value.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<bool, EngineError> {
        self.check_online()?;
        self.purge_expired();
        Ok(self.entries.write().unwrap().remove(key).is_some())
    }

    async fn publish(&self, channel: &str, message: String) -> Result<(), EngineError> {
        self.check_online()?;
        let mut channels = self.channels.lock().unwrap();
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|sub| sub.send(message.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>, EngineError> {
        self.check_online()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

struct TreeNode {
    data: Vec<u8>,
    ephemeral: bool,
}

/// In-memory tree engine with one session shared by every user of the
/// instance. `expire_session` drops all ephemeral nodes and watches, then
/// reports the expiry and an immediate reconnect.
pub struct MemoryTreeEngine {
    nodes: RwLock<BTreeMap<String, TreeNode>>,
    watches: Mutex<HashMap<String, Vec<oneshot::Sender<WatchEvent>>>>,
    session: broadcast::Sender<SessionEvent>,
    offline: AtomicBool,
}

impl Default for MemoryTreeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTreeEngine {
    pub fn new() -> Self {
        let (session, _) = broadcast::channel(16);
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            watches: Mutex::new(HashMap::new()),
            session,
            offline: AtomicBool::new(false),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// End the current session: ephemeral nodes vanish and every pending
    /// watch fires with `SessionLost`.
    pub fn expire_session(&self) {
        self.nodes
            .write()
            .unwrap()
            .retain(|_, node| !node.ephemeral);

        let pending: Vec<oneshot::Sender<WatchEvent>> = self
            .watches
            .lock()
            .unwrap()
            .drain()
            .flat_map(|(_, senders)| senders)
            .collect();
        for watch in pending {
            let _ = watch.send(WatchEvent::SessionLost);
        }

        let _ = self.session.send(SessionEvent::Expired);
        let _ = self.session.send(SessionEvent::Reconnected);
    }

    pub fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.read().unwrap().contains_key(path)
    }

    fn check_online(&self) -> Result<(), EngineError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(offline_error())
        } else {
            Ok(())
        }
    }

    fn parent_of(path: &str) -> Option<&str> {
        match path.rsplit_once('/') {
            Some(("", _)) => Some("/"),
            Some((parent, _)) => Some(parent),
            None => None,
        }
    }

    fn children_of(nodes: &BTreeMap<String, TreeNode>, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let name = &key[prefix.len()..];
                (!name.is_empty() && !name.contains('/')).then(|| name.to_string())
            })
            .collect()
    }

    fn fire_watches(&self, path: &str) {
        let pending = self.watches.lock().unwrap().remove(path);
        for watch in pending.into_iter().flatten() {
            let _ = watch.send(WatchEvent::ChildrenChanged(path.to_string()));
        }
    }
}

#[async_trait]
impl TreeEngine for MemoryTreeEngine {
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<(), EngineError> {
        self.check_online()?;
        let parent = Self::parent_of(path)
            .ok_or_else(|| EngineError::Other(format!("invalid path {path}")))?;
        {
            let mut nodes = self.nodes.write().unwrap();
            if nodes.contains_key(path) {
                return Err(EngineError::AlreadyExists(path.to_string()));
            }
            if parent != "/" && !nodes.contains_key(parent) {
                return Err(EngineError::NoNode(parent.to_string()));
            }
            nodes.insert(
                path.to_string(),
                TreeNode {
                    data,
                    ephemeral: mode == CreateMode::Ephemeral,
                },
            );
        }
        self.fire_watches(parent);
        Ok(())
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, EngineError> {
        self.check_online()?;
        if !self.exists(path) {
            return Err(EngineError::NoNode(path.to_string()));
        }
        Ok(Self::children_of(&self.nodes.read().unwrap(), path))
    }

    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, oneshot::Receiver<WatchEvent>), EngineError> {
        self.check_online()?;
        if !self.exists(path) {
            return Err(EngineError::NoNode(path.to_string()));
        }
        // Register under the same lock order as `fire_watches` so no change
        // slips between the listing and the watch.
        let mut watches = self.watches.lock().unwrap();
        let children = Self::children_of(&self.nodes.read().unwrap(), path);
        let (tx, rx) = oneshot::channel();
        watches.entry(path.to_string()).or_default().push(tx);
        Ok((children, rx))
    }

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>, EngineError> {
        self.check_online()?;
        Ok(self
            .nodes
            .read()
            .unwrap()
            .get(path)
            .map(|node| node.data.clone()))
    }

    async fn delete(&self, path: &str) -> Result<(), EngineError> {
        self.check_online()?;
        {
            let mut nodes = self.nodes.write().unwrap();
            if !nodes.contains_key(path) {
                return Err(EngineError::NoNode(path.to_string()));
            }
            if !Self::children_of(&nodes, path).is_empty() {
                return Err(EngineError::Other(format!("node {path} has children")));
            }
            nodes.remove(path);
        }
        if let Some(parent) = Self::parent_of(path) {
            self.fire_watches(parent);
        }
        Ok(())
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe()
    }
}
