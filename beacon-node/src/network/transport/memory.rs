// In-memory transport
//
// INTENTION: Let clients and servers in one process talk without sockets.
// Endpoints register on a shared `MemoryNetwork` under `host:port`; a call
// invokes the server's handler directly. `kill` takes an endpoint down and
// fails every connection to it, which is how tests simulate a provider
// crashing.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use super::{
    CallEnvelope, ConnectionStatus, EnvelopeHandler, NetworkError, ResponseEnvelope,
    RpcConnection, RpcListener, RpcTransport,
};

/// First port handed out when a server listens on port 0
const EPHEMERAL_PORT_START: u16 = 40000;

struct Endpoint {
    handler: EnvelopeHandler,
    connections: Mutex<Vec<Arc<watch::Sender<ConnectionStatus>>>>,
}

impl Endpoint {
    fn fail_connections(&self, status: ConnectionStatus) {
        for connection in self.connections.lock().unwrap().drain(..) {
            connection.send_replace(status.clone());
        }
    }
}

/// Shared switchboard of in-process endpoints
pub struct MemoryNetwork {
    endpoints: DashMap<String, Arc<Endpoint>>,
    next_port: AtomicU16,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: DashMap::new(),
            next_port: AtomicU16::new(EPHEMERAL_PORT_START),
        })
    }

    pub fn is_listening(&self, address: &str) -> bool {
        self.endpoints.contains_key(address)
    }

    /// Number of connections currently open to `address`
    pub fn connection_count(&self, address: &str) -> usize {
        self.endpoints
            .get(address)
            .map(|endpoint| {
                endpoint
                    .connections
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|c| c.borrow().is_open())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Take an endpoint down as if its process died
    pub fn kill(&self, address: &str) -> bool {
        match self.endpoints.remove(address) {
            Some((_, endpoint)) => {
                endpoint.fail_connections(ConnectionStatus::Failed(format!(
                    "endpoint {address} went away"
                )));
                true
            }
            None => false,
        }
    }
}

/// Transport handle over a `MemoryNetwork`
#[derive(Clone)]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
}

impl MemoryTransport {
    pub fn new(network: Arc<MemoryNetwork>) -> Self {
        Self { network }
    }

    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

pub struct MemoryConnection {
    peer: String,
    handler: EnvelopeHandler,
    status: Arc<watch::Sender<ConnectionStatus>>,
}

#[async_trait]
impl RpcConnection for MemoryConnection {
    fn peer_address(&self) -> &str {
        &self.peer
    }

    async fn send(&self, envelope: CallEnvelope) -> Result<ResponseEnvelope, NetworkError> {
        if !self.status.borrow().is_open() {
            return Err(NetworkError::ConnectionError(format!(
                "connection to {} is not open",
                self.peer
            )));
        }
        Ok((self.handler)(envelope).await)
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    async fn close(&self) {
        self.status.send_replace(ConnectionStatus::Closed);
    }
}

pub struct MemoryListener {
    address: String,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl RpcListener for MemoryListener {
    fn local_address(&self) -> String {
        self.address.clone()
    }

    async fn stop(&self) {
        if let Some((_, endpoint)) = self.network.endpoints.remove(&self.address) {
            endpoint.fail_connections(ConnectionStatus::Closed);
        }
    }
}

#[async_trait]
impl RpcTransport for MemoryTransport {
    async fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn RpcConnection>, NetworkError> {
        let peer = format!("{host}:{port}");
        let endpoint = self
            .network
            .endpoints
            .get(&peer)
            .map(|e| e.value().clone())
            .ok_or_else(|| NetworkError::ConnectionError(format!("connection refused: {peer}")))?;

        let (status_tx, _) = watch::channel(ConnectionStatus::Open);
        let status = Arc::new(status_tx);
        endpoint.connections.lock().unwrap().push(status.clone());

        Ok(Arc::new(MemoryConnection {
            peer,
            handler: endpoint.handler.clone(),
            status,
        }))
    }

    async fn listen(
        &self,
        host: &str,
        port: u16,
        handler: EnvelopeHandler,
    ) -> Result<Arc<dyn RpcListener>, NetworkError> {
        let port = if port == 0 {
            self.network.next_port.fetch_add(1, Ordering::SeqCst)
        } else {
            port
        };
        let address = format!("{host}:{port}");

        match self.network.endpoints.entry(address.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(NetworkError::TransportError(format!(
                    "address already in use: {address}"
                )))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(Endpoint {
                    handler,
                    connections: Mutex::new(Vec::new()),
                }));
            }
        }

        Ok(Arc::new(MemoryListener {
            address,
            network: self.network.clone(),
        }))
    }
}
