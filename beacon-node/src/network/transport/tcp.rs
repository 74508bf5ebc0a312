// TCP transport
//
// INTENTION: Multiplex calls over one TCP stream per provider. Frames are
// length-prefixed bincode; responses are matched to calls by call id, so
// several calls may be in flight on the same connection.

use async_trait::async_trait;
use beacon_common::logging::Logger;
use beacon_common::{log_debug, log_info, log_warn};
use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::{
    encode_frame, read_frame, write_encoded, CallEnvelope, ConnectionStatus, EnvelopeHandler,
    NetworkError, ResponseEnvelope, RpcConnection, RpcListener, RpcTransport,
};
use crate::errors::ErrorKind;

type PendingCalls = Arc<DashMap<String, oneshot::Sender<ResponseEnvelope>>>;

/// Transport over plain TCP streams
pub struct TcpTransport {
    logger: Arc<Logger>,
}

impl TcpTransport {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self { logger }
    }
}

/// Client side of one TCP stream
pub struct TcpConnection {
    peer: String,
    /// Encoded call frames for the writer task
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    pending: PendingCalls,
    status: Arc<watch::Sender<ConnectionStatus>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpConnection {
    fn spawn(stream: TcpStream, peer: String, logger: Arc<Logger>) -> Self {
        let (mut reader, mut writer) = stream.into_split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let pending: PendingCalls = Arc::new(DashMap::new());
        let (status_tx, _) = watch::channel(ConnectionStatus::Open);
        let status = Arc::new(status_tx);

        let writer_status = status.clone();
        let writer_pending = pending.clone();
        let writer_logger = logger.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = write_encoded(&mut writer, &frame).await {
                    log_warn!(writer_logger, "write to peer failed: {e}");
                    writer_status.send_replace(ConnectionStatus::Failed(e.to_string()));
                    writer_pending.clear();
                    break;
                }
            }
        });

        let reader_status = status.clone();
        let reader_pending = pending.clone();
        let reader_peer = peer.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame::<_, ResponseEnvelope>(&mut reader).await {
                    Ok(Some(response)) => {
                        match reader_pending.remove(&response.call_id) {
                            Some((_, waiter)) => {
                                let _ = waiter.send(response);
                            }
                            None => log_debug!(
                                logger,
                                "response for unknown call {} from {reader_peer}",
                                response.call_id
                            ),
                        }
                    }
                    Ok(None) => {
                        log_debug!(logger, "peer {reader_peer} closed the connection");
                        reader_status.send_replace(ConnectionStatus::Closed);
                        break;
                    }
                    Err(e) => {
                        log_warn!(logger, "read from {reader_peer} failed: {e}");
                        reader_status.send_replace(ConnectionStatus::Failed(e.to_string()));
                        break;
                    }
                }
            }
            // Dropping the waiters fails every call still in flight
            reader_pending.clear();
        });

        Self {
            peer,
            outbound,
            pending,
            status,
            tasks: Mutex::new(vec![writer_task, reader_task]),
        }
    }
}

#[async_trait]
impl RpcConnection for TcpConnection {
    fn peer_address(&self) -> &str {
        &self.peer
    }

    async fn send(&self, envelope: CallEnvelope) -> Result<ResponseEnvelope, NetworkError> {
        // Oversized calls fail alone; the connection stays usable
        let frame = encode_frame(&envelope)?;

        let call_id = envelope.call_id;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id.clone(), tx);

        // Status flips before the waiters are dropped, so checking after the
        // insert never leaves a waiter nobody will answer or drop
        if !self.status.borrow().is_open() {
            self.pending.remove(&call_id);
            return Err(NetworkError::ConnectionError(format!(
                "connection to {} is not open",
                self.peer
            )));
        }

        if self.outbound.send(frame).is_err() {
            self.pending.remove(&call_id);
            return Err(NetworkError::ConnectionError(format!(
                "connection to {} is closed",
                self.peer
            )));
        }

        rx.await.map_err(|_| {
            NetworkError::ConnectionError(format!(
                "connection to {} closed before call {call_id} was answered",
                self.peer
            ))
        })
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    async fn close(&self) {
        self.status.send_replace(ConnectionStatus::Closed);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.pending.clear();
    }
}

/// A bound TCP listener and the tasks serving its connections
pub struct TcpRpcListener {
    address: String,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

#[async_trait]
impl RpcListener for TcpRpcListener {
    fn local_address(&self) -> String {
        self.address.clone()
    }

    async fn stop(&self) {
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
        let connections: Vec<JoinHandle<()>> =
            self.connections.lock().unwrap().drain(..).collect();
        for task in connections {
            task.abort();
        }
    }
}

/// Serve one accepted stream: every frame is handled on its own task so a
/// slow action does not hold up the others.
async fn serve_stream(stream: TcpStream, handler: EnvelopeHandler, logger: Arc<Logger>) {
    let (mut reader, mut writer) = stream.into_split();
    let (responses, mut responses_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer_logger = logger.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = responses_rx.recv().await {
            if let Err(e) = write_encoded(&mut writer, &frame).await {
                log_warn!(writer_logger, "failed to write response: {e}");
                break;
            }
        }
    });

    loop {
        match read_frame::<_, CallEnvelope>(&mut reader).await {
            Ok(Some(envelope)) => {
                let handler = handler.clone();
                let responses = responses.clone();
                let logger = logger.clone();
                tokio::spawn(async move {
                    let response = handler(envelope).await;
                    if let Some(frame) = encode_response(&response, &logger) {
                        let _ = responses.send(frame);
                    }
                });
            }
            Ok(None) => break,
            Err(e) => {
                log_warn!(logger, "dropping connection after bad frame: {e}");
                break;
            }
        }
    }

    drop(responses);
    // In-flight handlers still hold senders; let them finish writing
    let _ = writer_task.await;
}

/// Encode a response; a result too large for one frame is replaced by an
/// error response so the caller's connection survives it
fn encode_response(response: &ResponseEnvelope, logger: &Logger) -> Option<Vec<u8>> {
    match encode_frame(response) {
        Ok(frame) => Some(frame),
        Err(e) => {
            log_warn!(logger, "response to call {} not sent: {e}", response.call_id);
            let replacement = ResponseEnvelope::error(
                response.call_id.clone(),
                ErrorKind::RemoteCallError,
                format!("result too large: {e}"),
            );
            encode_frame(&replacement).ok()
        }
    }
}

#[async_trait]
impl RpcTransport for TcpTransport {
    async fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn RpcConnection>, NetworkError> {
        let peer = format!("{host}:{port}");
        let stream = TcpStream::connect((host, port)).await.map_err(|e| {
            NetworkError::ConnectionError(format!("failed to connect to {peer}: {e}"))
        })?;
        let _ = stream.set_nodelay(true);
        log_debug!(self.logger, "connected to {peer}");
        Ok(Arc::new(TcpConnection::spawn(
            stream,
            peer,
            self.logger.clone(),
        )))
    }

    async fn listen(
        &self,
        host: &str,
        port: u16,
        handler: EnvelopeHandler,
    ) -> Result<Arc<dyn RpcListener>, NetworkError> {
        // Bind on every interface; `host` is only what gets advertised
        let bind_address = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let listener = TcpListener::bind(bind_address).await.map_err(|e| {
            NetworkError::TransportError(format!("failed to listen on {bind_address}: {e}"))
        })?;
        let bound_port = listener
            .local_addr()
            .map_err(|e| NetworkError::TransportError(e.to_string()))?
            .port();
        let address = format!("{host}:{bound_port}");
        log_info!(self.logger, "listening on {address}");

        let connections: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
        let accepted = connections.clone();
        let logger = self.logger.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        log_debug!(logger, "accepted connection from {remote}");
                        let _ = stream.set_nodelay(true);
                        let task =
                            tokio::spawn(serve_stream(stream, handler.clone(), logger.clone()));
                        let mut tasks = accepted.lock().unwrap();
                        tasks.retain(|t| !t.is_finished());
                        tasks.push(task);
                    }
                    Err(e) => {
                        log_warn!(logger, "accept failed: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                }
            }
        });

        Ok(Arc::new(TcpRpcListener {
            address,
            accept_task: Mutex::new(Some(accept_task)),
            connections,
        }))
    }
}
