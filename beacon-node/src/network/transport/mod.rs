// Network Transport Module
//
// INTENTION: Carry call envelopes from a client to one provider endpoint
// and carry exactly one response back. The transport knows nothing about
// aliases or permissions; it only moves envelopes and reports the state of
// each connection so the pool can prune dead providers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use crate::errors::ErrorKind;

pub mod memory;
pub mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

/// Type alias for async-returning function
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Largest frame written to or accepted from a peer (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Error type for network operations
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection error: {0}")]
    ConnectionError(String),
    #[error("Message error: {0}")]
    MessageError(String),
    #[error("Transport error: {0}")]
    TransportError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// One remote invocation as it travels on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub sender_id: String,
    /// Unique per call; the response carries it back
    pub call_id: String,
    pub alias: String,
    pub action: String,
    /// JSON-encoded array of parameters
    pub params: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseOutcome {
    /// JSON-encoded result value
    Result(Vec<u8>),
    Error { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub call_id: String,
    pub outcome: ResponseOutcome,
}

impl ResponseEnvelope {
    pub fn result(call_id: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            call_id: call_id.into(),
            outcome: ResponseOutcome::Result(value),
        }
    }

    pub fn error(call_id: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            outcome: ResponseOutcome::Error {
                kind,
                message: message.into(),
            },
        }
    }
}

/// Lifecycle of a client connection to one provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Open,
    /// Closed locally or by the peer
    Closed,
    Failed(String),
}

impl ConnectionStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionStatus::Open)
    }
}

/// Server-side handler: every inbound envelope yields exactly one response
pub type EnvelopeHandler =
    Arc<dyn Fn(CallEnvelope) -> BoxFuture<'static, ResponseEnvelope> + Send + Sync>;

/// Client endpoint bound to one provider
#[async_trait]
pub trait RpcConnection: Send + Sync {
    /// `host:port` of the provider
    fn peer_address(&self) -> &str;

    /// Send an envelope and wait for its response
    async fn send(&self, envelope: CallEnvelope) -> Result<ResponseEnvelope, NetworkError>;

    /// Watch the connection state; the pool prunes on anything but `Open`
    fn status(&self) -> watch::Receiver<ConnectionStatus>;

    async fn close(&self);
}

/// A listening server endpoint
#[async_trait]
pub trait RpcListener: Send + Sync {
    fn local_address(&self) -> String;

    async fn stop(&self);
}

/// Byte-level transport between clients and servers
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn RpcConnection>, NetworkError>;

    async fn listen(
        &self,
        host: &str,
        port: u16,
        handler: EnvelopeHandler,
    ) -> Result<Arc<dyn RpcListener>, NetworkError>;
}

/// Encode one length-prefixed bincode frame, refusing anything the peer
/// would reject on read
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, NetworkError> {
    let serialized = bincode::serialize(message)
        .map_err(|e| NetworkError::MessageError(format!("Failed to serialize message: {e}")))?;
    if serialized.len() > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge(serialized.len()));
    }

    let mut frame = Vec::with_capacity(4 + serialized.len());
    frame.extend_from_slice(&(serialized.len() as u32).to_be_bytes());
    frame.extend_from_slice(&serialized);
    Ok(frame)
}

/// Write a frame produced by `encode_frame`
pub async fn write_encoded<S>(stream: &mut S, frame: &[u8]) -> Result<(), NetworkError>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(frame)
        .await
        .map_err(|e| NetworkError::MessageError(format!("Failed to write message: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| NetworkError::MessageError(format!("Failed to flush stream: {e}")))
}

/// Write one length-prefixed bincode frame
pub async fn write_frame<S, T>(stream: &mut S, message: &T) -> Result<(), NetworkError>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(message)?;
    write_encoded(stream, &frame).await
}

/// Read one length-prefixed bincode frame. `Ok(None)` on a clean EOF.
pub async fn read_frame<S, T>(stream: &mut S) -> Result<Option<T>, NetworkError>
where
    S: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_bytes = [0u8; 4];
    match stream.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(NetworkError::MessageError(format!(
                "Failed to read message length: {e}"
            )))
        }
    }

    let message_len = u32::from_be_bytes(len_bytes) as usize;
    if message_len > MAX_FRAME_SIZE {
        return Err(NetworkError::MessageError(format!(
            "Message too large: {message_len} bytes"
        )));
    }

    let mut message_data = vec![0u8; message_len];
    stream
        .read_exact(&mut message_data)
        .await
        .map_err(|e| NetworkError::MessageError(format!("Failed to read message data: {e}")))?;

    bincode::deserialize(&message_data)
        .map(Some)
        .map_err(|e| NetworkError::MessageError(format!("Failed to deserialize message: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_a_duplex_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let envelope = CallEnvelope {
            sender_id: "h.1.abc".into(),
            call_id: "c1".into(),
            alias: "lodash".into(),
            action: "isString".into(),
            params: br#"["x"]"#.to_vec(),
        };
        write_frame(&mut a, &envelope).await.unwrap();
        drop(a);

        let read: Option<CallEnvelope> = read_frame(&mut b).await.unwrap();
        assert_eq!(read, Some(envelope));
        let eof: Option<CallEnvelope> = read_frame(&mut b).await.unwrap();
        assert_eq!(eof, None);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();
        let result: Result<Option<CallEnvelope>, _> = read_frame(&mut b).await;
        assert!(matches!(result, Err(NetworkError::MessageError(_))));
    }

    #[test]
    fn oversized_frames_are_not_encoded() {
        let response = ResponseEnvelope::result("c1", vec![7u8; MAX_FRAME_SIZE + 1]);
        match encode_frame(&response) {
            Err(NetworkError::FrameTooLarge(size)) => assert!(size > MAX_FRAME_SIZE),
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }

        let small = ResponseEnvelope::result("c2", vec![7u8; 16]);
        let frame = encode_frame(&small).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
    }
}
