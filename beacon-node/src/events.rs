// Event Bus
//
// INTENTION: Give lifecycle and background-failure signalling one explicit,
// enumerated shape. Components emit onto a shared bus; callers subscribe
// and receive every event emitted after they subscribed. Every event is also
// written to the emitting component's log.

use beacon_common::logging::Logger;
use beacon_common::{log_debug, log_error, log_info};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::errors::{ErrorKind, RpcError};

/// Number of events buffered per subscriber before the oldest are dropped
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events published by adapters, registries, pools and facades
#[derive(Debug, Clone, PartialEq)]
pub enum BeaconEvent {
    /// A component finished starting up
    Ready(String),
    /// Lifecycle information (registration, listening, pruning)
    Info(String),
    /// Low-level tracing of idempotent backend operations
    Debug(String),
    /// A failure that is not returned to any caller
    Error { kind: ErrorKind, message: String },
}

impl BeaconEvent {
    pub fn is_error(&self) -> bool {
        matches!(self, BeaconEvent::Error { .. })
    }
}

/// Broadcast bus shared by every component of one client or server
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BeaconEvent>,
    logger: Arc<Logger>,
}

impl EventBus {
    pub fn new(logger: Arc<Logger>) -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender, logger }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BeaconEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn emit(&self, event: BeaconEvent) {
        match &event {
            BeaconEvent::Ready(info) => log_info!(self.logger, "ready: {info}"),
            BeaconEvent::Info(info) => log_info!(self.logger, "{info}"),
            BeaconEvent::Debug(msg) => log_debug!(self.logger, "{msg}"),
            BeaconEvent::Error { kind, message } => {
                log_error!(self.logger, "{kind}: {message}")
            }
        }
        let _ = self.sender.send(event);
    }

    pub fn ready(&self, info: impl Into<String>) {
        self.emit(BeaconEvent::Ready(info.into()));
    }

    pub fn info(&self, info: impl Into<String>) {
        self.emit(BeaconEvent::Info(info.into()));
    }

    pub fn debug(&self, msg: impl Into<String>) {
        self.emit(BeaconEvent::Debug(msg.into()));
    }

    pub fn error(&self, kind: ErrorKind, message: impl Into<String>) {
        self.emit(BeaconEvent::Error {
            kind,
            message: message.into(),
        });
    }

    /// Report an error that has no caller to return to
    pub fn report(&self, context: &str, err: &RpcError) {
        self.error(err.kind(), format!("{context}: {err}"));
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}
