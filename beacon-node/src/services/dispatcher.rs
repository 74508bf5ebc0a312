// Call Dispatcher
//
// INTENTION: Own the envelope protocol on both ends of a call.
//
// Outbound, it builds a `CallEnvelope` with a fresh call id, sends it over
// the selected connection and turns the `ResponseEnvelope` back into a value
// or a structured error.
//
// Inbound, it resolves the alias in the local registration table, enforces
// the permitted-action set BEFORE anything is invoked, decodes the
// parameters and runs the handler. Whatever happens (handler error, panic,
// undecodable params) exactly one response is produced per envelope.

use beacon_common::logging::Logger;
use beacon_common::{log_debug, log_warn};
use futures_util::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use super::service_registry::ServiceRegistry;
use crate::errors::{ErrorKind, RpcError};
use crate::network::transport::{
    CallEnvelope, NetworkError, ResponseEnvelope, ResponseOutcome, RpcConnection,
};

/// Decoded contents of an inbound envelope
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCall {
    pub alias: String,
    pub action: String,
    pub params: Vec<Value>,
}

pub struct CallDispatcher {
    sender_id: String,
    logger: Arc<Logger>,
}

impl CallDispatcher {
    pub fn new(sender_id: impl Into<String>, logger: Arc<Logger>) -> Self {
        Self {
            sender_id: sender_id.into(),
            logger,
        }
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    /// Build an envelope with a freshly generated call id
    pub fn build_envelope(
        &self,
        alias: &str,
        action: &str,
        params: &[Value],
    ) -> Result<CallEnvelope, RpcError> {
        let params = serde_json::to_vec(params)
            .map_err(|e| RpcError::InvalidParams(format!("unserializable params: {e}")))?;
        Ok(CallEnvelope {
            sender_id: self.sender_id.clone(),
            call_id: uuid::Uuid::new_v4().to_string(),
            alias: alias.to_string(),
            action: action.to_string(),
            params,
        })
    }

    /// Decode the routing fields and parameter list of an envelope
    pub fn parse_envelope(envelope: &CallEnvelope) -> Result<ParsedCall, RpcError> {
        let params: Vec<Value> = serde_json::from_slice(&envelope.params).map_err(|e| {
            RpcError::InvalidParams(format!("params must be a JSON array: {e}"))
        })?;
        Ok(ParsedCall {
            alias: envelope.alias.clone(),
            action: envelope.action.clone(),
            params,
        })
    }

    /// Round trip one call over `connection`
    pub async fn call(
        &self,
        connection: &dyn RpcConnection,
        alias: &str,
        action: &str,
        params: &[Value],
    ) -> Result<Value, RpcError> {
        let envelope = self.build_envelope(alias, action, params)?;
        let call_id = envelope.call_id.clone();
        log_debug!(
            self.logger,
            "call {call_id} {alias}.{action} -> {}",
            connection.peer_address()
        );

        let response = connection.send(envelope).await.map_err(|e| match e {
            NetworkError::FrameTooLarge(_) => {
                RpcError::InvalidParams(format!("{alias}.{action} params: {e}"))
            }
            e => RpcError::RemoteCallError(e.to_string()),
        })?;

        if response.call_id != call_id {
            return Err(RpcError::RemoteCallError(format!(
                "response for call {} received while waiting for {call_id}",
                response.call_id
            )));
        }

        match response.outcome {
            ResponseOutcome::Result(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                RpcError::RemoteCallError(format!("undecodable result for {alias}.{action}: {e}"))
            }),
            ResponseOutcome::Error { kind, message } => {
                log_debug!(self.logger, "call {call_id} failed remotely: {kind}: {message}");
                Err(RpcError::from_response(kind, message))
            }
        }
    }

    /// Serve one inbound envelope against the local registration table
    pub async fn handle_inbound(
        &self,
        registry: &ServiceRegistry,
        envelope: CallEnvelope,
    ) -> ResponseEnvelope {
        let call_id = envelope.call_id.clone();
        log_debug!(
            self.logger,
            "inbound call {call_id} {}.{} from {}",
            envelope.alias,
            envelope.action,
            envelope.sender_id
        );

        match self.invoke(registry, &envelope).await {
            Ok(value) => match serde_json::to_vec(&value) {
                Ok(bytes) => ResponseEnvelope::result(call_id, bytes),
                Err(e) => ResponseEnvelope::error(
                    call_id,
                    ErrorKind::RemoteCallError,
                    format!("unserializable result: {e}"),
                ),
            },
            Err(err) => {
                let message = match &err {
                    RpcError::ActionForbidden { alias, action } => format!("{alias}.{action}"),
                    RpcError::InvalidParams(m)
                    | RpcError::NoServiceFound(m)
                    | RpcError::RemoteCallError(m)
                    | RpcError::RegistryUnavailable(m)
                    | RpcError::AdapterUnsupported(m) => m.clone(),
                    RpcError::Transport(e) => e.to_string(),
                };
                ResponseEnvelope::error(call_id, err.kind(), message)
            }
        }
    }

    async fn invoke(
        &self,
        registry: &ServiceRegistry,
        envelope: &CallEnvelope,
    ) -> Result<Value, RpcError> {
        let entry = registry
            .resolve(&envelope.alias)
            .ok_or_else(|| RpcError::NoServiceFound(envelope.alias.clone()))?;

        // Short-circuit before anything about the action is looked at
        if !entry.permitted_actions.allows(&envelope.action) {
            log_warn!(
                self.logger,
                "forbidden call {}.{} from {}",
                envelope.alias,
                envelope.action,
                envelope.sender_id
            );
            return Err(RpcError::ActionForbidden {
                alias: envelope.alias.clone(),
                action: envelope.action.clone(),
            });
        }

        let handler = entry.service.action(&envelope.action).ok_or_else(|| {
            RpcError::RemoteCallError(format!(
                "{} has no action named {}",
                envelope.alias, envelope.action
            ))
        })?;

        let parsed = Self::parse_envelope(envelope)?;

        let future = std::panic::catch_unwind(AssertUnwindSafe(|| handler(parsed.params)))
            .map_err(|payload| RpcError::RemoteCallError(panic_message(payload.as_ref())))?;

        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(RpcError::RemoteCallError(e.to_string())),
            Err(payload) => Err(RpcError::RemoteCallError(panic_message(payload.as_ref()))),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("action panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("action panicked: {message}")
    } else {
        "action panicked".to_string()
    }
}

impl std::fmt::Debug for CallDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallDispatcher")
            .field("sender_id", &self.sender_id)
            .finish()
    }
}
