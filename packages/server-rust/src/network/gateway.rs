//! Adapts the connection registry to the engine's delivery collaborators.
//!
//! Results and invocation requests both travel as JSON-RPC notifications
//! written into the outbound channel of the socket carrying the target. The
//! engine's connection ids are resolved through `ConnectionBindings`, and the
//! id the caller declared is what appears on the wire.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use capbroker_core::messages::provider::methods;
use capbroker_core::messages::{JsonRpcRequest, ProviderRequest, RespondParams};
use capbroker_core::{
    ConnectionId, DeliveryError, ProviderEntry, ResponseGateway, ResponseTarget, ResultKind,
};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::connection::{ConnectionRegistry, OutboundMessage, SendError};
use crate::service::ConnectionBindings;
use crate::traits::{DispatchError, ProviderDispatcher};

/// Writes broker notifications to live WebSocket connections.
#[derive(Debug)]
pub struct ConnectionGateway {
    registry: Arc<ConnectionRegistry>,
    bindings: Arc<ConnectionBindings>,
    send_timeout: Duration,
}

impl ConnectionGateway {
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        bindings: Arc<ConnectionBindings>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            bindings,
            send_timeout,
        }
    }

    async fn deliver(&self, socket: ConnectionId, frame: String) -> Result<(), SendError> {
        let handle = self.registry.get(socket).ok_or(SendError::Disconnected)?;
        handle
            .send_timeout(OutboundMessage::Text(frame), self.send_timeout)
            .await
    }

    /// `target` as the receiving side knows it.
    fn on_wire(&self, target: &ResponseTarget) -> ResponseTarget {
        let mut target = target.clone();
        if let Some(route) = self.bindings.route(target.connection_id) {
            target.connection_id = route.wire_id;
        }
        target
    }
}

fn encode_notification<T: Serialize>(method: &str, params: &T) -> serde_json::Result<String> {
    let params: Value = serde_json::to_value(params)?;
    serde_json::to_string(&JsonRpcRequest::notification(method, params))
}

#[async_trait]
impl ResponseGateway for ConnectionGateway {
    async fn respond(
        &self,
        target: &ResponseTarget,
        payload: Value,
        kind: ResultKind,
    ) -> Result<(), DeliveryError> {
        let connection_id = target.connection_id;
        let route = self
            .bindings
            .route(connection_id)
            .ok_or(DeliveryError::Disconnected(connection_id))?;
        let params = RespondParams {
            context: self.on_wire(target),
            payload,
        };
        let frame = encode_notification(methods::GATEWAY_RESPOND, &params)
            .map_err(|err| DeliveryError::Rejected(err.to_string()))?;

        self.deliver(route.socket, frame)
            .await
            .map_err(|err| match err {
                SendError::Timeout => DeliveryError::Timeout(connection_id),
                SendError::Disconnected | SendError::Full => {
                    DeliveryError::Disconnected(connection_id)
                }
            })?;

        debug!(
            connection = %connection_id,
            socket = %route.socket,
            kind = kind.as_str(),
            "result written to consumer"
        );
        Ok(())
    }
}

#[async_trait]
impl ProviderDispatcher for ConnectionGateway {
    async fn dispatch(
        &self,
        provider: &ProviderEntry,
        mut request: ProviderRequest,
    ) -> Result<(), DispatchError> {
        let connection_id = provider.connection_id;
        let route = self
            .bindings
            .route(connection_id)
            .ok_or(DispatchError::Disconnected(connection_id))?;
        request.context = self.on_wire(&request.context);
        let frame = encode_notification(methods::PROVIDER_REQUEST, &request)?;
        self.deliver(route.socket, frame)
            .await
            .map_err(|err| match err {
                SendError::Timeout => DispatchError::Timeout(connection_id),
                SendError::Disconnected | SendError::Full => {
                    DispatchError::Disconnected(connection_id)
                }
            })
    }
}
