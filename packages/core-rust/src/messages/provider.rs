//! Method names and parameter shapes of the provider protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{RequestContext, ResponseTarget};
use crate::types::{ConnectionId, CorrelationId};

/// Method names, without any namespace prefix.
pub mod methods {
    pub const REGISTER_PROVIDER: &str = "registerProvider";
    pub const INVOKE_PROVIDER: &str = "invokeProvider";
    pub const HANDLE_PROVIDER_RESPONSE: &str = "handleProviderResponse";
    pub const HANDLE_PROVIDER_ERROR: &str = "handleProviderError";
    pub const ON_CONNECTION_CLOSED: &str = "onConnectionClosed";

    /// Notification sent to a provider connection for each invocation.
    pub const PROVIDER_REQUEST: &str = "org.rdk.App2AppProvider.request";
    /// Notification sent to a consumer connection carrying a provider result.
    pub const GATEWAY_RESPOND: &str = "org.rdk.AppGateway.respond";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterProviderParams {
    pub context: RequestContext,
    pub register: bool,
    pub capability: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeProviderParams {
    pub context: RequestContext,
    pub capability: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Params of `handleProviderResponse` and `handleProviderError`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResultParams {
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

impl ProviderResultParams {
    /// Resolves the correlation handle and strips it from the payload.
    ///
    /// The side-channel `correlationId` wins; otherwise a string
    /// `payload.correlationId` is used. The embedded field is removed in
    /// either case so the consumer never sees the handle.
    pub fn take_correlation(&mut self) -> Option<CorrelationId> {
        let embedded = match &mut self.payload {
            Value::Object(map) => map.remove("correlationId"),
            _ => None,
        };
        self.correlation_id.take().or_else(|| match embedded {
            Some(Value::String(id)) => Some(CorrelationId::new(id)),
            _ => None,
        })
    }
}

/// Params of the `org.rdk.App2AppProvider.request` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRequest {
    pub correlation_id: CorrelationId,
    pub capability: String,
    /// The consumer that invoked the capability.
    pub context: ResponseTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Params of the `org.rdk.AppGateway.respond` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondParams {
    pub context: ResponseTarget,
    pub payload: Value,
}

/// Params of `onConnectionClosed`, sent by gateway peers fronting many apps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionClosedParams {
    #[serde(deserialize_with = "crate::context::deserialize_connection_ref")]
    pub connection_id: String,
}

impl ConnectionClosedParams {
    #[must_use]
    pub fn connection(&self) -> Option<ConnectionId> {
        ConnectionId::parse(&self.connection_id)
    }
}
