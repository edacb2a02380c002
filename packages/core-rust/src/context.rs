//! Consumer, provider, and delivery contexts.

use std::time::Instant;

use serde::{Deserialize, Deserializer, Serialize};

use crate::types::{ConnectionId, RequestId};

/// Identity and routing info attached to every inbound request.
///
/// `connection_id` is kept as the raw transport value until the engine
/// validates it, because callers send it either as a JSON number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub request_id: RequestId,
    #[serde(default, deserialize_with = "deserialize_connection_ref")]
    pub connection_id: String,
    pub app_id: String,
}

impl RequestContext {
    #[must_use]
    pub fn new(request_id: u64, connection_id: impl ToString, app_id: impl Into<String>) -> Self {
        Self {
            request_id: RequestId(request_id),
            connection_id: connection_id.to_string(),
            app_id: app_id.into(),
        }
    }

    /// The validated connection identifier, if `connection_id` is well-formed.
    #[must_use]
    pub fn connection(&self) -> Option<ConnectionId> {
        ConnectionId::parse(&self.connection_id)
    }
}

/// Accepts `"connectionId": 7` as well as `"connectionId": "7"`.
pub(crate) fn deserialize_connection_ref<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Unsigned(u64),
        Signed(i64),
        Text(String),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Unsigned(n) => n.to_string(),
        Raw::Signed(n) => n.to_string(),
        Raw::Text(s) => s,
    })
}

/// One active provider registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEntry {
    pub capability: String,
    pub app_id: String,
    pub connection_id: ConnectionId,
    pub registered_at: Instant,
}

/// One in-flight invocation awaiting a provider result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerContext {
    pub request_id: RequestId,
    pub connection_id: ConnectionId,
    pub app_id: String,
    pub capability: String,
    pub created_at: Instant,
}

impl ConsumerContext {
    /// Delivery address for this invocation's result.
    #[must_use]
    pub fn target(&self) -> ResponseTarget {
        ResponseTarget {
            request_id: self.request_id,
            connection_id: self.connection_id,
            app_id: self.app_id.clone(),
        }
    }
}

/// The exact consumer context handed to the response gateway.
///
/// Always built from the context stored at invoke time, never from anything
/// the provider sends back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseTarget {
    pub request_id: RequestId,
    pub connection_id: ConnectionId,
    pub app_id: String,
}
