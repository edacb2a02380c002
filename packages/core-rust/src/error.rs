//! Error taxonomy of the routing engine.

use thiserror::Error;

use crate::messages::rpc::codes;
use crate::types::{ConnectionId, CorrelationId};

/// Failures returned synchronously by `RoutingEngine` operations.
///
/// None of these are fatal. Each one is an expected outcome the immediate
/// caller can act on; the engine never retries internally.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Empty or malformed capability, app id, or connection id.
    #[error("invalid parameters: {reason}")]
    BadParameters { reason: String },

    /// Invoke against a capability with no registered provider.
    #[error("no provider registered for capability \"{capability}\"")]
    UnknownCapability { capability: String },

    /// Result for a handle that is resolved, dropped, or never existed.
    #[error("unknown correlation \"{correlation_id}\"")]
    UnknownCorrelation { correlation_id: CorrelationId },

    /// Unregister of a capability nobody provides.
    #[error("capability \"{capability}\" is not registered")]
    NotRegistered { capability: String },

    /// Unregister from a connection that does not own the registration.
    #[error(
        "capability \"{capability}\" is owned by connection {owner}, not {requester}"
    )]
    OwnershipViolation {
        capability: String,
        owner: ConnectionId,
        requester: ConnectionId,
    },

    /// The response gateway could not deliver. The correlation stays consumed.
    #[error("delivery unavailable: {0}")]
    Delivery(#[from] DeliveryError),
}

impl BrokerError {
    pub(crate) fn bad_parameters(reason: impl Into<String>) -> Self {
        Self::BadParameters {
            reason: reason.into(),
        }
    }

    /// JSON-RPC error code reported to the remote caller.
    #[must_use]
    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::BadParameters { .. } => codes::INVALID_PARAMS,
            Self::UnknownCapability { .. } | Self::NotRegistered { .. } => {
                codes::PROVIDER_NOT_FOUND
            }
            Self::UnknownCorrelation { .. } => codes::UNKNOWN_CORRELATION,
            Self::OwnershipViolation { .. } => codes::INVALID_REQUEST,
            Self::Delivery(_) => codes::DISPATCH_FAILED,
        }
    }
}

/// Why the response gateway could not deliver a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// No gateway is attached to the engine.
    #[error("no response gateway attached")]
    GatewayUnavailable,
    /// The consumer's connection is gone.
    #[error("consumer connection {0} is not connected")]
    Disconnected(ConnectionId),
    /// The consumer's outbound queue stayed full.
    #[error("timed out delivering to connection {0}")]
    Timeout(ConnectionId),
    /// The gateway refused the delivery for a transport-specific reason.
    #[error("gateway rejected delivery: {0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_error_kind() {
        assert_eq!(
            BrokerError::bad_parameters("x").rpc_code(),
            codes::INVALID_PARAMS
        );
        assert_eq!(
            BrokerError::UnknownCapability {
                capability: "c".into()
            }
            .rpc_code(),
            codes::PROVIDER_NOT_FOUND
        );
        assert_eq!(
            BrokerError::UnknownCorrelation {
                correlation_id: "h".into()
            }
            .rpc_code(),
            codes::UNKNOWN_CORRELATION
        );
        assert_eq!(
            BrokerError::OwnershipViolation {
                capability: "c".into(),
                owner: ConnectionId(7),
                requester: ConnectionId(8),
            }
            .rpc_code(),
            codes::INVALID_REQUEST
        );
        assert_eq!(
            BrokerError::NotRegistered {
                capability: "c".into()
            }
            .rpc_code(),
            codes::PROVIDER_NOT_FOUND
        );
        assert_eq!(
            BrokerError::from(DeliveryError::GatewayUnavailable).rpc_code(),
            codes::DISPATCH_FAILED
        );
    }

    #[test]
    fn ownership_message_names_both_connections() {
        let err = BrokerError::OwnershipViolation {
            capability: "video.play".into(),
            owner: ConnectionId(7),
            requester: ConnectionId(8),
        };
        assert_eq!(
            err.to_string(),
            "capability \"video.play\" is owned by connection 7, not 8"
        );
    }
}
