//! Operation types flowing through the service pipeline.

use std::time::Instant;

use capbroker_core::messages::rpc::codes;
use capbroker_core::messages::{
    ConnectionClosedParams, InvokeProviderParams, JsonRpcError, RegisterProviderParams,
};
use capbroker_core::{BrokerError, CleanupReport, ConnectionId, CorrelationId, ResultKind};
use serde_json::{json, Value};

use crate::traits::DispatchError;

/// Context carried with every operation through the pipeline.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub call_id: u64,
    /// Socket the request arrived on.
    pub connection_id: ConnectionId,
    /// Bare method name, namespace prefix removed.
    pub method: &'static str,
    pub call_timeout_ms: u64,
    pub received_at: Instant,
}

impl OperationContext {
    #[must_use]
    pub fn new(
        call_id: u64,
        connection_id: ConnectionId,
        method: &'static str,
        call_timeout_ms: u64,
    ) -> Self {
        Self {
            call_id,
            connection_id,
            method,
            call_timeout_ms,
            received_at: Instant::now(),
        }
    }
}

/// Typed operation variants dispatched through the pipeline.
#[derive(Debug)]
pub enum Operation {
    RegisterProvider {
        ctx: OperationContext,
        params: RegisterProviderParams,
    },
    InvokeProvider {
        ctx: OperationContext,
        params: InvokeProviderParams,
    },
    /// `handleProviderResponse` or `handleProviderError`, handle already extracted.
    ProviderResult {
        ctx: OperationContext,
        correlation_id: CorrelationId,
        payload: Value,
        kind: ResultKind,
    },
    ConnectionClosed {
        ctx: OperationContext,
        params: ConnectionClosedParams,
    },
}

impl Operation {
    #[must_use]
    pub fn ctx(&self) -> &OperationContext {
        match self {
            Self::RegisterProvider { ctx, .. }
            | Self::InvokeProvider { ctx, .. }
            | Self::ProviderResult { ctx, .. }
            | Self::ConnectionClosed { ctx, .. } => ctx,
        }
    }

    /// Operations that resolve or release broker state rather than create it.
    #[must_use]
    pub fn releases_state(&self) -> bool {
        matches!(
            self,
            Self::ProviderResult { .. } | Self::ConnectionClosed { .. }
        )
    }
}

/// Successful response from the broker service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResponse {
    Registered { registered: bool },
    Invoked { correlation_id: CorrelationId },
    Delivered,
    ConnectionCleaned(CleanupReport),
}

impl OperationResponse {
    /// The JSON-RPC `result` value for this response.
    #[must_use]
    pub fn to_result(&self) -> Value {
        match self {
            Self::Registered { registered } => json!({ "registered": registered }),
            Self::Invoked { correlation_id } => json!({ "correlationId": correlation_id }),
            Self::Delivered => json!({ "delivered": true }),
            Self::ConnectionCleaned(report) => json!({
                "providersRemoved": report.providers_removed,
                "correlationsDropped": report.correlations_dropped,
            }),
        }
    }
}

/// Errors returned by the operation pipeline.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("dispatch to provider failed: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("server overloaded, try again later")]
    Overloaded,
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OperationError {
    #[must_use]
    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::Broker(err) => err.rpc_code(),
            Self::Dispatch(_) => codes::DISPATCH_FAILED,
            Self::Timeout { .. } => codes::TIMEOUT,
            Self::Overloaded => codes::OVERLOADED,
            Self::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    #[must_use]
    pub fn to_rpc_error(&self) -> JsonRpcError {
        JsonRpcError::new(self.rpc_code(), self.to_string())
    }
}

/// Errors from classifying a JSON-RPC request into an `Operation`.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("method not found: {method}")]
    UnknownMethod { method: String },
    #[error("method {method} is not accepted on this connection")]
    NotPermitted { method: &'static str },
    #[error("invalid params for {method}: {source}")]
    InvalidParams {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("missing correlationId")]
    MissingCorrelation,
    #[error("{method} requires a non-empty payload")]
    EmptyPayload { method: &'static str },
    #[error("invalid connectionId \"{raw}\"")]
    InvalidConnection { raw: String },
}

impl ClassifyError {
    #[must_use]
    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::UnknownMethod { .. } | Self::NotPermitted { .. } => codes::METHOD_NOT_FOUND,
            Self::InvalidParams { .. }
            | Self::MissingCorrelation
            | Self::EmptyPayload { .. }
            | Self::InvalidConnection { .. } => codes::INVALID_PARAMS,
        }
    }

    #[must_use]
    pub fn to_rpc_error(&self) -> JsonRpcError {
        JsonRpcError::new(self.rpc_code(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use capbroker_core::DeliveryError;

    use super::*;

    #[test]
    fn responses_render_wire_results() {
        assert_eq!(
            OperationResponse::Registered { registered: false }.to_result(),
            json!({"registered": false})
        );
        assert_eq!(
            OperationResponse::Invoked {
                correlation_id: "h1".into()
            }
            .to_result(),
            json!({"correlationId": "h1"})
        );
        assert_eq!(
            OperationResponse::ConnectionCleaned(CleanupReport {
                providers_removed: 2,
                correlations_dropped: 1,
            })
            .to_result(),
            json!({"providersRemoved": 2, "correlationsDropped": 1})
        );
    }

    #[test]
    fn error_codes() {
        assert_eq!(OperationError::Overloaded.rpc_code(), codes::OVERLOADED);
        assert_eq!(
            OperationError::Timeout { timeout_ms: 5 }.rpc_code(),
            codes::TIMEOUT
        );
        assert_eq!(
            OperationError::from(DispatchError::Disconnected(ConnectionId(7))).rpc_code(),
            codes::DISPATCH_FAILED
        );
        assert_eq!(
            OperationError::from(BrokerError::from(DeliveryError::GatewayUnavailable)).rpc_code(),
            codes::DISPATCH_FAILED
        );
        assert_eq!(
            ClassifyError::MissingCorrelation.rpc_code(),
            codes::INVALID_PARAMS
        );
        assert_eq!(
            ClassifyError::UnknownMethod {
                method: "x".into()
            }
            .rpc_code(),
            codes::METHOD_NOT_FOUND
        );
    }

    #[test]
    fn broker_error_message_is_passed_through() {
        let err = OperationError::from(BrokerError::UnknownCapability {
            capability: "video.play".into(),
        });
        let rpc = err.to_rpc_error();
        assert_eq!(rpc.code, codes::PROVIDER_NOT_FOUND);
        assert_eq!(
            rpc.message,
            "no provider registered for capability \"video.play\""
        );
    }
}
