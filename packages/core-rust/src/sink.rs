//! Per-invocation result callback bound to one correlation handle.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::engine::RoutingEngine;
use crate::error::BrokerError;
use crate::types::{CorrelationId, ResultKind};

/// Forwards a provider's result to `RoutingEngine::handle_result` with the
/// handle captured at creation, so the caller never has to carry it.
///
/// Clones share the same handle; only the first result through any of them
/// is delivered.
#[derive(Clone)]
pub struct ResponseSink {
    engine: Arc<RoutingEngine>,
    correlation_id: CorrelationId,
}

impl ResponseSink {
    #[must_use]
    pub fn new(engine: Arc<RoutingEngine>, correlation_id: CorrelationId) -> Self {
        Self {
            engine,
            correlation_id,
        }
    }

    #[must_use]
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// # Errors
    ///
    /// Same as `RoutingEngine::handle_result`.
    pub async fn success(&self, payload: Value) -> Result<(), BrokerError> {
        self.engine
            .handle_result(&self.correlation_id, payload, ResultKind::Success)
            .await
    }

    /// # Errors
    ///
    /// Same as `RoutingEngine::handle_result`.
    pub async fn error(&self, payload: Value) -> Result<(), BrokerError> {
        self.engine
            .handle_result(&self.correlation_id, payload, ResultKind::Error)
            .await
    }
}

impl fmt::Debug for ResponseSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSink")
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}
