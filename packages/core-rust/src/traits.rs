use async_trait::async_trait;
use serde_json::Value;

use crate::context::ResponseTarget;
use crate::error::DeliveryError;
use crate::types::ResultKind;

/// Transports a provider result back to the consumer that asked for it.
///
/// The engine calls this after releasing its lock, so implementations may
/// block, await, or re-enter the engine.
#[async_trait]
pub trait ResponseGateway: Send + Sync {
    /// Deliver `payload` to `target`. `kind` is informational; the payload
    /// content already tells the consumer whether it is an error.
    async fn respond(
        &self,
        target: &ResponseTarget,
        payload: Value,
        kind: ResultKind,
    ) -> Result<(), DeliveryError>;
}
