use async_trait::async_trait;
use capbroker_core::messages::ProviderRequest;
use capbroker_core::{ConnectionId, ProviderEntry};
use thiserror::Error;

/// Delivers an invocation request to the provider that owns the capability.
///
/// The routing engine only bookkeeps; sending the request over the wire is
/// the transport's job.
#[async_trait]
pub trait ProviderDispatcher: Send + Sync {
    /// Send `request` to `provider`'s connection.
    async fn dispatch(
        &self,
        provider: &ProviderEntry,
        request: ProviderRequest,
    ) -> Result<(), DispatchError>;
}

/// Why an invocation request could not reach its provider.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("provider connection {0} is not connected")]
    Disconnected(ConnectionId),
    #[error("timed out dispatching to provider connection {0}")]
    Timeout(ConnectionId),
    #[error("failed to encode provider request: {0}")]
    Encode(#[from] serde_json::Error),
}
