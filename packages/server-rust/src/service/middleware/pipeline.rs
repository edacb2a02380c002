//! Pipeline composition: combines all middleware layers into a single service stack.

use tower::util::BoxCloneSyncService;
use tower::ServiceBuilder;

use super::load_shed::LoadShedLayer;
use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use crate::service::broker::BrokerService;
use crate::service::config::ServerConfig;
use crate::service::operation::{Operation, OperationError, OperationResponse};

/// The type-erased operation pipeline shared by every connection.
///
/// Cloning is cheap; each request works on its own clone.
pub type OperationPipeline = BoxCloneSyncService<Operation, OperationResponse, OperationError>;

/// Wraps the `BrokerService` with the middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when overloaded before doing any work
/// 2. `TimeoutLayer` -- enforce per-operation deadlines
/// 3. `MetricsLayer` -- record timing and outcome closest to the handler
#[must_use]
pub fn build_operation_pipeline(service: BrokerService, config: &ServerConfig) -> OperationPipeline {
    let stack = ServiceBuilder::new()
        .layer(LoadShedLayer::new(config.max_concurrent_operations))
        .layer(TimeoutLayer)
        .layer(MetricsLayer)
        .service(service);
    BoxCloneSyncService::new(stack)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use capbroker_core::messages::{ProviderRequest, RegisterProviderParams};
    use capbroker_core::{
        BrokerError, ConnectionId, EngineConfig, ProviderEntry, RequestContext, RoutingEngine,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::service::binding::ConnectionBindings;
    use crate::service::config::ContextBinding;
    use crate::service::operation::OperationContext;
    use crate::traits::{DispatchError, ProviderDispatcher};

    struct NullDispatcher;

    #[async_trait]
    impl ProviderDispatcher for NullDispatcher {
        async fn dispatch(
            &self,
            _provider: &ProviderEntry,
            _request: ProviderRequest,
        ) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    fn register_op(conn: u32, register: bool) -> Operation {
        Operation::RegisterProvider {
            ctx: OperationContext::new(1, ConnectionId(conn), "registerProvider", 5000),
            params: RegisterProviderParams {
                context: RequestContext::new(0, conn, "app1"),
                register,
                capability: "video.play".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn pipeline_routes_through_all_layers() {
        let engine = Arc::new(RoutingEngine::new(EngineConfig::default()));
        let service = BrokerService::new(
            Arc::clone(&engine),
            Arc::new(NullDispatcher),
            Arc::new(ConnectionBindings::new(ContextBinding::Transport)),
        );
        let pipeline = build_operation_pipeline(service, &ServerConfig::default());

        let resp = pipeline.clone().oneshot(register_op(7, true)).await.unwrap();
        assert_eq!(resp, OperationResponse::Registered { registered: true });
        assert!(engine.find_provider("video.play").is_some());

        let err = pipeline.oneshot(register_op(8, false)).await.unwrap_err();
        assert!(matches!(
            err,
            OperationError::Broker(BrokerError::OwnershipViolation { .. })
        ));
    }
}
