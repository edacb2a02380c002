//! The innermost pipeline service: executes operations against the routing engine.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use capbroker_core::messages::ProviderRequest;
use capbroker_core::{CleanupReport, CorrelationId, RoutingEngine};
use tower::Service;
use tracing::{debug, warn};

use super::binding::ConnectionBindings;
use super::operation::{Operation, OperationError, OperationResponse};
use crate::traits::ProviderDispatcher;

/// Executes `Operation`s against the shared `RoutingEngine`.
///
/// Invocations are dispatched to the provider after the engine has created
/// the pending correlation. If the dispatch fails, or the call is dropped
/// before it finishes (timeout layer), the correlation is withdrawn again.
#[derive(Clone)]
pub struct BrokerService {
    engine: Arc<RoutingEngine>,
    dispatcher: Arc<dyn ProviderDispatcher>,
    bindings: Arc<ConnectionBindings>,
}

impl BrokerService {
    #[must_use]
    pub fn new(
        engine: Arc<RoutingEngine>,
        dispatcher: Arc<dyn ProviderDispatcher>,
        bindings: Arc<ConnectionBindings>,
    ) -> Self {
        Self {
            engine,
            dispatcher,
            bindings,
        }
    }

    async fn execute(
        engine: Arc<RoutingEngine>,
        dispatcher: Arc<dyn ProviderDispatcher>,
        bindings: Arc<ConnectionBindings>,
        op: Operation,
    ) -> Result<OperationResponse, OperationError> {
        match op {
            Operation::RegisterProvider { params, .. } => {
                let registration =
                    engine.register_provider(&params.context, params.register, &params.capability)?;
                Ok(OperationResponse::Registered {
                    registered: registration.is_registered(),
                })
            }
            Operation::InvokeProvider { params, .. } => {
                let invocation = engine.invoke(&params.context, &params.capability)?;
                let pending = PendingDispatch::new(&engine, invocation.correlation_id.clone());
                let request = ProviderRequest {
                    correlation_id: invocation.correlation_id.clone(),
                    capability: params.capability,
                    context: invocation.consumer,
                    payload: params.payload,
                };

                if let Err(err) = dispatcher.dispatch(&invocation.provider, request).await {
                    warn!(
                        correlation = %invocation.correlation_id,
                        provider = %invocation.provider.connection_id,
                        error = %err,
                        "dispatch failed; withdrawing correlation"
                    );
                    return Err(err.into());
                }

                pending.confirm();
                Ok(OperationResponse::Invoked {
                    correlation_id: invocation.correlation_id,
                })
            }
            Operation::ProviderResult {
                correlation_id,
                payload,
                kind,
                ..
            } => {
                engine.handle_result(&correlation_id, payload, kind).await?;
                Ok(OperationResponse::Delivered)
            }
            Operation::ConnectionClosed { ctx, params } => {
                let Some(declared) = params.connection() else {
                    return Err(OperationError::Internal(anyhow::anyhow!(
                        "unvalidated connection id \"{}\"",
                        params.connection_id
                    )));
                };
                // Only ids this peer declared; anything else is already gone.
                let report = bindings
                    .release(ctx.connection_id, declared)
                    .map_or_else(CleanupReport::default, |routed| {
                        engine.on_connection_closed(routed)
                    });
                Ok(OperationResponse::ConnectionCleaned(report))
            }
        }
    }
}

/// Withdraws a freshly created correlation unless `confirm` is called.
struct PendingDispatch<'a> {
    engine: &'a RoutingEngine,
    correlation_id: CorrelationId,
    armed: bool,
}

impl<'a> PendingDispatch<'a> {
    fn new(engine: &'a RoutingEngine, correlation_id: CorrelationId) -> Self {
        Self {
            engine,
            correlation_id,
            armed: true,
        }
    }

    fn confirm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingDispatch<'_> {
    fn drop(&mut self) {
        if self.armed && self.engine.withdraw(&self.correlation_id).is_some() {
            debug!(correlation = %self.correlation_id, "invocation withdrawn before dispatch completed");
        }
    }
}

impl std::fmt::Debug for BrokerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerService")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl Service<Operation> for BrokerService {
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let engine = Arc::clone(&self.engine);
        let dispatcher = Arc::clone(&self.dispatcher);
        let bindings = Arc::clone(&self.bindings);
        Box::pin(Self::execute(engine, dispatcher, bindings, op))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
