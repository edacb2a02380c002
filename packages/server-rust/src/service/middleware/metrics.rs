//! Operation instrumentation: a tracing span per operation plus
//! `metrics` counters and a duration histogram labelled by method.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::operation::{Operation, OperationError, OperationResponse};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Records duration and outcome of every operation.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

/// Short label for the `outcome` field and metric label.
fn outcome_label(result: &Result<OperationResponse, OperationError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(OperationError::Broker(_)) => "rejected",
        Err(OperationError::Dispatch(_)) => "dispatch_failed",
        Err(OperationError::Timeout { .. }) => "timeout",
        Err(OperationError::Overloaded) => "overloaded",
        Err(OperationError::Internal(_)) => "internal",
    }
}

impl<S> Service<Operation> for MetricsService<S>
where
    S: Service<Operation, Response = OperationResponse, Error = OperationError> + Send,
    S::Future: Send + 'static,
{
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let method = op.ctx().method;
        let call_id = op.ctx().call_id;
        let connection = op.ctx().connection_id.0;

        let span = info_span!(
            "operation",
            method,
            call_id,
            connection,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(op);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();
                let outcome = outcome_label(&result);

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                let span = tracing::Span::current();
                span.record("duration_ms", duration_ms);
                span.record("outcome", outcome);

                ::metrics::counter!(
                    "capbroker_operations_total",
                    "method" => method,
                    "outcome" => outcome
                )
                .increment(1);
                ::metrics::histogram!("capbroker_operation_duration_seconds", "method" => method)
                    .record(elapsed.as_secs_f64());

                match &result {
                    Ok(_) => tracing::debug!(duration_ms, outcome, "operation complete"),
                    Err(err) => tracing::info!(duration_ms, outcome, error = %err, "operation failed"),
                }

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use capbroker_core::{BrokerError, ConnectionId, ResultKind};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::service::operation::OperationContext;

    /// Fails every operation whose handle is "bad".
    struct PickyService;

    impl Service<Operation> for PickyService {
        type Response = OperationResponse;
        type Error = OperationError;
        type Future =
            Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, op: Operation) -> Self::Future {
            let result = match op {
                Operation::ProviderResult { correlation_id, .. }
                    if correlation_id.as_str() == "bad" =>
                {
                    Err(OperationError::Broker(BrokerError::UnknownCorrelation {
                        correlation_id,
                    }))
                }
                _ => Ok(OperationResponse::Delivered),
            };
            Box::pin(async move { result })
        }
    }

    fn result_op(handle: &str) -> Operation {
        Operation::ProviderResult {
            ctx: OperationContext::new(42, ConnectionId(7), "handleProviderResponse", 5000),
            correlation_id: handle.into(),
            payload: Value::Null,
            kind: ResultKind::Success,
        }
    }

    #[tokio::test]
    async fn passes_responses_and_errors_through() {
        let resp = MetricsLayer
            .layer(PickyService)
            .oneshot(result_op("good"))
            .await
            .unwrap();
        assert_eq!(resp, OperationResponse::Delivered);

        let err = MetricsLayer
            .layer(PickyService)
            .oneshot(result_op("bad"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OperationError::Broker(BrokerError::UnknownCorrelation { .. })
        ));
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(outcome_label(&Ok(OperationResponse::Delivered)), "ok");
        assert_eq!(outcome_label(&Err(OperationError::Overloaded)), "overloaded");
        assert_eq!(
            outcome_label(&Err(OperationError::Timeout { timeout_ms: 1 })),
            "timeout"
        );
    }
}
