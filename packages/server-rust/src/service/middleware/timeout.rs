//! Per-operation deadline enforcement.
//!
//! Each operation carries its own `call_timeout_ms`; an operation still
//! running when it elapses fails with `OperationError::Timeout`. Provider
//! results are exempt: once the engine has consumed the correlation, dropping
//! the delivery midway would lose the result. The gateway's own send timeout
//! bounds them instead.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tower::{Layer, Service};
use tracing::warn;

use crate::service::operation::{Operation, OperationError, OperationResponse};

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Wraps services with the deadline read from `ctx.call_timeout_ms`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutLayer;

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService { inner }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
}

impl<S> Service<Operation> for TimeoutService<S>
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
        if op.releases_state() {
            return Box::pin(self.inner.call(op));
        }

        let timeout_ms = op.ctx().call_timeout_ms;
        let method = op.ctx().method;
        let call_id = op.ctx().call_id;
        let fut = self.inner.call(op);

        Box::pin(async move {
            match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(method, call_id, timeout_ms, "operation timed out");
                    Err(OperationError::Timeout { timeout_ms })
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
