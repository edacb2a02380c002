//! Concurrency cap for state-creating operations.
//!
//! Registrations and invocations beyond `max_concurrent_operations` fail
//! fast with `OperationError::Overloaded`. Provider results and connection
//! cleanup always pass: shedding them would leave a consumer waiting on a
//! correlation the provider already answered.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower::{Layer, Service};
use tracing::warn;

use crate::service::operation::{Operation, OperationError, OperationResponse};

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    permits: Arc<Semaphore>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent as usize)),
        }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            permits: Arc::clone(&self.permits),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    permits: Arc<Semaphore>,
}

impl<S> LoadShedService<S> {
    /// `Ok(None)` for operations exempt from the cap.
    fn admit(&self, op: &Operation) -> Result<Option<OwnedSemaphorePermit>, OperationError> {
        if op.releases_state() {
            return Ok(None);
        }
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => Ok(Some(permit)),
            Err(_) => {
                warn!(
                    method = op.ctx().method,
                    call_id = op.ctx().call_id,
                    connection = %op.ctx().connection_id,
                    "operation shed: concurrency limit reached"
                );
                metrics::counter!("capbroker_operations_shed_total", "method" => op.ctx().method)
                    .increment(1);
                Err(OperationError::Overloaded)
            }
        }
    }
}

impl<S> Service<Operation> for LoadShedService<S>
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
        let permit = match self.admit(&op) {
            Ok(permit) => permit,
            Err(err) => return Box::pin(async move { Err(err) }),
        };

        let fut = self.inner.call(op);
        Box::pin(async move {
            let _permit = permit;
            fut.await
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
