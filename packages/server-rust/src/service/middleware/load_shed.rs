//! Concurrency limit for the procedure pipeline.
//!
//! Calls beyond `max_concurrent_operations` fail straight away with
//! [`ProcedureError::Overloaded`] instead of queueing.

use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::Semaphore;
use tower::{Layer, Service};

use crate::service::procedure::{CallFuture, ProcedureCall, ProcedureError, ProcedureOutput};

/// Every service built from one layer shares its permits.
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

    /// Permits not held by a running call.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShed<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShed {
            inner,
            permits: Arc::clone(&self.permits),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadShed<S> {
    inner: S,
    permits: Arc<Semaphore>,
}

impl<S> Service<ProcedureCall> for LoadShed<S>
where
    S: Service<ProcedureCall, Response = ProcedureOutput, Error = ProcedureError>,
    S::Future: Send + 'static,
{
    type Response = ProcedureOutput;
    type Error = ProcedureError;
    type Future = CallFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: ProcedureCall) -> Self::Future {
        // Taken at call time so a burst is refused before any of it is polled.
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            tracing::warn!(path = %call.path, kind = %call.kind, "shedding call, server overloaded");
            return Box::pin(async { Err(ProcedureError::Overloaded) });
        };

        let output = self.inner.call(call);
        Box::pin(async move {
            let _permit = permit;
            output.await
        })
    }
}
