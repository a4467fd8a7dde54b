//! Procedure routing: dispatches `ProcedureCall` to the procedure registered on its path.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde_json::Value;
use skein_core::OperationKind;
use tower::util::BoxCloneSyncService;
use tower::{service_fn, Service, ServiceExt};

use super::procedure::{
    CallFuture, ProcedureCall, ProcedureError, ProcedureOutput, ProcedureStream,
};

// ---------------------------------------------------------------------------
// Boxed procedure
// ---------------------------------------------------------------------------

/// A type-erased Tower service answering calls for one path.
pub type BoxedProcedure = BoxCloneSyncService<ProcedureCall, ProcedureOutput, ProcedureError>;

#[derive(Clone)]
struct Procedure {
    kind: OperationKind,
    service: BoxedProcedure,
}

// ---------------------------------------------------------------------------
// ProcedureRouter
// ---------------------------------------------------------------------------

/// Routes `ProcedureCall` values to the procedure registered on their path.
///
/// Calls to an unregistered path return `ProcedureError::NotFound`; calls
/// whose kind differs from the registered one return
/// `ProcedureError::KindMismatch`. Cloning shares the registered procedures.
#[derive(Clone, Default)]
pub struct ProcedureRouter {
    procedures: Arc<HashMap<String, Procedure>>,
}

impl ProcedureRouter {
    /// Create a new empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service answering calls of `kind` on `path`.
    ///
    /// A later registration on the same path replaces the earlier one.
    pub fn register<S>(&mut self, path: impl Into<String>, kind: OperationKind, service: S)
    where
        S: Service<ProcedureCall, Response = ProcedureOutput, Error = ProcedureError>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        self.insert(path.into(), kind, BoxCloneSyncService::new(service));
    }

    fn insert(&mut self, path: String, kind: OperationKind, service: BoxedProcedure) {
        Arc::make_mut(&mut self.procedures).insert(path, Procedure { kind, service });
    }

    /// Register an async function as a query.
    #[must_use]
    pub fn query<F, Fut>(mut self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ProcedureCall) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ProcedureError>> + Send + 'static,
    {
        self.insert(path.into(), OperationKind::Query, value_service(handler));
        self
    }

    /// Register an async function as a mutation.
    #[must_use]
    pub fn mutation<F, Fut>(mut self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ProcedureCall) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ProcedureError>> + Send + 'static,
    {
        self.insert(path.into(), OperationKind::Mutation, value_service(handler));
        self
    }

    /// Register an async function producing a stream as a subscription.
    #[must_use]
    pub fn subscription<F, Fut>(mut self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ProcedureCall) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<ProcedureStream, ProcedureError>> + Send + 'static,
    {
        let service = service_fn(move |call: ProcedureCall| {
            let fut = handler(call);
            async move { fut.await.map(ProcedureOutput::Stream) }
        });
        self.register(path, OperationKind::Subscription, service);
        self
    }

    /// The kind registered on `path`.
    #[must_use]
    pub fn kind_of(&self, path: &str) -> Option<OperationKind> {
        self.procedures.get(path).map(|p| p.kind)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

fn value_service<F, Fut>(handler: F) -> BoxedProcedure
where
    F: Fn(ProcedureCall) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ProcedureError>> + Send + 'static,
{
    BoxCloneSyncService::new(service_fn(move |call: ProcedureCall| {
        let fut = handler(call);
        async move { fut.await.map(ProcedureOutput::Value) }
    }))
}

impl Service<ProcedureCall> for ProcedureRouter {
    type Response = ProcedureOutput;
    type Error = ProcedureError;
    type Future = CallFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Each call drives its own clone of the target procedure to readiness.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, call: ProcedureCall) -> Self::Future {
        let Some(procedure) = self.procedures.get(&call.path) else {
            let path = call.path;
            return Box::pin(async move { Err(ProcedureError::NotFound { path }) });
        };
        if procedure.kind != call.kind {
            let err = ProcedureError::KindMismatch {
                path: call.path,
                expected: procedure.kind,
                actual: call.kind,
            };
            return Box::pin(async move { Err(err) });
        }
        Box::pin(procedure.service.clone().oneshot(call))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
