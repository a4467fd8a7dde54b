//! Typed-path client facade over a link chain.

use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use skein_core::{Observable, ObservableFuture, Operation, OperationId, OperationKind};

use crate::error::ClientError;
use crate::link::{Chain, OperationObservable, OperationResult};
use crate::polling::{self, PollingConfig};

/// Declares which kind each procedure path is, so callers can invoke by
/// path alone.
#[derive(Debug, Clone, Default)]
pub struct ProcedureRegistry {
    kinds: HashMap<String, OperationKind>,
}

impl ProcedureRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn query(self, path: impl Into<String>) -> Self {
        self.with(path, OperationKind::Query)
    }

    #[must_use]
    pub fn mutation(self, path: impl Into<String>) -> Self {
        self.with(path, OperationKind::Mutation)
    }

    #[must_use]
    pub fn subscription(self, path: impl Into<String>) -> Self {
        self.with(path, OperationKind::Subscription)
    }

    #[must_use]
    pub fn with(mut self, path: impl Into<String>, kind: OperationKind) -> Self {
        self.kinds.insert(path.into(), kind);
        self
    }

    #[must_use]
    pub fn kind_of(&self, path: &str) -> Option<OperationKind> {
        self.kinds.get(path).copied()
    }
}

/// Entry point for issuing operations.
///
/// Every operation gets a fresh id from a counter shared by all clones of
/// the client.
#[derive(Clone)]
pub struct SkeinClient {
    chain: Chain,
    procedures: Arc<ProcedureRegistry>,
    ids: Arc<AtomicU64>,
}

impl SkeinClient {
    #[must_use]
    pub fn new(chain: Chain) -> Self {
        Self {
            chain,
            procedures: Arc::new(ProcedureRegistry::new()),
            ids: Arc::new(AtomicU64::new(1)),
        }
    }

    #[must_use]
    pub fn with_procedures(mut self, procedures: ProcedureRegistry) -> Self {
        self.procedures = Arc::new(procedures);
        self
    }

    pub fn next_id(&self) -> OperationId {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Builds an operation with a fresh id, for callers that need to attach
    /// context or a cancellation signal before executing it.
    pub fn operation(&self, kind: OperationKind, path: impl Into<String>, input: Value) -> Operation {
        Operation::new(self.next_id(), kind, path, input)
    }

    /// Runs `op` through the chain. Lazy: nothing happens until subscribed.
    #[must_use]
    pub fn execute(&self, op: Operation) -> OperationObservable {
        self.chain.execute(op)
    }

    /// Starts `op` and resolves with its data.
    pub fn send(&self, op: Operation) -> ObservableFuture<Value, ClientError> {
        self.execute(op)
            .filter_map(OperationResult::into_data)
            .into_future()
    }

    pub fn query(&self, path: impl Into<String>, input: Value) -> ObservableFuture<Value, ClientError> {
        self.send(self.operation(OperationKind::Query, path, input))
    }

    pub fn mutation(
        &self,
        path: impl Into<String>,
        input: Value,
    ) -> ObservableFuture<Value, ClientError> {
        self.send(self.operation(OperationKind::Mutation, path, input))
    }

    /// Subscription stream, including `Started`/`Stopped` markers.
    #[must_use]
    pub fn subscription(&self, path: impl Into<String>, input: Value) -> OperationObservable {
        self.execute(self.operation(OperationKind::Subscription, path, input))
    }

    /// Calls a registered query or mutation by path.
    ///
    /// # Errors
    ///
    /// [`ClientError::Config`] if the path is not registered or is a
    /// subscription.
    pub fn call(
        &self,
        path: &str,
        input: Value,
    ) -> Result<ObservableFuture<Value, ClientError>, ClientError> {
        match self.procedures.kind_of(path) {
            Some(kind @ (OperationKind::Query | OperationKind::Mutation)) => {
                Ok(self.send(self.operation(kind, path, input)))
            }
            Some(OperationKind::Subscription) => Err(ClientError::Config(format!(
                "{path} is a subscription; use `subscription`"
            ))),
            None => Err(ClientError::Config(format!("unknown procedure {path}"))),
        }
    }

    /// Polls a cursor-paginated query as a stream.
    #[must_use]
    pub fn poll(
        &self,
        path: impl Into<String>,
        input: Value,
        config: PollingConfig,
    ) -> Observable<Value, ClientError> {
        polling::poll(self.chain.clone(), Arc::clone(&self.ids), path, input, config)
    }
}
