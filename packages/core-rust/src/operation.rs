//! The logical call that flows through a link chain.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::fingerprint::Fingerprint;

/// Identifier chosen by the caller; unique per in-flight operation on one connection.
pub type OperationId = u64;

/// Procedure kind. Serializes lowercase to match the wire `method` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single logical call: id, kind, path, input and caller context.
///
/// Immutable once built; the `with_*` methods consume and return a new value.
/// The context map is opaque to the pipeline and only read by links that
/// agree on a key.
#[derive(Debug, Clone)]
pub struct Operation {
    id: OperationId,
    kind: OperationKind,
    path: String,
    input: Value,
    context: Map<String, Value>,
    signal: Option<CancellationToken>,
}

impl Operation {
    #[must_use]
    pub fn new(id: OperationId, kind: OperationKind, path: impl Into<String>, input: Value) -> Self {
        Self {
            id,
            kind,
            path: path.into(),
            input,
            context: Map::new(),
            signal: None,
        }
    }

    #[must_use]
    pub fn query(id: OperationId, path: impl Into<String>, input: Value) -> Self {
        Self::new(id, OperationKind::Query, path, input)
    }

    #[must_use]
    pub fn mutation(id: OperationId, path: impl Into<String>, input: Value) -> Self {
        Self::new(id, OperationKind::Mutation, path, input)
    }

    #[must_use]
    pub fn subscription(id: OperationId, path: impl Into<String>, input: Value) -> Self {
        Self::new(id, OperationKind::Subscription, path, input)
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Attaches an abort signal. Cancelling it aborts this operation only.
    #[must_use]
    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Same call under a different id.
    #[must_use]
    pub fn with_id(mut self, id: OperationId) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn id(&self) -> OperationId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn input(&self) -> &Value {
        &self.input
    }

    #[must_use]
    pub fn context(&self) -> &Map<String, Value> {
        &self.context
    }

    #[must_use]
    pub fn signal(&self) -> Option<&CancellationToken> {
        self.signal.as_ref()
    }

    /// Deterministic key over kind, path and input.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self.kind, &self.path, &self.input)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&OperationKind::Subscription).unwrap(),
            "\"subscription\""
        );
        let kind: OperationKind = serde_json::from_str("\"mutation\"").unwrap();
        assert_eq!(kind, OperationKind::Mutation);
    }

    #[test]
    fn builders_keep_fields() {
        let token = CancellationToken::new();
        let op = Operation::query(7, "user.get", json!({"id": 1}))
            .with_context("auth", json!("token"))
            .with_signal(token.clone());

        assert_eq!(op.id(), 7);
        assert_eq!(op.kind(), OperationKind::Query);
        assert_eq!(op.path(), "user.get");
        assert_eq!(op.input(), &json!({"id": 1}));
        assert_eq!(op.context().get("auth"), Some(&json!("token")));
        token.cancel();
        assert!(op.signal().is_some_and(CancellationToken::is_cancelled));
    }

    #[test]
    fn fingerprint_ignores_id_and_context() {
        let a = Operation::query(1, "p", json!({"a": 1, "b": 2}));
        let b = Operation::query(2, "p", json!({"b": 2, "a": 1})).with_context("x", json!(1));
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}
