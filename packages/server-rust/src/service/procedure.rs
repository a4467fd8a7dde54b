//! Procedure call types flowing through the server pipeline.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde_json::Value;
use skein_core::{ErrorCode, OperationKind, RpcError};

use super::context::CallContext;

/// Stream of items produced by a subscription procedure.
pub type ProcedureStream = BoxStream<'static, Result<Value, ProcedureError>>;

/// Future returned by every service in the procedure pipeline.
pub type CallFuture = BoxFuture<'static, Result<ProcedureOutput, ProcedureError>>;

/// One invocation of a procedure, as seen by the middleware stack.
#[derive(Debug, Clone)]
pub struct ProcedureCall {
    /// Request id on a duplex connection, or the member index of an HTTP batch.
    pub id: u64,
    pub kind: OperationKind,
    pub path: String,
    pub input: Value,
    pub ctx: Arc<CallContext>,
    /// Deadline for producing the output, 0 for none. Streams are not bounded by it.
    pub timeout_ms: u64,
}

impl ProcedureCall {
    #[must_use]
    pub fn new(
        id: u64,
        kind: OperationKind,
        path: impl Into<String>,
        input: Value,
        ctx: Arc<CallContext>,
        timeout_ms: u64,
    ) -> Self {
        Self {
            id,
            kind,
            path: path.into(),
            input,
            ctx,
            timeout_ms,
        }
    }
}

/// Successful output of a procedure.
pub enum ProcedureOutput {
    /// Single value answering a query or mutation.
    Value(Value),
    /// Item stream answering a subscription.
    Stream(ProcedureStream),
}

impl ProcedureOutput {
    #[must_use]
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Stream(_) => None,
        }
    }
}

impl fmt::Debug for ProcedureOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Errors returned by procedures and the middleware around them.
#[derive(Debug, thiserror::Error)]
pub enum ProcedureError {
    #[error("no procedure found on path \"{path}\"")]
    NotFound { path: String },
    #[error("procedure \"{path}\" is a {expected}, not a {actual}")]
    KindMismatch {
        path: String,
        expected: OperationKind,
        actual: OperationKind,
    },
    #[error("procedure timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("server overloaded, try again later")]
    Overloaded,
    #[error(transparent)]
    Application(#[from] RpcError),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ProcedureError {
    /// Shorthand for an application error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Application(RpcError::new(code, message))
    }

    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::KindMismatch { .. } => ErrorCode::MethodNotSupported,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Overloaded => ErrorCode::TooManyRequests,
            Self::Application(err) => err.code,
            Self::Internal(_) => ErrorCode::InternalServerError,
        }
    }

    /// The error as reported to the caller of `path`.
    ///
    /// Internal errors are logged here and reported without their cause chain.
    #[must_use]
    pub fn to_rpc_error(&self, path: &str) -> RpcError {
        let err = match self {
            Self::Application(err) => err.clone(),
            Self::Internal(cause) => {
                tracing::error!(path, error = ?cause, "procedure failed");
                RpcError::new(ErrorCode::InternalServerError, "internal server error")
            }
            other => RpcError::new(other.code(), other.to_string()),
        };
        if err.path.is_some() {
            err
        } else {
            err.with_path(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_variants() {
        let not_found = ProcedureError::NotFound { path: "a".into() };
        assert_eq!(not_found.code(), ErrorCode::NotFound);
        let mismatch = ProcedureError::KindMismatch {
            path: "a".into(),
            expected: OperationKind::Query,
            actual: OperationKind::Mutation,
        };
        assert_eq!(mismatch.code(), ErrorCode::MethodNotSupported);
        assert_eq!(ProcedureError::Timeout { timeout_ms: 5 }.code(), ErrorCode::Timeout);
        assert_eq!(ProcedureError::Overloaded.code(), ErrorCode::TooManyRequests);
        assert_eq!(
            ProcedureError::new(ErrorCode::Conflict, "taken").code(),
            ErrorCode::Conflict
        );
    }

    #[test]
    fn application_errors_keep_their_shape() {
        let err = ProcedureError::Application(
            RpcError::new(ErrorCode::BadRequest, "name required").with_detail(serde_json::json!({"field": "name"})),
        );
        let rpc = err.to_rpc_error("users.create");
        assert_eq!(rpc.code, ErrorCode::BadRequest);
        assert_eq!(rpc.message, "name required");
        assert_eq!(rpc.path.as_deref(), Some("users.create"));
        assert!(rpc.detail.is_some());
    }

    #[test]
    fn internal_errors_hide_the_cause() {
        let err = ProcedureError::Internal(anyhow::anyhow!("db password rejected"));
        let rpc = err.to_rpc_error("users.list");
        assert_eq!(rpc.code, ErrorCode::InternalServerError);
        assert!(!rpc.message.contains("password"));
        assert!(rpc.cause.is_none());
    }

    #[test]
    fn not_found_message_names_the_path() {
        let rpc = ProcedureError::NotFound { path: "nope".into() }.to_rpc_error("nope");
        assert!(rpc.message.contains("\"nope\""));
        assert_eq!(rpc.code.http_status(), 404);
    }

    #[test]
    fn output_debug_hides_stream() {
        let out = ProcedureOutput::Stream(Box::pin(futures_util::stream::empty()));
        assert_eq!(format!("{out:?}"), "Stream(..)");
        assert!(out.into_value().is_none());
    }
}
