//! Client-side error type.

use skein_core::{ErrorCode, Incomplete, RpcError};

/// Everything an operation can fail with on the client.
///
/// Clonable because a single upstream failure may be fanned out to every
/// rider of a deduplicated call or every member of a batch.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    /// The transport could not send or receive.
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection went away while the call was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// The caller cancelled the operation.
    #[error("operation aborted")]
    Aborted,

    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// A response could not be decoded.
    #[error("malformed response: {0}")]
    Parse(String),

    /// The peer broke the protocol (wrong item count, unknown envelope).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The server answered with an error.
    #[error(transparent)]
    Remote(#[from] RpcError),

    /// The link chain ran out of links before any of them answered.
    #[error("link chain ended without a terminating link")]
    NoTerminatingLink,

    #[error("invalid client configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// The wire error code this failure corresponds to.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Remote(err) => err.code,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Aborted => ErrorCode::ClientClosedRequest,
            Self::Parse(_) => ErrorCode::ParseError,
            Self::Transport(_)
            | Self::ConnectionClosed
            | Self::Protocol(_)
            | Self::NoTerminatingLink
            | Self::Config(_) => ErrorCode::InternalServerError,
        }
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// The remote error, if the server produced this failure.
    #[must_use]
    pub fn remote(&self) -> Option<&RpcError> {
        match self {
            Self::Remote(err) => Some(err),
            _ => None,
        }
    }
}

impl From<Incomplete> for ClientError {
    fn from(reason: Incomplete) -> Self {
        match reason {
            Incomplete::Empty => Self::Protocol("operation completed without a result".into()),
            Incomplete::Cancelled => Self::Aborted,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Parse(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}
