//! Messages exchanged over a persistent duplex connection.
//!
//! Client → server:
//! - request: `{ "id", "jsonrpc"?, "method": "query"|"mutation"|"subscription", "params": { "path", "input" } }`
//! - stop: `{ "id", "jsonrpc"?, "method": "subscription.stop" }`
//!
//! Server → client:
//! - result: `{ "id", "jsonrpc"?, "result": { "type": "data"|"started"|"stopped", "data"? } }`
//! - error: `{ "id" | null, "jsonrpc"?, "error": { "code", "message", "data" } }`
//! - reconnect notification: `{ "id": null, "method": "reconnect" }`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorShape, RpcError};
use crate::operation::{Operation, OperationKind};

/// Request identifier. `null` on the wire is reserved for connection-level messages.
pub type RequestId = u64;

/// Optional `"jsonrpc": "2.0"` marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JsonRpcVersion {
    #[serde(rename = "2.0")]
    V2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    #[serde(rename = "query")]
    Query,
    #[serde(rename = "mutation")]
    Mutation,
    #[serde(rename = "subscription")]
    Subscription,
    #[serde(rename = "subscription.stop")]
    SubscriptionStop,
}

impl Method {
    /// The operation kind a request method starts, `None` for `subscription.stop`.
    #[must_use]
    pub fn kind(self) -> Option<OperationKind> {
        match self {
            Self::Query => Some(OperationKind::Query),
            Self::Mutation => Some(OperationKind::Mutation),
            Self::Subscription => Some(OperationKind::Subscription),
            Self::SubscriptionStop => None,
        }
    }
}

impl From<OperationKind> for Method {
    fn from(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Query => Self::Query,
            OperationKind::Mutation => Self::Mutation,
            OperationKind::Subscription => Self::Subscription,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestParams {
    pub path: String,
    #[serde(default)]
    pub input: Value,
}

// ---------------------------------------------------------------------------
// Client → server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub jsonrpc: Option<JsonRpcVersion>,
    pub method: Method,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub params: Option<RequestParams>,
}

impl ClientMessage {
    /// The request that starts `op` on the server.
    #[must_use]
    pub fn request(op: &Operation) -> Self {
        Self {
            id: op.id(),
            jsonrpc: Some(JsonRpcVersion::V2),
            method: op.kind().into(),
            params: Some(RequestParams {
                path: op.path().to_string(),
                input: op.input().clone(),
            }),
        }
    }

    #[must_use]
    pub fn stop(id: RequestId) -> Self {
        Self {
            id,
            jsonrpc: Some(JsonRpcVersion::V2),
            method: Method::SubscriptionStop,
            params: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Server → client
// ---------------------------------------------------------------------------

/// Success payload of a server response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResultEnvelope {
    Data { data: Value },
    Started,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerNotification {
    /// The server is draining; reconnect and resume subscriptions.
    Reconnect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Result {
        id: RequestId,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        jsonrpc: Option<JsonRpcVersion>,
        result: ResultEnvelope,
    },
    Error {
        id: Option<RequestId>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        jsonrpc: Option<JsonRpcVersion>,
        error: ErrorShape,
    },
    Notification {
        id: Option<RequestId>,
        method: ServerNotification,
    },
}

impl ServerMessage {
    #[must_use]
    pub fn data(id: RequestId, data: Value) -> Self {
        Self::result(id, ResultEnvelope::Data { data })
    }

    #[must_use]
    pub fn started(id: RequestId) -> Self {
        Self::result(id, ResultEnvelope::Started)
    }

    #[must_use]
    pub fn stopped(id: RequestId) -> Self {
        Self::result(id, ResultEnvelope::Stopped)
    }

    fn result(id: RequestId, result: ResultEnvelope) -> Self {
        Self::Result {
            id,
            jsonrpc: Some(JsonRpcVersion::V2),
            result,
        }
    }

    /// Error scoped to one request, or to the whole connection when `id` is `None`.
    #[must_use]
    pub fn error(id: Option<RequestId>, error: &RpcError) -> Self {
        Self::Error {
            id,
            jsonrpc: Some(JsonRpcVersion::V2),
            error: error.to_shape(),
        }
    }

    #[must_use]
    pub fn reconnect() -> Self {
        Self::Notification {
            id: None,
            method: ServerNotification::Reconnect,
        }
    }

    /// The request this message answers, `None` for connection-level messages.
    #[must_use]
    pub fn id(&self) -> Option<RequestId> {
        match self {
            Self::Result { id, .. } => Some(*id),
            Self::Error { id, .. } | Self::Notification { id, .. } => *id,
        }
    }
}
