//! Per-connection call context and the factory that creates it.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde_json::{Map, Value};
use skein_core::RpcError;

/// Transport a call arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Http,
    WebSocket,
}

impl TransportKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::WebSocket => "websocket",
        }
    }
}

/// What a [`ContextFactory`] sees of the incoming request.
#[derive(Debug, Clone, Default)]
pub struct ContextRequest {
    pub transport: TransportKind,
    pub connection_id: Option<u64>,
    pub headers: HeaderMap,
    pub query: HashMap<String, String>,
}

/// Context shared by every call on one connection (or one HTTP request).
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub transport: TransportKind,
    pub connection_id: Option<u64>,
    pub values: Map<String, Value>,
}

impl CallContext {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

/// Creates the context for a connection before its first message is processed.
#[async_trait]
pub trait ContextFactory: Send + Sync + 'static {
    /// # Errors
    ///
    /// A failure is reported to every call waiting on this context.
    async fn create(&self, request: &ContextRequest) -> Result<Map<String, Value>, RpcError>;
}

/// Factory producing an empty context.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyContext;

#[async_trait]
impl ContextFactory for EmptyContext {
    async fn create(&self, _request: &ContextRequest) -> Result<Map<String, Value>, RpcError> {
        Ok(Map::new())
    }
}

#[async_trait]
impl<F> ContextFactory for F
where
    F: Fn(&ContextRequest) -> Result<Map<String, Value>, RpcError> + Send + Sync + 'static,
{
    async fn create(&self, request: &ContextRequest) -> Result<Map<String, Value>, RpcError> {
        self(request)
    }
}

/// Runs `factory` and wraps its values into a [`CallContext`].
///
/// # Errors
///
/// Propagates the factory's error.
pub async fn create_context(
    factory: &dyn ContextFactory,
    request: &ContextRequest,
) -> Result<CallContext, RpcError> {
    let values = factory.create(request).await?;
    Ok(CallContext {
        transport: request.transport,
        connection_id: request.connection_id,
        values,
    })
}
