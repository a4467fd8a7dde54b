//! Axum handlers and the state they share.

pub mod health;
pub mod http_batch;
pub mod websocket;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use http_batch::http_batch_handler;
pub use websocket::ws_upgrade_handler;

use std::sync::Arc;
use std::time::Instant;

use super::{ConnectionRegistry, NetworkConfig, ShutdownController};
use crate::service::{ContextFactory, ProcedurePipeline, ServerConfig};

/// Everything a handler reaches through `State`. Cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    /// Health state and the in-flight count the drain waits on.
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NetworkConfig>,
    pub server: Arc<ServerConfig>,
    pub pipeline: ProcedurePipeline,
    /// Runs once per duplex connection and once per HTTP request.
    pub contexts: Arc<dyn ContextFactory>,
    pub start_time: Instant,
}
