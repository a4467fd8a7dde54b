//! Network module with deferred startup lifecycle.
//!
//! `new()` creates resources, `start()` binds the TCP listener, and `serve()`
//! accepts connections until shutdown. The split lets callers learn the bound
//! port (port 0 in tests) before serving.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{any, get};
use axum::Router;
use skein_core::messages::ServerMessage;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::connection::ConnectionRegistry;
use super::handlers::{
    health_handler, http_batch_handler, liveness_handler, readiness_handler, ws_upgrade_handler,
    AppState,
};
use super::middleware::with_http_layers;
use super::shutdown::ShutdownController;
use crate::service::{
    build_procedure_pipeline, ContextFactory, EmptyContext, ProcedureRouter, ServerConfig,
};

/// Manages the full HTTP/WebSocket server lifecycle.
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    state: AppState,
}

impl NetworkModule {
    /// Creates a new network module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig, server: ServerConfig, router: ProcedureRouter) -> Self {
        let state = AppState {
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown: Arc::new(ShutdownController::new()),
            config: Arc::new(config.clone()),
            pipeline: build_procedure_pipeline(router, &server),
            server: Arc::new(server),
            contexts: Arc::new(EmptyContext),
            start_time: Instant::now(),
        };
        Self {
            config,
            listener: None,
            state,
        }
    }

    /// Replaces the context factory run once per connection.
    #[must_use]
    pub fn with_context_factory(mut self, factory: impl ContextFactory) -> Self {
        self.state.contexts = Arc::new(factory);
        self
    }

    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.state.registry)
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.state.shutdown)
    }

    /// Assembles the axum router with all routes and middleware.
    ///
    /// Routes:
    /// - `GET /health` -- detailed health JSON
    /// - `GET /health/live` -- liveness probe
    /// - `GET /health/ready` -- readiness probe
    /// - `GET /ws` -- duplex WebSocket upgrade
    /// - `GET|POST /rpc/{paths}` -- HTTP batch endpoint
    pub fn build_router(&self) -> Router {
        let router = Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/ws", get(ws_upgrade_handler))
            .route("/rpc/{paths}", any(http_batch_handler));
        with_http_layers(router, &self.config).with_state(self.state.clone())
    }

    /// Binds the TCP listener, returning the actual port.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let listener = TcpListener::bind(self.config.bind_address()).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves connections until `shutdown` resolves, then drains.
    ///
    /// On shutdown:
    /// 1. Health state transitions to Draining
    /// 2. Every duplex connection gets the reconnect notification, then a close frame
    /// 3. Waits up to `drain_timeout` for in-flight calls
    /// 4. Health state transitions to Stopped
    ///
    /// # Errors
    ///
    /// Returns an error if the server encounters a fatal I/O error.
    ///
    /// # Panics
    ///
    /// Panics if `start()` was not called before `serve()`.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let router = self.build_router();
        let listener = self
            .listener
            .expect("start() must be called before serve()");
        let registry = Arc::clone(&self.state.registry);
        let shutdown_ctrl = Arc::clone(&self.state.shutdown);

        shutdown_ctrl.set_ready();
        info!(name = %self.state.server.name, "serving HTTP and duplex connections");

        let signal = {
            let registry = Arc::clone(&registry);
            let shutdown_ctrl = Arc::clone(&shutdown_ctrl);
            let send_timeout = self.config.connection.send_timeout;
            async move {
                shutdown.await;
                shutdown_ctrl.trigger_shutdown();
                notify_reconnect(&registry, send_timeout);
            }
        };
        axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await?;

        if shutdown_ctrl.wait_for_drain(self.config.drain_timeout).await {
            info!("All in-flight calls drained");
        } else {
            warn!("Drain timeout expired with in-flight calls remaining");
        }
        Ok(())
    }
}

/// Tells every duplex client to reconnect, then closes its connection.
///
/// A client too slow to take the notice within `send_timeout` is
/// disconnected without it.
fn notify_reconnect(registry: &ConnectionRegistry, send_timeout: Duration) {
    let notice = match serde_json::to_string(&ServerMessage::reconnect()) {
        Ok(text) => text,
        Err(err) => {
            warn!(error = %err, "failed to encode reconnect notification");
            return;
        }
    };
    let closed = registry.close_all(&notice, "server shutting down", send_timeout);
    if closed > 0 {
        info!(connections = closed, "asked duplex clients to reconnect");
    }
}
