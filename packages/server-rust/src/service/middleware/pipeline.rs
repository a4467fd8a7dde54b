//! Pipeline composition: combines all middleware layers into a single service stack.

use tower::util::BoxCloneSyncService;
use tower::ServiceBuilder;

use super::load_shed::LoadShedLayer;
use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use crate::service::config::ServerConfig;
use crate::service::procedure::{ProcedureCall, ProcedureError, ProcedureOutput};
use crate::service::router::ProcedureRouter;

/// The composed pipeline, cloned once per call.
pub type ProcedurePipeline = BoxCloneSyncService<ProcedureCall, ProcedureOutput, ProcedureError>;

/// Build the procedure pipeline by wrapping the `ProcedureRouter` with middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when overloaded (fail fast before doing any work)
/// 2. `TimeoutLayer` -- enforce per-call timeouts
/// 3. `MetricsLayer` -- record timing and outcome (closest to the actual handler)
#[must_use]
pub fn build_procedure_pipeline(router: ProcedureRouter, config: &ServerConfig) -> ProcedurePipeline {
    let service = ServiceBuilder::new()
        .layer(LoadShedLayer::new(config.max_concurrent_operations))
        .layer(TimeoutLayer)
        .layer(MetricsLayer)
        .service(router);
    BoxCloneSyncService::new(service)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
