//! Tower layers wrapped around the [`ProcedureRouter`](crate::service::ProcedureRouter).
//!
//! Calls pass through them outermost first: [`LoadShedLayer`] refuses work
//! past the concurrency limit, [`TimeoutLayer`] bounds each call by its own
//! deadline, and [`MetricsLayer`] records the outcome.

pub mod load_shed;
pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_procedure_pipeline, ProcedurePipeline};
pub use timeout::TimeoutLayer;
