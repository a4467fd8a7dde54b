//! Procedure routing and execution framework.
//!
//! 1. **Context** (`context`): per-connection context created by a `ContextFactory`
//! 2. **Middleware** (`middleware`): Tower layers (load-shedding, timeout, metrics)
//! 3. **Routing** (`router`): Dispatch to procedures by path and kind

pub mod config;
pub mod context;
pub mod middleware;
pub mod procedure;
pub mod router;

pub use config::ServerConfig;
pub use context::{
    create_context, CallContext, ContextFactory, ContextRequest, EmptyContext, TransportKind,
};
pub use middleware::{build_procedure_pipeline, ProcedurePipeline};
pub use procedure::{CallFuture, ProcedureCall, ProcedureError, ProcedureOutput, ProcedureStream};
pub use router::{BoxedProcedure, ProcedureRouter};
