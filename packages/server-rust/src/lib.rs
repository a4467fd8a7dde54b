//! `Skein` Server: procedure router, tower pipeline, duplex WebSocket and HTTP batch endpoints.

pub mod network;
pub mod service;

pub use network::{NetworkConfig, NetworkModule};
pub use service::{
    CallContext, ContextFactory, ContextRequest, ProcedureCall, ProcedureError, ProcedureOutput,
    ProcedureRouter, ProcedureStream, ServerConfig,
};
