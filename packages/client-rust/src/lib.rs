//! `Skein` Client: link chain, request batching, and transports.
//!
//! Build a [`Chain`] of links ending in a transport ([`HttpBatchLink`] or
//! [`WsLink`]), wrap it in a [`SkeinClient`], and issue operations:
//!
//! ```no_run
//! # async fn demo() -> Result<(), skein_client::ClientError> {
//! use skein_client::{shared, Chain, DedupeLink, HttpBatchConfig, HttpBatchLink, SkeinClient};
//!
//! let chain = Chain::new(vec![
//!     shared(DedupeLink::new()),
//!     shared(HttpBatchLink::new(HttpBatchConfig::new("http://127.0.0.1:3000/rpc"))),
//! ])?;
//! let client = SkeinClient::new(chain);
//! let greeting = client.query("greeting", serde_json::json!({"name": "ada"})).await?;
//! # let _ = greeting;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod http;
pub mod link;
pub mod loader;
pub mod polling;
pub mod ws;

pub use client::{ProcedureRegistry, SkeinClient};
pub use error::ClientError;
pub use http::{HttpBatchConfig, HttpBatchLink};
pub use link::{
    shared, Chain, DedupeCache, DedupeLink, LogDirection, LoggerLink, Next, OperationLink,
    OperationObservable, OperationResult, RetryConfig, RetryLink, SharedLink, SplitLink,
};
pub use loader::{BatchFetch, DataLoader, Load, LoadCanceller};
pub use polling::PollingConfig;
pub use ws::{ConnectionState, WsClientConfig, WsConnection, WsLink};
