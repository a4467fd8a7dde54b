//! Wire-compatible JSON message schemas.
//!
//! - [`duplex`]: request/response/notification messages on a persistent connection
//! - [`batch`]: HTTP batch input map and per-index response items

pub mod batch;
pub mod duplex;

pub use batch::{batch_status, input_at, input_map, BatchResponseItem, BatchResult, PATH_SEPARATOR};
pub use duplex::{
    ClientMessage, JsonRpcVersion, Method, RequestId, RequestParams, ResultEnvelope,
    ServerMessage, ServerNotification,
};
