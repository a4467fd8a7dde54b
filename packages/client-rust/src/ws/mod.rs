//! Duplex transport: one persistent socket multiplexing queries, mutations
//! and subscriptions by request id.

mod config;
mod connection;
mod link;
mod transport;

pub use config::{exponential_backoff, LazyConfig, WsClientConfig};
pub use connection::{ConnectionState, WsConnection};
pub use link::WsLink;
pub use transport::{CloseInfo, Connector, Socket, SocketEvent, TungsteniteConnector};

#[cfg(test)]
pub(crate) use transport::memory;
