//! Networking: configuration, connection registry, duplex sessions, HTTP handlers, and shutdown.

pub mod config;
pub mod connection;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod session;
pub mod shutdown;

pub use config::*;
pub use connection::*;
pub use handlers::AppState;
pub use module::NetworkModule;
pub use session::{Session, SessionSettings};
pub use shutdown::*;
