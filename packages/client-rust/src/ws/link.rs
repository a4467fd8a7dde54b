use skein_core::Operation;

use super::connection::WsConnection;
use crate::link::{Next, OperationLink, OperationObservable};

/// Terminating link over a [`WsConnection`]. Handles every operation kind.
#[derive(Clone)]
pub struct WsLink {
    connection: WsConnection,
}

impl WsLink {
    #[must_use]
    pub fn new(connection: WsConnection) -> Self {
        Self { connection }
    }

    #[must_use]
    pub fn connection(&self) -> &WsConnection {
        &self.connection
    }
}

impl OperationLink for WsLink {
    fn call(&self, op: Operation, _next: Next) -> OperationObservable {
        self.connection.execute(op)
    }
}
