//! Duplex connection bookkeeping.
//!
//! Each socket gets a [`ConnectionHandle`] whose bounded channel feeds the
//! socket writer. Sessions push into it; the registry reaches every open
//! connection for drain notices and health counts.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::config::ConnectionConfig;

/// Registry-assigned connection number, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A frame queued for the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Text(String),
    /// Ends the writer after a close frame carrying the reason.
    Close(Option<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("client did not drain its queue within the send timeout")]
    Timeout,
    #[error("connection closed")]
    Disconnected,
}

#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub tx: mpsc::Sender<OutboundMessage>,
    /// Cancelled to end the session driving this connection.
    pub closed: CancellationToken,
    messages_received: AtomicU64,
}

impl ConnectionHandle {
    /// Queues `msg` if there is room right now.
    #[must_use]
    pub fn try_send(&self, msg: OutboundMessage) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// Queues `msg`, waiting up to `timeout` for room.
    ///
    /// # Errors
    ///
    /// [`SendError::Timeout`] when the queue stayed full, and
    /// [`SendError::Disconnected`] when the writer is gone.
    pub async fn send_timeout(&self, msg: OutboundMessage, timeout: Duration) -> Result<(), SendError> {
        tokio::time::timeout(timeout, self.tx.send(msg))
            .await
            .map_err(|_elapsed| SendError::Timeout)?
            .map_err(|_closed| SendError::Disconnected)
    }

    /// Counts an inbound message.
    pub fn touch(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Queues `farewell` (when still pending) and a close frame, waiting up
    /// to `timeout` for room. A connection that cannot take them is closed
    /// without them.
    async fn say_goodbye(&self, farewell: Option<String>, reason: String, timeout: Duration) {
        let delivered = async {
            if let Some(text) = farewell {
                self.send_timeout(OutboundMessage::Text(text), timeout).await?;
            }
            self.send_timeout(OutboundMessage::Close(Some(reason)), timeout).await
        }
        .await;
        if let Err(err) = delivered {
            warn!(connection_id = %self.id, error = %err, "farewell not delivered, closing connection");
            self.closed.cancel();
        }
    }
}

/// Totals reported by the health endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub connections: usize,
    pub messages_received: u64,
}

// ---------------------------------------------------------------------------
// ConnectionRegistry
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Adds a connection. The receiver belongs to the socket writer.
    pub fn register(
        &self,
        config: &ConnectionConfig,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity);
        let handle = Arc::new(ConnectionHandle {
            id,
            tx,
            closed: CancellationToken::new(),
            messages_received: AtomicU64::new(0),
        });
        self.connections.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.connections.iter().fold(RegistryStats::default(), |mut stats, entry| {
            stats.connections += 1;
            stats.messages_received += entry.value().messages_received();
            stats
        })
    }

    /// Unregisters every connection, queueing `farewell` and then a close
    /// frame with `reason` on each. Returns how many were closed.
    ///
    /// Connections with room get both frames immediately. A full queue gets
    /// `timeout` to make room; if it doesn't, its session is cancelled so the
    /// socket closes anyway. Must be called within a Tokio runtime.
    pub fn close_all(&self, farewell: &str, reason: &str, timeout: Duration) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();
        let mut closed = 0;
        for handle in ids.into_iter().filter_map(|id| self.remove(id)) {
            closed += 1;
            let farewell_queued = handle.try_send(OutboundMessage::Text(farewell.to_string()));
            if farewell_queued && handle.try_send(OutboundMessage::Close(Some(reason.to_string()))) {
                continue;
            }
            let pending = (!farewell_queued).then(|| farewell.to_string());
            let reason = reason.to_string();
            tokio::spawn(async move { handle.say_goodbye(pending, reason, timeout).await });
        }
        closed
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
