//! Listener and per-connection settings.

use std::time::Duration;

/// Where to listen and how to treat connections once accepted.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Interface to bind, e.g. `0.0.0.0` or `127.0.0.1`.
    pub host: String,
    /// 0 lets the OS pick; [`NetworkModule::start`](super::NetworkModule::start) reports the result.
    pub port: u16,
    /// Limits applied to each duplex connection.
    pub connection: ConnectionConfig,
    /// Origins allowed by CORS. `"*"` allows any.
    pub cors_origins: Vec<String>,
    /// Whole-request deadline for HTTP batch calls, answered with 408.
    pub request_timeout: Duration,
    /// Time given to in-flight calls after duplex clients were told to reconnect.
    pub drain_timeout: Duration,
}

impl NetworkConfig {
    /// `host:port` as handed to the listener.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            connection: ConnectionConfig::default(),
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Backpressure limits for one duplex connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Frames queued for the socket writer before senders wait.
    pub outbound_channel_capacity: usize,
    /// How long a sender may wait on a full queue. A client that stays this
    /// far behind is disconnected.
    pub send_timeout: Duration,
    /// Largest inbound message accepted, in bytes.
    pub max_message_size: usize,
    /// Bytes buffered by the socket before a write is flushed.
    pub ws_write_buffer_size: usize,
    /// Hard cap on buffered outgoing bytes; writes past it fail.
    pub ws_max_write_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 256,
            send_timeout: Duration::from_secs(5),
            max_message_size: 1 << 20,
            ws_write_buffer_size: 128 * 1024,
            ws_max_write_buffer_size: 512 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_address_joins_host_and_port() {
        let config = NetworkConfig {
            host: "127.0.0.1".to_string(),
            port: 4100,
            ..NetworkConfig::default()
        };
        assert_eq!(config.bind_address(), "127.0.0.1:4100");
        assert_eq!(NetworkConfig::default().bind_address(), "0.0.0.0:0");
    }

    #[test]
    fn write_buffer_fits_under_its_ceiling() {
        let config = ConnectionConfig::default();
        assert!(config.ws_write_buffer_size < config.ws_max_write_buffer_size);
        assert!(config.outbound_channel_capacity > 0);
        assert_eq!(config.send_timeout, Duration::from_secs(5));
    }
}
