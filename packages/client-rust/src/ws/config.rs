use std::fmt;
use std::sync::Arc;

use super::transport::CloseInfo;

type DelayFn = dyn Fn(u32) -> u64 + Send + Sync;
type OpenHook = dyn Fn() + Send + Sync;
type CloseHook = dyn Fn(&CloseInfo) + Send + Sync;

/// Default reconnect backoff: `min(1000 * 2^attempt, 30000)` milliseconds.
#[must_use]
pub fn exponential_backoff(attempt: u32) -> u64 {
    1000u64.saturating_mul(2u64.saturating_pow(attempt)).min(30_000)
}

/// Lazy connections open on first use and close once idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LazyConfig {
    /// Idle time with no pending calls or subscriptions before closing.
    pub close_ms: u64,
}

/// Duplex client settings.
#[derive(Clone)]
pub struct WsClientConfig {
    pub url: String,
    /// Give up on an opening handshake after this long and back off.
    pub connect_timeout_ms: u64,
    /// Delay before reconnect attempt `n`, counted from 0 after each
    /// successful open.
    pub retry_delay_ms: Arc<DelayFn>,
    /// Fail queries and mutations with no answer after this long.
    pub request_timeout_ms: Option<u64>,
    pub lazy: Option<LazyConfig>,
    pub on_open: Option<Arc<OpenHook>>,
    pub on_close: Option<Arc<CloseHook>>,
}

impl WsClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout_ms: 10_000,
            retry_delay_ms: Arc::new(exponential_backoff),
            request_timeout_ms: None,
            lazy: None,
            on_open: None,
            on_close: None,
        }
    }

    #[must_use]
    pub fn with_retry_delay(mut self, delay: impl Fn(u32) -> u64 + Send + Sync + 'static) -> Self {
        self.retry_delay_ms = Arc::new(delay);
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = Some(timeout_ms);
        self
    }

    #[must_use]
    pub fn lazy(mut self, close_ms: u64) -> Self {
        self.lazy = Some(LazyConfig { close_ms });
        self
    }

    #[must_use]
    pub fn on_open(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_close(mut self, hook: impl Fn(&CloseInfo) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for WsClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsClientConfig")
            .field("url", &self.url)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("lazy", &self.lazy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(exponential_backoff(0), 1000);
        assert_eq!(exponential_backoff(1), 2000);
        assert_eq!(exponential_backoff(4), 16_000);
        assert_eq!(exponential_backoff(5), 30_000);
        assert_eq!(exponential_backoff(63), 30_000);
        assert_eq!(exponential_backoff(80), 30_000);
    }

    #[test]
    fn builder_sets_options() {
        let config = WsClientConfig::new("ws://localhost:1")
            .with_request_timeout(50)
            .with_connect_timeout(75)
            .lazy(200);
        assert_eq!(config.request_timeout_ms, Some(50));
        assert_eq!(config.connect_timeout_ms, 75);
        assert_eq!(WsClientConfig::new("ws://x").connect_timeout_ms, 10_000);
        assert_eq!(config.lazy, Some(LazyConfig { close_ms: 200 }));
        assert!(config.on_open.is_none());
    }
}
