//! Pull-based subscriptions over a request/response transport.
//!
//! The procedure is queried repeatedly. Each answer has the shape
//! `{ "data": ..., "nextInput": ... }`: a non-null `data` is emitted, and a
//! non-null `nextInput` becomes the input of the following poll. A null
//! `nextInput` keeps the previous cursor. A poll that outlives
//! `request_timeout_ms` is abandoned and replayed with the same cursor.

use std::future::IntoFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use skein_core::{Observable, Operation, Teardown};

use crate::error::ClientError;
use crate::link::{Chain, OperationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingConfig {
    /// Pause between the end of one poll and the start of the next.
    pub backpressure_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            backpressure_ms: 1000,
            request_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    data: Value,
    #[serde(default, rename = "nextInput")]
    next_input: Value,
}

/// Repeatedly queries `path` through `chain`, following the server's cursor.
///
/// Runs on a spawned task; unsubscribing cancels the in-flight poll.
pub fn poll(
    chain: Chain,
    ids: Arc<AtomicU64>,
    path: impl Into<String>,
    input: Value,
    config: PollingConfig,
) -> Observable<Value, ClientError> {
    let path = path.into();
    Observable::new(move |subscriber| {
        let chain = chain.clone();
        let ids = Arc::clone(&ids);
        let path = path.clone();
        let mut cursor = input.clone();

        let task = tokio::spawn(async move {
            loop {
                let op = Operation::query(ids.fetch_add(1, Ordering::Relaxed), path.as_str(), cursor.clone());
                let request = chain
                    .execute(op)
                    .filter_map(OperationResult::into_data)
                    .into_future();
                let timeout = Duration::from_millis(config.request_timeout_ms);

                match tokio::time::timeout(timeout, request).await {
                    Err(_elapsed) => {
                        tracing::debug!(path = %path, "poll timed out, replaying cursor");
                    }
                    Ok(Err(err)) => {
                        subscriber.error(err);
                        return;
                    }
                    Ok(Ok(raw)) => {
                        let page: Page = match serde_json::from_value(raw) {
                            Ok(page) => page,
                            Err(err) => {
                                subscriber.error(ClientError::Parse(err.to_string()));
                                return;
                            }
                        };
                        if !page.data.is_null() {
                            subscriber.next(page.data);
                        }
                        if !page.next_input.is_null() {
                            cursor = page.next_input;
                        }
                    }
                }

                if subscriber.is_closed() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(config.backpressure_ms)).await;
            }
        });

        Teardown::new(move || task.abort())
    })
}
