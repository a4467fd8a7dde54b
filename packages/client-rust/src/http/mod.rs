//! Terminating link that batches queries and mutations over HTTP.
//!
//! Operations of the same kind issued in the same scheduler tick travel in
//! one request: queries as `GET`, mutations as `POST`. Each caller gets the
//! item at its position in the response array. Subscriptions are rejected;
//! route them to a duplex link with a [`SplitLink`](crate::link::SplitLink).

mod fetch;

use std::sync::Arc;

use reqwest::header::HeaderMap;
use skein_core::messages::BatchResponseItem;
use skein_core::{ErrorCode, Observable, Operation, OperationKind, RpcError, Teardown};

use crate::error::ClientError;
use crate::link::{Next, OperationLink, OperationObservable, OperationResult};
use crate::loader::DataLoader;

use fetch::HttpBatchFetcher;

/// HTTP batch transport settings.
#[derive(Debug, Clone)]
pub struct HttpBatchConfig {
    /// Base URL the procedure paths are appended to, e.g. `http://host/rpc`.
    pub url: String,
    /// Longest GET URL a batch may produce before it is split.
    pub max_url_length: usize,
    /// Most operations per request.
    pub max_items: usize,
    /// Sent with every request.
    pub headers: HeaderMap,
    pub request_timeout_ms: Option<u64>,
}

impl HttpBatchConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for HttpBatchConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:3000/rpc".into(),
            max_url_length: 2083,
            max_items: 100,
            headers: HeaderMap::new(),
            request_timeout_ms: None,
        }
    }
}

/// Batching HTTP transport.
///
/// Needs a tokio runtime: requests and cancellation watchers run on spawned
/// tasks.
#[derive(Clone)]
pub struct HttpBatchLink {
    queries: DataLoader<Operation, BatchResponseItem>,
    mutations: DataLoader<Operation, BatchResponseItem>,
}

impl HttpBatchLink {
    #[must_use]
    pub fn new(config: HttpBatchConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client, config: HttpBatchConfig) -> Self {
        let config = Arc::new(config);
        let loader = |kind| {
            DataLoader::new(HttpBatchFetcher {
                client: client.clone(),
                config: Arc::clone(&config),
                kind,
            })
        };
        Self {
            queries: loader(OperationKind::Query),
            mutations: loader(OperationKind::Mutation),
        }
    }
}

impl OperationLink for HttpBatchLink {
    fn call(&self, op: Operation, _next: Next) -> OperationObservable {
        let loader = match op.kind() {
            OperationKind::Query => self.queries.clone(),
            OperationKind::Mutation => self.mutations.clone(),
            OperationKind::Subscription => {
                return Observable::fail(ClientError::Remote(
                    RpcError::new(
                        ErrorCode::MethodNotSupported,
                        "subscriptions are not supported over HTTP batching",
                    )
                    .with_path(op.path()),
                ));
            }
        };

        Observable::new(move |subscriber| {
            let load = loader.load(op.clone());
            let canceller = load.canceller();

            let watcher = op.signal().cloned().map(|signal| {
                let canceller = canceller.clone();
                tokio::spawn(async move {
                    signal.cancelled().await;
                    canceller.cancel();
                })
            });

            let task = tokio::spawn(async move {
                match load.await {
                    Ok(item) => match item.into_result() {
                        Ok(data) => {
                            subscriber.next(OperationResult::Data(data));
                            subscriber.complete();
                        }
                        Err(err) => subscriber.error(ClientError::Remote(err)),
                    },
                    Err(err) => subscriber.error(err),
                }
            });

            Teardown::new(move || {
                canceller.cancel();
                task.abort();
                if let Some(watcher) = watcher {
                    watcher.abort();
                }
            })
        })
    }
}
