//! Batched HTTP request encoding and response decoding.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, Url};
use serde_json::Value;
use skein_core::messages::{input_map, BatchResponseItem, PATH_SEPARATOR};
use skein_core::{Operation, OperationKind, RpcError};

use super::HttpBatchConfig;
use crate::error::ClientError;
use crate::loader::BatchFetch;

/// Sends one batch of same-kind operations as a single HTTP request.
pub(super) struct HttpBatchFetcher {
    pub(super) client: reqwest::Client,
    pub(super) config: Arc<HttpBatchConfig>,
    pub(super) kind: OperationKind,
}

impl HttpBatchFetcher {
    fn method(&self) -> Method {
        match self.kind {
            OperationKind::Mutation => Method::POST,
            OperationKind::Query | OperationKind::Subscription => Method::GET,
        }
    }

    /// `<base>/<path0,path1,...>?batch=1[&input=<map>]`. GET requests carry the
    /// input map in the query string.
    pub(super) fn url_for(&self, ops: &[Operation]) -> Result<Url, ClientError> {
        let paths: Vec<&str> = ops.iter().map(Operation::path).collect();
        let base = self.config.url.trim_end_matches('/');
        let joined = paths.join(&PATH_SEPARATOR.to_string());
        let mut url = Url::parse(&format!("{base}/{joined}"))
            .map_err(|e| ClientError::Config(format!("invalid url {base:?}: {e}")))?;

        let mut query = url.query_pairs_mut();
        query.append_pair("batch", "1");
        if self.method() == Method::GET {
            let input = serde_json::to_string(&input_map(ops.iter().map(Operation::input)))?;
            query.append_pair("input", &input);
        }
        drop(query);
        Ok(url)
    }
}

#[async_trait]
impl BatchFetch<Operation, BatchResponseItem> for HttpBatchFetcher {
    fn validate(&self, ops: &[Operation]) -> bool {
        if ops.len() > self.config.max_items {
            return false;
        }
        self.url_for(ops)
            .is_ok_and(|url| url.as_str().len() <= self.config.max_url_length)
    }

    async fn fetch(&self, ops: Vec<Operation>) -> Result<Vec<BatchResponseItem>, ClientError> {
        let url = self.url_for(&ops)?;
        let mut request = self
            .client
            .request(self.method(), url)
            .headers(self.config.headers.clone());
        if self.method() == Method::POST {
            request = request.json(&input_map(ops.iter().map(Operation::input)));
        }
        if let Some(timeout_ms) = self.config.request_timeout_ms {
            request = request.timeout(std::time::Duration::from_millis(timeout_ms));
        }

        tracing::debug!(kind = %self.kind, size = ops.len(), "sending batch");
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        decode_batch(&body, ops.len()).map_err(|err| {
            tracing::warn!(%status, error = %err, "unusable batch response");
            err
        })
    }
}

/// Decodes a batch response body into exactly `expected` items.
///
/// A lone error object (the whole request was rejected) fails every member.
pub(super) fn decode_batch(body: &[u8], expected: usize) -> Result<Vec<BatchResponseItem>, ClientError> {
    let value: Value = serde_json::from_slice(body)?;
    match value {
        Value::Array(_) => {
            let items: Vec<BatchResponseItem> = serde_json::from_value(value)?;
            if items.len() != expected {
                return Err(ClientError::Protocol(format!(
                    "batch returned {} results for {expected} requests",
                    items.len()
                )));
            }
            Ok(items)
        }
        other => match serde_json::from_value::<BatchResponseItem>(other) {
            Ok(BatchResponseItem::Error { error }) => {
                Err(ClientError::Remote(RpcError::from_shape(error)))
            }
            _ => Err(ClientError::Protocol("expected a batch array".into())),
        },
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderMap;
    use serde_json::json;
    use skein_core::ErrorCode;

    use super::*;

    fn fetcher(kind: OperationKind, max_url_length: usize) -> HttpBatchFetcher {
        HttpBatchFetcher {
            client: reqwest::Client::new(),
            config: Arc::new(HttpBatchConfig {
                url: "http://localhost:3000/rpc/".into(),
                max_url_length,
                max_items: 10,
                headers: HeaderMap::new(),
                request_timeout_ms: None,
            }),
            kind,
        }
    }

    #[test]
    fn get_url_carries_paths_and_inputs() {
        let ops = [
            Operation::query(1, "user.get", json!({"id": 1})),
            Operation::query(2, "post.list", Value::Null),
        ];
        let url = fetcher(OperationKind::Query, usize::MAX).url_for(&ops).unwrap();
        assert_eq!(url.path(), "/rpc/user.get,post.list");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("batch".into(), "1".into()));
        let input: Value = serde_json::from_str(&pairs[1].1).unwrap();
        assert_eq!(input, json!({"0": {"id": 1}, "1": null}));
    }

    #[test]
    fn post_url_has_no_input() {
        let ops = [Operation::mutation(1, "post.add", json!({"title": "x"}))];
        let url = fetcher(OperationKind::Mutation, usize::MAX).url_for(&ops).unwrap();
        assert_eq!(url.query(), Some("batch=1"));
    }

    #[test]
    fn long_urls_fail_validation() {
        let ops: Vec<_> = (0..3)
            .map(|i| Operation::query(i, "search", json!("x".repeat(40))))
            .collect();
        let f = fetcher(OperationKind::Query, 150);
        assert!(f.validate(&ops[..1]));
        assert!(!f.validate(&ops));
    }

    #[test]
    fn too_many_items_fail_validation() {
        let ops: Vec<_> = (0..11).map(|i| Operation::query(i, "a", Value::Null)).collect();
        assert!(!fetcher(OperationKind::Query, usize::MAX).validate(&ops));
    }

    #[test]
    fn decodes_positional_items() {
        let body = br#"[{"result":{"data":1}},{"error":{"code":-32004,"message":"nope","data":{"code":"NOT_FOUND","httpStatus":404}}}]"#;
        let items = decode_batch(body, 2).unwrap();
        assert_eq!(items[0].clone().into_result(), Ok(json!(1)));
        assert_eq!(items[1].clone().into_result().unwrap_err().code, ErrorCode::NotFound);
    }

    #[test]
    fn count_mismatch_is_a_protocol_error() {
        let body = br#"[{"result":{"data":1}}]"#;
        assert!(matches!(decode_batch(body, 2), Err(ClientError::Protocol(_))));
    }

    #[test]
    fn whole_request_error_fails_everyone() {
        let body = br#"{"error":{"code":-32600,"message":"bad","data":{"code":"BAD_REQUEST","httpStatus":400}}}"#;
        let err = decode_batch(body, 3).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(decode_batch(b"<html>", 1), Err(ClientError::Parse(_))));
    }
}
