//! Per-call deadlines.

use std::task::{Context, Poll};
use std::time::Duration;

use tower::{Layer, Service};

use crate::service::procedure::{CallFuture, ProcedureCall, ProcedureError, ProcedureOutput};

/// Fails a call with [`ProcedureError::Timeout`] once its `timeout_ms` has
/// passed. A `timeout_ms` of 0 leaves the call unbounded.
///
/// For subscriptions only producing the stream is bounded; the items that
/// follow are not.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutLayer;

impl<S> Layer<S> for TimeoutLayer {
    type Service = Deadline<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Deadline { inner }
    }
}

#[derive(Debug, Clone)]
pub struct Deadline<S> {
    inner: S,
}

impl<S> Service<ProcedureCall> for Deadline<S>
where
    S: Service<ProcedureCall, Response = ProcedureOutput, Error = ProcedureError>,
    S::Future: Send + 'static,
{
    type Response = ProcedureOutput;
    type Error = ProcedureError;
    type Future = CallFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: ProcedureCall) -> Self::Future {
        let timeout_ms = call.timeout_ms;
        let output = self.inner.call(call);
        if timeout_ms == 0 {
            return Box::pin(output);
        }
        Box::pin(async move {
            tokio::time::timeout(Duration::from_millis(timeout_ms), output)
                .await
                .unwrap_or_else(|_elapsed| Err(ProcedureError::Timeout { timeout_ms }))
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::service::middleware::test_support::{delayed_echo, query};

    #[tokio::test(start_paused = true)]
    async fn fast_calls_keep_their_output() {
        let svc = TimeoutLayer.layer(delayed_echo(10));
        let out = svc.oneshot(query("echo", json!("in time"), 1_000)).await.unwrap();
        assert_eq!(out.into_value(), Some(json!("in time")));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out_with_their_own_deadline() {
        let svc = TimeoutLayer.layer(delayed_echo(200));
        let err = svc.oneshot(query("echo", json!(null), 50)).await.unwrap_err();
        assert!(matches!(err, ProcedureError::Timeout { timeout_ms: 50 }));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_means_no_deadline() {
        let svc = TimeoutLayer.layer(delayed_echo(3_600_000));
        let out = svc.oneshot(query("echo", json!(1), 0)).await.unwrap();
        assert_eq!(out.into_value(), Some(json!(1)));
    }
}
