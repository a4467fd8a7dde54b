//! Records each call's latency and outcome on a `procedure` tracing span.

use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::field::Empty;
use tracing::{info_span, Instrument, Span};

use crate::service::procedure::{CallFuture, ProcedureCall, ProcedureError, ProcedureOutput};

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = Metrics<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Metrics { inner }
    }
}

#[derive(Debug, Clone)]
pub struct Metrics<S> {
    inner: S,
}

/// Short label logged for a finished call: `ok`, `stream`, or the error code.
fn outcome(result: &Result<ProcedureOutput, ProcedureError>) -> &'static str {
    match result {
        Ok(ProcedureOutput::Value(_)) => "ok",
        Ok(ProcedureOutput::Stream(_)) => "stream",
        Err(err) => err.code().as_str(),
    }
}

impl<S> Service<ProcedureCall> for Metrics<S>
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
        let span = info_span!(
            "procedure",
            path = %call.path,
            kind = call.kind.as_str(),
            id = call.id,
            transport = call.ctx.transport.as_str(),
            duration_ms = Empty,
            outcome = Empty,
        );
        let started = Instant::now();
        let output = self.inner.call(call);

        Box::pin(
            async move {
                let result = output.await;
                let label = outcome(&result);
                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = started.elapsed().as_millis() as u64;

                let span = Span::current();
                span.record("duration_ms", duration_ms);
                span.record("outcome", label);
                tracing::info!(duration_ms, outcome = label, "procedure complete");
                result
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use futures_util::stream;
    use serde_json::json;
    use skein_core::ErrorCode;
    use tower::ServiceExt;

    use super::*;
    use crate::service::middleware::test_support::{delayed_echo, query};

    #[tokio::test]
    async fn output_passes_through_unchanged() {
        let out = MetricsLayer
            .layer(delayed_echo(0))
            .oneshot(query("stats", json!({ "id": 42 }), 5_000))
            .await
            .unwrap();
        assert_eq!(out.into_value(), Some(json!({ "id": 42 })));
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(outcome(&Ok(ProcedureOutput::Value(json!(1)))), "ok");
        assert_eq!(
            outcome(&Ok(ProcedureOutput::Stream(Box::pin(stream::empty())))),
            "stream"
        );
        assert_eq!(outcome(&Err(ProcedureError::Overloaded)), ErrorCode::TooManyRequests.as_str());
    }
}
