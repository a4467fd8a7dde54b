//! HTTP batch endpoint: `GET|POST /rpc/{paths}`.
//!
//! GET runs queries, POST runs mutations. With `?batch=1` the path segment
//! is a comma-separated list and the input is a map keyed by position; the
//! response is an array with one item per path and the status of the most
//! severe member. Without it, one procedure runs and one item is returned.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::future::join_all;
use serde_json::Value;
use skein_core::messages::{batch_status, input_at, BatchResponseItem, PATH_SEPARATOR};
use skein_core::{ErrorCode, OperationKind, RpcError};
use tower::ServiceExt;
use tracing::debug;

use super::AppState;
use crate::service::{create_context, ContextRequest, ProcedureCall, ProcedureOutput, TransportKind};

pub async fn http_batch_handler(
    State(state): State<AppState>,
    Path(paths): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.shutdown.is_accepting() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let kind = match method {
        Method::GET => OperationKind::Query,
        Method::POST => OperationKind::Mutation,
        other => {
            let err = RpcError::new(
                ErrorCode::MethodNotSupported,
                format!("unsupported {other} request, use GET for queries and POST for mutations"),
            );
            return single(BatchResponseItem::error(&err));
        }
    };
    let batch = query.get("batch").is_some_and(|v| v == "1" || v == "true");
    let paths: Vec<String> = if batch {
        paths.split(PATH_SEPARATOR).map(str::to_string).collect()
    } else {
        vec![paths]
    };
    if paths.len() > state.server.max_batch_items {
        let err = RpcError::new(
            ErrorCode::PayloadTooLarge,
            format!("batch of {} exceeds the limit of {}", paths.len(), state.server.max_batch_items),
        );
        return single(BatchResponseItem::error(&err));
    }

    let raw = match read_input(kind, &query, &body) {
        Ok(raw) => raw,
        Err(err) => return single(BatchResponseItem::error(&err)),
    };
    let inputs: Vec<Value> = match (batch, raw) {
        (false, raw) => vec![raw.unwrap_or(Value::Null)],
        (true, None) => vec![Value::Null; paths.len()],
        (true, Some(map @ Value::Object(_))) => (0..paths.len()).map(|i| input_at(&map, i)).collect(),
        (true, Some(_)) => {
            let err = RpcError::new(ErrorCode::BadRequest, "batch input must be an object keyed by position");
            return single(BatchResponseItem::error(&err));
        }
    };
    debug!(kind = %kind, paths = ?paths, "http batch");

    let request = ContextRequest {
        transport: TransportKind::Http,
        connection_id: None,
        headers,
        query,
    };
    let items = match create_context(state.contexts.as_ref(), &request).await {
        Ok(ctx) => {
            let ctx = Arc::new(ctx);
            let calls = paths.into_iter().zip(inputs).enumerate().map(|(index, (path, input))| {
                let call = ProcedureCall::new(
                    index as u64,
                    kind,
                    path,
                    input,
                    Arc::clone(&ctx),
                    state.server.default_operation_timeout_ms,
                );
                run(&state, call)
            });
            join_all(calls).await
        }
        Err(err) => paths.iter().map(|_| BatchResponseItem::error(&err)).collect(),
    };

    if batch {
        (status(batch_status(&items)), Json(items)).into_response()
    } else {
        items
            .into_iter()
            .next()
            .map_or_else(|| StatusCode::NO_CONTENT.into_response(), single)
    }
}

fn read_input(
    kind: OperationKind,
    query: &HashMap<String, String>,
    body: &Bytes,
) -> Result<Option<Value>, RpcError> {
    let parsed = match kind {
        OperationKind::Mutation if !body.is_empty() => serde_json::from_slice::<Value>(body).map(Some),
        OperationKind::Query => query.get("input").map(|raw| serde_json::from_str::<Value>(raw)).transpose(),
        _ => Ok(None),
    };
    parsed.map_err(|err| RpcError::new(ErrorCode::ParseError, "input is not valid JSON").with_cause(err))
}

async fn run(state: &AppState, call: ProcedureCall) -> BatchResponseItem {
    let _guard = state.shutdown.in_flight_guard();
    let path = call.path.clone();
    match state.pipeline.clone().oneshot(call).await {
        Ok(ProcedureOutput::Value(data)) => BatchResponseItem::data(data),
        Ok(ProcedureOutput::Stream(_)) => BatchResponseItem::error(
            &RpcError::new(ErrorCode::MethodNotSupported, "subscriptions need a duplex connection")
                .with_path(path),
        ),
        Err(err) => BatchResponseItem::error(&err.to_rpc_error(&path)),
    }
}

fn single(item: BatchResponseItem) -> Response {
    (status(item.http_status()), Json(item)).into_response()
}

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}
