//! HTTP batch link against a minimal in-process batch endpoint.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::Method;
use axum::routing::any;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use skein_client::{shared, Chain, ClientError, HttpBatchConfig, HttpBatchLink, SkeinClient};
use skein_core::{ErrorCode, OperationKind};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct Seen {
    requests: Arc<Mutex<Vec<(Method, Vec<String>)>>>,
}

async fn batch(
    State(seen): State<Seen>,
    method: Method,
    Path(paths): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Json<Value> {
    let paths: Vec<String> = paths.split(',').map(str::to_string).collect();
    seen.requests.lock().push((method.clone(), paths.clone()));

    let inputs: Value = if method == Method::POST {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    } else {
        query
            .get("input")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(Value::Null)
    };

    let items: Vec<Value> = paths
        .iter()
        .enumerate()
        .map(|(i, path)| {
            if path == "missing" {
                json!({"error": {"code": -32004, "message": "no such procedure",
                                 "data": {"code": "NOT_FOUND", "httpStatus": 404, "path": path}}})
            } else {
                json!({"result": {"data": {"path": path, "input": inputs[i.to_string()].clone()}}})
            }
        })
        .collect();
    Json(Value::Array(items))
}

async fn serve() -> (SocketAddr, Seen) {
    let seen = Seen::default();
    let app = Router::new()
        .route("/rpc/{paths}", any(batch))
        .with_state(seen.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, seen)
}

fn client(addr: SocketAddr, tweak: impl FnOnce(&mut HttpBatchConfig)) -> SkeinClient {
    let mut config = HttpBatchConfig::new(format!("http://{addr}/rpc"));
    tweak(&mut config);
    SkeinClient::new(Chain::new(vec![shared(HttpBatchLink::new(config))]).unwrap())
}

#[tokio::test]
async fn same_tick_queries_travel_together() {
    let (addr, seen) = serve().await;
    let client = client(addr, |_| {});

    let a = client.query("user.get", json!({"id": 1}));
    let b = client.query("post.list", json!(null));
    let c = client.query("user.get", json!({"id": 2}));
    let (a, b, c) = tokio::join!(a, b, c);

    assert_eq!(a.unwrap(), json!({"path": "user.get", "input": {"id": 1}}));
    assert_eq!(b.unwrap(), json!({"path": "post.list", "input": null}));
    assert_eq!(c.unwrap()["input"], json!({"id": 2}));

    let requests = seen.requests.lock().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, Method::GET);
    assert_eq!(requests[0].1, vec!["user.get", "post.list", "user.get"]);
}

#[tokio::test]
async fn mutations_are_posted_separately() {
    let (addr, seen) = serve().await;
    let client = client(addr, |_| {});

    let q = client.query("a", json!(1));
    let m = client.mutation("b", json!({"title": "hi"}));
    let (q, m) = tokio::join!(q, m);
    assert_eq!(q.unwrap()["input"], json!(1));
    assert_eq!(m.unwrap()["input"], json!({"title": "hi"}));

    let mut methods: Vec<Method> = seen.requests.lock().iter().map(|(m, _)| m.clone()).collect();
    methods.sort_by_key(|m| m.to_string());
    assert_eq!(methods, vec![Method::GET, Method::POST]);
}

#[tokio::test]
async fn long_urls_split_the_batch() {
    let (addr, seen) = serve().await;
    let client = client(addr, |config| config.max_url_length = 160);

    let calls: Vec<_> = (0..4)
        .map(|i| client.query("search", json!({"q": "x".repeat(20), "page": i})))
        .collect();
    for (i, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap()["input"]["page"], json!(i));
    }
    assert!(seen.requests.lock().len() > 1);
}

#[tokio::test]
async fn one_failing_member_does_not_fail_the_rest() {
    let (addr, _seen) = serve().await;
    let client = client(addr, |_| {});

    let ok = client.query("user.get", json!(1));
    let missing = client.query("missing", json!(2));
    let (ok, missing) = tokio::join!(ok, missing);

    assert!(ok.is_ok());
    let err = missing.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    assert_eq!(err.remote().and_then(|e| e.path.as_deref()), Some("missing"));
}

#[tokio::test]
async fn aborting_one_operation_leaves_its_batch_mates_alone() {
    let (addr, seen) = serve().await;
    let client = client(addr, |_| {});

    let signal = CancellationToken::new();
    let doomed = client.send(
        client
            .operation(OperationKind::Query, "a", json!(1))
            .with_signal(signal.clone()),
    );
    let kept = client.query("b", json!(2));
    signal.cancel();

    let (doomed, kept) = tokio::join!(doomed, kept);
    assert_eq!(doomed.unwrap_err(), ClientError::Aborted);
    assert_eq!(kept.unwrap()["path"], "b");
    assert_eq!(seen.requests.lock()[0].1, vec!["b"]);
}

#[tokio::test]
async fn subscriptions_are_refused() {
    let (addr, seen) = serve().await;
    let client = client(addr, |_| {});

    let err = client.send(client.operation(OperationKind::Subscription, "ticks", Value::Null)).await;
    assert_eq!(err.unwrap_err().code(), ErrorCode::MethodNotSupported);
    assert!(seen.requests.lock().is_empty());
}
