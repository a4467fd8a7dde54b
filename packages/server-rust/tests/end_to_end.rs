//! Runs a real server on an OS-assigned port and drives it with the
//! `skein-client` transports and raw WebSocket frames.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use skein_client::{
    shared, Chain, ClientError, ConnectionState, HttpBatchConfig, HttpBatchLink, OperationResult,
    PollingConfig, SkeinClient, WsClientConfig, WsConnection, WsLink,
};
use skein_core::{Callbacks, ErrorCode, RpcError};
use skein_server::network::NetworkConfig;
use skein_server::service::{ProcedureCall, ProcedureError, ProcedureStream};
use skein_server::{ContextRequest, NetworkModule, ProcedureRouter, ServerConfig};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn procedures() -> ProcedureRouter {
    ProcedureRouter::new()
        .query("greeting", |call: ProcedureCall| async move {
            let name = call.input["name"].as_str().unwrap_or("world").to_string();
            Ok(json!(format!("hello {name}")))
        })
        .query("whoami", |call: ProcedureCall| async move {
            Ok(call.ctx.get("user").cloned().unwrap_or(Value::Null))
        })
        .query("fail", |_call: ProcedureCall| async move {
            Err::<Value, _>(ProcedureError::new(ErrorCode::Conflict, "already exists"))
        })
        .query("feed", |call: ProcedureCall| async move {
            let cursor = call.input["cursor"].as_u64().unwrap_or(0);
            Ok(json!({ "data": cursor, "nextInput": { "cursor": cursor + 1 } }))
        })
        .mutation("add", |call: ProcedureCall| async move {
            Ok(json!(call.input["a"].as_i64().unwrap_or(0) + call.input["b"].as_i64().unwrap_or(0)))
        })
        .subscription("ticks", |call: ProcedureCall| async move {
            let count = call.input["count"].as_u64().unwrap_or(u64::MAX);
            let every = Duration::from_millis(call.input["every_ms"].as_u64().unwrap_or(10));
            let ticks: ProcedureStream = Box::pin(stream::unfold(0u64, move |n| async move {
                if n >= count {
                    return None;
                }
                tokio::time::sleep(every).await;
                Some((Ok(json!(n)), n + 1))
            }));
            Ok(ticks)
        })
}

struct TestServer {
    port: u16,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(|module| module).await
    }

    async fn start_with(configure: impl FnOnce(NetworkModule) -> NetworkModule) -> Self {
        let config = NetworkConfig {
            host: "127.0.0.1".to_string(),
            drain_timeout: Duration::from_secs(2),
            ..NetworkConfig::default()
        };
        let mut module = configure(NetworkModule::new(config, ServerConfig::default(), procedures()));
        let port = module.start().await.expect("bind");
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(module.serve(async move {
            let _ = stopped.await;
        }));
        Self {
            port,
            stop: Some(stop),
            task,
        }
    }

    fn rpc_url(&self) -> String {
        format!("http://127.0.0.1:{}/rpc", self.port)
    }

    fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server did not stop")
            .expect("server task panicked")
            .expect("server failed");
    }
}

fn http_client(server: &TestServer) -> SkeinClient {
    let link = HttpBatchLink::new(HttpBatchConfig::new(server.rpc_url()));
    SkeinClient::new(Chain::new(vec![shared(link)]).unwrap())
}

fn ws_client(connection: &WsConnection) -> SkeinClient {
    SkeinClient::new(Chain::new(vec![shared(WsLink::new(connection.clone()))]).unwrap())
}

type RawSocket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn raw_socket(url: &str) -> RawSocket {
    tokio_tungstenite::connect_async(url).await.expect("connect").0
}

async fn send_json(socket: &mut RawSocket, value: Value) {
    socket.send(Message::text(value.to_string())).await.unwrap();
}

/// Next frame as JSON, or `None` for a close frame.
async fn recv_json(socket: &mut RawSocket) -> Option<Value> {
    let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("no frame within 5s")?
        .ok()?;
    match frame {
        Message::Text(text) => Some(serde_json::from_str(text.as_str()).unwrap()),
        Message::Close(_) => None,
        other => panic!("unexpected frame {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// HTTP batch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn http_batch_link_runs_concurrent_queries() {
    let server = TestServer::start().await;
    let client = http_client(&server);

    let (ada, grace) = tokio::join!(
        client.query("greeting", json!({ "name": "ada" })),
        client.query("greeting", json!({ "name": "grace" })),
    );
    assert_eq!(ada.unwrap(), json!("hello ada"));
    assert_eq!(grace.unwrap(), json!("hello grace"));

    server.shutdown().await;
}

#[tokio::test]
async fn http_batch_link_posts_mutations() {
    let server = TestServer::start().await;
    let client = http_client(&server);

    let sum = client.mutation("add", json!({ "a": 2, "b": 3 })).await.unwrap();
    assert_eq!(sum, json!(5));

    server.shutdown().await;
}

#[tokio::test]
async fn http_errors_keep_their_code() {
    let server = TestServer::start().await;
    let client = http_client(&server);

    let (failed, missing) = tokio::join!(
        client.query("fail", Value::Null),
        client.query("nowhere", Value::Null),
    );
    let failed = failed.unwrap_err();
    assert_eq!(failed.code(), ErrorCode::Conflict);
    assert_eq!(failed.remote().unwrap().message, "already exists");
    assert_eq!(missing.unwrap_err().code(), ErrorCode::NotFound);

    server.shutdown().await;
}

#[tokio::test]
async fn polling_follows_the_cursor() {
    let server = TestServer::start().await;
    let client = http_client(&server);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = client
        .poll(
            "feed",
            json!({ "cursor": 5 }),
            PollingConfig {
                backpressure_ms: 10,
                request_timeout_ms: 2_000,
            },
        )
        .subscribe(Callbacks::new().on_next(move |page| {
            let _ = tx.send(page);
        }));

    let mut pages = Vec::new();
    for _ in 0..3 {
        pages.push(rx.recv().await.unwrap());
    }
    subscription.unsubscribe();
    assert_eq!(pages, vec![json!(5), json!(6), json!(7)]);

    server.shutdown().await;
}

// ---------------------------------------------------------------------------
// Duplex
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ws_link_answers_queries_and_mutations() {
    let server = TestServer::start().await;
    let connection = WsConnection::connect(WsClientConfig::new(server.ws_url()));
    let client = ws_client(&connection);

    assert_eq!(
        client.query("greeting", json!({ "name": "ws" })).await.unwrap(),
        json!("hello ws")
    );
    assert_eq!(client.mutation("add", json!({ "a": 1, "b": 1 })).await.unwrap(), json!(2));
    let err = client.query("fail", Value::Null).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Conflict);

    connection.close();
    server.shutdown().await;
}

#[tokio::test]
async fn ws_subscription_streams_until_the_server_stops() {
    let server = TestServer::start().await;
    let connection = WsConnection::connect(WsClientConfig::new(server.ws_url()));
    let client = ws_client(&connection);

    let events = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = oneshot::channel::<Result<(), ClientError>>();
    let done_tx = Arc::new(Mutex::new(Some(done_tx)));
    let sink = Arc::clone(&events);
    let (on_complete, on_error) = (Arc::clone(&done_tx), done_tx);
    let _subscription = client
        .subscription("ticks", json!({ "count": 3, "every_ms": 5 }))
        .subscribe(
            Callbacks::new()
                .on_next(move |event| sink.lock().push(event))
                .on_complete(move || {
                    if let Some(tx) = on_complete.lock().take() {
                        let _ = tx.send(Ok(()));
                    }
                })
                .on_error(move |err| {
                    if let Some(tx) = on_error.lock().take() {
                        let _ = tx.send(Err(err));
                    }
                }),
        );

    tokio::time::timeout(Duration::from_secs(5), done_rx)
        .await
        .expect("subscription never ended")
        .unwrap()
        .unwrap();
    assert_eq!(
        *events.lock(),
        vec![
            OperationResult::Started,
            OperationResult::Data(json!(0)),
            OperationResult::Data(json!(1)),
            OperationResult::Data(json!(2)),
            OperationResult::Stopped,
        ]
    );

    connection.close();
    server.shutdown().await;
}

#[tokio::test]
async fn raw_protocol_stop_and_duplicate_ids() {
    let server = TestServer::start().await;
    let mut socket = raw_socket(&server.ws_url()).await;

    let subscribe = json!({
        "id": 1,
        "jsonrpc": "2.0",
        "method": "subscription",
        "params": { "path": "ticks", "input": { "every_ms": 1000 } },
    });
    send_json(&mut socket, subscribe.clone()).await;
    let started = recv_json(&mut socket).await.unwrap();
    assert_eq!(started["id"], 1);
    assert_eq!(started["result"]["type"], "started");

    send_json(&mut socket, subscribe).await;
    let stopped = recv_json(&mut socket).await.unwrap();
    assert_eq!(stopped["result"]["type"], "stopped");
    let rejected = recv_json(&mut socket).await.unwrap();
    assert_eq!(rejected["id"], 1);
    assert_eq!(rejected["error"]["data"]["code"], "BAD_REQUEST");

    send_json(&mut socket, json!({ "id": 9, "method": "subscription.stop" })).await;
    let stopped = recv_json(&mut socket).await.unwrap();
    assert_eq!(stopped["id"], 9);
    assert_eq!(stopped["result"]["type"], "stopped");

    socket.send(Message::text("{not json")).await.unwrap();
    let parse = recv_json(&mut socket).await.unwrap();
    assert!(parse["id"].is_null());
    assert_eq!(parse["error"]["code"], -32700);

    let _ = socket.close(None).await;
    server.shutdown().await;
}

#[tokio::test]
async fn drain_tells_duplex_clients_to_reconnect() {
    let server = TestServer::start().await;
    let mut socket = raw_socket(&server.ws_url()).await;

    // Round trip first so the server has registered the connection.
    send_json(
        &mut socket,
        json!({ "id": 1, "method": "query", "params": { "path": "greeting" } }),
    )
    .await;
    assert_eq!(recv_json(&mut socket).await.unwrap()["result"]["data"], "hello world");

    server.shutdown().await;

    let notice = recv_json(&mut socket).await.unwrap();
    assert_eq!(notice, json!({ "id": null, "method": "reconnect" }));
    assert_eq!(recv_json(&mut socket).await, None);
}

#[tokio::test]
async fn ws_connection_reconnects_after_drain() {
    let server = TestServer::start().await;
    let connection = WsConnection::connect(WsClientConfig::new(server.ws_url()).with_retry_delay(|_| 50));
    connection.wait_for(ConnectionState::Open).await;

    server.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), connection.wait_for(ConnectionState::Reconnecting))
        .await
        .expect("client did not notice the drain");

    connection.close();
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

fn token_auth(request: &ContextRequest) -> Result<Map<String, Value>, RpcError> {
    match request.query.get("token").map(String::as_str) {
        Some("secret") => {
            let mut values = Map::new();
            values.insert("user".to_string(), json!("ada"));
            Ok(values)
        }
        _ => Err(RpcError::new(ErrorCode::Unauthorized, "missing token")),
    }
}

#[tokio::test]
async fn context_values_reach_procedures() {
    let server = TestServer::start_with(|module| module.with_context_factory(token_auth)).await;

    let mut socket = raw_socket(&format!("{}?token=secret", server.ws_url())).await;
    send_json(
        &mut socket,
        json!({ "id": 3, "method": "query", "params": { "path": "whoami" } }),
    )
    .await;
    assert_eq!(recv_json(&mut socket).await.unwrap()["result"]["data"], "ada");

    let body: Value = reqwest::get(format!("{}/whoami?token=secret", server.rpc_url()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["result"]["data"], "ada");

    let _ = socket.close(None).await;
    server.shutdown().await;
}

#[tokio::test]
async fn rejected_context_fails_buffered_calls_and_closes() {
    let server = TestServer::start_with(|module| module.with_context_factory(token_auth)).await;

    let mut socket = raw_socket(&server.ws_url()).await;
    // The factory may reject before the call arrives; the error then carries a null id.
    let _ = socket
        .send(Message::text(
            json!({ "id": 4, "method": "query", "params": { "path": "whoami" } }).to_string(),
        ))
        .await;
    let rejected = recv_json(&mut socket).await.unwrap();
    assert!(rejected["id"] == 4 || rejected["id"].is_null());
    assert_eq!(rejected["error"]["data"]["code"], "UNAUTHORIZED");
    assert_eq!(recv_json(&mut socket).await, None);

    let response = reqwest::get(format!("{}/whoami", server.rpc_url())).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    server.shutdown().await;
}
