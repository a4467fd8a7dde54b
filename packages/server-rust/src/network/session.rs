//! Server half of the duplex protocol.
//!
//! One [`Session`] runs per socket. It waits for the connection context
//! (buffering messages that arrive meanwhile), then answers queries and
//! mutations with one `data` result each and drives subscriptions as
//! `started`, `data`*, `stopped`. Active subscriptions are keyed by request id
//! and cancelled when the client stops them or the socket goes away.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use skein_core::messages::{ClientMessage, RequestId, ServerMessage};
use skein_core::{ErrorCode, OperationKind, RpcError};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, warn};

use super::connection::{ConnectionHandle, OutboundMessage, SendError};
use super::shutdown::ShutdownController;
use crate::service::{CallContext, ProcedureCall, ProcedureOutput, ProcedurePipeline};

/// Per-session limits, taken from the network and server configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub send_timeout: Duration,
    pub call_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            call_timeout_ms: 30_000,
        }
    }
}

struct ActiveStream {
    token: CancellationToken,
    generation: u64,
}

struct SessionInner {
    handle: Arc<ConnectionHandle>,
    pipeline: ProcedurePipeline,
    shutdown: Arc<ShutdownController>,
    settings: SessionSettings,
    subscriptions: Mutex<HashMap<RequestId, ActiveStream>>,
    next_generation: AtomicU64,
    closed: CancellationToken,
}

/// Protocol state of one duplex connection.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    #[must_use]
    pub fn new(
        handle: Arc<ConnectionHandle>,
        pipeline: ProcedurePipeline,
        shutdown: Arc<ShutdownController>,
        settings: SessionSettings,
    ) -> Self {
        let closed = handle.closed.clone();
        Self {
            inner: Arc::new(SessionInner {
                handle,
                pipeline,
                shutdown,
                settings,
                subscriptions: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                closed,
            }),
        }
    }

    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    /// Token cancelled when the session ends.
    #[must_use]
    pub fn closed(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    /// Processes `incoming` text frames until the stream ends or the session closes.
    ///
    /// Frames arriving before `context` resolves are buffered and processed
    /// in order once it does. If it fails, every buffered message is answered
    /// with the failure and the connection is closed.
    pub async fn run<S, C>(self, incoming: S, context: C)
    where
        S: Stream<Item = String> + Send,
        C: Future<Output = Result<CallContext, RpcError>> + Send,
    {
        let inner = self.inner;
        let mut incoming = pin!(incoming);
        let mut context = pin!(context);
        let mut buffered = Vec::new();

        let created = loop {
            tokio::select! {
                biased;
                () = inner.closed.cancelled() => {
                    inner.close();
                    return;
                }
                frame = incoming.next() => match frame {
                    Some(text) => buffered.push(text),
                    None => {
                        inner.close();
                        return;
                    }
                },
                result = &mut context => break result,
            }
        };

        let ctx = match created {
            Ok(ctx) => Arc::new(ctx),
            Err(err) => {
                warn!(connection_id = %inner.handle.id, error = %err, "context creation failed");
                inner.reject_buffered(&buffered, &err).await;
                inner.close();
                let _ = inner
                    .handle
                    .send_timeout(
                        OutboundMessage::Close(Some(err.message.clone())),
                        inner.settings.send_timeout,
                    )
                    .await;
                return;
            }
        };

        for text in buffered {
            inner.handle_text(&ctx, &text).await;
        }

        loop {
            tokio::select! {
                () = inner.closed.cancelled() => break,
                () = inner.handle.tx.closed() => break,
                frame = incoming.next() => match frame {
                    Some(text) => inner.handle_text(&ctx, &text).await,
                    None => break,
                },
            }
        }
        inner.close();
    }
}

impl SessionInner {
    async fn handle_text(self: &Arc<Self>, ctx: &Arc<CallContext>, text: &str) {
        self.handle.touch();
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                let err = RpcError::new(ErrorCode::ParseError, "message is not valid JSON").with_cause(err);
                self.send(&ServerMessage::error(None, &err)).await;
                return;
            }
        };
        match value {
            Value::Array(items) => {
                for item in items {
                    self.handle_value(ctx, item).await;
                }
            }
            other => self.handle_value(ctx, other).await,
        }
    }

    async fn handle_value(self: &Arc<Self>, ctx: &Arc<CallContext>, value: Value) {
        let id = value.get("id").and_then(Value::as_u64);
        let msg: ClientMessage = match serde_json::from_value(value) {
            Ok(msg) => msg,
            Err(err) => {
                let err = RpcError::new(ErrorCode::BadRequest, "malformed message").with_cause(err);
                self.send(&ServerMessage::error(id, &err)).await;
                return;
            }
        };
        debug!(connection_id = %self.handle.id, id = msg.id, method = ?msg.method, "received");

        let Some(kind) = msg.method.kind() else {
            self.stop_subscription(msg.id).await;
            return;
        };
        let Some(params) = msg.params else {
            let err = RpcError::new(ErrorCode::BadRequest, "request is missing params");
            self.send(&ServerMessage::error(Some(msg.id), &err)).await;
            return;
        };

        let call = ProcedureCall::new(
            msg.id,
            kind,
            params.path,
            params.input,
            Arc::clone(ctx),
            self.settings.call_timeout_ms,
        );
        if kind == OperationKind::Subscription {
            self.start_subscription(call).await;
        } else {
            self.spawn_call(call);
        }
    }

    fn spawn_call(self: &Arc<Self>, call: ProcedureCall) {
        let inner = Arc::clone(self);
        let guard = self.shutdown.in_flight_guard();
        tokio::spawn(async move {
            let _guard = guard;
            let id = call.id;
            let path = call.path.clone();
            let result = tokio::select! {
                () = inner.closed.cancelled() => return,
                result = inner.pipeline.clone().oneshot(call) => result,
            };
            let reply = match result {
                Ok(ProcedureOutput::Value(data)) => ServerMessage::data(id, data),
                Ok(ProcedureOutput::Stream(_)) => {
                    let err = RpcError::new(ErrorCode::InternalServerError, "procedure returned a stream")
                        .with_path(path);
                    ServerMessage::error(Some(id), &err)
                }
                Err(err) => ServerMessage::error(Some(id), &err.to_rpc_error(&path)),
            };
            inner.send(&reply).await;
        });
    }

    async fn start_subscription(self: &Arc<Self>, call: ProcedureCall) {
        let id = call.id;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = self.closed.child_token();

        let previous = match self.subscriptions.lock().entry(id) {
            Entry::Occupied(entry) => Some(entry.remove()),
            Entry::Vacant(entry) => {
                entry.insert(ActiveStream {
                    token: token.clone(),
                    generation,
                });
                None
            }
        };
        if let Some(previous) = previous {
            warn!(connection_id = %self.handle.id, id, "duplicate subscription id");
            previous.token.cancel();
            self.send(&ServerMessage::stopped(id)).await;
            let err = RpcError::new(ErrorCode::BadRequest, format!("duplicate id {id}"));
            self.send(&ServerMessage::error(Some(id), &err)).await;
            return;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let path = call.path.clone();
            let guard = inner.shutdown.in_flight_guard();
            let output = tokio::select! {
                biased;
                () = token.cancelled() => return,
                output = inner.pipeline.clone().oneshot(call) => output,
            };
            drop(guard);

            let mut stream = match output {
                Ok(ProcedureOutput::Stream(stream)) => stream,
                Ok(ProcedureOutput::Value(_)) => {
                    let err = RpcError::new(
                        ErrorCode::InternalServerError,
                        "subscription procedure returned a single value",
                    )
                    .with_path(path);
                    inner.finish(id, generation, ServerMessage::error(Some(id), &err)).await;
                    return;
                }
                Err(err) => {
                    let reply = ServerMessage::error(Some(id), &err.to_rpc_error(&path));
                    inner.finish(id, generation, reply).await;
                    return;
                }
            };

            inner.send(&ServerMessage::started(id)).await;
            loop {
                let item = tokio::select! {
                    biased;
                    () = token.cancelled() => return,
                    item = stream.next() => item,
                };
                match item {
                    Some(Ok(data)) => inner.send(&ServerMessage::data(id, data)).await,
                    Some(Err(err)) => {
                        let reply = ServerMessage::error(Some(id), &err.to_rpc_error(&path));
                        inner.finish(id, generation, reply).await;
                        return;
                    }
                    None => {
                        inner.finish(id, generation, ServerMessage::stopped(id)).await;
                        return;
                    }
                }
            }
        });
    }

    /// Removes subscription `id` if it is still `generation` and sends its last message.
    async fn finish(&self, id: RequestId, generation: u64, last: ServerMessage) {
        let removed = {
            let mut subscriptions = self.subscriptions.lock();
            match subscriptions.get(&id) {
                Some(active) if active.generation == generation => subscriptions.remove(&id),
                _ => None,
            }
        };
        if removed.is_some() {
            self.send(&last).await;
        }
    }

    async fn stop_subscription(&self, id: RequestId) {
        let removed = self.subscriptions.lock().remove(&id);
        match removed {
            Some(active) => active.token.cancel(),
            None => debug!(connection_id = %self.handle.id, id, "stop for inactive subscription"),
        }
        self.send(&ServerMessage::stopped(id)).await;
    }

    async fn reject_buffered(&self, buffered: &[String], err: &RpcError) {
        let mut ids: Vec<Option<RequestId>> = Vec::new();
        for text in buffered {
            match serde_json::from_str::<Value>(text) {
                Ok(Value::Array(items)) => {
                    ids.extend(items.iter().map(|item| item.get("id").and_then(Value::as_u64)));
                }
                Ok(item) => ids.push(item.get("id").and_then(Value::as_u64)),
                Err(_) => ids.push(None),
            }
        }
        if ids.is_empty() {
            ids.push(None);
        }
        for id in ids {
            self.send(&ServerMessage::error(id, err)).await;
        }
    }

    /// Sends `msg`, closing the session if the client stops draining its channel.
    async fn send(&self, msg: &ServerMessage) {
        let text = match serde_json::to_string(msg) {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(connection_id = %self.handle.id, error = %err, "failed to encode message");
                return;
            }
        };
        match self
            .handle
            .send_timeout(OutboundMessage::Text(text), self.settings.send_timeout)
            .await
        {
            Ok(()) => {}
            Err(SendError::Timeout) => {
                warn!(connection_id = %self.handle.id, "outbound channel full, closing slow connection");
                self.closed.cancel();
            }
            Err(SendError::Disconnected) => self.closed.cancel(),
        }
    }

    fn close(&self) {
        self.closed.cancel();
        let dropped = std::mem::take(&mut *self.subscriptions.lock());
        if !dropped.is_empty() {
            debug!(connection_id = %self.handle.id, count = dropped.len(), "cancelled subscriptions on close");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::stream;
    use serde_json::json;
    use tokio::sync::{mpsc, oneshot};
    use tokio::task::JoinHandle;

    use super::*;
    use crate::network::config::ConnectionConfig;
    use crate::network::connection::ConnectionRegistry;
    use crate::service::{
        build_procedure_pipeline, ProcedureError, ProcedureRouter, ProcedureStream, ServerConfig,
    };

    type DropSignal = Arc<Mutex<Option<oneshot::Sender<()>>>>;

    fn router(dropped: DropSignal) -> ProcedureRouter {
        ProcedureRouter::new()
            .query("echo", |call: ProcedureCall| async move { Ok(call.input) })
            .query("whoami", |call: ProcedureCall| async move {
                Ok(call.ctx.get("user").cloned().unwrap_or(Value::Null))
            })
            .subscription("count", |call: ProcedureCall| async move {
                let n = call.input.as_u64().unwrap_or(0);
                let items: ProcedureStream = Box::pin(stream::iter((0..n).map(|i| Ok(json!(i)))));
                Ok(items)
            })
            .subscription("broken", |_call: ProcedureCall| async move {
                let items: ProcedureStream = Box::pin(stream::iter(vec![
                    Ok(json!("first")),
                    Err(ProcedureError::new(ErrorCode::Conflict, "stream broke")),
                ]));
                Ok(items)
            })
            .subscription("forever", move |_call: ProcedureCall| {
                let dropped = Arc::clone(&dropped);
                async move {
                    let guard = dropped.lock().take();
                    let items: ProcedureStream = Box::pin(stream::pending().map(move |item| {
                        let _ = &guard;
                        item
                    }));
                    Ok(items)
                }
            })
    }

    struct Harness {
        input: Option<mpsc::UnboundedSender<String>>,
        output: mpsc::Receiver<OutboundMessage>,
        task: JoinHandle<()>,
        closed: CancellationToken,
        handle: Arc<ConnectionHandle>,
    }

    impl Harness {
        fn start<C>(config: ConnectionConfig, context: C, dropped: DropSignal) -> Self
        where
            C: Future<Output = Result<CallContext, RpcError>> + Send + 'static,
        {
            let registry = ConnectionRegistry::new();
            let (handle, output) = registry.register(&config);
            let pipeline = build_procedure_pipeline(router(dropped), &ServerConfig::default());
            let settings = SessionSettings {
                send_timeout: config.send_timeout,
                ..SessionSettings::default()
            };
            let session = Session::new(
                Arc::clone(&handle),
                pipeline,
                Arc::new(ShutdownController::new()),
                settings,
            );
            let closed = session.closed();

            let (input, rx) = mpsc::unbounded_channel::<String>();
            let incoming = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|m| (m, rx)) });
            let task = tokio::spawn(session.run(incoming, context));
            Self {
                input: Some(input),
                output,
                task,
                closed,
                handle,
            }
        }

        fn ready() -> Self {
            Self::start(
                ConnectionConfig::default(),
                async { Ok(CallContext::default()) },
                Arc::new(Mutex::new(None)),
            )
        }

        fn send(&self, value: Value) {
            self.send_text(value.to_string());
        }

        fn send_text(&self, text: String) {
            if let Some(input) = &self.input {
                input.send(text).unwrap();
            }
        }

        async fn recv(&mut self) -> Value {
            match self.output.recv().await {
                Some(OutboundMessage::Text(text)) => serde_json::from_str(&text).unwrap(),
                other => panic!("expected a text message, got {other:?}"),
            }
        }
    }

    fn request(id: u64, method: &str, path: &str, input: Value) -> Value {
        json!({ "id": id, "jsonrpc": "2.0", "method": method, "params": { "path": path, "input": input } })
    }

    fn stop(id: u64) -> Value {
        json!({ "id": id, "method": "subscription.stop" })
    }

    #[tokio::test]
    async fn query_replies_with_one_data_result() {
        let mut h = Harness::ready();
        h.send(request(1, "query", "echo", json!({"a": 1})));
        let reply = h.recv().await;
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["result"], json!({"type": "data", "data": {"a": 1}}));
    }

    #[tokio::test]
    async fn unknown_path_replies_not_found() {
        let mut h = Harness::ready();
        h.send(request(4, "mutation", "missing", Value::Null));
        let reply = h.recv().await;
        assert_eq!(reply["id"], 4);
        assert_eq!(reply["error"]["code"], -32004);
        assert_eq!(reply["error"]["data"]["code"], "NOT_FOUND");
        assert_eq!(reply["error"]["data"]["path"], "missing");
    }

    #[tokio::test]
    async fn subscription_streams_until_exhausted() {
        let mut h = Harness::ready();
        h.send(request(2, "subscription", "count", json!(2)));

        assert_eq!(h.recv().await["result"]["type"], "started");
        assert_eq!(h.recv().await["result"], json!({"type": "data", "data": 0}));
        assert_eq!(h.recv().await["result"], json!({"type": "data", "data": 1}));
        assert_eq!(h.recv().await["result"]["type"], "stopped");
    }

    #[tokio::test]
    async fn stream_error_replies_error_and_ends_subscription() {
        let mut h = Harness::ready();
        h.send(request(3, "subscription", "broken", Value::Null));

        assert_eq!(h.recv().await["result"]["type"], "started");
        assert_eq!(h.recv().await["result"]["data"], "first");
        let reply = h.recv().await;
        assert_eq!(reply["id"], 3);
        assert_eq!(reply["error"]["data"]["code"], "CONFLICT");

        // The id is free again.
        h.send(request(3, "subscription", "count", json!(0)));
        assert_eq!(h.recv().await["result"]["type"], "started");
        assert_eq!(h.recv().await["result"]["type"], "stopped");
    }

    #[tokio::test]
    async fn stop_cancels_and_replies_stopped() {
        let (dropped_tx, dropped_rx) = oneshot::channel();
        let mut h = Harness::start(
            ConnectionConfig::default(),
            async { Ok(CallContext::default()) },
            Arc::new(Mutex::new(Some(dropped_tx))),
        );
        h.send(request(5, "subscription", "forever", Value::Null));
        assert_eq!(h.recv().await["result"]["type"], "started");

        h.send(stop(5));
        let reply = h.recv().await;
        assert_eq!(reply["id"], 5);
        assert_eq!(reply["result"]["type"], "stopped");

        // The stream itself is dropped.
        assert!(dropped_rx.await.is_err());
    }

    #[tokio::test]
    async fn duplicate_subscription_id_stops_old_and_rejects_new() {
        let mut h = Harness::ready();
        h.send(request(6, "subscription", "forever", Value::Null));
        assert_eq!(h.recv().await["result"]["type"], "started");

        h.send(request(6, "subscription", "forever", Value::Null));
        let stopped = h.recv().await;
        assert_eq!(stopped["id"], 6);
        assert_eq!(stopped["result"]["type"], "stopped");
        let rejected = h.recv().await;
        assert_eq!(rejected["id"], 6);
        assert_eq!(rejected["error"]["data"]["code"], "BAD_REQUEST");
        assert!(rejected["error"]["message"].as_str().unwrap().contains("duplicate id"));
    }

    #[tokio::test]
    async fn malformed_batch_member_does_not_abort_siblings() {
        let mut h = Harness::ready();
        h.send(json!([
            { "id": 7, "method": "teleport" },
            request(8, "query", "echo", json!("ok")),
        ]));

        let bad = h.recv().await;
        assert_eq!(bad["id"], 7);
        assert_eq!(bad["error"]["data"]["code"], "BAD_REQUEST");
        let good = h.recv().await;
        assert_eq!(good["id"], 8);
        assert_eq!(good["result"]["data"], "ok");
    }

    #[tokio::test]
    async fn invalid_json_replies_parse_error_without_id() {
        let mut h = Harness::ready();
        h.send_text("{not json".to_string());
        let reply = h.recv().await;
        assert!(reply["id"].is_null());
        assert_eq!(reply["error"]["code"], -32700);

        h.send(request(9, "query", "echo", json!(1)));
        assert_eq!(h.recv().await["id"], 9);
    }

    #[tokio::test]
    async fn messages_wait_for_context() {
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let context = async move {
            let _ = ready_rx.await;
            let mut ctx = CallContext::default();
            ctx.values.insert("user".into(), json!("ada"));
            Ok(ctx)
        };
        let mut h = Harness::start(ConnectionConfig::default(), context, Arc::new(Mutex::new(None)));
        h.send(request(1, "query", "whoami", Value::Null));
        h.send(request(2, "query", "echo", json!(2)));
        tokio::task::yield_now().await;
        assert!(h.output.try_recv().is_err());

        ready_tx.send(()).unwrap();
        let mut replies = vec![h.recv().await, h.recv().await];
        replies.sort_by_key(|r| r["id"].as_u64());
        assert_eq!(replies[0]["result"]["data"], "ada");
        assert_eq!(replies[1]["result"]["data"], 2);
    }

    #[tokio::test]
    async fn context_failure_rejects_buffered_messages_and_closes() {
        let (fail_tx, fail_rx) = oneshot::channel::<()>();
        let context = async move {
            let _ = fail_rx.await;
            Err(RpcError::new(ErrorCode::Unauthorized, "bad token"))
        };
        let mut h = Harness::start(ConnectionConfig::default(), context, Arc::new(Mutex::new(None)));
        h.send(json!([request(1, "query", "echo", Value::Null), request(2, "query", "echo", Value::Null)]));
        tokio::task::yield_now().await;
        fail_tx.send(()).unwrap();

        for expected in [1, 2] {
            let reply = h.recv().await;
            assert_eq!(reply["id"], expected);
            assert_eq!(reply["error"]["data"]["code"], "UNAUTHORIZED");
        }
        assert_eq!(
            h.output.recv().await,
            Some(OutboundMessage::Close(Some("bad token".to_string())))
        );
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn context_failure_without_messages_sends_connection_error() {
        let mut h = Harness::start(
            ConnectionConfig::default(),
            async { Err(RpcError::new(ErrorCode::Forbidden, "no entry")) },
            Arc::new(Mutex::new(None)),
        );
        let reply = h.recv().await;
        assert!(reply["id"].is_null());
        assert_eq!(reply["error"]["data"]["code"], "FORBIDDEN");
        assert!(matches!(h.output.recv().await, Some(OutboundMessage::Close(_))));
    }

    #[tokio::test]
    async fn socket_close_cancels_active_subscriptions() {
        let (dropped_tx, dropped_rx) = oneshot::channel();
        let mut h = Harness::start(
            ConnectionConfig::default(),
            async { Ok(CallContext::default()) },
            Arc::new(Mutex::new(Some(dropped_tx))),
        );
        h.send(request(1, "subscription", "forever", Value::Null));
        assert_eq!(h.recv().await["result"]["type"], "started");

        h.input.take();
        h.task.await.unwrap();
        assert!(h.closed.is_cancelled());
        assert!(dropped_rx.await.is_err());
    }

    #[tokio::test]
    async fn closing_the_connection_handle_ends_the_session() {
        let (dropped_tx, dropped_rx) = oneshot::channel();
        let mut h = Harness::start(
            ConnectionConfig::default(),
            async { Ok(CallContext::default()) },
            Arc::new(Mutex::new(Some(dropped_tx))),
        );
        h.send(request(1, "subscription", "forever", Value::Null));
        assert_eq!(h.recv().await["result"]["type"], "started");

        h.handle.closed.cancel();
        tokio::time::timeout(Duration::from_secs(5), h.task)
            .await
            .expect("session should end")
            .unwrap();
        assert!(dropped_rx.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_consumer_is_disconnected() {
        let config = ConnectionConfig {
            outbound_channel_capacity: 1,
            send_timeout: Duration::from_millis(100),
            ..ConnectionConfig::default()
        };
        let h = Harness::start(config, async { Ok(CallContext::default()) }, Arc::new(Mutex::new(None)));
        h.send(request(1, "subscription", "count", json!(1000)));

        tokio::time::timeout(Duration::from_secs(5), h.task)
            .await
            .expect("session should end")
            .unwrap();
        assert!(h.closed.is_cancelled());
    }
}
