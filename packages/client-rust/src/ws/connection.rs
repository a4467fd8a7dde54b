//! Duplex connection state machine.
//!
//! A background driver task owns the socket lifecycle:
//!
//! ```text
//! Idle ──(work arrives, lazy only)──▶ Connecting ──▶ Open ──(socket lost)──▶ Reconnecting ──▶ Open ...
//!   ▲                                                 │
//!   └──────────────(idle for close_ms, lazy only)─────┘
//! any state ──(close / last handle dropped)──▶ Closing ──▶ Closed
//! ```
//!
//! Queries and mutations sent before the socket opens are queued and
//! flushed in order on open. Calls that were on the wire when the socket
//! dropped fail with [`ClientError::ConnectionClosed`]. Subscriptions
//! survive reconnects: they are re-sent on every open with their original
//! id, and a repeated `started` acknowledgement is not passed on.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use skein_core::messages::{ClientMessage, RequestId, ResultEnvelope, ServerMessage};
use skein_core::{Observable, Operation, OperationKind, RpcError, Subscriber, Teardown};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::config::WsClientConfig;
use super::transport::{CloseInfo, Connector, Socket, SocketEvent, TungsteniteConnector};
use crate::error::ClientError;
use crate::link::{OperationObservable, OperationResult};

type ResultSubscriber = Subscriber<OperationResult, ClientError>;

/// Observable lifecycle of a [`WsConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Lazy connection with nothing to do.
    Idle,
    Connecting,
    Open,
    /// The socket dropped; waiting to try again.
    Reconnecting,
    Closing,
    Closed,
}

// ---------------------------------------------------------------------------
// Registries
// ---------------------------------------------------------------------------

/// A query or mutation awaiting its single response.
struct PendingCall {
    registration: u64,
    subscriber: ResultSubscriber,
    message: String,
    /// Written to the current socket, as opposed to waiting in the queue.
    sent: bool,
    timer: Option<AbortHandle>,
}

impl PendingCall {
    fn disarm(&self) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
    }
}

struct ActiveSubscription {
    registration: u64,
    subscriber: ResultSubscriber,
    message: String,
    started: bool,
}

struct Shared {
    status: ConnectionState,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    pending: HashMap<RequestId, PendingCall>,
    subscriptions: HashMap<RequestId, ActiveSubscription>,
    /// Unsent calls, in submission order.
    queue: VecDeque<RequestId>,
    next_registration: u64,
    last_activity: Instant,
}

impl Shared {
    fn has_work(&self) -> bool {
        !self.pending.is_empty() || !self.subscriptions.is_empty()
    }

    fn registration(&mut self) -> u64 {
        self.next_registration += 1;
        self.next_registration
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Writes `message` if the socket is open.
    fn try_send(&self, message: &str) -> bool {
        match (&self.outgoing, self.status) {
            (Some(tx), ConnectionState::Open) => tx.send(message.to_string()).is_ok(),
            _ => false,
        }
    }

    fn ensure_unused(&self, id: RequestId) -> Result<(), ClientError> {
        if self.pending.contains_key(&id) || self.subscriptions.contains_key(&id) {
            return Err(ClientError::Protocol(format!("request id {id} is already in use")));
        }
        Ok(())
    }
}

/// What to tell a caller once the registry lock is released.
enum Delivery {
    Resolve(ResultSubscriber, Value),
    Emit(ResultSubscriber, OperationResult),
    Stop(ResultSubscriber),
    Fail(ResultSubscriber, ClientError),
}

impl Delivery {
    fn deliver(self) {
        match self {
            Self::Resolve(subscriber, data) => {
                subscriber.next(OperationResult::Data(data));
                subscriber.complete();
            }
            Self::Emit(subscriber, event) => subscriber.next(event),
            Self::Stop(subscriber) => {
                subscriber.next(OperationResult::Stopped);
                subscriber.complete();
            }
            Self::Fail(subscriber, err) => subscriber.error(err),
        }
    }
}

/// How a socket session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Socket lost or refused; back off before retrying.
    Dropped,
    /// The server asked for a fresh connection.
    Reconnect,
    /// Lazy connection went idle.
    Idle,
    Shutdown,
}

// ---------------------------------------------------------------------------
// ConnectionInner
// ---------------------------------------------------------------------------

struct ConnectionInner {
    config: WsClientConfig,
    connector: Arc<dyn Connector>,
    shared: Mutex<Shared>,
    state: watch::Sender<ConnectionState>,
    wake: Notify,
    closing: CancellationToken,
}

impl ConnectionInner {
    fn set_state(&self, status: ConnectionState) {
        self.shared.lock().status = status;
        self.state.send_replace(status);
    }

    async fn drive(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        let mut opened_before = false;

        loop {
            if self.closing.is_cancelled() {
                break;
            }
            if self.config.lazy.is_some() && !self.shared.lock().has_work() {
                self.set_state(ConnectionState::Idle);
                tokio::select! {
                    () = self.wake.notified() => continue,
                    () = self.closing.cancelled() => break,
                }
            }

            self.set_state(if opened_before {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            });
            let connected = tokio::select! {
                result = self.connector.connect() => result,
                () = self.closing.cancelled() => break,
            };

            let end = match connected {
                Ok(socket) => {
                    attempt = 0;
                    opened_before = true;
                    self.serve(socket).await
                }
                Err(err) => {
                    tracing::warn!(url = %self.config.url, attempt, error = %err, "connect failed");
                    SessionEnd::Dropped
                }
            };

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Idle => opened_before = false,
                SessionEnd::Reconnect => {}
                SessionEnd::Dropped => {
                    let delay = (self.config.retry_delay_ms)(attempt);
                    attempt = attempt.saturating_add(1);
                    self.set_state(ConnectionState::Reconnecting);
                    tokio::select! {
                        () = tokio::time::sleep(Duration::from_millis(delay)) => {}
                        () = self.closing.cancelled() => break,
                    }
                }
            }
        }

        self.finish();
    }

    async fn serve(&self, socket: Socket) -> SessionEnd {
        let Socket {
            outgoing,
            mut incoming,
        } = socket;
        self.attach(outgoing);

        let idle_after = self
            .config
            .lazy
            .map(|lazy| Duration::from_millis(lazy.close_ms.max(1)));
        let period = idle_after.unwrap_or(Duration::from_secs(3600));
        let mut idle_check = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                event = incoming.recv() => match event {
                    Some(SocketEvent::Message(text)) => {
                        if self.handle_text(&text) {
                            tracing::info!(url = %self.config.url, "server requested reconnect");
                            self.detach(&CloseInfo::new(None, "reconnect requested"));
                            return SessionEnd::Reconnect;
                        }
                    }
                    Some(SocketEvent::Closed(info)) => {
                        tracing::warn!(url = %self.config.url, code = ?info.code, reason = %info.reason, "connection lost");
                        self.detach(&info);
                        return SessionEnd::Dropped;
                    }
                    None => {
                        self.detach(&CloseInfo::new(None, "socket dropped"));
                        return SessionEnd::Dropped;
                    }
                },
                _ = idle_check.tick(), if idle_after.is_some() => {
                    if self.is_idle(period) {
                        tracing::debug!(url = %self.config.url, "closing idle connection");
                        self.detach(&CloseInfo::new(Some(1000), "idle"));
                        return SessionEnd::Idle;
                    }
                }
                () = self.closing.cancelled() => {
                    self.detach(&CloseInfo::new(Some(1000), "closed by client"));
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    /// Socket is up: flush queued calls, then resume subscriptions.
    fn attach(&self, outgoing: mpsc::UnboundedSender<String>) {
        {
            let mut shared = self.shared.lock();
            let shared = &mut *shared;
            shared.status = ConnectionState::Open;
            shared.touch();

            while let Some(id) = shared.queue.pop_front() {
                if let Some(call) = shared.pending.get_mut(&id) {
                    if !call.sent {
                        call.sent = outgoing.send(call.message.clone()).is_ok();
                    }
                }
            }
            for subscription in shared.subscriptions.values() {
                let _ = outgoing.send(subscription.message.clone());
            }
            shared.outgoing = Some(outgoing);
        }
        self.state.send_replace(ConnectionState::Open);
        tracing::info!(url = %self.config.url, "connection open");
        if let Some(hook) = &self.config.on_open {
            hook();
        }
    }

    /// Socket is gone: fail calls that were on the wire. Unsent calls and
    /// subscriptions wait for the next socket.
    fn detach(&self, info: &CloseInfo) {
        let lost: Vec<PendingCall> = {
            let mut shared = self.shared.lock();
            shared.outgoing = None;
            let sent: Vec<RequestId> = shared
                .pending
                .iter()
                .filter(|(_, call)| call.sent)
                .map(|(id, _)| *id)
                .collect();
            sent.iter()
                .filter_map(|id| shared.pending.remove(id))
                .collect()
        };
        for call in lost {
            call.disarm();
            call.subscriber.error(ClientError::ConnectionClosed);
        }
        if let Some(hook) = &self.config.on_close {
            hook(info);
        }
    }

    fn is_idle(&self, idle_after: Duration) -> bool {
        let shared = self.shared.lock();
        !shared.has_work() && shared.last_activity.elapsed() >= idle_after
    }

    /// Terminal cleanup once the driver stops.
    fn finish(&self) {
        self.set_state(ConnectionState::Closing);
        let (pending, subscriptions) = {
            let mut shared = self.shared.lock();
            shared.outgoing = None;
            shared.queue.clear();
            (
                std::mem::take(&mut shared.pending),
                std::mem::take(&mut shared.subscriptions),
            )
        };
        for call in pending.into_values() {
            call.disarm();
            call.subscriber.error(ClientError::ConnectionClosed);
        }
        for subscription in subscriptions.into_values() {
            subscription.subscriber.complete();
        }
        self.set_state(ConnectionState::Closed);
        tracing::debug!(url = %self.config.url, "connection closed");
    }

    // -- inbound -------------------------------------------------------------

    /// Routes one text frame. Returns true when the server asked for a
    /// reconnect.
    fn handle_text(&self, text: &str) -> bool {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "dropping unparseable message");
                return false;
            }
        };
        let messages = match value {
            Value::Array(items) => items,
            single => vec![single],
        };

        let mut reconnect = false;
        for raw in messages {
            match serde_json::from_value::<ServerMessage>(raw) {
                Ok(ServerMessage::Notification { .. }) => reconnect = true,
                Ok(ServerMessage::Result { id, result, .. }) => self.route(id, Ok(result)),
                Ok(ServerMessage::Error {
                    id: Some(id),
                    error,
                    ..
                }) => self.route(id, Err(RpcError::from_shape(error))),
                Ok(ServerMessage::Error { id: None, error, .. }) => {
                    self.fail_pending(&RpcError::from_shape(error));
                }
                Err(err) => tracing::warn!(error = %err, "dropping unrecognized message"),
            }
        }
        reconnect
    }

    fn route(&self, id: RequestId, outcome: Result<ResultEnvelope, RpcError>) {
        let delivery = {
            let mut shared = self.shared.lock();
            shared.touch();
            if shared.pending.contains_key(&id) {
                match outcome {
                    Ok(ResultEnvelope::Data { data }) => shared.pending.remove(&id).map(|call| {
                        call.disarm();
                        Delivery::Resolve(call.subscriber, data)
                    }),
                    Err(err) => shared.pending.remove(&id).map(|call| {
                        call.disarm();
                        Delivery::Fail(call.subscriber, ClientError::Remote(err))
                    }),
                    Ok(ResultEnvelope::Started | ResultEnvelope::Stopped) => None,
                }
            } else if let Some(subscription) = shared.subscriptions.get_mut(&id) {
                match outcome {
                    Ok(ResultEnvelope::Started) if subscription.started => None,
                    Ok(ResultEnvelope::Started) => {
                        subscription.started = true;
                        Some(Delivery::Emit(
                            subscription.subscriber.clone(),
                            OperationResult::Started,
                        ))
                    }
                    Ok(ResultEnvelope::Data { data }) => Some(Delivery::Emit(
                        subscription.subscriber.clone(),
                        OperationResult::Data(data),
                    )),
                    Ok(ResultEnvelope::Stopped) => shared.subscriptions.remove(&id).map(|sub| {
                        send_stop(&shared, id);
                        Delivery::Stop(sub.subscriber)
                    }),
                    Err(err) => shared
                        .subscriptions
                        .remove(&id)
                        .map(|sub| Delivery::Fail(sub.subscriber, ClientError::Remote(err))),
                }
            } else {
                tracing::debug!(id, "response for unknown request");
                None
            }
        };
        if let Some(delivery) = delivery {
            delivery.deliver();
        }
    }

    /// Connection-level error: every call on the wire fails with it.
    fn fail_pending(&self, err: &RpcError) {
        tracing::warn!(error = %err, "connection-level error");
        let failed: Vec<PendingCall> = {
            let mut shared = self.shared.lock();
            let ids: Vec<RequestId> = shared
                .pending
                .iter()
                .filter(|(_, call)| call.sent)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| shared.pending.remove(id)).collect()
        };
        for call in failed {
            call.disarm();
            call.subscriber.error(ClientError::Remote(err.clone()));
        }
    }

    // -- outbound ------------------------------------------------------------

    fn register_call(
        self: &Arc<Self>,
        op: &Operation,
        subscriber: ResultSubscriber,
    ) -> Result<u64, ClientError> {
        let message = serde_json::to_string(&ClientMessage::request(op))
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        let id = op.id();
        let registration = {
            let mut shared = self.shared.lock();
            if self.closing.is_cancelled() {
                return Err(ClientError::ConnectionClosed);
            }
            shared.ensure_unused(id)?;
            let registration = shared.registration();
            let sent = shared.try_send(&message);
            if !sent {
                shared.queue.push_back(id);
            }
            let timer = self.config.request_timeout_ms.map(|timeout_ms| {
                spawn_timeout(Arc::downgrade(self), id, registration, timeout_ms).abort_handle()
            });
            shared.pending.insert(
                id,
                PendingCall {
                    registration,
                    subscriber,
                    message,
                    sent,
                    timer,
                },
            );
            shared.touch();
            registration
        };
        self.wake.notify_one();
        Ok(registration)
    }

    fn cancel_call(&self, id: RequestId, registration: u64) {
        let mut shared = self.shared.lock();
        if shared
            .pending
            .get(&id)
            .is_some_and(|call| call.registration == registration)
        {
            if let Some(call) = shared.pending.remove(&id) {
                call.disarm();
            }
            shared.queue.retain(|queued| *queued != id);
            shared.touch();
        }
    }

    fn expire(&self, id: RequestId, registration: u64, timeout_ms: u64) {
        let expired = {
            let mut shared = self.shared.lock();
            if shared
                .pending
                .get(&id)
                .is_some_and(|call| call.registration == registration)
            {
                shared.queue.retain(|queued| *queued != id);
                shared.pending.remove(&id)
            } else {
                None
            }
        };
        if let Some(call) = expired {
            tracing::debug!(id, timeout_ms, "request timed out");
            call.subscriber.error(ClientError::Timeout { timeout_ms });
        }
    }

    fn register_subscription(
        &self,
        op: &Operation,
        subscriber: ResultSubscriber,
    ) -> Result<u64, ClientError> {
        let message = serde_json::to_string(&ClientMessage::request(op))
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        let id = op.id();
        let registration = {
            let mut shared = self.shared.lock();
            if self.closing.is_cancelled() {
                return Err(ClientError::ConnectionClosed);
            }
            shared.ensure_unused(id)?;
            let registration = shared.registration();
            // Not queued: every open re-sends all registered subscriptions.
            shared.try_send(&message);
            shared.subscriptions.insert(
                id,
                ActiveSubscription {
                    registration,
                    subscriber,
                    message,
                    started: false,
                },
            );
            shared.touch();
            registration
        };
        self.wake.notify_one();
        Ok(registration)
    }

    fn cancel_subscription(&self, id: RequestId, registration: u64) {
        let mut shared = self.shared.lock();
        if shared
            .subscriptions
            .get(&id)
            .is_some_and(|sub| sub.registration == registration)
        {
            shared.subscriptions.remove(&id);
            send_stop(&shared, id);
            shared.touch();
        }
    }
}

fn send_stop(shared: &Shared, id: RequestId) {
    if let Ok(message) = serde_json::to_string(&ClientMessage::stop(id)) {
        shared.try_send(&message);
    }
}

fn spawn_timeout(
    inner: Weak<ConnectionInner>,
    id: RequestId,
    registration: u64,
    timeout_ms: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
        if let Some(inner) = inner.upgrade() {
            inner.expire(id, registration, timeout_ms);
        }
    })
}

/// Fails `subscriber` with [`ClientError::Aborted`] once the operation's
/// cancellation signal fires.
fn watch_signal(op: &Operation, subscriber: &ResultSubscriber) -> Option<JoinHandle<()>> {
    let signal = op.signal()?.clone();
    let subscriber = subscriber.clone();
    Some(tokio::spawn(async move {
        signal.cancelled().await;
        subscriber.error(ClientError::Aborted);
    }))
}

// ---------------------------------------------------------------------------
// WsConnection
// ---------------------------------------------------------------------------

/// Handle to a duplex connection. Clones share the connection; when the
/// last handle is dropped the connection closes.
#[derive(Clone)]
pub struct WsConnection {
    inner: Arc<ConnectionInner>,
    _close_on_drop: Arc<DropGuard>,
}

impl WsConnection {
    /// Starts the connection driver. Must be called inside a tokio runtime.
    pub fn new(config: WsClientConfig, connector: impl Connector) -> Self {
        let closing = CancellationToken::new();
        let initial = if config.lazy.is_some() {
            ConnectionState::Idle
        } else {
            ConnectionState::Connecting
        };
        let inner = Arc::new(ConnectionInner {
            config,
            connector: Arc::new(connector),
            shared: Mutex::new(Shared {
                status: initial,
                outgoing: None,
                pending: HashMap::new(),
                subscriptions: HashMap::new(),
                queue: VecDeque::new(),
                next_registration: 0,
                last_activity: Instant::now(),
            }),
            state: watch::channel(initial).0,
            wake: Notify::new(),
            closing: closing.clone(),
        });
        tokio::spawn(Arc::clone(&inner).drive());
        Self {
            inner,
            _close_on_drop: Arc::new(closing.drop_guard()),
        }
    }

    /// Connects to `config.url` over WebSocket.
    pub fn connect(config: WsClientConfig) -> Self {
        let connector = TungsteniteConnector::new(config.url.clone())
            .with_connect_timeout(Duration::from_millis(config.connect_timeout_ms));
        Self::new(config, connector)
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state transition.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Waits until the connection reaches `state`.
    pub async fn wait_for(&self, state: ConnectionState) {
        let mut rx = self.watch_state();
        let _ = rx.wait_for(|current| *current == state).await;
    }

    /// Calls awaiting a response, including queued ones.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.shared.lock().pending.len()
    }

    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.inner.shared.lock().subscriptions.len()
    }

    /// Stops reconnecting, fails pending calls and completes subscriptions.
    pub fn close(&self) {
        self.inner.closing.cancel();
    }

    /// Sends a query or mutation and resolves with its single response.
    #[must_use]
    pub fn request(&self, op: Operation) -> OperationObservable {
        let weak = Arc::downgrade(&self.inner);
        Observable::new(move |subscriber| {
            let Some(inner) = weak.upgrade() else {
                subscriber.error(ClientError::ConnectionClosed);
                return Teardown::noop();
            };
            let watcher = watch_signal(&op, &subscriber);
            match inner.register_call(&op, subscriber.clone()) {
                Ok(registration) => {
                    let weak = Weak::clone(&weak);
                    let id = op.id();
                    Teardown::new(move || {
                        if let Some(watcher) = watcher {
                            watcher.abort();
                        }
                        if let Some(inner) = weak.upgrade() {
                            inner.cancel_call(id, registration);
                        }
                    })
                }
                Err(err) => {
                    if let Some(watcher) = watcher {
                        watcher.abort();
                    }
                    subscriber.error(err);
                    Teardown::noop()
                }
            }
        })
    }

    /// Starts a subscription. Unsubscribing sends `subscription.stop`.
    #[must_use]
    pub fn subscription(&self, op: Operation) -> OperationObservable {
        let weak = Arc::downgrade(&self.inner);
        Observable::new(move |subscriber| {
            let Some(inner) = weak.upgrade() else {
                subscriber.error(ClientError::ConnectionClosed);
                return Teardown::noop();
            };
            let watcher = watch_signal(&op, &subscriber);
            match inner.register_subscription(&op, subscriber.clone()) {
                Ok(registration) => {
                    let weak = Weak::clone(&weak);
                    let id = op.id();
                    Teardown::new(move || {
                        if let Some(watcher) = watcher {
                            watcher.abort();
                        }
                        if let Some(inner) = weak.upgrade() {
                            inner.cancel_subscription(id, registration);
                        }
                    })
                }
                Err(err) => {
                    if let Some(watcher) = watcher {
                        watcher.abort();
                    }
                    subscriber.error(err);
                    Teardown::noop()
                }
            }
        })
    }

    /// Routes `op` by kind.
    #[must_use]
    pub fn execute(&self, op: Operation) -> OperationObservable {
        match op.kind() {
            OperationKind::Subscription => self.subscription(op),
            OperationKind::Query | OperationKind::Mutation => self.request(op),
        }
    }
}
