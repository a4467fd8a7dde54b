//! WebSocket upgrade handler bridging axum sockets to a duplex [`Session`].

use std::collections::HashMap;
use std::future::ready;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::header::USER_AGENT;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::AppState;
use crate::network::connection::OutboundMessage;
use crate::network::session::{Session, SessionSettings};
use crate::service::{create_context, ContextRequest, TransportKind};

/// Upgrades an HTTP connection to a duplex WebSocket session.
///
/// Request headers and query parameters are handed to the context factory.
/// Answers 503 once the server is draining.
pub async fn ws_upgrade_handler(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.shutdown.is_accepting() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let connection = &state.config.connection;
    let request = ContextRequest {
        transport: TransportKind::WebSocket,
        connection_id: None,
        headers,
        query,
    };
    ws.max_message_size(connection.max_message_size)
        .write_buffer_size(connection.ws_write_buffer_size)
        .max_write_buffer_size(connection.ws_max_write_buffer_size)
        .on_upgrade(move |socket| handle_socket(socket, state, request))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState, mut request: ContextRequest) {
    let (handle, outbound) = state.registry.register(&state.config.connection);
    request.connection_id = Some(handle.id.0);
    let user_agent = request.headers.get(USER_AGENT).and_then(|v| v.to_str().ok());
    info!(connection_id = %handle.id, user_agent, "duplex connection opened");

    let (sink, stream) = socket.split();
    tokio::spawn(write_loop(sink, outbound));

    let incoming = stream
        .take_while(|frame| ready(matches!(frame, Ok(message) if !matches!(message, Message::Close(_)))))
        .filter_map(|frame| {
            ready(match frame {
                Ok(Message::Text(text)) => Some(text.as_str().to_owned()),
                _ => None,
            })
        });

    let settings = SessionSettings {
        send_timeout: state.config.connection.send_timeout,
        call_timeout_ms: state.server.default_operation_timeout_ms,
    };
    let session = Session::new(
        Arc::clone(&handle),
        state.pipeline.clone(),
        Arc::clone(&state.shutdown),
        settings,
    );
    let contexts = Arc::clone(&state.contexts);
    let context = async move { create_context(contexts.as_ref(), &request).await };

    session.run(incoming, context).await;

    state.registry.remove(handle.id);
    info!(connection_id = %handle.id, "duplex connection closed");
}

/// Drains the outbound channel into the socket until it closes.
async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut outbound: mpsc::Receiver<OutboundMessage>) {
    while let Some(message) = outbound.recv().await {
        match message {
            OutboundMessage::Text(text) => {
                if let Err(err) = sink.send(Message::Text(text.into())).await {
                    debug!(error = %err, "socket write failed");
                    break;
                }
            }
            OutboundMessage::Close(reason) => {
                let frame = CloseFrame {
                    code: close_code::NORMAL,
                    reason: reason.unwrap_or_default().into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}
