use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use marginalia_common::protocol::ws::{decode_client_message, PresenceEvent};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::gatekeeper::{Gatekeeper, HandshakeError, HandshakeParams};
use super::lifecycle::{ConnectionState, Lifecycle};
use crate::bridge::RelayBridge;
use crate::error::{ErrorCode, RelayError};
use crate::metrics::RelayMetrics;
use crate::rooms::{Connection, RoomRegistry};

pub const MAX_FRAME_BYTES: usize = 262_144;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(15), timeout: Duration::from_secs(10) }
    }
}

/// Everything a connection task needs, cloned into each one.
#[derive(Clone)]
pub struct WsState {
    pub gatekeeper: Gatekeeper,
    pub registry: Arc<RoomRegistry>,
    pub bridge: RelayBridge,
    pub metrics: Arc<RelayMetrics>,
    pub outbound_queue_capacity: usize,
    pub heartbeat: HeartbeatConfig,
    pub shutdown: watch::Receiver<bool>,
    /// Held by every connection task; the receiving side observes the
    /// channel closing once all of them have finished.
    pub active_sessions: mpsc::Sender<()>,
}

pub fn router(state: WsState) -> Router {
    Router::new().route("/ws", get(ws_upgrade)).with_state(state)
}

pub async fn ws_upgrade(
    Query(params): Query<HandshakeParams>,
    State(state): State<WsState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_frame_size(MAX_FRAME_BYTES)
        .max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(state, params, socket))
}

/// Why a joined session ended, and the close frame to send if any.
struct SessionEnd {
    reason: &'static str,
    close: Option<RelayError>,
}

impl SessionEnd {
    fn quiet(reason: &'static str) -> Self {
        Self { reason, close: None }
    }

    fn closing(reason: &'static str, code: ErrorCode) -> Self {
        Self { reason, close: Some(RelayError::from_code(code)) }
    }
}

async fn handle_socket(state: WsState, params: HandshakeParams, mut socket: WebSocket) {
    let mut lifecycle = Lifecycle::default();

    let shutting_down = *state.shutdown.borrow();
    if shutting_down {
        let _ = socket
            .send(Message::Close(Some(RelayError::from_code(ErrorCode::ShuttingDown).close_frame())))
            .await;
        advance(&mut lifecycle, ConnectionState::Closed);
        return;
    }

    let admission = match state.gatekeeper.admit(&params).await {
        Ok(admission) => admission,
        Err(rejection) => {
            reject(&state, &mut socket, &rejection).await;
            advance(&mut lifecycle, ConnectionState::Closed);
            return;
        }
    };
    advance(&mut lifecycle, ConnectionState::Authorized);

    let (connection, mut outbound) =
        Connection::open(admission.peer, admission.room, state.outbound_queue_capacity);
    let members = state.registry.join(Arc::clone(&connection)).await;
    advance(&mut lifecycle, ConnectionState::Joined);
    state.metrics.record_connection_opened();
    info!(
        room = %connection.room(),
        peer = %connection.peer(),
        connection_id = %connection.id(),
        members = members.len(),
        "connection joined room"
    );

    state
        .bridge
        .publish(connection.room(), &PresenceEvent::Joined { peer: connection.peer().clone() })
        .await;

    let end = run_session(&state, &connection, &mut socket, &mut outbound).await;

    advance(&mut lifecycle, ConnectionState::Closing);
    state.registry.leave(&connection).await;
    drop(outbound);
    state
        .bridge
        .publish(connection.room(), &PresenceEvent::Left { peer: connection.peer().clone() })
        .await;

    if let Some(close) = &end.close {
        let _ = socket.send(Message::Close(Some(close.close_frame()))).await;
    }
    advance(&mut lifecycle, ConnectionState::Closed);
    info!(
        room = %connection.room(),
        peer = %connection.peer(),
        connection_id = %connection.id(),
        reason = end.reason,
        "connection left room"
    );
}

async fn reject(state: &WsState, socket: &mut WebSocket, rejection: &HandshakeError) {
    let code = rejection.code();
    state.metrics.record_handshake_rejection(code.as_str());
    match rejection {
        HandshakeError::Lookup(lookup) => {
            error!(error = %lookup, code = code.as_str(), "document access lookup failed, closing connection");
        }
        _ => {
            info!(reason = %rejection, code = code.as_str(), "handshake rejected");
        }
    }
    let _ = socket.send(Message::Close(Some(rejection.relay_error().close_frame()))).await;
}

async fn run_session(
    state: &WsState,
    connection: &Connection,
    socket: &mut WebSocket,
    outbound: &mut mpsc::Receiver<Utf8Bytes>,
) -> SessionEnd {
    let mut shutdown = state.shutdown.clone();
    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + state.heartbeat.interval,
        state.heartbeat.interval,
    );
    let mut pong_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + state.heartbeat.timeout);
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return SessionEnd::quiet("ping failed");
                }
            }
            _ = wait_until(pong_deadline) => {
                warn!(
                    room = %connection.room(),
                    peer = %connection.peer(),
                    connection_id = %connection.id(),
                    "heartbeat timeout, disconnecting"
                );
                return SessionEnd::closing("heartbeat timeout", ErrorCode::HeartbeatTimeout);
            }
            changed = shutdown.changed() => {
                let stop = changed.is_err() || *shutdown.borrow();
                if stop {
                    return SessionEnd::closing("shutdown", ErrorCode::ShuttingDown);
                }
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    return SessionEnd::quiet("outbound queue closed");
                };
                if socket.send(Message::Text(frame)).await.is_err() {
                    return SessionEnd::quiet("send failed");
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    None | Some(Ok(Message::Close(_))) => return SessionEnd::quiet("client closed"),
                    Some(Ok(Message::Text(raw))) => {
                        if raw.len() > MAX_FRAME_BYTES {
                            return SessionEnd::closing("frame too large", ErrorCode::FrameTooLarge);
                        }
                        handle_client_frame(state, connection, raw.as_str()).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        state.metrics.record_decode_failure("client");
                        warn!(
                            room = %connection.room(),
                            connection_id = %connection.id(),
                            "ignoring binary client frame"
                        );
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_deadline = None;
                    }
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Err(error)) if is_frame_size_violation(&error) => {
                        return SessionEnd::closing("frame too large", ErrorCode::FrameTooLarge);
                    }
                    Some(Err(error)) => {
                        debug!(connection_id = %connection.id(), error = %error, "websocket transport error");
                        return SessionEnd::quiet("transport error");
                    }
                }
            }
        }
    }
}

async fn handle_client_frame(state: &WsState, connection: &Connection, raw: &str) {
    match decode_client_message(raw) {
        Ok(message) => {
            let event = message.into_event(connection.peer().clone());
            state.bridge.publish(connection.room(), &event).await;
        }
        Err(error) => {
            state.metrics.record_decode_failure("client");
            warn!(
                room = %connection.room(),
                peer = %connection.peer(),
                connection_id = %connection.id(),
                error = %error,
                "dropping undecodable client frame"
            );
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn advance(lifecycle: &mut Lifecycle, next: ConnectionState) {
    if let Err(invalid) = lifecycle.advance(next) {
        error!(error = %invalid, "connection lifecycle violated");
    }
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}
