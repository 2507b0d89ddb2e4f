//! End-user and operator WebSocket endpoints.
//!
//! Each socket is split into a writer task draining the connection's queue
//! in the registry (plus periodic pings) and a reader task feeding inbound
//! frames to the session hub. Whichever finishes first ends the connection.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use desk_core::{ConnectionId, InboundMessage, SessionId, UserFrame};

use crate::api::ApiError;
use crate::connections::Channel;
use crate::server::AppState;

pub const UNAVAILABLE_NOTICE: &str =
    "We couldn't take that message right now. Please try again in a moment.";

#[derive(Debug, Default, Deserialize)]
pub struct OperatorParams {
    pub operator: Option<String>,
}

/// `GET /ws/{session_id}`
pub async fn user_socket(
    ws: WebSocketUpgrade,
    Path(session_id): Path<SessionId>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    state.hub.open(&session_id).await?;
    if let Err(e) = state.hub.store().reopen(&session_id) {
        error!(session_id = %session_id, error = %e, "failed to clear ended_at on reconnect");
    }
    Ok(ws.on_upgrade(move |socket| serve(socket, session_id, Channel::User, state)))
}

/// `GET /operator/{session_id}?operator=name`
pub async fn operator_socket(
    ws: WebSocketUpgrade,
    Path(session_id): Path<SessionId>,
    Query(params): Query<OperatorParams>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    state.hub.open(&session_id).await?;
    if let Some(name) = params.operator.as_deref().filter(|n| !n.trim().is_empty()) {
        state.hub.store().assign_operator(&session_id, name.trim())?;
    }
    Ok(ws.on_upgrade(move |socket| serve(socket, session_id, Channel::Operator, state)))
}

async fn serve(socket: WebSocket, session_id: SessionId, channel: Channel, state: AppState) {
    let connections = Arc::clone(state.hub.connections());
    let (conn_id, rx) = connections.bind(&session_id, channel);
    info!(session_id = %session_id, channel = %channel, connection_id = %conn_id, "connected");

    let (ws_tx, ws_rx) = socket.split();
    let mut writer = tokio::spawn(write_loop(
        ws_tx,
        rx,
        state.config.heartbeat_interval(),
        conn_id.clone(),
    ));
    let mut reader = tokio::spawn(read_loop(
        ws_rx,
        session_id.clone(),
        channel,
        state.clone(),
        state.config.idle_timeout(),
    ));

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
        _ = state.shutdown.cancelled() => {
            reader.abort();
            writer.abort();
        }
    }

    // A replaced connection no longer owns the slot; its exit changes nothing.
    if connections.unbind(&session_id, channel, &conn_id) && channel == Channel::User {
        if let Err(e) = state.hub.store().mark_ended(&session_id) {
            error!(session_id = %session_id, error = %e, "failed to record session end");
        }
    }
    info!(session_id = %session_id, channel = %channel, connection_id = %conn_id, "disconnected");
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<String>,
    heartbeat: Duration,
    conn_id: ConnectionId,
) {
    let mut ping_interval = tokio::time::interval(heartbeat);
    ping_interval.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(text) => {
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                // Replaced by a newer connection.
                None => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            _ = ping_interval.tick() => {
                if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                    break;
                }
                tracing::trace!(connection_id = %conn_id, "sent ping");
            }
        }
    }
}

async fn read_loop(
    mut ws_rx: SplitStream<WebSocket>,
    session_id: SessionId,
    channel: Channel,
    state: AppState,
    idle_timeout: Duration,
) {
    loop {
        let msg = match tokio::time::timeout(idle_timeout, ws_rx.next()).await {
            Err(_) => {
                info!(session_id = %session_id, channel = %channel, "no traffic within idle timeout, closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(session_id = %session_id, channel = %channel, error = %e, "read error");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };
        match msg {
            WsMessage::Text(text) => handle_text(&state, &session_id, channel, text.as_str()).await,
            WsMessage::Close(_) => break,
            // Pongs only keep the idle timer fresh; axum answers pings.
            _ => {}
        }
    }
}

async fn handle_text(state: &AppState, session_id: &SessionId, channel: Channel, raw: &str) {
    let connections = state.hub.connections();
    let inbound = match InboundMessage::parse(raw) {
        Ok(inbound) => inbound,
        Err(e) => {
            debug!(session_id = %session_id, channel = %channel, error = %e, "rejected inbound frame");
            connections.send(session_id, channel, &UserFrame::system(format!("Invalid message: {e}")));
            return;
        }
    };

    let result = match channel {
        Channel::User => state.hub.user_message(session_id, inbound.message).await,
        Channel::Operator => state.hub.operator_message(session_id, inbound.message).await,
    };
    if let Err(e) = result {
        warn!(session_id = %session_id, channel = %channel, error = %e, "inbound message not accepted");
        connections.send(session_id, channel, &UserFrame::system(UNAVAILABLE_NOTICE));
    }
}
