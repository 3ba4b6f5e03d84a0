//! Device-facing ingress: streaming subscriptions and acknowledgement
//! RPCs.
//!
//! A device opens one WebSocket per stream kind; outbound frames are
//! forwarded from its session sink as JSON text frames. Acknowledgements
//! arrive as unary POSTs and are always answered with a receipt, even
//! when the ack no longer matches a waiter.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use marquee_proto::{AckReceipt, CommandAck, ContentAck};

use crate::dispatch::{Acknowledgement, Dispatcher, Frame};
use crate::session::SessionReceiver;
use crate::state::HubState;

#[derive(Debug, Deserialize)]
pub struct ContentSubscribeQuery {
    #[serde(default)]
    pub last_received_delivery_id: Option<String>,
}

pub async fn subscribe_commands(
    ws: WebSocketUpgrade,
    Path(device_id): Path<String>,
    State(state): State<HubState>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let session = state.commands.attach(&device_id, None);
        run_device_socket(socket, state.commands.clone(), session).await;
    })
}

pub async fn subscribe_content(
    ws: WebSocketUpgrade,
    Path(device_id): Path<String>,
    Query(query): Query<ContentSubscribeQuery>,
    State(state): State<HubState>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let session = state
            .content
            .attach(&device_id, query.last_received_delivery_id);
        run_device_socket(socket, state.content.clone(), session).await;
    })
}

pub async fn ack_command(
    State(state): State<HubState>,
    Path(device_id): Path<String>,
    Json(ack): Json<CommandAck>,
) -> Json<AckReceipt> {
    state.command_acks.deliver(&device_id, ack);
    Json(AckReceipt::accepted())
}

pub async fn ack_content(
    State(state): State<HubState>,
    Path(device_id): Path<String>,
    Json(ack): Json<ContentAck>,
) -> Json<AckReceipt> {
    state.content_acks.deliver(&device_id, ack);
    Json(AckReceipt::accepted())
}

/// Forward session frames onto the socket until either side ends. The
/// epoch-guarded detach at the bottom means a replaced session's cleanup
/// never tears down its replacement.
async fn run_device_socket<F, A>(
    socket: WebSocket,
    dispatcher: Dispatcher<F, A>,
    mut session: SessionReceiver<F>,
) where
    F: Frame + Serialize,
    A: Acknowledgement,
{
    let device_id = session.device_id.clone();
    let epoch = session.epoch;
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            changed = session.closed.changed() => {
                if changed.is_err() || *session.closed.borrow() {
                    // Replaced or detached: end the stream cleanly.
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
            frame = session.frames.recv() => {
                let Some(frame) = frame else {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                };
                match serde_json::to_string(&frame) {
                    Ok(json) => {
                        if ws_tx.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(device_id, error = %err, "failed to encode outbound frame");
                    }
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        dispatcher.registry().mark_activity(&device_id);
                    }
                    Some(Ok(_)) => {
                        debug!(device_id, "ignoring inbound frame on subscribe stream");
                    }
                    Some(Err(err)) => {
                        warn!(device_id, error = %err, "device socket error");
                        break;
                    }
                }
            }
        }
    }

    dispatcher.detach_session(&device_id, epoch);
    debug!(
        kind = dispatcher.kind().as_str(),
        device_id, epoch, "device socket closed"
    );
}
