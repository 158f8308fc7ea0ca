use std::time::Duration;

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::{SharedState, Tenant};
use crate::pubsub::PubSubFrame;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
pub struct WsParams {
    /// Only forward frames on this channel, e.g. `agent:<session id>`.
    pub channel: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Tenant(tenant_id): Tenant,
    Query(params): Query<WsParams>,
) -> impl IntoResponse {
    let rx = state.bus.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx, tenant_id, params.channel))
}

async fn handle_socket(
    socket: WebSocket,
    rx: broadcast::Receiver<PubSubFrame>,
    tenant_id: Uuid,
    channel: Option<String>,
) {
    debug!(%tenant_id, channel = channel.as_deref().unwrap_or("*"), "websocket subscribed");
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, rx, tenant_id, channel).await;
    debug!(%tenant_id, "websocket closed");
}

/// Forward the tenant's frames, answer keepalives, and drop the connection
/// once a Ping goes unanswered for [`PONG_TIMEOUT`].
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<PubSubFrame>,
    tenant_id: Uuid,
    channel: Option<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(frame) => {
                        if !frame.visible_to(tenant_id, channel.as_deref()) {
                            continue;
                        }
                        let text = String::from_utf8_lossy(&frame.payload).into_owned();
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(%tenant_id, missed, "websocket subscriber lagged");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
