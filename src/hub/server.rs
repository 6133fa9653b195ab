//! The hub's HTTP/WebSocket surface.
//!
//! Routes:
//! - `GET /ws` - subscriber WebSocket; first frame out is `hello` with
//!   the assigned connection id
//! - `POST /broadcast` - engine-side ingress for committed change events
//! - `GET /healthz` - liveness probe
//!
//! Each accepted socket gets one task that interleaves three concerns:
//! draining the connection's outbound queue, handling inbound frames, and
//! protocol-level liveness (30 s pings, two missed pongs or 60 s of
//! silence close the connection, after a graceful close frame).

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::broadcast::ChangeEvent;
use crate::error::{Result, StoreError};

use super::{ClientFrame, Hub, ServerFrame};

/// Budget for getting the `hello` frame onto the wire.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Liveness ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Connections silent for this long are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Missed pongs tolerated before close.
const MAX_MISSED_PONGS: u32 = 2;

/// Builds the hub router over shared hub state.
pub fn router(hub: Hub) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .route("/broadcast", post(broadcast_handler))
        .with_state(hub)
}

/// Binds and serves the hub until the process ends.
#[instrument(skip(hub))]
pub async fn serve(addr: SocketAddr, hub: Hub) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| StoreError::io(format!("bind {}: {}", addr, e)))?;
    info!(addr = %addr, "Hub listening");
    axum::serve(listener, router(hub))
        .await
        .map_err(|e| StoreError::io(format!("hub server: {}", e)))
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "service": "elementstore-hub"}))
}

async fn broadcast_handler(State(hub): State<Hub>, Json(event): Json<ChangeEvent>) -> StatusCode {
    hub.dispatch(&event);
    StatusCode::ACCEPTED
}

async fn ws_handler(State(hub): State<Hub>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| connection(socket, hub))
}

/// Runs one connection from `hello` to graceful close.
async fn connection(socket: WebSocket, hub: Hub) {
    let (connection_id, queue) = hub.register();
    let (mut sink, mut stream) = socket.split();

    let hello = ServerFrame::Hello {
        connection_id: connection_id.clone(),
    };
    let hello_sent = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        sink.send(Message::Text(encode(&hello).into())),
    )
    .await;
    if !matches!(hello_sent, Ok(Ok(()))) {
        warn!(connection = %connection_id, "Handshake timed out");
        hub.unregister(&connection_id);
        return;
    }

    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_timer.reset();
    let mut missed_pongs: u32 = 0;
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            // Outbound: drain whatever dispatch queued for us.
            _ = queue.wait() => {
                let mut failed = false;
                for frame in queue.drain() {
                    if sink.send(Message::Text(encode(&frame).into())).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed || queue.is_closed() {
                    break;
                }
            }

            // Inbound: client frames and protocol messages.
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        last_inbound = Instant::now();
                        match serde_json::from_str::<ClientFrame>(text.as_str()) {
                            Ok(frame) => {
                                if let Some(reply) = hub.handle_frame(&connection_id, frame) {
                                    if sink
                                        .send(Message::Text(encode(&reply).into()))
                                        .await
                                        .is_err()
                                    {
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                debug!(connection = %connection_id, error = %e,
                                       "Ignoring malformed client frame");
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_inbound = Instant::now();
                        missed_pongs = 0;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        last_inbound = Instant::now();
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(connection = %connection_id, error = %e, "Socket error");
                        break;
                    }
                }
            }

            // Liveness: ping, count silence, enforce the idle timeout.
            _ = ping_timer.tick() => {
                if last_inbound.elapsed() > IDLE_TIMEOUT {
                    debug!(connection = %connection_id, "Idle timeout");
                    break;
                }
                if missed_pongs >= MAX_MISSED_PONGS {
                    debug!(connection = %connection_id, "Missed pongs, closing");
                    break;
                }
                missed_pongs += 1;
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Graceful close: flush pending frames, then the close frame.
    for frame in queue.drain() {
        let _ = sink.send(Message::Text(encode(&frame).into())).await;
    }
    let _ = sink.send(Message::Close(None)).await;
    hub.unregister(&connection_id);
}

fn encode(frame: &ServerFrame) -> String {
    serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string())
}
