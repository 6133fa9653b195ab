//! Reconnecting hub subscriber.
//!
//! [`HubClient`] keeps one WebSocket to the hub alive: it connects with
//! exponential backoff (1 s → 2 s → 4 s → capped at 30 s), waits for the
//! `hello` frame, re-subscribes every tracked key, and forwards `changes`
//! items to the consumer channel. Subscriptions survive reconnects - the
//! tracked set is replayed on every new socket.
//!
//! Downtime means dropped events by design; consumers refetch
//! authoritative state over the REST plane after a reconnect.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Initial reconnect delay.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Reconnect delay cap.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// A tracked subscription key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum SubKey {
    Class(String),
    Object(String, String),
}

impl SubKey {
    fn frame(&self) -> Value {
        match self {
            SubKey::Class(class_id) => json!({"op": "subscribe", "class_id": class_id}),
            SubKey::Object(class_id, id) => {
                json!({"op": "subscribe_object", "class_id": class_id, "id": id})
            }
        }
    }
}

struct ClientState {
    subs: Mutex<HashSet<SubKey>>,
    connection_id: watch::Sender<Option<String>>,
}

/// Handle to a running hub subscription.
pub struct HubClient {
    state: Arc<ClientState>,
    commands: mpsc::UnboundedSender<Value>,
    connection_id: watch::Receiver<Option<String>>,
}

impl HubClient {
    /// Connects to a hub base URL (`http://host:port`), returning the
    /// handle and the stream of change items.
    ///
    /// The background task owns the socket and reconnects forever; drop
    /// the handle (and the receiver) to stop it.
    pub fn connect(hub_url: &str) -> (Self, mpsc::UnboundedReceiver<Value>) {
        let ws_url = format!(
            "{}/ws",
            hub_url
                .trim_end_matches('/')
                .replacen("http", "ws", 1)
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (conn_tx, conn_rx) = watch::channel(None);

        let state = Arc::new(ClientState {
            subs: Mutex::new(HashSet::new()),
            connection_id: conn_tx,
        });

        tokio::spawn(run(
            ws_url,
            Arc::clone(&state),
            commands_rx,
            events_tx,
        ));

        (
            Self {
                state,
                commands: commands_tx,
                connection_id: conn_rx,
            },
            events_rx,
        )
    }

    /// The connection id from the latest `hello`, once connected.
    pub fn connection_id(&self) -> Option<String> {
        self.connection_id.borrow().clone()
    }

    /// Waits until the hub has said `hello`, returning the connection id.
    pub async fn wait_connected(&mut self) -> Option<String> {
        loop {
            if let Some(id) = self.connection_id.borrow().clone() {
                return Some(id);
            }
            if self.connection_id.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Subscribes to a class (tracked across reconnects).
    pub fn subscribe(&self, class_id: &str) {
        self.track_and_send(SubKey::Class(class_id.to_string()));
    }

    /// Subscribes to one object (tracked across reconnects).
    pub fn subscribe_object(&self, class_id: &str, id: &str) {
        self.track_and_send(SubKey::Object(class_id.to_string(), id.to_string()));
    }

    /// Drops a class (or, with `id`, an object) subscription.
    pub fn unsubscribe(&self, class_id: &str, id: Option<&str>) {
        let key = match id {
            Some(id) => SubKey::Object(class_id.to_string(), id.to_string()),
            None => SubKey::Class(class_id.to_string()),
        };
        if let Ok(mut subs) = self.state.subs.lock() {
            subs.remove(&key);
        }
        let mut frame = json!({"op": "unsubscribe", "class_id": class_id});
        if let Some(id) = id {
            frame["id"] = json!(id);
        }
        let _ = self.commands.send(frame);
    }

    fn track_and_send(&self, key: SubKey) {
        let frame = key.frame();
        if let Ok(mut subs) = self.state.subs.lock() {
            subs.insert(key);
        }
        let _ = self.commands.send(frame);
    }
}

/// The connection loop: connect, replay subscriptions, pump frames,
/// back off, repeat.
async fn run(
    ws_url: String,
    state: Arc<ClientState>,
    mut commands: mpsc::UnboundedReceiver<Value>,
    events: mpsc::UnboundedSender<Value>,
) {
    let mut delay = BACKOFF_INITIAL;

    loop {
        match connect_async(&ws_url).await {
            Ok((socket, _)) => {
                info!(url = %ws_url, "Hub connected");
                delay = BACKOFF_INITIAL;
                pump(socket, &state, &mut commands, &events).await;
                let _ = state.connection_id.send(None);
                if events.is_closed() {
                    return;
                }
                warn!(url = %ws_url, "Hub connection lost, reconnecting");
            }
            Err(e) => {
                if events.is_closed() {
                    return;
                }
                debug!(url = %ws_url, error = %e, delay_s = delay.as_secs(), "Hub connect failed");
            }
        }

        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(BACKOFF_CAP);
    }
}

/// Pumps one live socket until it drops.
async fn pump(
    socket: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    state: &ClientState,
    commands: &mut mpsc::UnboundedReceiver<Value>,
    events: &mpsc::UnboundedSender<Value>,
) {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(frame) = command else { return };
                if sink.send(Message::Text(frame.to_string())).await.is_err() {
                    return;
                }
            }
            inbound = stream.next() => {
                let message = match inbound {
                    Some(Ok(message)) => message,
                    _ => return,
                };
                match message {
                    Message::Text(text) => {
                        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        match frame.get("type").and_then(Value::as_str) {
                            Some("hello") => {
                                let id = frame
                                    .get("connection_id")
                                    .and_then(Value::as_str)
                                    .map(String::from);
                                let _ = state.connection_id.send(id);
                                // Replay the tracked subscriptions onto the
                                // fresh connection.
                                let replay: Vec<Value> = state
                                    .subs
                                    .lock()
                                    .map(|subs| subs.iter().map(SubKey::frame).collect())
                                    .unwrap_or_default();
                                for sub in replay {
                                    if sink.send(Message::Text(sub.to_string())).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Some("changes") => {
                                for item in frame
                                    .get("items")
                                    .and_then(Value::as_array)
                                    .into_iter()
                                    .flatten()
                                {
                                    if events.send(item.clone()).is_err() {
                                        return;
                                    }
                                }
                            }
                            Some("pong") | None => {}
                            Some(other) => {
                                debug!(frame_type = other, "Ignoring unknown hub frame");
                            }
                        }
                    }
                    Message::Ping(payload) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            return;
                        }
                    }
                    Message::Close(_) => return,
                    _ => {}
                }
            }
        }
    }
}
