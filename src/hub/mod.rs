//! The WebSocket hub - stateless change fan-out.
//!
//! The hub holds no history: it accepts WebSocket subscribers, receives
//! broadcast events from the engine over `POST /broadcast`, and pushes
//! `changes` frames to every subscriber of the affected class or object,
//! suppressing the echo to the originating connection. A disconnected
//! client misses events for its downtime and recovers by re-subscribing
//! and refetching authoritative state over REST.
//!
//! Slow consumers are contained by a bounded per-connection outbound
//! queue: overflow drops the oldest frame and marks the connection
//! degraded; repeated degradation force-closes it. Dispatch never holds a
//! subscription lock across a socket send - sends happen in each
//! connection's writer task.

pub mod client;
mod server;

pub use client::HubClient;
pub use server::{router, serve};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::broadcast::{ChangeEvent, ChangeKind};
use crate::types::ConnectionId;

/// Outbound frames buffered per connection before drop-oldest kicks in.
const OUTBOUND_CAPACITY: usize = 256;

/// Degradations (drop-oldest events) tolerated before force-close.
const DEGRADED_CLOSE_THRESHOLD: u32 = 3;

/// Client → hub frames.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Subscribe to every change in a class.
    Subscribe {
        /// Class to watch.
        class_id: String,
    },
    /// Subscribe to one object.
    SubscribeObject {
        /// Class of the object.
        class_id: String,
        /// Object id.
        id: String,
    },
    /// Drop a class subscription, or an object subscription when `id` is
    /// present.
    Unsubscribe {
        /// Class to stop watching.
        class_id: String,
        /// Object id, for object-level unsubscribe.
        #[serde(default)]
        id: Option<String>,
    },
    /// Application-level liveness probe; answered with `pong`.
    Ping,
}

/// Hub → client frames.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// First frame on every connection, carrying the assigned id.
    Hello {
        /// The connection's unique id, echoed into `X-WS-Connection-Id`
        /// by writing clients for echo suppression.
        connection_id: String,
    },
    /// Answer to a client `ping`.
    Pong,
    /// One or more committed changes, in per-class commit order.
    Changes {
        /// Change items: the new fields plus `_old` / `_deleted` markers.
        items: Vec<Value>,
    },
}

/// Renders a broadcast event as one `changes` item.
///
/// The item is the committed record itself, with `_old` carrying the
/// previous record (when any) and `_deleted: true` marking deletions.
pub fn event_item(event: &ChangeEvent) -> Value {
    let mut item = match event.kind {
        ChangeKind::Change => event.new.clone().unwrap_or_default(),
        ChangeKind::Delete => serde_json::Map::new(),
    };
    item.insert("id".to_string(), Value::String(event.id.clone()));
    item.insert("class_id".to_string(), Value::String(event.class_id.clone()));
    if let Some(ref old) = event.old {
        item.insert("_old".to_string(), Value::Object(old.clone()));
    }
    if event.kind == ChangeKind::Delete {
        item.insert("_deleted".to_string(), Value::Bool(true));
    }
    Value::Object(item)
}

/// Bounded outbound queue feeding one connection's writer task.
pub(crate) struct OutboundQueue {
    frames: Mutex<VecDeque<ServerFrame>>,
    notify: Notify,
    degraded: AtomicU32,
    closed: AtomicBool,
}

impl OutboundQueue {
    fn new() -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            degraded: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueues a frame; overflow drops the oldest frame and marks the
    /// connection degraded. Returns `false` once the connection should be
    /// force-closed.
    pub(crate) fn push(&self, frame: ServerFrame) -> bool {
        let Ok(mut frames) = self.frames.lock() else {
            return false;
        };
        if frames.len() >= OUTBOUND_CAPACITY {
            frames.pop_front();
            let degradations = self.degraded.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(degradations, "Slow subscriber: dropped oldest outbound frame");
            if degradations >= DEGRADED_CLOSE_THRESHOLD {
                drop(frames);
                self.close();
                return false;
            }
        }
        frames.push_back(frame);
        drop(frames);
        self.notify.notify_one();
        true
    }

    /// Takes everything currently queued.
    pub(crate) fn drain(&self) -> Vec<ServerFrame> {
        match self.frames.lock() {
            Ok(mut frames) => frames.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Waits until frames are queued (or the queue is closed).
    pub(crate) async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Marks the connection for termination and wakes its writer.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// True once the connection should terminate.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

/// The hub's shared state: connections and subscription maps.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubState>,
}

struct HubState {
    connections: Mutex<HashMap<String, Arc<OutboundQueue>>>,
    by_class: Mutex<HashMap<String, HashSet<String>>>,
    by_object: Mutex<HashMap<(String, String), HashSet<String>>>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubState {
                connections: Mutex::new(HashMap::new()),
                by_class: Mutex::new(HashMap::new()),
                by_object: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Registers a new connection, returning its id and outbound queue.
    pub(crate) fn register(&self) -> (String, Arc<OutboundQueue>) {
        let id = ConnectionId::new().to_string();
        let queue = Arc::new(OutboundQueue::new());
        if let Ok(mut connections) = self.inner.connections.lock() {
            connections.insert(id.clone(), Arc::clone(&queue));
        }
        info!(connection = %id, "Hub connection registered");
        (id, queue)
    }

    /// Drops a connection and all its subscriptions.
    pub(crate) fn unregister(&self, connection_id: &str) {
        if let Ok(mut connections) = self.inner.connections.lock() {
            connections.remove(connection_id);
        }
        if let Ok(mut by_class) = self.inner.by_class.lock() {
            by_class.retain(|_, subs| {
                subs.remove(connection_id);
                !subs.is_empty()
            });
        }
        if let Ok(mut by_object) = self.inner.by_object.lock() {
            by_object.retain(|_, subs| {
                subs.remove(connection_id);
                !subs.is_empty()
            });
        }
        info!(connection = %connection_id, "Hub connection unregistered");
    }

    /// Applies a client frame to the subscription maps. Returns a frame to
    /// answer with, if any.
    pub(crate) fn handle_frame(&self, connection_id: &str, frame: ClientFrame) -> Option<ServerFrame> {
        match frame {
            ClientFrame::Subscribe { class_id } => {
                if let Ok(mut by_class) = self.inner.by_class.lock() {
                    by_class
                        .entry(class_id)
                        .or_default()
                        .insert(connection_id.to_string());
                }
                None
            }
            ClientFrame::SubscribeObject { class_id, id } => {
                if let Ok(mut by_object) = self.inner.by_object.lock() {
                    by_object
                        .entry((class_id, id))
                        .or_default()
                        .insert(connection_id.to_string());
                }
                None
            }
            ClientFrame::Unsubscribe { class_id, id } => {
                match id {
                    Some(id) => {
                        if let Ok(mut by_object) = self.inner.by_object.lock() {
                            if let Some(subs) = by_object.get_mut(&(class_id, id)) {
                                subs.remove(connection_id);
                            }
                        }
                    }
                    None => {
                        if let Ok(mut by_class) = self.inner.by_class.lock() {
                            if let Some(subs) = by_class.get_mut(&class_id) {
                                subs.remove(connection_id);
                            }
                        }
                    }
                }
                None
            }
            ClientFrame::Ping => Some(ServerFrame::Pong),
        }
    }

    /// Fans an inbound broadcast out to subscribers, skipping the
    /// originating connection.
    ///
    /// Target queues are collected under the subscription locks, but the
    /// pushes (and the actual socket sends, in the writer tasks) happen
    /// after those locks are released.
    pub fn dispatch(&self, event: &ChangeEvent) {
        let mut targets: HashSet<String> = HashSet::new();
        if let Ok(by_class) = self.inner.by_class.lock() {
            if let Some(subs) = by_class.get(&event.class_id) {
                targets.extend(subs.iter().cloned());
            }
        }
        if let Ok(by_object) = self.inner.by_object.lock() {
            if let Some(subs) = by_object.get(&(event.class_id.clone(), event.id.clone())) {
                targets.extend(subs.iter().cloned());
            }
        }
        if let Some(ref origin) = event.origin_connection_id {
            targets.remove(origin);
        }
        if targets.is_empty() {
            debug!(class = %event.class_id, id = %event.id, "Broadcast had no subscribers");
            return;
        }

        let queues: Vec<(String, Arc<OutboundQueue>)> = match self.inner.connections.lock() {
            Ok(connections) => targets
                .into_iter()
                .filter_map(|id| connections.get(&id).map(|q| (id, Arc::clone(q))))
                .collect(),
            Err(_) => return,
        };

        let item = event_item(event);
        for (connection_id, queue) in queues {
            let healthy = queue.push(ServerFrame::Changes {
                items: vec![item.clone()],
            });
            if !healthy {
                warn!(connection = %connection_id, "Force-closing degraded subscriber");
            }
        }
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}
