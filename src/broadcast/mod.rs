//! Change broadcast emitter.
//!
//! After any mutation commits, the engine hands a [`ChangeEvent`] to the
//! [`ChangeEmitter`]. Delivery is fire-and-forget: events flow through a
//! bounded channel to a dispatcher thread that posts them to the hub's
//! `/broadcast` ingress. A full channel or an unreachable hub is logged
//! and the event dropped - the originating request never fails or blocks
//! on broadcasting.

use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::object::ObjectMap;

/// Events buffered towards the dispatcher before overflow drops begin.
const CHANNEL_CAPACITY: usize = 1024;

/// Per-post HTTP timeout. Short on purpose - the hub is local
/// infrastructure and a slow hub must not back the dispatcher up.
const POST_TIMEOUT: Duration = Duration::from_secs(2);

/// What happened to the object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Create or update.
    Change,
    /// Deletion.
    Delete,
}

/// A committed mutation, as shipped to the hub.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Change or delete.
    pub kind: ChangeKind,

    /// Class of the mutated object.
    pub class_id: String,

    /// Id of the mutated object.
    pub id: String,

    /// The committed record (absent for deletes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<ObjectMap>,

    /// The previous record (absent for creates).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<ObjectMap>,

    /// Hub connection id of the originating client, for echo suppression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_connection_id: Option<String>,
}

impl ChangeEvent {
    /// Builds a create/update event.
    pub fn change(
        class_id: &str,
        id: &str,
        new: ObjectMap,
        old: Option<ObjectMap>,
        origin: Option<String>,
    ) -> Self {
        Self {
            kind: ChangeKind::Change,
            class_id: class_id.to_string(),
            id: id.to_string(),
            new: Some(new),
            old,
            origin_connection_id: origin,
        }
    }

    /// Builds a delete event.
    pub fn delete(class_id: &str, id: &str, old: ObjectMap, origin: Option<String>) -> Self {
        Self {
            kind: ChangeKind::Delete,
            class_id: class_id.to_string(),
            id: id.to_string(),
            new: None,
            old: Some(old),
            origin_connection_id: origin,
        }
    }
}

/// Fire-and-forget emitter towards the hub.
///
/// Cheap to call from the write path: `emit` is a non-blocking channel
/// send. The dispatcher thread owns the HTTP side.
pub struct ChangeEmitter {
    tx: Option<Sender<ChangeEvent>>,
    worker: Option<JoinHandle<()>>,
}

impl ChangeEmitter {
    /// An emitter that drops everything (no hub configured).
    pub fn disabled() -> Self {
        Self {
            tx: None,
            worker: None,
        }
    }

    /// Spawns the dispatcher thread posting to `<hub_url>/broadcast`.
    pub fn new(hub_url: &str) -> Self {
        let endpoint = format!("{}/broadcast", hub_url.trim_end_matches('/'));
        let (tx, rx) = bounded::<ChangeEvent>(CHANNEL_CAPACITY);

        let worker_endpoint = endpoint.clone();
        let worker = std::thread::Builder::new()
            .name("broadcast-dispatch".to_string())
            .spawn(move || {
                let endpoint = worker_endpoint;
                let config = ureq::config::Config::builder()
                    .timeout_global(Some(POST_TIMEOUT))
                    .build();
                let agent = ureq::Agent::new_with_config(config);

                while let Ok(event) = rx.recv() {
                    match agent.post(&endpoint).send_json(&event) {
                        Ok(_) => debug!(
                            class = %event.class_id,
                            id = %event.id,
                            "Broadcast delivered"
                        ),
                        Err(e) => warn!(
                            class = %event.class_id,
                            id = %event.id,
                            error = %e,
                            "Broadcast dropped (hub unreachable)"
                        ),
                    }
                }
            })
            .ok();

        if worker.is_none() {
            warn!("Failed to spawn broadcast dispatcher; broadcasting disabled");
            return Self::disabled();
        }

        info!(endpoint = %endpoint, "Broadcast emitter started");
        Self {
            tx: Some(tx),
            worker,
        }
    }

    /// Returns true when a hub is configured.
    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Enqueues an event. Never blocks, never fails the caller.
    pub fn emit(&self, event: ChangeEvent) {
        let Some(ref tx) = self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => warn!(
                class = %event.class_id,
                id = %event.id,
                "Broadcast queue full, dropping event"
            ),
            Err(TrySendError::Disconnected(_)) => {
                warn!("Broadcast dispatcher gone, dropping event")
            }
        }
    }
}

impl Drop for ChangeEmitter {
    fn drop(&mut self) {
        // Closing the channel lets the dispatcher drain and exit.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for ChangeEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeEmitter")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: serde_json::Value) -> ObjectMap {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_change_event_serialization() {
        let event = ChangeEvent::change(
            "customer",
            "c1",
            obj(json!({"id": "c1", "name": "Ada"})),
            None,
            Some("conn-1".to_string()),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "change");
        assert_eq!(value["class_id"], "customer");
        assert_eq!(value["origin_connection_id"], "conn-1");
        assert!(value.get("old").is_none());
    }

    #[test]
    fn test_delete_event_has_no_new() {
        let event = ChangeEvent::delete("customer", "c1", obj(json!({"id": "c1"})), None);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "delete");
        assert!(value.get("new").is_none());
        assert!(value.get("origin_connection_id").is_none());
    }

    #[test]
    fn test_event_roundtrip() {
        let event = ChangeEvent::change("a", "b", obj(json!({"id": "b"})), None, None);
        let text = serde_json::to_string(&event).unwrap();
        let back: ChangeEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back.kind, ChangeKind::Change);
        assert_eq!(back.id, "b");
    }

    #[test]
    fn test_disabled_emitter_swallows() {
        let emitter = ChangeEmitter::disabled();
        assert!(!emitter.is_enabled());
        emitter.emit(ChangeEvent::delete("a", "b", ObjectMap::new(), None));
    }

    #[test]
    fn test_unreachable_hub_never_fails_caller() {
        // Nothing listens on port 1; emit must still return immediately
        // and drop cleanly.
        let emitter = ChangeEmitter::new("http://127.0.0.1:1");
        assert!(emitter.is_enabled());
        for i in 0..32 {
            emitter.emit(ChangeEvent::delete("a", &format!("{}", i), ObjectMap::new(), None));
        }
        drop(emitter);
    }
}
