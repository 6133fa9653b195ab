//! Hub fan-out end to end: hello, subscriptions, echo suppression, and
//! the engine → hub broadcast path.

use std::time::Duration;

use elementstore::broadcast::ChangeEvent;
use elementstore::hub::{router, Hub, HubClient};
use elementstore::{Config, ElementStore, ObjectMap};
use serde_json::{json, Value};
use tempfile::tempdir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const SILENCE_WINDOW: Duration = Duration::from_millis(500);

/// Time for a subscribe frame to reach the hub's maps.
const SETTLE: Duration = Duration::from_millis(300);

fn obj(value: Value) -> ObjectMap {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

async fn spawn_hub() -> (String, Hub) {
    let hub = Hub::new();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(hub.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), hub)
}

async fn recv_item(events: &mut UnboundedReceiver<Value>) -> Value {
    timeout(RECV_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for change item")
        .expect("event stream closed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hello_assigns_connection_id() {
    let (url, hub) = spawn_hub().await;

    let (mut client, _events) = HubClient::connect(&url);
    let connection_id = timeout(RECV_TIMEOUT, client.wait_connected())
        .await
        .unwrap()
        .unwrap();

    assert!(!connection_id.is_empty());
    assert_eq!(hub.connection_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_class_subscription_delivers_changes() {
    let (url, hub) = spawn_hub().await;

    let (mut client, mut events) = HubClient::connect(&url);
    timeout(RECV_TIMEOUT, client.wait_connected()).await.unwrap();
    client.subscribe("customer");
    tokio::time::sleep(SETTLE).await;

    hub.dispatch(&ChangeEvent::change(
        "customer",
        "c1",
        obj(json!({"id": "c1", "name": "Ada"})),
        None,
        None,
    ));

    let item = recv_item(&mut events).await;
    assert_eq!(item["id"], json!("c1"));
    assert_eq!(item["class_id"], json!("customer"));
    assert_eq!(item["name"], json!("Ada"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_object_subscription_filters_other_ids() {
    let (url, hub) = spawn_hub().await;

    let (mut client, mut events) = HubClient::connect(&url);
    timeout(RECV_TIMEOUT, client.wait_connected()).await.unwrap();
    client.subscribe_object("customer", "c1");
    tokio::time::sleep(SETTLE).await;

    hub.dispatch(&ChangeEvent::change(
        "customer",
        "c2",
        obj(json!({"id": "c2"})),
        None,
        None,
    ));
    hub.dispatch(&ChangeEvent::change(
        "customer",
        "c1",
        obj(json!({"id": "c1"})),
        None,
        None,
    ));

    // Only the watched object arrives.
    let item = recv_item(&mut events).await;
    assert_eq!(item["id"], json!("c1"));
    assert!(timeout(SILENCE_WINDOW, events.recv()).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_broadcast_ingress_and_echo_suppression() {
    let (url, _hub) = spawn_hub().await;

    let (mut client_a, mut events_a) = HubClient::connect(&url);
    let (mut client_b, mut events_b) = HubClient::connect(&url);
    let ka = timeout(RECV_TIMEOUT, client_a.wait_connected())
        .await
        .unwrap()
        .unwrap();
    timeout(RECV_TIMEOUT, client_b.wait_connected()).await.unwrap();
    client_a.subscribe("customer");
    client_b.subscribe("customer");
    tokio::time::sleep(SETTLE).await;

    // Post through the HTTP ingress, exactly as the engine does, with
    // client A as the originator.
    let event = ChangeEvent::change(
        "customer",
        "c1",
        obj(json!({"id": "c1", "name": "Ada"})),
        None,
        Some(ka),
    );
    let ingress = format!("{}/broadcast", url);
    tokio::task::spawn_blocking(move || {
        ureq::post(&ingress).send_json(&event).unwrap();
    })
    .await
    .unwrap();

    // B receives one changes frame; A receives none.
    let item = recv_item(&mut events_b).await;
    assert_eq!(item["id"], json!("c1"));
    assert!(timeout(SILENCE_WINDOW, events_a.recv()).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_engine_commit_reaches_subscriber() {
    let (url, _hub) = spawn_hub().await;
    let dir = tempdir().unwrap();

    let store = ElementStore::open(Config {
        data_root: dir.path().to_path_buf(),
        hub_url: Some(url.clone()),
        ..Default::default()
    })
    .unwrap();

    let (mut client, mut events) = HubClient::connect(&url);
    timeout(RECV_TIMEOUT, client.wait_connected()).await.unwrap();
    client.subscribe("customer");
    tokio::time::sleep(SETTLE).await;

    let record = tokio::task::spawn_blocking(move || {
        let ctx = store.request().with_principal("u1");
        store
            .set_object(&ctx, "@class", obj(json!({"id": "customer"})))
            .unwrap();
        store
            .set_object(&ctx, "customer", obj(json!({"name": "Ada"})))
            .unwrap()
    })
    .await
    .unwrap();

    let item = recv_item(&mut events).await;
    assert_eq!(item["id"], record["id"]);
    assert_eq!(item["name"], json!("Ada"));
    assert_eq!(item["_version"], json!(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_event_carries_markers() {
    let (url, hub) = spawn_hub().await;

    let (mut client, mut events) = HubClient::connect(&url);
    timeout(RECV_TIMEOUT, client.wait_connected()).await.unwrap();
    client.subscribe("customer");
    tokio::time::sleep(SETTLE).await;

    hub.dispatch(&ChangeEvent::delete(
        "customer",
        "c1",
        obj(json!({"id": "c1", "name": "Ada"})),
        None,
    ));

    let item = recv_item(&mut events).await;
    assert_eq!(item["_deleted"], json!(true));
    assert_eq!(item["_old"]["name"], json!("Ada"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_hub_never_blocks_writes() {
    // Nothing listens on this port; commits must still succeed.
    let dir = tempdir().unwrap();
    let store = ElementStore::open(Config {
        data_root: dir.path().to_path_buf(),
        hub_url: Some("http://127.0.0.1:1".to_string()),
        ..Default::default()
    })
    .unwrap();

    tokio::task::spawn_blocking(move || {
        let ctx = store.request().with_principal("u1");
        store
            .set_object(&ctx, "@class", obj(json!({"id": "customer"})))
            .unwrap();
        let record = store
            .set_object(&ctx, "customer", obj(json!({"name": "Ada"})))
            .unwrap();
        assert_eq!(record["_version"], json!(1));
    })
    .await
    .unwrap();
}
