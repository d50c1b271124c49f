use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use regis::{DeltaBatch, Instance, ManualClock, RegistrySnapshot};
use regis_node::{api, test_utils::LoopbackNetwork, NodeConfig, RegistryNode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn solo_node() -> (Arc<RegistryNode>, ManualClock) {
    let clock = ManualClock::new(1_000_000);
    let network = LoopbackNetwork::new();
    let node = RegistryNode::with_clock(
        NodeConfig::new(),
        network.transport("http://solo"),
        Arc::new(clock.clone()),
    )
    .unwrap();
    (node, clock)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let body = body.map_or_else(Body::empty, |v| Body::from(v.to_string()));
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn billing(port: u16) -> Value {
    json!({ "host": "10.0.0.7", "port": port, "lease_duration_secs": 30 })
}

#[tokio::test]
async fn test_register_renew_cancel_lifecycle() {
    let (node, _) = solo_node();
    let app = api::router(node.clone());

    let (status, _) = send(&app, "PUT", "/instances/billing/b-1", Some(billing(8080))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&app, "GET", "/instances/billing/b-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service_name"], "billing");
    assert_eq!(body["address"]["port"], 8080);
    assert_eq!(body["status"], "UP");

    // empty body renews
    let (status, _) = send(&app, "PUT", "/instances/billing/b-1", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(node.registry().lease(&regis::InstanceKey::new("billing", "b-1")).unwrap().renewal_count, 1);

    let (status, _) = send(&app, "DELETE", "/instances/billing/b-1", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, "DELETE", "/instances/billing/b-1", None).await;
    assert_eq!(status, StatusCode::OK, "cancel is idempotent");

    let (status, _) = send(&app, "GET", "/instances/billing/b-1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_renew_unknown_instance_is_404() {
    let (node, _) = solo_node();
    let app = api::router(node);

    let (status, body) = send(&app, "PUT", "/instances/billing/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("billing/ghost"));
}

#[tokio::test]
async fn test_status_change() {
    let (node, _) = solo_node();
    let app = api::router(node);
    send(&app, "PUT", "/instances/billing/b-1", Some(billing(8080))).await;

    let (status, _) = send(
        &app,
        "PUT",
        "/instances/billing/b-1/status",
        Some(json!({ "status": "out_of_service" })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = send(&app, "GET", "/instances/billing/b-1", None).await;
    assert_eq!(body["status"], "OUT_OF_SERVICE");

    let (status, _) = send(
        &app,
        "PUT",
        "/instances/billing/b-1/status",
        Some(json!({ "status": "SLEEPING" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        "PUT",
        "/instances/billing/nope/status",
        Some(json!({ "status": "DOWN" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_payloads_rejected_before_store() {
    let (node, _) = solo_node();
    let app = api::router(node.clone());

    let mismatched = json!({ "service_name": "orders", "host": "h", "port": 1 });
    let (status, _) = send(&app, "PUT", "/instances/billing/b-1", Some(mismatched)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "PUT", "/instances/billing/b-1", Some(json!({ "port": 1 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let huge_lease = json!({ "host": "h", "port": 1, "lease_duration_secs": 7200 });
    let (status, _) = send(&app, "PUT", "/instances/billing/b-1", Some(huge_lease)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "PUT", "/instances/bill%20ing/b-1", Some(billing(1))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(node.registry().is_empty());
}

#[tokio::test]
async fn test_delta_replays_onto_snapshot() {
    let (node, _) = solo_node();
    let app = api::router(node);

    send(&app, "PUT", "/instances/billing/b-1", Some(billing(8080))).await;
    let (_, body) = send(&app, "GET", "/registry", None).await;
    let mut cached: RegistrySnapshot = serde_json::from_value(body).unwrap();
    assert_eq!(cached.sequence, 1);

    send(&app, "PUT", "/instances/billing/b-2", Some(billing(8081))).await;
    send(&app, "PUT", "/instances/billing/b-2", None).await;
    send(&app, "DELETE", "/instances/billing/b-1", None).await;

    let (status, body) = send(&app, "GET", &format!("/registry/delta?since={}", cached.sequence), None).await;
    assert_eq!(status, StatusCode::OK);
    let batch: DeltaBatch = serde_json::from_value(body).unwrap();
    let sequences: Vec<u64> = batch.records.iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, vec![2, 3, 4]);

    cached.replay(&batch.records);
    let (_, body) = send(&app, "GET", "/registry", None).await;
    let full: RegistrySnapshot = serde_json::from_value(body).unwrap();

    assert_eq!(cached.registry_hash, batch.registry_hash);
    assert_eq!(cached.sequence, full.sequence);
    let ids = |s: &RegistrySnapshot| s.instances.iter().map(|i| i.instance_id.clone()).collect::<Vec<_>>();
    assert_eq!(ids(&cached), ids(&full));
}

#[tokio::test]
async fn test_stale_cursor_is_gone() {
    let (node, clock) = solo_node();
    let app = api::router(node.clone());
    send(&app, "PUT", "/instances/billing/b-1", Some(billing(8080))).await;

    let (status, _) = send(&app, "GET", "/registry/delta?since=9", None).await;
    assert_eq!(status, StatusCode::GONE, "cursor ahead of the log");

    clock.advance(Duration::from_secs(181));
    node.registry().prune();
    let (status, body) = send(&app, "GET", "/registry/delta?since=0", None).await;
    assert_eq!(status, StatusCode::GONE);
    assert!(body["error"].as_str().is_some());

    let (status, _) = send(&app, "GET", "/registry/delta?since=1", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_application_view() {
    let (node, _) = solo_node();
    let app = api::router(node);
    send(&app, "PUT", "/instances/billing/b-2", Some(billing(8081))).await;
    send(&app, "PUT", "/instances/billing/b-1", Some(billing(8080))).await;

    let (status, body) = send(&app, "GET", "/registry/billing", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "billing");
    assert_eq!(body["instances"][0]["instance_id"], "b-1");

    let (status, _) = send(&app, "GET", "/registry/orders", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_peer_replicate_endpoint() {
    let (node, _) = solo_node();
    let (peer, _) = solo_node();
    let app = api::router(node.clone());

    let record = peer
        .register(Instance::new("orders", "o-1", "10.0.0.9", 9000).with_lease_duration(Duration::from_secs(30)))
        .unwrap();

    let (status, body) = send(&app, "POST", "/peer/replicate", Some(serde_json::to_value(&record).unwrap())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "applied");
    assert_eq!(node.registry().len(), 1);

    let (status, _) = send(&app, "POST", "/peer/replicate", Some(json!({ "nonsense": true }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_peer_replicate_rejects_malformed_instance() {
    let (node, _) = solo_node();
    let (peer, _) = solo_node();
    let app = api::router(node.clone());

    let record = peer
        .register(Instance::new("orders", "o-1", "10.0.0.9", 9000).with_lease_duration(Duration::from_secs(30)))
        .unwrap();

    let mut payload = serde_json::to_value(&record).unwrap();
    payload["instance"]["address"]["port"] = json!(0);
    payload["instance"]["lease_duration_secs"] = json!(u64::MAX);
    let (status, body) = send(&app, "POST", "/peer/replicate", Some(payload)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("Validation"));

    let mut payload = serde_json::to_value(&record).unwrap();
    payload["instance"]["last_dirty"] = json!({ "physical": u64::MAX / 2, "logical": 0 });
    let (status, _) = send(&app, "POST", "/peer/replicate", Some(payload)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(node.registry().is_empty());
}

#[tokio::test]
async fn test_status_and_peers() {
    let (node, _) = solo_node();
    let app = api::router(node);
    send(&app, "PUT", "/instances/billing/b-1", Some(billing(8080))).await;

    let (status, body) = send(&app, "GET", "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["instance_count"], 1);
    assert_eq!(body["latest_sequence"], 1);
    assert_eq!(body["governor_state"], "NORMAL");

    let (status, body) = send(&app, "GET", "/peers", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}
