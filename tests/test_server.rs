//! HTTP surface tests
//!
//! Drives the warp routes in-process with `warp::test`, backed by mock
//! adapters and a mock health gate.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use taskgate::adapter::AdapterSet;
use taskgate::config::RegistrySource;
use taskgate::dispatch::{DispatchGateway, GatewaySettings};
use taskgate::health::HealthStatus;
use taskgate::registry::{BackendKind, RawRegistry, RegistryStore};
use taskgate::routing::{TaskRoute, TaskRouter};
use taskgate::server::routes;
use taskgate::testing::{MockAdapter, MockHealthGate};
use tempfile::TempDir;

fn gateway_with(health: MockHealthGate, mandatory: Vec<String>) -> Arc<DispatchGateway> {
    let raw = RawRegistry::from_pairs([("a", "http://a:8000"), ("b", "http://b:8000")]);
    let adapter = MockAdapter::new(BackendKind::Local)
        .with_output("a", json!({"answer": 42}))
        .with_progress(vec!["thinking".to_string()]);
    Arc::new(DispatchGateway::new(
        Arc::new(RegistryStore::from_raw(&raw).unwrap()),
        TaskRouter::new([TaskRoute::new("T1", "a"), TaskRoute::new("T2", "ghost")]),
        AdapterSet::new().with_adapter(Arc::new(adapter)),
        Arc::new(health),
        GatewaySettings {
            gateway_id: "gw-test".to_string(),
            default_deadline: Duration::from_secs(2),
            mandatory_backends: mandatory,
        },
    ))
}

fn gateway() -> Arc<DispatchGateway> {
    gateway_with(MockHealthGate::new(), Vec::new())
}

fn json_body(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn test_dispatch_success() {
    let response = warp::test::request()
        .method("POST")
        .path("/v1/dispatch")
        .json(&json!({"request_id": "r-1", "task_type": "T1", "inputs": {"q": "?"}}))
        .reply(&routes(gateway()))
        .await;

    assert_eq!(response.status(), 200);
    let body = json_body(response.body());
    assert_eq!(body["ok"], true);
    assert_eq!(body["request_id"], "r-1");
    assert_eq!(body["outputs"], json!({"answer": 42}));
    assert_eq!(body["provenance"]["backend_key"], "a");
}

#[tokio::test]
async fn test_dispatch_unknown_task_type_is_404_with_known_types() {
    let response = warp::test::request()
        .method("POST")
        .path("/v1/dispatch")
        .json(&json!({"task_type": "nope"}))
        .reply(&routes(gateway()))
        .await;

    assert_eq!(response.status(), 404);
    let body = json_body(response.body());
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"]["kind"], "RoutingError");
    let known = body["error"]["details"]["known_task_types"].as_array().unwrap();
    assert!(known.contains(&json!("T1")));
}

#[tokio::test]
async fn test_dispatch_malformed_body_is_400() {
    let response = warp::test::request()
        .method("POST")
        .path("/v1/dispatch")
        .header("content-type", "application/json")
        .body("{not json")
        .reply(&routes(gateway()))
        .await;

    assert_eq!(response.status(), 400);
    let body = json_body(response.body());
    assert_eq!(body["error"]["kind"], "InvalidRequest");
    assert!(!body["request_id"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_stream_emits_lifecycle_events() {
    let response = warp::test::request()
        .method("POST")
        .path("/v1/dispatch/stream")
        .json(&json!({"task_type": "T1"}))
        .reply(&routes(gateway()))
        .await;

    assert_eq!(response.status(), 200);
    let text = String::from_utf8_lossy(response.body()).to_string();
    let started = text.find(r#""event":"started""#).unwrap();
    let progress = text.find(r#""event":"progress""#).unwrap();
    let completed = text.find(r#""event":"completed""#).unwrap();
    assert!(started < progress && progress < completed);
    assert!(text.contains("thinking"));
}

#[tokio::test]
async fn test_registry_view_reports_drift() {
    let response = warp::test::request()
        .method("GET")
        .path("/v1/registry")
        .reply(&routes(gateway()))
        .await;

    assert_eq!(response.status(), 200);
    let body = json_body(response.body());
    assert_eq!(body["gateway_id"], "gw-test");
    assert_eq!(body["registry"]["version"], 1);
    assert!(body["registry"]["entries"]["a"].is_object());
    assert_eq!(body["route_drift"][0]["task_type"], "T2");
    assert_eq!(body["route_drift"][0]["unresolved_key"], "ghost");
}

#[tokio::test]
async fn test_reload_without_source_is_rejected() {
    let response = warp::test::request()
        .method("POST")
        .path("/v1/registry/reload")
        .reply(&routes(gateway()))
        .await;

    assert_eq!(response.status(), 500);
    assert_eq!(json_body(response.body())["reloaded"], false);
}

#[tokio::test]
async fn test_reload_from_file_swaps_registry() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("registry.toml");
    std::fs::write(&path, "a = \"http://a2:8000\"\nc = \"http://c:8000\"\n").unwrap();

    let raw = RawRegistry::from_pairs([("a", "http://a:8000")]);
    let gw = Arc::new(
        DispatchGateway::new(
            Arc::new(RegistryStore::from_raw(&raw).unwrap()),
            TaskRouter::new([TaskRoute::new("T1", "a")]),
            AdapterSet::new().with_adapter(Arc::new(MockAdapter::new(BackendKind::Local))),
            Arc::new(MockHealthGate::new()),
            GatewaySettings::default(),
        )
        .with_registry_source(RegistrySource::File(path.clone())),
    );

    let ok = warp::test::request()
        .method("POST")
        .path("/v1/registry/reload")
        .reply(&routes(gw.clone()))
        .await;
    assert_eq!(ok.status(), 200);
    let body = json_body(ok.body());
    assert_eq!(body["version"], 2);
    assert_eq!(body["entries"], 2);

    std::fs::write(&path, "a = \"ftp://a:21\"\n").unwrap();
    let rejected = warp::test::request()
        .method("POST")
        .path("/v1/registry/reload")
        .reply(&routes(gw.clone()))
        .await;
    assert_eq!(rejected.status(), 422);
    assert_eq!(json_body(rejected.body())["error"]["kind"], "RegistryError");
    assert_eq!(gw.registry().get("a").unwrap().location.as_str(), "http://a2:8000/");
}

#[tokio::test]
async fn test_preflight_fails_when_mandatory_backend_unhealthy() {
    let health = MockHealthGate::new().with_status("a", HealthStatus::Unhealthy);
    let gw = gateway_with(health, vec!["a".to_string()]);

    let response = warp::test::request()
        .method("GET")
        .path("/v1/preflight")
        .reply(&routes(gw))
        .await;

    assert_eq!(response.status(), 503);
    let body = json_body(response.body());
    assert_eq!(body["passed"], false);
    assert_eq!(body["unroutable_mandatory"], json!(["a"]));
}

#[tokio::test]
async fn test_preflight_passes_with_live_mandatory_backend() {
    let gw = gateway_with(MockHealthGate::new(), vec!["a".to_string()]);

    let response = warp::test::request()
        .method("GET")
        .path("/v1/preflight")
        .reply(&routes(gw))
        .await;

    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_probe_endpoints() {
    let filter = routes(gateway());

    let live = warp::test::request().path("/live").reply(&filter).await;
    assert_eq!(live.status(), 200);
    assert_eq!(json_body(live.body())["alive"], true);

    let ready = warp::test::request().path("/ready").reply(&filter).await;
    assert_eq!(ready.status(), 200);

    let health = warp::test::request().path("/health").reply(&filter).await;
    assert_eq!(health.status(), 200);
    let body = json_body(health.body());
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["registry_entries"], 2);
    assert_eq!(body["route_drift"], 1);

    let root = warp::test::request().path("/").reply(&filter).await;
    assert!(json_body(root.body())["endpoints"]["POST /v1/dispatch"].is_string());
}
