//! Integration tests for the backend adapters
//!
//! Tests behavioral contracts against mock backends:
//! - canonical request/response handling for local backends
//! - run API translation for platform-hosted backends
//! - failure classification (caller errors, upstream errors, timeouts)
//! - the single idempotent retry on timeout
//! - event stream decoding into progress updates

use serde_json::json;
use std::time::Duration;
use taskgate::adapter::{AdaptedAdapter, AdapterPolicy, AdapterTransformRule, BackendAdapter, LocalAdapter};
use taskgate::error::FailureKind;
use taskgate::protocol::{CanonicalRequest, ExecutionMode};
use taskgate::registry::{validate, BackendKind, RawRegistry};
use taskgate::routing::ResolvedTarget;
use tokio::sync::mpsc;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BUDGET: Duration = Duration::from_secs(5);

fn target(key: &str, location: &str, kind: BackendKind) -> ResolvedTarget {
    let raw = RawRegistry::new().with_entry(key, location, kind);
    let snapshot = validate(&raw, 1).unwrap();
    ResolvedTarget::from_entry(snapshot.get(key).unwrap())
}

fn local_adapter(timeout: Duration) -> LocalAdapter {
    LocalAdapter::new(AdapterPolicy::new(timeout), "/dispatch")
}

fn request() -> CanonicalRequest {
    CanonicalRequest::new("summarize", json!({"text": "hello"})).with_request_id("req-1")
}

#[tokio::test]
async fn test_local_adapter_returns_outputs() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/dispatch"))
        .and(header("x-request-id", "req-1"))
        .and(body_partial_json(json!({"task_type": "summarize"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"ok": true, "outputs": {"summary": "hi"}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let target = target("stats", &server.uri(), BackendKind::Local);
    let outputs = local_adapter(Duration::from_secs(2))
        .dispatch(&request(), &target, BUDGET)
        .await
        .unwrap();

    assert_eq!(outputs, json!({"summary": "hi"}));
}

#[tokio::test]
async fn test_local_adapter_unprocessable_is_caller_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/dispatch"))
        .respond_with(
            ResponseTemplate::new(422).set_body_json(json!({"error": {"message": "text is required"}})),
        )
        .mount(&server)
        .await;

    let target = target("stats", &server.uri(), BackendKind::Local);
    let failure = local_adapter(Duration::from_secs(2))
        .dispatch(&request(), &target, BUDGET)
        .await
        .unwrap_err();

    assert_eq!(failure.kind, FailureKind::InvalidRequest);
    assert_eq!(failure.status, Some(422));
    assert!(failure.message.contains("text is required"));
    assert!(!failure.is_fallback_eligible());
}

#[tokio::test]
async fn test_local_adapter_server_error_is_backend_caused() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/dispatch"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let target = target("stats", &server.uri(), BackendKind::Local);
    let failure = local_adapter(Duration::from_secs(2))
        .dispatch(&request(), &target, BUDGET)
        .await
        .unwrap_err();

    assert_eq!(failure.kind, FailureKind::UpstreamError);
    assert!(failure.backend_caused);
    assert!(failure.is_fallback_eligible());
}

#[tokio::test]
async fn test_demo_request_is_retried_once_on_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/dispatch"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(800)))
        .expect(2)
        .mount(&server)
        .await;

    let target = target("stats", &server.uri(), BackendKind::Local);
    let failure = local_adapter(Duration::from_millis(150))
        .dispatch(&request().with_mode(ExecutionMode::Demo), &target, BUDGET)
        .await
        .unwrap_err();

    assert_eq!(failure.kind, FailureKind::UpstreamTimeout);
    assert_eq!(failure.attempts, 2);
}

#[tokio::test]
async fn test_live_request_is_not_retried_on_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/dispatch"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(800)))
        .expect(1)
        .mount(&server)
        .await;

    let target = target("stats", &server.uri(), BackendKind::Local);
    let failure = local_adapter(Duration::from_millis(150))
        .dispatch(&request().with_mode(ExecutionMode::Live), &target, BUDGET)
        .await
        .unwrap_err();

    assert_eq!(failure.kind, FailureKind::UpstreamTimeout);
    assert_eq!(failure.attempts, 1);
}

#[tokio::test]
async fn test_closed_port_is_unreachable() {
    let target = target("stats", "http://127.0.0.1:9", BackendKind::Local);
    let failure = local_adapter(Duration::from_secs(2))
        .dispatch(&request(), &target, BUDGET)
        .await
        .unwrap_err();

    assert_eq!(failure.kind, FailureKind::AgentUnreachable);
}

#[tokio::test]
async fn test_adapted_adapter_translates_run() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/runs/wait"))
        .and(header("x-api-key", "secret-key"))
        .and(body_partial_json(json!({
            "assistant_id": "summarizer",
            "input": {"text": "hello"},
            "metadata": {"correlation_id": "req-1", "task_type": "summarize"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "success",
            "output": {"summary": "hi"},
            "run_id": "run-42"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let rule = AdapterTransformRule {
        default_assistant_id: Some("summarizer".to_string()),
        ..AdapterTransformRule::default()
    };
    let adapter = AdaptedAdapter::new(AdapterPolicy::new(Duration::from_secs(2)))
        .with_api_key("x-api-key", "secret-key")
        .with_rule("drafting", rule);
    let target = target("drafting", &server.uri(), BackendKind::Adapted);

    let outputs = adapter.dispatch(&request(), &target, BUDGET).await.unwrap();

    assert_eq!(outputs, json!({"summary": "hi"}));
}

#[tokio::test]
async fn test_adapted_run_error_with_invalid_input_is_caller_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/runs/wait"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "error",
            "error": {"code": "invalid_input", "message": "missing field"}
        })))
        .mount(&server)
        .await;

    let adapter = AdaptedAdapter::new(AdapterPolicy::new(Duration::from_secs(2)));
    let target = target("drafting", &server.uri(), BackendKind::Adapted);
    let failure = adapter.dispatch(&request(), &target, BUDGET).await.unwrap_err();

    assert_eq!(failure.kind, FailureKind::InvalidRequest);
    assert!(!failure.backend_caused);
}

#[tokio::test]
async fn test_adapted_stream_forwards_progress_and_ends_with_last_values() {
    let server = MockServer::start().await;
    let body = concat!(
        "event: metadata\ndata: {\"run_id\": \"run-1\"}\n\n",
        "event: values\ndata: {\"step\": 1}\n\n",
        "event: updates\ndata: {\"node\": \"draft\"}\n\n",
        "event: end\ndata: \n\n",
    );
    Mock::given(method("POST"))
        .and(path("/runs/stream"))
        .and(header("accept", "text/event-stream"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let adapter = AdaptedAdapter::new(AdapterPolicy::new(Duration::from_secs(2)));
    let target = target("drafting", &server.uri(), BackendKind::Adapted);
    let (tx, mut rx) = mpsc::channel(16);

    let outputs = adapter.stream(&request(), &target, BUDGET, tx).await.unwrap();

    assert_eq!(outputs, json!({"step": 1}));
    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(first.stage, "values");
    assert_eq!(second.stage, "updates");
    assert_eq!(second.data, json!({"node": "draft"}));
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_adapted_stream_without_terminal_event_is_upstream_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/runs/stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("event: values\ndata: {\"step\": 1}\n\n", "text/event-stream"),
        )
        .mount(&server)
        .await;

    let adapter = AdaptedAdapter::new(AdapterPolicy::new(Duration::from_secs(2)));
    let target = target("drafting", &server.uri(), BackendKind::Adapted);
    let (tx, _rx) = mpsc::channel(16);

    let failure = adapter.stream(&request(), &target, BUDGET, tx).await.unwrap_err();

    assert_eq!(failure.kind, FailureKind::UpstreamError);
    assert!(failure.backend_caused);
}
