//! Adapter for backends hosted on the external agent platform
//!
//! The platform runs "assistants" on "threads". A canonical request becomes a
//! run against the assistant configured for its task type, on a thread derived
//! from the request id, so the same request always lands on the same thread.
//!
//! # Request Format
//!
//! ```json
//! {
//!   "assistant_id": "drafter",
//!   "input": { ... canonical inputs ... },
//!   "config": { "configurable": { "thread_id": "…", "mode": "demo" } },
//!   "metadata": { "correlation_id": "<request_id>", "task_type": "draft" }
//! }
//! ```
//!
//! # Response Format
//!
//! ```json
//! { "status": "success", "output": { ... }, "error": null, "run_id": "…" }
//! ```

use crate::adapter::{classify_status, classify_transport_error, send_with_policy};
use crate::adapter::{AdapterPolicy, BackendAdapter, SseDecoder, SseFrame};
use crate::adapter_span;
use crate::config::{AdaptedAdapterSection, TransformRuleConfig};
use crate::error::DispatchFailure;
use crate::protocol::{CanonicalRequest, ProgressUpdate};
use crate::registry::BackendKind;
use crate::routing::ResolvedTarget;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

const DEFAULT_THREAD_PREFIX: &str = "taskgate:";
const DEFAULT_CORRELATION_FIELD: &str = "correlation_id";

/// Platform error codes that blame the caller's input
const CALLER_ERROR_CODES: [&str; 2] = ["invalid_input", "validation_error"];

/// Stream events forwarded to the caller as progress
const PROGRESS_EVENTS: [&str; 4] = ["values", "updates", "messages", "custom"];

/// Per-backend mapping between the canonical shape and the platform's
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterTransformRule {
    pub default_assistant_id: Option<String>,
    pub assistant_ids: HashMap<String, String>,
    pub thread_prefix: String,
    pub correlation_field: String,
}

impl Default for AdapterTransformRule {
    fn default() -> Self {
        Self {
            default_assistant_id: None,
            assistant_ids: HashMap::new(),
            thread_prefix: DEFAULT_THREAD_PREFIX.to_string(),
            correlation_field: DEFAULT_CORRELATION_FIELD.to_string(),
        }
    }
}

impl From<&TransformRuleConfig> for AdapterTransformRule {
    fn from(config: &TransformRuleConfig) -> Self {
        Self {
            default_assistant_id: config.assistant_id.clone(),
            assistant_ids: config.assistants.clone(),
            thread_prefix: config
                .thread_prefix
                .clone()
                .unwrap_or_else(|| DEFAULT_THREAD_PREFIX.to_string()),
            correlation_field: config
                .correlation_field
                .clone()
                .unwrap_or_else(|| DEFAULT_CORRELATION_FIELD.to_string()),
        }
    }
}

impl AdapterTransformRule {
    /// Assistant for a task type: explicit mapping, then the backend default,
    /// then the task type itself
    pub fn assistant_for(&self, task_type: &str) -> String {
        self.assistant_ids
            .get(task_type)
            .or(self.default_assistant_id.as_ref())
            .cloned()
            .unwrap_or_else(|| task_type.to_string())
    }

    /// Deterministic platform thread id for a request
    pub fn thread_id(&self, request_id: &str) -> String {
        let name = format!("{}{}", self.thread_prefix, request_id);
        Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
    }

    /// Outbound run body for a canonical request
    pub fn outbound(&self, request: &CanonicalRequest) -> Value {
        let mut metadata = serde_json::Map::new();
        metadata.insert(
            self.correlation_field.clone(),
            Value::String(request.request_id.clone()),
        );
        metadata.insert(
            "task_type".to_string(),
            Value::String(request.task_type.clone()),
        );

        json!({
            "assistant_id": self.assistant_for(&request.task_type),
            "input": request.inputs,
            "config": {
                "configurable": {
                    "thread_id": self.thread_id(&request.request_id),
                    "mode": request.mode.as_str(),
                }
            },
            "metadata": metadata,
        })
    }
}

/// Run result as returned by `/runs/wait`
#[derive(Debug, Deserialize)]
struct RunResponse {
    status: String,
    #[serde(default)]
    output: Value,
    #[serde(default)]
    error: Option<RunError>,
    #[serde(default)]
    run_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RunError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl RunError {
    fn into_failure(self, backend_key: &str, default_message: &str) -> DispatchFailure {
        let message = self
            .message
            .unwrap_or_else(|| default_message.to_string());
        match self.code.as_deref() {
            Some(code) if CALLER_ERROR_CODES.contains(&code) => {
                DispatchFailure::caller_error(backend_key, message)
            }
            Some(code) => DispatchFailure::upstream(backend_key, format!("{code}: {message}")),
            None => DispatchFailure::upstream(backend_key, message),
        }
    }
}

/// Outcome of one stream frame
enum FrameOutcome {
    Continue,
    Done(Result<Value, DispatchFailure>),
}

/// Talks to the hosted agent platform's run API
pub struct AdaptedAdapter {
    client: reqwest::Client,
    policy: AdapterPolicy,
    wait_path: String,
    stream_path: String,
    api_key: Option<(String, String)>,
    rules: HashMap<String, AdapterTransformRule>,
    default_rule: AdapterTransformRule,
}

impl AdaptedAdapter {
    pub fn new(policy: AdapterPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            policy,
            wait_path: "/runs/wait".to_string(),
            stream_path: "/runs/stream".to_string(),
            api_key: None,
            rules: HashMap::new(),
            default_rule: AdapterTransformRule::default(),
        }
    }

    pub fn from_config(section: &AdaptedAdapterSection) -> Self {
        let mut adapter = Self::new(
            AdapterPolicy::new(Duration::from_millis(section.timeout_ms))
                .with_retry_idempotent_timeouts(section.retry_idempotent_timeouts),
        )
        .with_paths(section.wait_path.clone(), section.stream_path.clone());

        if let Some(key) = section.api_key() {
            adapter = adapter.with_api_key(section.api_key_header.clone(), key);
        } else if let Some(env) = &section.api_key_env {
            warn!(env = %env, "Platform API key variable is not set; sending unauthenticated requests");
        }

        for (backend_key, rule) in &section.rules {
            adapter = adapter.with_rule(backend_key.clone(), AdapterTransformRule::from(rule));
        }
        adapter
    }

    pub fn with_paths(mut self, wait_path: String, stream_path: String) -> Self {
        self.wait_path = wait_path;
        self.stream_path = stream_path;
        self
    }

    pub fn with_api_key(mut self, header: impl Into<String>, key: impl Into<String>) -> Self {
        self.api_key = Some((header.into(), key.into()));
        self
    }

    pub fn with_rule(mut self, backend_key: impl Into<String>, rule: AdapterTransformRule) -> Self {
        self.rules.insert(backend_key.into(), rule);
        self
    }

    pub fn rule_for(&self, backend_key: &str) -> &AdapterTransformRule {
        self.rules.get(backend_key).unwrap_or(&self.default_rule)
    }

    fn post(&self, url: &str, request: &CanonicalRequest, body: &Value) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(url)
            .header("x-request-id", &request.request_id)
            .json(body);
        if let Some((header, key)) = &self.api_key {
            builder = builder.header(header.as_str(), key.as_str());
        }
        builder
    }

    fn interpret_run(&self, backend_key: &str, body: &str) -> Result<Value, DispatchFailure> {
        let run: RunResponse = serde_json::from_str(body).map_err(|e| {
            DispatchFailure::upstream(backend_key, format!("malformed run response: {e}"))
        })?;

        debug!(run_id = ?run.run_id, status = %run.status, "Platform run finished");

        match run.status.as_str() {
            "success" => Ok(run.output),
            "error" => Err(run
                .error
                .unwrap_or_default()
                .into_failure(backend_key, "run failed")),
            "interrupted" => Err(DispatchFailure::upstream(
                backend_key,
                "run was interrupted on the platform",
            )),
            "timeout" => Err(DispatchFailure::timeout(
                backend_key,
                "run timed out on the platform",
            )),
            other => Err(DispatchFailure::upstream(
                backend_key,
                format!("unexpected run status '{other}'"),
            )),
        }
    }

    async fn handle_frame(
        &self,
        backend_key: &str,
        frame: SseFrame,
        last_values: &mut Value,
        progress: &mpsc::Sender<ProgressUpdate>,
    ) -> FrameOutcome {
        let data = parse_frame_data(&frame.data);
        match frame.event.as_str() {
            "metadata" => FrameOutcome::Continue,
            "end" => {
                let outputs = if data.is_null() {
                    std::mem::take(last_values)
                } else {
                    data
                };
                FrameOutcome::Done(Ok(outputs))
            }
            "error" => {
                let error = match &data {
                    Value::Object(_) => serde_json::from_value::<RunError>(data.clone())
                        .unwrap_or_default(),
                    Value::String(message) => RunError {
                        code: None,
                        message: Some(message.clone()),
                    },
                    _ => RunError::default(),
                };
                FrameOutcome::Done(Err(error.into_failure(backend_key, "run failed mid-stream")))
            }
            event if is_progress_event(event) => {
                if event == "values" {
                    *last_values = data.clone();
                }
                // A closed receiver means nobody is listening; keep draining
                let _ = progress.send(ProgressUpdate::new(event, data)).await;
                FrameOutcome::Continue
            }
            other => {
                debug!(event = %other, "Ignoring unknown stream event");
                FrameOutcome::Continue
            }
        }
    }
}

fn is_progress_event(event: &str) -> bool {
    PROGRESS_EVENTS.contains(&event)
        || event
            .split_once('/')
            .is_some_and(|(head, _)| PROGRESS_EVENTS.contains(&head))
}

fn parse_frame_data(data: &str) -> Value {
    if data.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(data).unwrap_or_else(|_| Value::String(data.to_string()))
}

#[async_trait]
impl BackendAdapter for AdaptedAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Adapted
    }

    fn name(&self) -> &str {
        "adapted"
    }

    async fn dispatch(
        &self,
        request: &CanonicalRequest,
        target: &ResolvedTarget,
        budget: Duration,
    ) -> Result<Value, DispatchFailure> {
        let key = target.backend_key.as_str();
        let url = target.endpoint(&self.wait_path);
        let body = self.rule_for(key).outbound(request);
        let span = adapter_span!(
            adapter = "adapted",
            backend_key = %key,
            request_id = %request.request_id
        );

        async {
            let response = send_with_policy(&self.policy, key, request.mode, budget, || {
                self.post(&url, request, &body)
            })
            .await?;

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| classify_transport_error(key, &e, budget))?;

            if !status.is_success() {
                return Err(classify_status(key, status.as_u16(), &text));
            }
            self.interpret_run(key, &text)
        }
        .instrument(span)
        .await
    }

    async fn stream(
        &self,
        request: &CanonicalRequest,
        target: &ResolvedTarget,
        budget: Duration,
        progress: mpsc::Sender<ProgressUpdate>,
    ) -> Result<Value, DispatchFailure> {
        let key = target.backend_key.as_str();
        let url = target.endpoint(&self.stream_path);
        let mut body = self.rule_for(key).outbound(request);
        body["stream_mode"] = json!(["values", "updates", "custom"]);
        let span = adapter_span!(
            adapter = "adapted",
            backend_key = %key,
            request_id = %request.request_id,
            streaming = true
        );

        async {
            let response = send_with_policy(&self.policy, key, request.mode, budget, || {
                self.post(&url, request, &body)
                    .header(reqwest::header::ACCEPT, "text/event-stream")
            })
            .await?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(classify_status(key, status.as_u16(), &text));
            }

            let mut decoder = SseDecoder::new();
            let mut last_values = Value::Null;
            let mut chunks = response.bytes_stream();

            while let Some(chunk) = chunks.next().await {
                let chunk = chunk.map_err(|e| classify_transport_error(key, &e, budget))?;
                for frame in decoder.push(&chunk) {
                    if let FrameOutcome::Done(result) = self
                        .handle_frame(key, frame, &mut last_values, &progress)
                        .await
                    {
                        return result;
                    }
                }
            }

            if let Some(frame) = decoder.finish() {
                if let FrameOutcome::Done(result) = self
                    .handle_frame(key, frame, &mut last_values, &progress)
                    .await
                {
                    return result;
                }
            }

            Err(DispatchFailure::upstream(
                key,
                "event stream closed without a terminal event",
            ))
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::protocol::ExecutionMode;

    fn rule() -> AdapterTransformRule {
        AdapterTransformRule {
            default_assistant_id: Some("generalist".to_string()),
            assistant_ids: HashMap::from([("draft".to_string(), "drafter".to_string())]),
            ..AdapterTransformRule::default()
        }
    }

    fn adapter() -> AdaptedAdapter {
        AdaptedAdapter::new(AdapterPolicy::new(Duration::from_secs(5)))
    }

    #[test]
    fn test_assistant_selection() {
        let rule = rule();
        assert_eq!(rule.assistant_for("draft"), "drafter");
        assert_eq!(rule.assistant_for("summarize"), "generalist");
        assert_eq!(
            AdapterTransformRule::default().assistant_for("summarize"),
            "summarize"
        );
    }

    #[test]
    fn test_thread_id_is_deterministic() {
        let rule = rule();
        let first = rule.thread_id("req-1");
        assert_eq!(first, rule.thread_id("req-1"));
        assert_ne!(first, rule.thread_id("req-2"));
        assert!(Uuid::parse_str(&first).is_ok());

        let other_prefix = AdapterTransformRule {
            thread_prefix: "other:".to_string(),
            ..rule.clone()
        };
        assert_ne!(first, other_prefix.thread_id("req-1"));
    }

    #[test]
    fn test_outbound_shape() {
        let request = CanonicalRequest::new("draft", json!({"topic": "rust"}))
            .with_request_id("req-9")
            .with_mode(ExecutionMode::Demo);

        let body = rule().outbound(&request);

        assert_eq!(body["assistant_id"], "drafter");
        assert_eq!(body["input"]["topic"], "rust");
        assert_eq!(body["config"]["configurable"]["mode"], "demo");
        assert_eq!(
            body["config"]["configurable"]["thread_id"],
            rule().thread_id("req-9")
        );
        assert_eq!(body["metadata"]["correlation_id"], "req-9");
        assert_eq!(body["metadata"]["task_type"], "draft");
    }

    #[test]
    fn test_custom_correlation_field() {
        let rule = AdapterTransformRule {
            correlation_field: "trace".to_string(),
            ..AdapterTransformRule::default()
        };
        let body = rule.outbound(&CanonicalRequest::new("t", json!({})).with_request_id("r"));
        assert_eq!(body["metadata"]["trace"], "r");
        assert!(body["metadata"].get("correlation_id").is_none());
    }

    #[test]
    fn test_inbound_status_mapping() {
        let adapter = adapter();

        let ok = adapter
            .interpret_run("p", r#"{"status": "success", "output": {"text": "hi"}, "run_id": "r1"}"#)
            .unwrap();
        assert_eq!(ok["text"], "hi");

        let invalid = adapter
            .interpret_run(
                "p",
                r#"{"status": "error", "error": {"code": "validation_error", "message": "topic required"}}"#,
            )
            .unwrap_err();
        assert_eq!(invalid.kind, FailureKind::InvalidRequest);

        let crashed = adapter
            .interpret_run("p", r#"{"status": "error", "error": {"code": "internal", "message": "boom"}}"#)
            .unwrap_err();
        assert_eq!(crashed.kind, FailureKind::UpstreamError);
        assert!(crashed.backend_caused);

        let interrupted = adapter
            .interpret_run("p", r#"{"status": "interrupted"}"#)
            .unwrap_err();
        assert_eq!(interrupted.kind, FailureKind::UpstreamError);

        let timed_out = adapter
            .interpret_run("p", r#"{"status": "timeout"}"#)
            .unwrap_err();
        assert_eq!(timed_out.kind, FailureKind::UpstreamTimeout);
    }

    #[test]
    fn test_progress_event_names() {
        assert!(is_progress_event("values"));
        assert!(is_progress_event("messages/partial"));
        assert!(!is_progress_event("metadata"));
        assert!(!is_progress_event("end"));
    }

    #[tokio::test]
    async fn test_end_frame_falls_back_to_last_values() {
        let adapter = adapter();
        let (tx, mut rx) = mpsc::channel(8);
        let mut last_values = Value::Null;

        let values = SseFrame {
            event: "values".to_string(),
            data: r#"{"draft": "v2"}"#.to_string(),
            id: None,
        };
        assert!(matches!(
            adapter.handle_frame("p", values, &mut last_values, &tx).await,
            FrameOutcome::Continue
        ));

        let end = SseFrame {
            event: "end".to_string(),
            data: String::new(),
            id: None,
        };
        match adapter.handle_frame("p", end, &mut last_values, &tx).await {
            FrameOutcome::Done(Ok(outputs)) => assert_eq!(outputs["draft"], "v2"),
            _ => panic!("expected terminal success"),
        }

        let update = rx.recv().await.unwrap();
        assert_eq!(update.stage, "values");
    }
}
