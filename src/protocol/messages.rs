//! Canonical envelope types for the dispatch gateway
//!
//! These are the gateway's own request/result shapes. Backend adapters translate
//! them to and from each backend's native protocol; nothing in this module knows
//! about any particular backend.

use crate::registry::BackendKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Execution profile requested by the caller
///
/// `Demo` requests are side-effect-free, which makes them safe to retry after a
/// network-level timeout. `Live` requests are never retried by an adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Demo,
    #[default]
    Live,
}

impl ExecutionMode {
    /// Whether repeating the request cannot cause additional side effects
    pub fn is_side_effect_free(&self) -> bool {
        matches!(self, ExecutionMode::Demo)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Demo => "demo",
            ExecutionMode::Live => "live",
        }
    }
}

/// Canonical work request accepted by the gateway
///
/// # Examples
/// ```
/// use taskgate::protocol::{CanonicalRequest, ExecutionMode};
/// use serde_json::json;
///
/// let request = CanonicalRequest::new("statistical_analysis", json!({"dataset": "q3"}))
///     .with_request_id("req-42")
///     .with_mode(ExecutionMode::Demo)
///     .with_deadline_ms(5_000);
///
/// assert_eq!(request.request_id, "req-42");
/// assert!(request.mode.is_side_effect_free());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalRequest {
    /// Caller-supplied identifier used for idempotency and tracing
    #[serde(default = "generate_request_id")]
    pub request_id: String,
    /// Logical task type, resolved through the route table
    pub task_type: String,
    /// Execution profile
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Opaque key-value payload handed to the backend
    #[serde(default = "empty_inputs")]
    pub inputs: Value,
    /// Time budget for the whole request in milliseconds, shared by the
    /// primary and any fallback attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

fn empty_inputs() -> Value {
    Value::Object(Map::new())
}

impl CanonicalRequest {
    pub fn new(task_type: impl Into<String>, inputs: Value) -> Self {
        Self {
            request_id: generate_request_id(),
            task_type: task_type.into(),
            mode: ExecutionMode::default(),
            inputs,
            deadline_ms: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }

    /// Check caller-supplied fields. Failures here are never eligible for fallback.
    pub fn validate(&self) -> Result<(), String> {
        if self.request_id.trim().is_empty() {
            return Err("request_id must not be empty".to_string());
        }
        if self.task_type.trim().is_empty() {
            return Err("task_type must not be empty".to_string());
        }
        if !self.inputs.is_object() {
            return Err(format!(
                "inputs must be a JSON object, got {}",
                json_type_name(&self.inputs)
            ));
        }
        if self.deadline_ms == Some(0) {
            return Err("deadline_ms must be greater than zero".to_string());
        }
        Ok(())
    }

    /// Time budget for a single backend attempt
    pub fn budget(&self, default: Duration) -> Duration {
        self.deadline_ms
            .map(Duration::from_millis)
            .unwrap_or(default)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Which path produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchPath {
    Primary,
    Fallback,
}

impl fmt::Display for DispatchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchPath::Primary => write!(f, "primary"),
            DispatchPath::Fallback => write!(f, "fallback"),
        }
    }
}

/// Record of which backend and path actually served a request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Provenance {
    pub backend_key: String,
    pub path: DispatchPath,
    pub adapter_kind: BackendKind,
    /// Why the primary was abandoned, set only on the fallback path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

/// Error taxonomy exposed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    RegistryError,
    RoutingError,
    AgentUnreachable,
    AgentUnhealthy,
    UpstreamTimeout,
    UpstreamError,
    FallbackExhausted,
    InvalidRequest,
    Internal,
}

impl ErrorKind {
    /// HTTP status used by the dispatch endpoint for this kind
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::InvalidRequest => 400,
            ErrorKind::RoutingError => 404,
            ErrorKind::RegistryError => 422,
            ErrorKind::UpstreamError => 502,
            ErrorKind::AgentUnreachable
            | ErrorKind::AgentUnhealthy
            | ErrorKind::FallbackExhausted => 503,
            ErrorKind::UpstreamTimeout => 504,
            ErrorKind::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::RegistryError => "RegistryError",
            ErrorKind::RoutingError => "RoutingError",
            ErrorKind::AgentUnreachable => "AgentUnreachable",
            ErrorKind::AgentUnhealthy => "AgentUnhealthy",
            ErrorKind::UpstreamTimeout => "UpstreamTimeout",
            ErrorKind::UpstreamError => "UpstreamError",
            ErrorKind::FallbackExhausted => "FallbackExhausted",
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// Structured error carried by a failed [`CanonicalResult`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    /// Actionable context: offending key, known alternatives, failed paths
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

/// Canonical result returned for every dispatch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalResult {
    pub ok: bool,
    pub request_id: String,
    #[serde(default)]
    pub outputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl CanonicalResult {
    pub fn success(request_id: impl Into<String>, outputs: Value, provenance: Provenance) -> Self {
        Self {
            ok: true,
            request_id: request_id.into(),
            outputs,
            provenance: Some(provenance),
            error: None,
        }
    }

    pub fn failure(request_id: impl Into<String>, error: ErrorBody) -> Self {
        Self {
            ok: false,
            request_id: request_id.into(),
            outputs: Value::Null,
            provenance: None,
            error: Some(error),
        }
    }

    /// HTTP status for the dispatch endpoint
    pub fn http_status(&self) -> u16 {
        match &self.error {
            None => 200,
            Some(error) => error.kind.http_status(),
        }
    }
}

/// Incremental update emitted by an adapter while a streamed dispatch runs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressUpdate {
    pub stage: String,
    #[serde(default)]
    pub data: Value,
}

impl ProgressUpdate {
    pub fn new(stage: impl Into<String>, data: Value) -> Self {
        Self {
            stage: stage.into(),
            data,
        }
    }
}

/// Lifecycle event of a streamed dispatch
///
/// A stream always yields `started`, then zero or more `progress`, then exactly
/// one of `completed` or `failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent {
    Started {
        request_id: String,
        task_type: String,
    },
    Progress {
        request_id: String,
        backend_key: String,
        stage: String,
        #[serde(default)]
        data: Value,
    },
    Completed {
        result: CanonicalResult,
    },
    Failed {
        result: CanonicalResult,
    },
}

impl DispatchEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            DispatchEvent::Started { .. } => "started",
            DispatchEvent::Progress { .. } => "progress",
            DispatchEvent::Completed { .. } => "completed",
            DispatchEvent::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DispatchEvent::Completed { .. } | DispatchEvent::Failed { .. }
        )
    }

    /// Terminal event for a finished dispatch
    pub fn terminal(result: CanonicalResult) -> Self {
        if result.ok {
            DispatchEvent::Completed { result }
        } else {
            DispatchEvent::Failed { result }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_defaults_when_fields_omitted() {
        let request: CanonicalRequest =
            serde_json::from_value(json!({"task_type": "T1"})).unwrap();

        assert!(!request.request_id.is_empty());
        assert_eq!(request.mode, ExecutionMode::Live);
        assert_eq!(request.inputs, json!({}));
        assert_eq!(request.deadline_ms, None);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_request_validation_rejects_caller_errors() {
        let empty_task = CanonicalRequest::new("  ", json!({}));
        assert!(empty_task.validate().is_err());

        let array_inputs = CanonicalRequest::new("T1", json!([1, 2, 3]));
        let err = array_inputs.validate().unwrap_err();
        assert!(err.contains("array"));

        let zero_deadline = CanonicalRequest::new("T1", json!({})).with_deadline_ms(0);
        assert!(zero_deadline.validate().is_err());
    }

    #[test]
    fn test_budget_prefers_request_deadline() {
        let default = Duration::from_secs(30);
        let request = CanonicalRequest::new("T1", json!({}));
        assert_eq!(request.budget(default), default);

        let request = request.with_deadline_ms(250);
        assert_eq!(request.budget(default), Duration::from_millis(250));
    }

    #[test]
    fn test_mode_side_effects() {
        assert!(ExecutionMode::Demo.is_side_effect_free());
        assert!(!ExecutionMode::Live.is_side_effect_free());
        assert_eq!(serde_json::to_string(&ExecutionMode::Demo).unwrap(), "\"demo\"");
    }

    #[test]
    fn test_success_result_serialization_omits_error() {
        let result = CanonicalResult::success(
            "req-1",
            json!({"answer": 42}),
            Provenance {
                backend_key: "a".to_string(),
                path: DispatchPath::Primary,
                adapter_kind: BackendKind::Local,
                fallback_reason: None,
            },
        );

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["ok"], true);
        assert_eq!(json["provenance"]["path"], "primary");
        assert_eq!(json["provenance"]["adapter_kind"], "local");
        assert!(json.get("error").is_none());
        assert!(json["provenance"].get("fallback_reason").is_none());
        assert_eq!(result.http_status(), 200);
    }

    #[test]
    fn test_failure_result_status_mapping() {
        let result = CanonicalResult::failure(
            "req-1",
            ErrorBody {
                kind: ErrorKind::UpstreamTimeout,
                message: "timed out".to_string(),
                details: Value::Null,
            },
        );

        assert!(!result.ok);
        assert_eq!(result.http_status(), 504);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["error"]["kind"], "UpstreamTimeout");
        assert!(json["error"].get("details").is_none());
    }

    #[test]
    fn test_dispatch_event_tagging() {
        let event = DispatchEvent::Progress {
            request_id: "req-1".to_string(),
            backend_key: "a".to_string(),
            stage: "updates".to_string(),
            data: json!({"step": 1}),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "progress");
        assert!(!event.is_terminal());

        let terminal = DispatchEvent::terminal(CanonicalResult::failure(
            "req-1",
            ErrorBody {
                kind: ErrorKind::Internal,
                message: "boom".to_string(),
                details: Value::Null,
            },
        ));
        assert_eq!(terminal.event_name(), "failed");
        assert!(terminal.is_terminal());
    }
}
