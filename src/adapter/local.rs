//! Adapter for backends that speak the canonical request shape

use crate::adapter::{classify_status, classify_transport_error, send_with_policy};
use crate::adapter::{AdapterPolicy, BackendAdapter};
use crate::adapter_span;
use crate::config::LocalAdapterSection;
use crate::error::DispatchFailure;
use crate::protocol::CanonicalRequest;
use crate::registry::BackendKind;
use crate::routing::ResolvedTarget;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, Instrument};

/// Error kinds a local backend uses to blame the caller's input
const CALLER_ERROR_KINDS: [&str; 3] = ["invalid_input", "invalid_request", "InvalidRequest"];

/// Body a local backend answers with
#[derive(Debug, Deserialize)]
struct LocalResponse {
    ok: bool,
    #[serde(default)]
    outputs: Value,
    #[serde(default)]
    error: Option<LocalError>,
}

#[derive(Debug, Deserialize)]
struct LocalError {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// POSTs the canonical request to `{location}{dispatch_path}`
pub struct LocalAdapter {
    client: reqwest::Client,
    policy: AdapterPolicy,
    dispatch_path: String,
}

impl LocalAdapter {
    pub fn new(policy: AdapterPolicy, dispatch_path: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            policy,
            dispatch_path: dispatch_path.into(),
        }
    }

    pub fn from_config(section: &LocalAdapterSection) -> Self {
        Self::new(
            AdapterPolicy::new(Duration::from_millis(section.timeout_ms))
                .with_retry_idempotent_timeouts(section.retry_idempotent_timeouts),
            section.dispatch_path.clone(),
        )
    }

    pub fn policy(&self) -> &AdapterPolicy {
        &self.policy
    }

    fn interpret(&self, backend_key: &str, body: &str) -> Result<Value, DispatchFailure> {
        let parsed: LocalResponse = serde_json::from_str(body).map_err(|e| {
            DispatchFailure::upstream(backend_key, format!("malformed canonical response: {e}"))
        })?;

        if parsed.ok {
            return Ok(parsed.outputs);
        }

        let error = parsed.error.unwrap_or(LocalError {
            kind: None,
            message: None,
        });
        let message = error
            .message
            .unwrap_or_else(|| "backend reported failure without a message".to_string());
        match error.kind.as_deref() {
            Some(kind) if CALLER_ERROR_KINDS.contains(&kind) => {
                Err(DispatchFailure::caller_error(backend_key, message))
            }
            _ => Err(DispatchFailure::upstream(backend_key, message)),
        }
    }
}

#[async_trait]
impl BackendAdapter for LocalAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn name(&self) -> &str {
        "local"
    }

    async fn dispatch(
        &self,
        request: &CanonicalRequest,
        target: &ResolvedTarget,
        budget: Duration,
    ) -> Result<Value, DispatchFailure> {
        let url = target.endpoint(&self.dispatch_path);
        let key = target.backend_key.as_str();
        let span = adapter_span!(
            adapter = "local",
            backend_key = %key,
            request_id = %request.request_id
        );

        async {
            let response = send_with_policy(&self.policy, key, request.mode, budget, || {
                self.client
                    .post(&url)
                    .header("x-request-id", &request.request_id)
                    .json(request)
            })
            .await?;

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| classify_transport_error(key, &e, budget))?;

            debug!(status = status.as_u16(), "Local backend answered");

            if !status.is_success() {
                return Err(classify_status(key, status.as_u16(), &body));
            }
            self.interpret(key, &body)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    fn adapter() -> LocalAdapter {
        LocalAdapter::from_config(&LocalAdapterSection::default())
    }

    #[test]
    fn test_successful_body_yields_outputs() {
        let outputs = adapter()
            .interpret("a", r#"{"ok": true, "outputs": {"mean": 4.5}}"#)
            .unwrap();
        assert_eq!(outputs["mean"], 4.5);
    }

    #[test]
    fn test_invalid_input_is_caller_error() {
        let failure = adapter()
            .interpret(
                "a",
                r#"{"ok": false, "error": {"kind": "invalid_input", "message": "missing series"}}"#,
            )
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::InvalidRequest);
        assert_eq!(failure.message, "missing series");
    }

    #[test]
    fn test_other_backend_failure_is_upstream() {
        let failure = adapter()
            .interpret("a", r#"{"ok": false, "error": {"message": "model crashed"}}"#)
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::UpstreamError);
        assert!(failure.is_fallback_eligible());
    }

    #[test]
    fn test_malformed_body_is_upstream() {
        let failure = adapter().interpret("a", "<html>").unwrap_err();
        assert_eq!(failure.kind, FailureKind::UpstreamError);
        assert!(failure.backend_caused);
    }
}
