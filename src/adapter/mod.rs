//! Backend adapters
//!
//! One adapter per backend shape. An adapter translates the canonical request
//! into whatever its backend speaks, owns the timeout and retry policy for that
//! class of backend, and classifies every failure into a [`DispatchFailure`]
//! the fallback coordinator can reason about.

pub mod adapted;
pub mod local;
pub mod sse;

pub use adapted::{AdaptedAdapter, AdapterTransformRule};
pub use local::LocalAdapter;
pub use sse::{SseDecoder, SseFrame};

use crate::config::AdaptersSection;
use crate::error::DispatchFailure;
use crate::protocol::{CanonicalRequest, ExecutionMode, ProgressUpdate};
use crate::registry::BackendKind;
use crate::routing::ResolvedTarget;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Strategy for talking to one shape of backend
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Backend kind this adapter serves
    fn kind(&self) -> BackendKind;

    fn name(&self) -> &str;

    /// Run one request to completion, returning the canonical outputs
    async fn dispatch(
        &self,
        request: &CanonicalRequest,
        target: &ResolvedTarget,
        budget: Duration,
    ) -> Result<Value, DispatchFailure>;

    /// Run one request, forwarding incremental updates to `progress`
    ///
    /// Backends without incremental framing emit nothing and return the
    /// terminal outcome.
    async fn stream(
        &self,
        request: &CanonicalRequest,
        target: &ResolvedTarget,
        budget: Duration,
        progress: mpsc::Sender<ProgressUpdate>,
    ) -> Result<Value, DispatchFailure> {
        drop(progress);
        self.dispatch(request, target, budget).await
    }
}

/// Adapters indexed by the backend kind they serve
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<BackendKind, Arc<dyn BackendAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Production adapters built from the `[adapters]` config section
    pub fn from_config(section: &AdaptersSection) -> Self {
        Self::new()
            .with_adapter(Arc::new(LocalAdapter::from_config(&section.local)))
            .with_adapter(Arc::new(AdaptedAdapter::from_config(&section.adapted)))
    }

    /// Register an adapter, replacing any adapter for the same kind
    pub fn with_adapter(mut self, adapter: Arc<dyn BackendAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn BackendAdapter>> {
        self.adapters.get(&kind).cloned()
    }
}

/// Timeout and retry policy for one backend class
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterPolicy {
    pub timeout: Duration,
    /// Retry once, without backoff, when the policy timeout fires before the
    /// request deadline and the request is side-effect free
    pub retry_idempotent_timeouts: bool,
}

impl AdapterPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            retry_idempotent_timeouts: true,
        }
    }

    pub fn with_retry_idempotent_timeouts(mut self, retry: bool) -> Self {
        self.retry_idempotent_timeouts = retry;
        self
    }

    fn max_attempts(&self, mode: ExecutionMode) -> u32 {
        if self.retry_idempotent_timeouts && mode.is_side_effect_free() {
            2
        } else {
            1
        }
    }
}

/// Send a request under `policy`, bounded by `budget`
///
/// `build` is called once per attempt. Each attempt's timeout is the smaller of
/// the policy timeout and the time left in the budget.
pub(crate) async fn send_with_policy<F>(
    policy: &AdapterPolicy,
    backend_key: &str,
    mode: ExecutionMode,
    budget: Duration,
    build: F,
) -> Result<reqwest::Response, DispatchFailure>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let deadline = Instant::now() + budget;
    let max_attempts = policy.max_attempts(mode);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(
                DispatchFailure::timeout(backend_key, "request deadline elapsed before sending")
                    .with_attempts(attempt - 1),
            );
        }
        let timeout = policy.timeout.min(remaining);
        let policy_fired_first = policy.timeout < remaining;

        debug!(
            backend_key = %backend_key,
            attempt,
            max_attempts,
            timeout_ms = timeout.as_millis() as u64,
            "Sending backend request"
        );

        match build().timeout(timeout).send().await {
            Ok(response) => return Ok(response),
            Err(e) if e.is_timeout() && policy_fired_first && attempt < max_attempts => {
                warn!(
                    backend_key = %backend_key,
                    attempt,
                    "Backend timed out on an idempotent request, retrying once"
                );
            }
            Err(e) => {
                return Err(classify_transport_error(backend_key, &e, timeout).with_attempts(attempt))
            }
        }
    }
}

/// Map a transport-level error to a dispatch failure
pub(crate) fn classify_transport_error(
    backend_key: &str,
    error: &reqwest::Error,
    timeout: Duration,
) -> DispatchFailure {
    if error.is_timeout() {
        DispatchFailure::timeout(
            backend_key,
            format!("no response within {}ms", timeout.as_millis()),
        )
    } else if error.is_connect() {
        DispatchFailure::unreachable(backend_key, format!("connection failed: {error}"))
    } else if error.is_builder() {
        DispatchFailure::gateway_fault(backend_key, format!("could not build request: {error}"))
    } else {
        DispatchFailure::upstream(backend_key, format!("transport error: {error}"))
    }
}

/// Map a non-success HTTP status to a dispatch failure
pub(crate) fn classify_status(backend_key: &str, status: u16, body: &str) -> DispatchFailure {
    let message = format!("HTTP {status}: {}", error_message_from_body(body));
    let failure = match status {
        400 | 413 | 415 | 422 => DispatchFailure::caller_error(backend_key, message),
        _ => DispatchFailure::upstream(backend_key, message),
    };
    failure.with_status(status)
}

const MAX_BODY_EXCERPT: usize = 200;

/// Best-effort human message from an error response body
pub(crate) fn error_message_from_body(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let candidates = [
            value.pointer("/error/message"),
            value.get("error"),
            value.get("message"),
            value.get("detail"),
        ];
        if let Some(text) = candidates.into_iter().flatten().find_map(Value::as_str) {
            return text.to_string();
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty response body".to_string();
    }
    trimmed.chars().take(MAX_BODY_EXCERPT).collect()
}
