//! Mock implementations for testing
//!
//! Provides a scripted [`BackendAdapter`] and an in-memory [`HealthGate`] so the
//! gateway and fallback coordinator can be exercised without real backends.

use crate::adapter::BackendAdapter;
use crate::error::{DispatchFailure, FailureKind};
use crate::health::{HealthGate, HealthRecord, HealthStatus};
use crate::protocol::{CanonicalRequest, ProgressUpdate};
use crate::registry::BackendKind;
use crate::routing::ResolvedTarget;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

/// Scripted behavior for one backend key
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Output(Value),
    Failure(FailureKind),
    /// Sleep, then behave as the inner outcome
    Delayed(Duration, Box<MockOutcome>),
}

/// Shared record of the calls a [`MockAdapter`] received
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<(String, CanonicalRequest)>>>,
    active: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
}

/// A call in progress; leaves the active count when dropped
struct ActiveCall {
    active: Arc<AtomicUsize>,
}

impl Drop for ActiveCall {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CallLog {
    fn record(&self, backend_key: &str, request: &CanonicalRequest) -> ActiveCall {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((backend_key.to_string(), request.clone()));
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        ActiveCall {
            active: Arc::clone(&self.active),
        }
    }

    fn complete(&self, call: ActiveCall) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        drop(call);
    }

    /// Calls still running right now
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Calls that ran to an outcome, success or failure
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn count(&self, backend_key: &str) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.iter().filter(|(k, _)| k == backend_key).count())
            .unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }

    /// Backend keys in call order
    pub fn order(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|calls| calls.iter().map(|(k, _)| k.clone()).collect())
            .unwrap_or_default()
    }
}

/// Mock adapter answering from a per-key script
///
/// Keys without a script echo the request inputs back.
#[derive(Debug, Clone)]
pub struct MockAdapter {
    kind: BackendKind,
    outcomes: HashMap<String, MockOutcome>,
    progress: Vec<String>,
    calls: CallLog,
}

impl MockAdapter {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            outcomes: HashMap::new(),
            progress: Vec::new(),
            calls: CallLog::default(),
        }
    }

    pub fn with_outcome(mut self, backend_key: impl Into<String>, outcome: MockOutcome) -> Self {
        self.outcomes.insert(backend_key.into(), outcome);
        self
    }

    pub fn with_output(self, backend_key: impl Into<String>, outputs: Value) -> Self {
        self.with_outcome(backend_key, MockOutcome::Output(outputs))
    }

    pub fn with_failure(self, backend_key: impl Into<String>, kind: FailureKind) -> Self {
        self.with_outcome(backend_key, MockOutcome::Failure(kind))
    }

    /// Succeed with `outputs` only after `delay`
    pub fn with_delay(self, backend_key: impl Into<String>, delay: Duration, outputs: Value) -> Self {
        self.with_outcome(
            backend_key,
            MockOutcome::Delayed(delay, Box::new(MockOutcome::Output(outputs))),
        )
    }

    /// Stages emitted, in order, by `stream` before the outcome
    pub fn with_progress<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.progress = stages.into_iter().map(Into::into).collect();
        self
    }

    /// Handle to the calls this adapter will receive
    pub fn call_counter(&self) -> CallLog {
        self.calls.clone()
    }

    async fn play(&self, request: &CanonicalRequest, backend_key: &str) -> Result<Value, DispatchFailure> {
        let mut outcome = self
            .outcomes
            .get(backend_key)
            .cloned()
            .unwrap_or_else(|| {
                MockOutcome::Output(json!({ "echo": request.inputs, "backend": backend_key }))
            });

        loop {
            match outcome {
                MockOutcome::Output(value) => return Ok(value),
                MockOutcome::Failure(kind) => return Err(failure_for(backend_key, kind)),
                MockOutcome::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    outcome = *inner;
                }
            }
        }
    }
}

fn failure_for(backend_key: &str, kind: FailureKind) -> DispatchFailure {
    let message = format!("mock {kind}");
    match kind {
        FailureKind::AgentUnreachable => DispatchFailure::unreachable(backend_key, message),
        FailureKind::AgentUnhealthy => DispatchFailure::unhealthy(backend_key, message),
        FailureKind::UpstreamTimeout => DispatchFailure::timeout(backend_key, message),
        FailureKind::UpstreamError => DispatchFailure::upstream(backend_key, message).with_status(500),
        FailureKind::InvalidRequest => DispatchFailure::caller_error(backend_key, message).with_status(422),
        FailureKind::RoutingError => DispatchFailure::gateway_fault(backend_key, message),
    }
}

#[async_trait]
impl BackendAdapter for MockAdapter {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn name(&self) -> &str {
        "mock"
    }

    async fn dispatch(
        &self,
        request: &CanonicalRequest,
        target: &ResolvedTarget,
        _budget: Duration,
    ) -> Result<Value, DispatchFailure> {
        let call = self.calls.record(&target.backend_key, request);
        let result = self.play(request, &target.backend_key).await;
        self.calls.complete(call);
        result
    }

    async fn stream(
        &self,
        request: &CanonicalRequest,
        target: &ResolvedTarget,
        _budget: Duration,
        progress: mpsc::Sender<ProgressUpdate>,
    ) -> Result<Value, DispatchFailure> {
        let call = self.calls.record(&target.backend_key, request);
        for (step, stage) in self.progress.iter().enumerate() {
            let update = ProgressUpdate::new(stage.clone(), json!({ "step": step }));
            if progress.send(update).await.is_err() {
                break;
            }
        }
        let result = self.play(request, &target.backend_key).await;
        self.calls.complete(call);
        result
    }
}

/// Health gate with fixed per-key statuses; unknown keys are `Live`
#[derive(Debug, Clone, Default)]
pub struct MockHealthGate {
    statuses: Arc<Mutex<HashMap<String, HealthStatus>>>,
    probes: Arc<AtomicUsize>,
    invalidated: Arc<Mutex<Vec<String>>>,
}

impl MockHealthGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(self, backend_key: impl Into<String>, status: HealthStatus) -> Self {
        self.set_status(backend_key, status);
        self
    }

    pub fn set_status(&self, backend_key: impl Into<String>, status: HealthStatus) {
        if let Ok(mut statuses) = self.statuses.lock() {
            statuses.insert(backend_key.into(), status);
        }
    }

    /// Number of records handed out
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Keys passed to `invalidate`, in call order
    pub fn invalidated(&self) -> Vec<String> {
        self.invalidated
            .lock()
            .map(|keys| keys.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl HealthGate for MockHealthGate {
    async fn record_for(&self, backend_key: &str, location: &Url) -> HealthRecord {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let status = self
            .statuses
            .lock()
            .ok()
            .and_then(|statuses| statuses.get(backend_key).copied())
            .unwrap_or(HealthStatus::Live);
        HealthRecord::new(backend_key, location.clone(), status, Duration::from_secs(30))
            .with_detail("mock")
    }

    fn invalidate(&self, backend_key: &str) {
        if let Ok(mut keys) = self.invalidated.lock() {
            keys.push(backend_key.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{validate, RawRegistry};

    fn target(key: &str) -> ResolvedTarget {
        let raw = RawRegistry::from_pairs([(key, "http://mock:1")]);
        let snapshot = validate(&raw, 1).unwrap();
        ResolvedTarget::from_entry(snapshot.get(key).unwrap())
    }

    #[tokio::test]
    async fn test_mock_adapter_scripts_and_counts() {
        let adapter = MockAdapter::new(BackendKind::Local)
            .with_output("a", json!({"x": 1}))
            .with_failure("b", FailureKind::UpstreamTimeout);
        let calls = adapter.call_counter();
        let request = CanonicalRequest::new("T", json!({"q": 1}));

        let ok = adapter
            .dispatch(&request, &target("a"), Duration::from_secs(1))
            .await
            .unwrap();
        let err = adapter
            .dispatch(&request, &target("b"), Duration::from_secs(1))
            .await
            .unwrap_err();
        let echo = adapter
            .dispatch(&request, &target("c"), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(ok, json!({"x": 1}));
        assert_eq!(err.kind, FailureKind::UpstreamTimeout);
        assert_eq!(echo["echo"], json!({"q": 1}));
        assert_eq!(calls.total(), 3);
        assert_eq!(calls.order(), vec!["a", "b", "c"]);
        assert_eq!(calls.completed(), 3);
        assert_eq!(calls.active(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_call_is_not_completed() {
        let adapter = MockAdapter::new(BackendKind::Local).with_delay(
            "slow",
            Duration::from_secs(10),
            json!({}),
        );
        let calls = adapter.call_counter();
        let request = CanonicalRequest::new("T", json!({}));
        let slow = target("slow");

        let call = adapter.dispatch(&request, &slow, Duration::from_secs(1));
        let timed_out = tokio::time::timeout(Duration::from_millis(20), call).await;

        assert!(timed_out.is_err());
        assert_eq!(calls.count("slow"), 1);
        assert_eq!(calls.active(), 0);
        assert_eq!(calls.completed(), 0);
    }

    #[tokio::test]
    async fn test_mock_adapter_streams_progress() {
        let adapter = MockAdapter::new(BackendKind::Adapted).with_progress(["one", "two"]);
        let (tx, mut rx) = mpsc::channel(8);

        adapter
            .stream(
                &CanonicalRequest::new("T", json!({})),
                &target("a"),
                Duration::from_secs(1),
                tx,
            )
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().stage, "one");
        assert_eq!(rx.recv().await.unwrap().stage, "two");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_mock_health_gate_defaults_to_live() {
        let gate = MockHealthGate::new().with_status("down", HealthStatus::Unreachable);
        let url = Url::parse("http://mock:1").unwrap();

        assert!(gate.is_routable("up", &url).await);
        assert!(!gate.is_routable("down", &url).await);
        assert_eq!(gate.probe_count(), 2);
    }
}
