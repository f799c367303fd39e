//! Primary/fallback state machine
//!
//! ```text
//! Init ──► PrimaryAttempt ──► Success
//!  │             │
//!  │             ▼
//!  └──────► FallbackAttempt ──► Success | Failed
//! ```
//!
//! `Init → FallbackAttempt` is taken when the health gate rejects the primary.
//! Exactly one fallback attempt is made, and only for failures the backend
//! caused (unreachable, unhealthy, timed out, or an upstream error).
//!
//! Both attempts share the request budget. The fallback gets whatever the
//! primary left, but never less than a quarter of the budget, so a request
//! runs for at most 1.25x its budget plus health checks.

use crate::adapter::AdapterSet;
use crate::error::{sanitize_error_message, DispatchFailure, FailureKind, GatewayError};
use crate::health::HealthGate;
use crate::observability::metrics::metrics;
use crate::protocol::{CanonicalRequest, DispatchEvent, DispatchPath, ProgressUpdate, Provenance};
use crate::routing::{ResolvedTarget, RoutingError};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const PROGRESS_BUFFER: usize = 32;

/// The fallback always gets at least `budget / FALLBACK_FLOOR_DIVISOR`
const FALLBACK_FLOOR_DIVISOR: u32 = 4;

/// Budget left for the fallback once the primary has used `spent`
pub fn fallback_budget(budget: Duration, spent: Duration) -> Duration {
    budget
        .saturating_sub(spent)
        .max(budget / FALLBACK_FLOOR_DIVISOR)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackState {
    Init,
    PrimaryAttempt,
    FallbackAttempt,
    Success,
    Failed,
}

impl FallbackState {
    pub fn can_transition_to(&self, next: FallbackState) -> bool {
        use FallbackState::*;
        matches!(
            (self, next),
            (Init, PrimaryAttempt)
                | (Init, FallbackAttempt)
                | (Init, Failed)
                | (PrimaryAttempt, Success)
                | (PrimaryAttempt, FallbackAttempt)
                | (PrimaryAttempt, Failed)
                | (FallbackAttempt, Success)
                | (FallbackAttempt, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FallbackState::Success | FallbackState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub from: FallbackState,
    pub to: FallbackState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub elapsed_ms: u64,
}

/// One request's walk through the state machine
#[derive(Debug)]
pub struct FallbackRun {
    state: FallbackState,
    trace: Vec<StateTransition>,
    started: Instant,
}

impl Default for FallbackRun {
    fn default() -> Self {
        Self::new()
    }
}

impl FallbackRun {
    pub fn new() -> Self {
        Self {
            state: FallbackState::Init,
            trace: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> FallbackState {
        self.state
    }

    pub fn trace(&self) -> &[StateTransition] {
        &self.trace
    }

    pub fn advance(
        &mut self,
        next: FallbackState,
        reason: Option<String>,
    ) -> Result<(), GatewayError> {
        if !self.state.can_transition_to(next) {
            return Err(GatewayError::internal(format!(
                "illegal fallback transition {:?} -> {:?}",
                self.state, next
            )));
        }
        self.trace.push(StateTransition {
            from: self.state,
            to: next,
            reason,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        });
        self.state = next;
        Ok(())
    }

    fn into_trace(self) -> Vec<StateTransition> {
        self.trace
    }
}

/// Successful dispatch with the path that produced it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchOutcome {
    pub outputs: Value,
    pub provenance: Provenance,
    pub trace: Vec<StateTransition>,
}

/// Health-gates and runs the primary attempt, then at most one fallback
pub struct FallbackCoordinator {
    adapters: AdapterSet,
    health: Arc<dyn HealthGate>,
}

impl FallbackCoordinator {
    pub fn new(adapters: AdapterSet, health: Arc<dyn HealthGate>) -> Self {
        Self { adapters, health }
    }

    /// Dispatch `request` to `primary`, falling back when eligible
    ///
    /// `fallback` is the route's resolved fallback: `None` when the route has
    /// none, `Some(Err(_))` when its key is missing from the snapshot. When
    /// `events` is given, adapters stream and their progress is forwarded.
    pub async fn execute(
        &self,
        request: &CanonicalRequest,
        primary: &ResolvedTarget,
        fallback: Option<Result<ResolvedTarget, RoutingError>>,
        budget: Duration,
        events: Option<&mpsc::Sender<DispatchEvent>>,
    ) -> Result<DispatchOutcome, GatewayError> {
        let started = Instant::now();
        let mut run = FallbackRun::new();

        let record = self
            .health
            .record_for(&primary.backend_key, &primary.location)
            .await;

        let primary_failure = if record.status.is_routable() {
            run.advance(FallbackState::PrimaryAttempt, None)?;
            match self.attempt(request, primary, budget, events).await {
                Ok(outputs) => {
                    run.advance(FallbackState::Success, None)?;
                    return Ok(finish(run, outputs, primary, DispatchPath::Primary, None));
                }
                Err(failure) => failure,
            }
        } else {
            debug!(
                backend_key = %primary.backend_key,
                status = ?record.status,
                "Health gate rejected primary"
            );
            DispatchFailure::from_health(&record)
        };

        let fallback = match fallback {
            Some(fallback) if primary_failure.is_fallback_eligible() => fallback,
            _ => {
                run.advance(FallbackState::Failed, Some(primary_failure.to_string()))?;
                log_trace(request, run.trace());
                return Err(GatewayError::Dispatch(primary_failure));
            }
        };

        metrics().fallback_triggered();
        info!(
            request_id = %request.request_id,
            primary = %primary.backend_key,
            reason = %primary_failure,
            "Primary failed, dispatching to fallback"
        );
        run.advance(
            FallbackState::FallbackAttempt,
            Some(primary_failure.to_string()),
        )?;

        let fallback_failure = match fallback {
            Err(routing) => DispatchFailure::routing(&routing),
            Ok(target) => {
                let record = self
                    .health
                    .record_for(&target.backend_key, &target.location)
                    .await;
                if !record.status.is_routable() {
                    DispatchFailure::from_health(&record)
                } else {
                    let remaining = fallback_budget(budget, started.elapsed());
                    debug!(
                        backend_key = %target.backend_key,
                        budget_ms = remaining.as_millis() as u64,
                        "Fallback budget"
                    );
                    match self.attempt(request, &target, remaining, events).await {
                        Ok(outputs) => {
                            run.advance(FallbackState::Success, None)?;
                            let reason = sanitize_error_message(&primary_failure.to_string());
                            return Ok(finish(
                                run,
                                outputs,
                                &target,
                                DispatchPath::Fallback,
                                Some(reason),
                            ));
                        }
                        Err(failure) => failure,
                    }
                }
            }
        };

        run.advance(FallbackState::Failed, Some(fallback_failure.to_string()))?;
        log_trace(request, run.trace());
        warn!(
            request_id = %request.request_id,
            primary = %primary_failure,
            fallback = %fallback_failure,
            "Fallback exhausted"
        );
        Err(GatewayError::fallback_exhausted(
            primary_failure,
            fallback_failure,
        ))
    }

    /// One adapter call, bounded by `budget`
    async fn attempt(
        &self,
        request: &CanonicalRequest,
        target: &ResolvedTarget,
        budget: Duration,
        events: Option<&mpsc::Sender<DispatchEvent>>,
    ) -> Result<Value, DispatchFailure> {
        let key = target.backend_key.as_str();
        let adapter = self.adapters.get(target.kind).ok_or_else(|| {
            DispatchFailure::gateway_fault(
                key,
                format!("no adapter registered for kind '{}'", target.kind),
            )
        })?;

        let start = Instant::now();
        let result = match events {
            None => bounded(key, budget, adapter.dispatch(request, target, budget)).await,
            Some(events) => {
                let (tx, mut rx) = mpsc::channel::<ProgressUpdate>(PROGRESS_BUFFER);
                let forward = async {
                    while let Some(update) = rx.recv().await {
                        let event = DispatchEvent::Progress {
                            request_id: request.request_id.clone(),
                            backend_key: key.to_string(),
                            stage: update.stage,
                            data: update.data,
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                };
                let call = bounded(key, budget, adapter.stream(request, target, budget, tx));
                let (result, ()) = tokio::join!(call, forward);
                result
            }
        };

        metrics().backend_called(key, start.elapsed(), result.is_ok());
        if let Err(failure) = &result {
            if failure.kind == FailureKind::UpstreamTimeout {
                metrics().backend_timed_out(key);
            }
            debug!(backend_key = %key, failure = %failure, "Attempt failed");
        }
        result
    }
}

async fn bounded<F>(backend_key: &str, budget: Duration, call: F) -> Result<Value, DispatchFailure>
where
    F: std::future::Future<Output = Result<Value, DispatchFailure>>,
{
    match tokio::time::timeout(budget, call).await {
        Ok(result) => result,
        Err(_) => Err(DispatchFailure::timeout(
            backend_key,
            format!("deadline of {}ms elapsed", budget.as_millis()),
        )),
    }
}

fn finish(
    run: FallbackRun,
    outputs: Value,
    target: &ResolvedTarget,
    path: DispatchPath,
    fallback_reason: Option<String>,
) -> DispatchOutcome {
    DispatchOutcome {
        outputs,
        provenance: Provenance {
            backend_key: target.backend_key.clone(),
            path,
            adapter_kind: target.kind,
            fallback_reason,
        },
        trace: run.into_trace(),
    }
}

fn log_trace(request: &CanonicalRequest, trace: &[StateTransition]) {
    debug!(request_id = %request.request_id, trace = ?trace, "Fallback trace");
}
