//! Request entry point: validate, resolve, dispatch, normalize
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use taskgate::adapter::AdapterSet;
//! use taskgate::dispatch::{DispatchGateway, GatewaySettings};
//! use taskgate::protocol::{CanonicalRequest, DispatchPath};
//! use taskgate::registry::{BackendKind, RawRegistry, RegistryStore};
//! use taskgate::routing::{TaskRoute, TaskRouter};
//! use taskgate::testing::{MockAdapter, MockHealthGate};
//!
//! # tokio_test::block_on(async {
//! let raw = RawRegistry::from_pairs([("stats", "http://stats:8000")]);
//! let gateway = DispatchGateway::new(
//!     Arc::new(RegistryStore::from_raw(&raw).unwrap()),
//!     TaskRouter::new([TaskRoute::new("summarize", "stats")]),
//!     AdapterSet::new().with_adapter(Arc::new(MockAdapter::new(BackendKind::Local))),
//!     Arc::new(MockHealthGate::new()),
//!     GatewaySettings::default(),
//! );
//!
//! let result = gateway.handle(CanonicalRequest::new("summarize", json!({"text": "hi"}))).await;
//! assert!(result.ok);
//! assert_eq!(result.provenance.unwrap().path, DispatchPath::Primary);
//! # });
//! ```

use super::fallback::{DispatchOutcome, FallbackCoordinator};
use super::preflight::{run_preflight, PreflightReport};
use crate::adapter::AdapterSet;
use crate::config::{GatewayConfig, RegistrySource};
use crate::dispatch_span;
use crate::error::GatewayError;
use crate::health::{HealthGate, HealthProber, HealthProberConfig};
use crate::observability::metrics::{metrics, InFlightGuard, MetricsCollector};
use crate::protocol::{CanonicalRequest, CanonicalResult, DispatchEvent};
use crate::registry::{RawRegistry, RegistryError, RegistrySnapshot, RegistryStore};
use crate::routing::TaskRouter;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn, Instrument};

const STREAM_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct GatewaySettings {
    pub gateway_id: String,
    /// Per-attempt budget when the request carries no deadline
    pub default_deadline: Duration,
    pub mandatory_backends: Vec<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            gateway_id: "taskgate".to_string(),
            default_deadline: Duration::from_secs(30),
            mandatory_backends: Vec::new(),
        }
    }
}

impl From<&GatewayConfig> for GatewaySettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            gateway_id: config.gateway.id.clone(),
            default_deadline: Duration::from_millis(config.gateway.default_deadline_ms),
            mandatory_backends: config.preflight.mandatory.clone(),
        }
    }
}

/// The dispatch gateway
///
/// Every request is served against one registry snapshot, taken when the
/// request arrives. Reloads swap the snapshot for later requests only.
///
/// A request abandoned by its caller (the `handle` future dropped, or the
/// event stream dropped) stops its adapter call and counts as cancelled.
pub struct DispatchGateway {
    registry: Arc<RegistryStore>,
    router: TaskRouter,
    health: Arc<dyn HealthGate>,
    coordinator: FallbackCoordinator,
    settings: GatewaySettings,
    registry_source: Option<RegistrySource>,
    metrics: &'static MetricsCollector,
}

impl DispatchGateway {
    pub fn new(
        registry: Arc<RegistryStore>,
        router: TaskRouter,
        adapters: AdapterSet,
        health: Arc<dyn HealthGate>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            coordinator: FallbackCoordinator::new(adapters, Arc::clone(&health)),
            registry,
            router,
            health,
            settings,
            registry_source: None,
            metrics: metrics(),
        }
    }

    /// Source re-read by [`DispatchGateway::reload_from_source`]
    pub fn with_registry_source(mut self, source: RegistrySource) -> Self {
        self.registry_source = Some(source);
        self
    }

    /// Record request metrics somewhere other than the global collector
    pub fn with_metrics(mut self, collector: &'static MetricsCollector) -> Self {
        self.metrics = collector;
        self
    }

    /// Production gateway: HTTP prober and adapters, registry from `source`
    pub fn from_config(
        config: &GatewayConfig,
        source: RegistrySource,
    ) -> Result<Self, GatewayError> {
        let raw = source.load()?;
        let registry = Arc::new(RegistryStore::from_raw(&raw)?);
        metrics().registry_loaded(registry.version());

        let health: Arc<dyn HealthGate> =
            Arc::new(HealthProber::new(HealthProberConfig::from(&config.health)));
        let gateway = Self::new(
            registry,
            TaskRouter::from_config(&config.routes),
            AdapterSet::from_config(&config.adapters),
            health,
            GatewaySettings::from(config),
        )
        .with_registry_source(source);

        for drift in gateway.router.drift(&gateway.registry.current()) {
            warn!(
                task_type = %drift.task_type,
                unresolved_key = ?drift.unresolved_key,
                "Route references an unregistered backend"
            );
        }
        Ok(gateway)
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn router(&self) -> &TaskRouter {
        &self.router
    }

    pub fn registry(&self) -> Arc<RegistrySnapshot> {
        self.registry.current()
    }

    /// Dispatch and always return a canonical result
    pub async fn handle(&self, request: CanonicalRequest) -> CanonicalResult {
        let span = dispatch_span!(
            request_id = %request.request_id,
            task_type = %request.task_type,
            mode = request.mode.as_str()
        );
        async {
            let start = Instant::now();
            let in_flight = self.metrics.dispatch_started();
            let result = self.dispatch(&request, None).await;
            self.finish(&request, result, start, in_flight)
        }
        .instrument(span)
        .await
    }

    /// Dispatch, keeping the typed error
    pub async fn try_handle(
        &self,
        request: &CanonicalRequest,
    ) -> Result<DispatchOutcome, GatewayError> {
        self.dispatch(request, None).await
    }

    /// Dispatch in the background, yielding lifecycle events
    ///
    /// The stream ends after the terminal event. Dropping it abandons the
    /// in-flight dispatch.
    pub fn handle_stream(self: &Arc<Self>, request: CanonicalRequest) -> ReceiverStream<DispatchEvent> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let gateway = Arc::clone(self);
        let span = dispatch_span!(
            request_id = %request.request_id,
            task_type = %request.task_type,
            mode = request.mode.as_str(),
            streaming = true
        );

        tokio::spawn(
            async move {
                let started = DispatchEvent::Started {
                    request_id: request.request_id.clone(),
                    task_type: request.task_type.clone(),
                };
                if tx.send(started).await.is_err() {
                    return;
                }

                let start = Instant::now();
                let in_flight = gateway.metrics.dispatch_started();
                let result = tokio::select! {
                    result = gateway.dispatch(&request, Some(&tx)) => result,
                    _ = tx.closed() => {
                        debug!(
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "Stream receiver dropped, abandoning dispatch"
                        );
                        return;
                    }
                };

                let result = gateway.finish(&request, result, start, in_flight);
                let _ = tx.send(DispatchEvent::terminal(result)).await;
            }
            .instrument(span),
        );

        ReceiverStream::new(rx)
    }

    /// Validate and swap in a new registry; the old one stays on failure
    ///
    /// Health verdicts for keys that were removed or moved are forgotten.
    pub fn reload_registry(
        &self,
        raw: &RawRegistry,
    ) -> Result<Arc<RegistrySnapshot>, RegistryError> {
        let (previous, snapshot) = self.registry.replace(raw)?;
        for entry in previous.entries() {
            let kept = snapshot
                .get(&entry.key)
                .is_some_and(|current| current.location == entry.location);
            if !kept {
                debug!(backend_key = %entry.key, "Forgetting health of removed or moved backend");
                self.health.invalidate(&entry.key);
            }
        }
        for drift in self.router.drift(&snapshot) {
            warn!(
                task_type = %drift.task_type,
                unresolved_key = ?drift.unresolved_key,
                version = snapshot.version(),
                "Route references an unregistered backend after reload"
            );
        }
        Ok(snapshot)
    }

    /// Re-read the configured registry source and reload from it
    pub async fn reload_from_source(&self) -> Result<Arc<RegistrySnapshot>, GatewayError> {
        let source = self
            .registry_source
            .as_ref()
            .ok_or_else(|| GatewayError::internal("no registry source configured"))?;
        let raw = source.load_async().await?;
        info!(source = %source.describe(), "Reloading registry");
        Ok(self.reload_registry(&raw)?)
    }

    /// Fresh probe of every registered backend against the mandatory set
    pub async fn preflight(&self) -> PreflightReport {
        let snapshot = self.registry.current();
        run_preflight(
            &snapshot,
            &self.router,
            self.health.as_ref(),
            &self.settings.mandatory_backends,
        )
        .await
    }

    async fn dispatch(
        &self,
        request: &CanonicalRequest,
        events: Option<&mpsc::Sender<DispatchEvent>>,
    ) -> Result<DispatchOutcome, GatewayError> {
        request.validate().map_err(GatewayError::invalid_request)?;

        let snapshot = self.registry.current();
        let primary = self.router.resolve(&request.task_type, &snapshot)?;
        let fallback = self
            .router
            .route(&request.task_type)
            .and_then(|route| self.router.resolve_fallback(route, &snapshot));
        let budget = request.budget(self.settings.default_deadline);

        debug!(
            backend_key = %primary.backend_key,
            registry_version = snapshot.version(),
            budget_ms = budget.as_millis() as u64,
            "Resolved primary backend"
        );

        self.coordinator
            .execute(request, &primary, fallback, budget, events)
            .await
    }

    fn finish(
        &self,
        request: &CanonicalRequest,
        result: Result<DispatchOutcome, GatewayError>,
        start: Instant,
        in_flight: InFlightGuard<'_>,
    ) -> CanonicalResult {
        let elapsed = start.elapsed();
        match result {
            Ok(outcome) => {
                in_flight.succeeded(outcome.provenance.path, elapsed);
                info!(
                    backend_key = %outcome.provenance.backend_key,
                    path = ?outcome.provenance.path,
                    duration_ms = elapsed.as_millis() as u64,
                    "Dispatch completed"
                );
                CanonicalResult::success(
                    request.request_id.clone(),
                    outcome.outputs,
                    outcome.provenance,
                )
            }
            Err(error) => {
                let body = error.to_error_body();
                in_flight.failed(body.kind, elapsed);
                warn!(
                    kind = ?body.kind,
                    duration_ms = elapsed.as_millis() as u64,
                    "Dispatch failed: {}",
                    body.message
                );
                CanonicalResult::failure(request.request_id.clone(), body)
            }
        }
    }
}
