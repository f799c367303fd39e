//! HTTP surface for the gateway
//!
//! Dispatch (plain and SSE), registry inspection and reload, preflight, and
//! the gateway's own health, readiness and metrics endpoints.

use crate::dispatch::DispatchGateway;
use crate::error::GatewayError;
use crate::observability::metrics::metrics;
use crate::protocol::{CanonicalRequest, CanonicalResult, DispatchEvent};
use crate::registry::RegistrySnapshot;
use crate::routing::{RoutingError, TaskRoute};
use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

const MAX_BODY_BYTES: u64 = 4 * 1024 * 1024;
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// HTTP server wrapping a [`DispatchGateway`]
pub struct GatewayServer {
    gateway: Arc<DispatchGateway>,
    port: u16,
}

impl GatewayServer {
    pub fn new(gateway: Arc<DispatchGateway>, port: u16) -> Self {
        Self { gateway, port }
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (addr, server) = warp::serve(routes(self.gateway))
            .try_bind_with_graceful_shutdown(([0, 0, 0, 0], self.port), shutdown)
            .map_err(|e| {
                GatewayError::internal(format!("failed to bind port {}: {e}", self.port))
            })?;

        info!("Gateway listening on {}", addr);
        metrics().set_gateway_state("serving");
        server.await;
        metrics().set_gateway_state("stopped");
        Ok(())
    }
}

/// Every gateway route, ready for `warp::serve` or `warp::test`
pub fn routes(
    gateway: Arc<DispatchGateway>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    // POST /v1/dispatch
    let dispatch = warp::path!("v1" / "dispatch")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::bytes())
        .and(with_gateway(gateway.clone()))
        .and_then(dispatch_handler);

    // POST /v1/dispatch/stream
    let dispatch_stream = warp::path!("v1" / "dispatch" / "stream")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::bytes())
        .and(with_gateway(gateway.clone()))
        .and_then(dispatch_stream_handler);

    // GET /v1/registry
    let registry = warp::path!("v1" / "registry")
        .and(warp::get())
        .and(with_gateway(gateway.clone()))
        .and_then(registry_handler);

    // POST /v1/registry/reload
    let reload = warp::path!("v1" / "registry" / "reload")
        .and(warp::post())
        .and(with_gateway(gateway.clone()))
        .and_then(reload_handler);

    // GET /v1/preflight
    let preflight = warp::path!("v1" / "preflight")
        .and(warp::get())
        .and(with_gateway(gateway.clone()))
        .and_then(preflight_handler);

    // GET /health - gateway status with registry summary
    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_gateway(gateway.clone()))
        .and_then(health_handler);

    // GET /ready - readiness probe
    let ready = warp::path("ready")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_gateway(gateway))
        .and_then(ready_handler);

    // GET /live - liveness probe
    let live = warp::path("live")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| {
            warp::reply::json(&LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            })
            .into_response()
        });

    // GET /metrics
    let metrics_route = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| warp::reply::json(&metrics().get_metrics()).into_response());

    // GET / - endpoint listing
    let root = warp::path::end().and(warp::get()).map(|| {
        let mut endpoints = BTreeMap::new();
        endpoints.insert("POST /v1/dispatch", "Dispatch a canonical request");
        endpoints.insert("POST /v1/dispatch/stream", "Dispatch with server-sent lifecycle events");
        endpoints.insert("GET /v1/registry", "Current registry snapshot and routes");
        endpoints.insert("POST /v1/registry/reload", "Re-read and swap the registry");
        endpoints.insert("GET /v1/preflight", "Probe every registered backend");
        endpoints.insert("GET /health", "Gateway health");
        endpoints.insert("GET /ready", "Readiness probe");
        endpoints.insert("GET /live", "Liveness probe");
        endpoints.insert("GET /metrics", "Dispatch, probe and backend metrics");
        warp::reply::json(&json!({ "endpoints": endpoints })).into_response()
    });

    dispatch_stream
        .or(dispatch)
        .unify()
        .or(reload)
        .unify()
        .or(registry)
        .unify()
        .or(preflight)
        .unify()
        .or(health)
        .unify()
        .or(ready)
        .unify()
        .or(live)
        .unify()
        .or(metrics_route)
        .unify()
        .or(root)
        .unify()
        .with(warp::cors().allow_any_origin())
        .map(Reply::into_response)
}

fn with_gateway(
    gateway: Arc<DispatchGateway>,
) -> impl Filter<Extract = (Arc<DispatchGateway>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&gateway))
}

async fn dispatch_handler(
    body: Bytes,
    gateway: Arc<DispatchGateway>,
) -> Result<Response, Infallible> {
    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(rejected) => return Ok(json_with_status(&rejected, rejected.http_status())),
    };
    let result = gateway.handle(request).await;
    Ok(json_with_status(&result, result.http_status()))
}

async fn dispatch_stream_handler(
    body: Bytes,
    gateway: Arc<DispatchGateway>,
) -> Result<Response, Infallible> {
    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(rejected) => return Ok(json_with_status(&rejected, rejected.http_status())),
    };
    let events = gateway
        .handle_stream(request)
        .map(|event| Ok::<_, Infallible>(sse_event(&event)));
    let stream = warp::sse::keep_alive().interval(SSE_KEEP_ALIVE).stream(events);
    Ok(warp::sse::reply(stream).into_response())
}

async fn registry_handler(gateway: Arc<DispatchGateway>) -> Result<Response, Infallible> {
    let snapshot = gateway.registry();
    let view = RegistryView {
        gateway_id: &gateway.settings().gateway_id,
        registry: &snapshot,
        routes: gateway.router().routes().collect(),
        route_drift: gateway.router().drift(&snapshot),
    };
    Ok(warp::reply::json(&view).into_response())
}

async fn reload_handler(gateway: Arc<DispatchGateway>) -> Result<Response, Infallible> {
    match gateway.reload_from_source().await {
        Ok(snapshot) => {
            let body = json!({
                "reloaded": true,
                "version": snapshot.version(),
                "entries": snapshot.len(),
            });
            Ok(json_with_status(&body, 200))
        }
        Err(error) => {
            let status = match &error {
                GatewayError::Config(_) => 422,
                other => other.kind().http_status(),
            };
            let body = json!({ "reloaded": false, "error": error.to_error_body() });
            Ok(json_with_status(&body, status))
        }
    }
}

async fn preflight_handler(gateway: Arc<DispatchGateway>) -> Result<Response, Infallible> {
    let report = gateway.preflight().await;
    let status = if report.passed { 200 } else { 503 };
    Ok(json_with_status(&report, status))
}

async fn health_handler(gateway: Arc<DispatchGateway>) -> Result<Response, Infallible> {
    let snapshot = gateway.registry();
    let route_drift = gateway.router().drift(&snapshot).len();
    let healthy = !snapshot.is_empty();
    metrics().update_health_status(healthy);

    let lifecycle = metrics().get_metrics().lifecycle;
    let response = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" },
        gateway_id: gateway.settings().gateway_id.clone(),
        timestamp: current_timestamp(),
        uptime_seconds: lifecycle.uptime_seconds,
        registry_version: snapshot.version(),
        registry_entries: snapshot.len(),
        route_drift,
    };
    let status = if healthy { 200 } else { 503 };
    Ok(json_with_status(&response, status))
}

async fn ready_handler(gateway: Arc<DispatchGateway>) -> Result<Response, Infallible> {
    let ready = !gateway.registry().is_empty();
    let response = ReadinessResponse {
        ready,
        timestamp: current_timestamp(),
    };
    let status = if ready { 200 } else { 503 };
    Ok(json_with_status(&response, status))
}

/// Parse a dispatch body; malformed JSON becomes an InvalidRequest result
fn parse_request(body: &[u8]) -> Result<CanonicalRequest, CanonicalResult> {
    serde_json::from_slice::<CanonicalRequest>(body).map_err(|e| {
        let request_id = serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|v| v.get("request_id").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let error = GatewayError::invalid_request(format!("malformed request body: {e}"));
        CanonicalResult::failure(request_id, error.to_error_body())
    })
}

fn sse_event(event: &DispatchEvent) -> warp::sse::Event {
    let name = event.event_name();
    match warp::sse::Event::default().event(name).json_data(event) {
        Ok(sse) => sse,
        Err(e) => {
            warn!("Failed to encode {} event: {}", name, e);
            warp::sse::Event::default().event(name).data("{}")
        }
    }
}

fn json_with_status<T: Serialize>(body: &T, status: u16) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    warp::reply::with_status(warp::reply::json(body), status).into_response()
}

#[derive(Serialize)]
struct RegistryView<'a> {
    gateway_id: &'a str,
    registry: &'a RegistrySnapshot,
    routes: Vec<&'a TaskRoute>,
    route_drift: Vec<RoutingError>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    gateway_id: String,
    timestamp: u64,
    uptime_seconds: u64,
    registry_version: u64,
    registry_entries: usize,
    route_drift: usize,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
