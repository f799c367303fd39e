//! Startup readiness check across the registry, routes and backend health

use crate::health::{HealthGate, HealthRecord};
use crate::registry::{BackendKind, RegistrySnapshot};
use crate::routing::{RoutingError, TaskRouter};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Clone, Serialize)]
pub struct PreflightEntry {
    pub backend_key: String,
    pub location: Url,
    pub kind: BackendKind,
    pub mandatory: bool,
    pub health: HealthRecord,
}

impl PreflightEntry {
    pub fn is_routable(&self) -> bool {
        self.health.status.is_routable()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    pub registry_version: u64,
    pub checked_at: DateTime<Utc>,
    pub entries: Vec<PreflightEntry>,
    /// Mandatory keys with no registry entry
    pub missing_mandatory: Vec<String>,
    /// Mandatory keys whose fresh probe was not routable
    pub unroutable_mandatory: Vec<String>,
    /// Route keys missing from the registry; reported but never fatal
    pub route_drift: Vec<RoutingError>,
    pub passed: bool,
}

impl PreflightReport {
    pub fn summary(&self) -> String {
        let routable = self.entries.iter().filter(|e| e.is_routable()).count();
        let mut summary = format!(
            "registry v{}: {}/{} backends routable",
            self.registry_version,
            routable,
            self.entries.len()
        );
        if !self.missing_mandatory.is_empty() {
            summary.push_str(&format!(
                "; missing mandatory: {}",
                self.missing_mandatory.join(", ")
            ));
        }
        if !self.unroutable_mandatory.is_empty() {
            summary.push_str(&format!(
                "; unroutable mandatory: {}",
                self.unroutable_mandatory.join(", ")
            ));
        }
        if !self.route_drift.is_empty() {
            summary.push_str(&format!("; {} route(s) drifted", self.route_drift.len()));
        }
        summary
    }
}

/// Probe every registry entry in parallel, bypassing cached health
pub async fn run_preflight(
    snapshot: &RegistrySnapshot,
    router: &TaskRouter,
    health: &dyn HealthGate,
    mandatory: &[String],
) -> PreflightReport {
    let probes = snapshot.entries().map(|entry| async move {
        let record = health.check(&entry.key, &entry.location).await;
        PreflightEntry {
            backend_key: entry.key.clone(),
            location: entry.location.clone(),
            kind: entry.kind,
            mandatory: mandatory.contains(&entry.key),
            health: record,
        }
    });
    let entries = join_all(probes).await;

    let missing_mandatory: Vec<String> = mandatory
        .iter()
        .filter(|key| !snapshot.contains(key))
        .cloned()
        .collect();
    let unroutable_mandatory: Vec<String> = entries
        .iter()
        .filter(|e| e.mandatory && !e.is_routable())
        .map(|e| e.backend_key.clone())
        .collect();
    let route_drift = router.drift(snapshot);

    for drift in &route_drift {
        warn!(
            task_type = %drift.task_type,
            unresolved_key = ?drift.unresolved_key,
            "Route references an unregistered backend"
        );
    }

    let passed = missing_mandatory.is_empty() && unroutable_mandatory.is_empty();
    let report = PreflightReport {
        registry_version: snapshot.version(),
        checked_at: Utc::now(),
        entries,
        missing_mandatory,
        unroutable_mandatory,
        route_drift,
        passed,
    };
    info!(passed = report.passed, "Preflight: {}", report.summary());
    report
}
