//! Route table and target resolution

use crate::config::RouteConfig;
use crate::registry::{BackendKind, RegistryEntry, RegistrySnapshot};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use url::Url;

/// Static route for one task type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRoute {
    pub task_type: String,
    pub backend_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_key: Option<String>,
}

impl TaskRoute {
    pub fn new(task_type: impl Into<String>, backend_key: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            backend_key: backend_key.into(),
            fallback_key: None,
        }
    }

    pub fn with_fallback(mut self, fallback_key: impl Into<String>) -> Self {
        self.fallback_key = Some(fallback_key.into());
        self
    }
}

/// A backend selected for a request, copied out of the snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedTarget {
    pub backend_key: String,
    pub location: Url,
    pub kind: BackendKind,
}

impl ResolvedTarget {
    pub fn from_entry(entry: &RegistryEntry) -> Self {
        Self {
            backend_key: entry.key.clone(),
            location: entry.location.clone(),
            kind: entry.kind,
        }
    }

    /// Join `path` onto the backend location, keeping any base path
    ///
    /// `http://h/deployments/x` + `/runs/wait` → `http://h/deployments/x/runs/wait`
    pub fn endpoint(&self, path: &str) -> String {
        join_endpoint(&self.location, path)
    }
}

/// Join `path` onto a backend base location
pub fn join_endpoint(location: &Url, path: &str) -> String {
    format!(
        "{}/{}",
        location.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingFailure {
    /// No route is configured for the task type
    UnknownTaskType,
    /// The route names a backend key absent from the snapshot
    BackendNotRegistered,
}

/// Resolution failure with everything needed to fix it
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
pub struct RoutingError {
    pub reason: RoutingFailure,
    pub task_type: String,
    /// Backend key that failed to resolve, when a route existed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unresolved_key: Option<String>,
    pub known_backend_keys: Vec<String>,
    pub known_task_types: Vec<String>,
    pub registry_version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            RoutingFailure::UnknownTaskType => write!(
                f,
                "no route for task type '{}' (known task types: {})",
                self.task_type,
                list_or_none(&self.known_task_types)
            )?,
            RoutingFailure::BackendNotRegistered => write!(
                f,
                "task type '{}' routes to backend '{}', which is not in registry v{} (registered: {})",
                self.task_type,
                self.unresolved_key.as_deref().unwrap_or_default(),
                self.registry_version,
                list_or_none(&self.known_backend_keys)
            )?,
        }
        if let Some(hint) = &self.remediation {
            write!(f, "; {hint}")?;
        }
        Ok(())
    }
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

/// Task type → backend key lookup table
#[derive(Debug, Clone, Default)]
pub struct TaskRouter {
    routes: BTreeMap<String, TaskRoute>,
}

impl TaskRouter {
    pub fn new(routes: impl IntoIterator<Item = TaskRoute>) -> Self {
        Self {
            routes: routes
                .into_iter()
                .map(|r| (r.task_type.clone(), r))
                .collect(),
        }
    }

    /// Build from the `[routes]` config table
    pub fn from_config(routes: &BTreeMap<String, RouteConfig>) -> Self {
        Self::new(routes.iter().map(|(task_type, config)| TaskRoute {
            task_type: task_type.clone(),
            backend_key: config.backend().to_string(),
            fallback_key: config.fallback().map(str::to_string),
        }))
    }

    pub fn route(&self, task_type: &str) -> Option<&TaskRoute> {
        self.routes.get(task_type)
    }

    pub fn routes(&self) -> impl Iterator<Item = &TaskRoute> {
        self.routes.values()
    }

    pub fn task_types(&self) -> Vec<String> {
        self.routes.keys().cloned().collect()
    }

    /// Resolve the primary backend for a task type
    pub fn resolve(
        &self,
        task_type: &str,
        snapshot: &RegistrySnapshot,
    ) -> Result<ResolvedTarget, RoutingError> {
        let route = self.route(task_type).ok_or_else(|| RoutingError {
            reason: RoutingFailure::UnknownTaskType,
            task_type: task_type.to_string(),
            unresolved_key: None,
            known_backend_keys: snapshot.keys(),
            known_task_types: self.task_types(),
            registry_version: snapshot.version(),
            remediation: Some(format!(
                "add a '{task_type}' entry to [routes] or use one of the known task types"
            )),
        })?;
        self.resolve_key(task_type, &route.backend_key, snapshot)
    }

    /// Resolve a route's fallback backend, if it has one
    pub fn resolve_fallback(
        &self,
        route: &TaskRoute,
        snapshot: &RegistrySnapshot,
    ) -> Option<Result<ResolvedTarget, RoutingError>> {
        route
            .fallback_key
            .as_deref()
            .map(|key| self.resolve_key(&route.task_type, key, snapshot))
    }

    /// Every route key missing from `snapshot`
    pub fn drift(&self, snapshot: &RegistrySnapshot) -> Vec<RoutingError> {
        let mut missing = Vec::new();
        for route in self.routes.values() {
            if let Err(e) = self.resolve_key(&route.task_type, &route.backend_key, snapshot) {
                missing.push(e);
            }
            if let Some(Err(e)) = self.resolve_fallback(route, snapshot) {
                missing.push(e);
            }
        }
        missing
    }

    fn resolve_key(
        &self,
        task_type: &str,
        backend_key: &str,
        snapshot: &RegistrySnapshot,
    ) -> Result<ResolvedTarget, RoutingError> {
        snapshot
            .get(backend_key)
            .map(ResolvedTarget::from_entry)
            .ok_or_else(|| RoutingError {
                reason: RoutingFailure::BackendNotRegistered,
                task_type: task_type.to_string(),
                unresolved_key: Some(backend_key.to_string()),
                known_backend_keys: snapshot.keys(),
                known_task_types: self.task_types(),
                registry_version: snapshot.version(),
                remediation: Some(format!(
                    "register '{backend_key}' in the registry or point the route at a registered key"
                )),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{validate, RawRegistry};

    fn snapshot() -> RegistrySnapshot {
        let raw = RawRegistry::from_pairs([("a", "http://a:8000"), ("b", "http://b:8000/base/")]);
        validate(&raw, 3).unwrap()
    }

    fn router() -> TaskRouter {
        TaskRouter::new([
            TaskRoute::new("T1", "a").with_fallback("b"),
            TaskRoute::new("T2", "missing"),
            TaskRoute::new("T3", "b").with_fallback("gone"),
        ])
    }

    #[test]
    fn test_resolve_registered_backend() {
        let target = router().resolve("T1", &snapshot()).unwrap();
        assert_eq!(target.backend_key, "a");
        assert_eq!(target.kind, BackendKind::Local);
        assert_eq!(target.location.as_str(), "http://a:8000/");
    }

    #[test]
    fn test_unknown_task_type_lists_alternatives() {
        let err = router().resolve("T9", &snapshot()).unwrap_err();
        assert_eq!(err.reason, RoutingFailure::UnknownTaskType);
        assert_eq!(err.known_task_types, vec!["T1", "T2", "T3"]);
        assert_eq!(err.known_backend_keys, vec!["a", "b"]);
        assert!(err.to_string().contains("T9"));
    }

    #[test]
    fn test_unregistered_backend_names_key() {
        let err = router().resolve("T2", &snapshot()).unwrap_err();
        assert_eq!(err.reason, RoutingFailure::BackendNotRegistered);
        assert_eq!(err.unresolved_key.as_deref(), Some("missing"));
        assert_eq!(err.registry_version, 3);
        assert!(err.to_string().contains("'missing'"));
        assert!(err.remediation.is_some());
    }

    #[test]
    fn test_resolve_fallback() {
        let router = router();
        let snapshot = snapshot();

        let t1 = router.route("T1").unwrap();
        let fallback = router.resolve_fallback(t1, &snapshot).unwrap().unwrap();
        assert_eq!(fallback.backend_key, "b");

        let t2 = router.route("T2").unwrap();
        assert!(router.resolve_fallback(t2, &snapshot).is_none());
    }

    #[test]
    fn test_drift_reports_primary_and_fallback_keys() {
        let drift = router().drift(&snapshot());
        let keys: Vec<_> = drift
            .iter()
            .filter_map(|e| e.unresolved_key.as_deref())
            .collect();
        assert_eq!(keys, vec!["missing", "gone"]);
    }

    #[test]
    fn test_endpoint_preserves_base_path() {
        let snapshot = snapshot();
        let target = ResolvedTarget::from_entry(snapshot.get("b").unwrap());
        assert_eq!(target.endpoint("/dispatch"), "http://b:8000/base/dispatch");

        let target = ResolvedTarget::from_entry(snapshot.get("a").unwrap());
        assert_eq!(target.endpoint("/health"), "http://a:8000/health");
    }

    #[test]
    fn test_from_config_table() {
        let mut table = BTreeMap::new();
        table.insert("s".to_string(), RouteConfig::Simple("a".to_string()));
        table.insert(
            "c".to_string(),
            RouteConfig::Complex {
                backend: "a".to_string(),
                fallback: Some("b".to_string()),
            },
        );

        let router = TaskRouter::from_config(&table);
        assert_eq!(router.route("s").unwrap().fallback_key, None);
        assert_eq!(router.route("c").unwrap().fallback_key.as_deref(), Some("b"));
    }
}
