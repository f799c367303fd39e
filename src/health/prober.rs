//! Liveness and readiness probing with a TTL cache
//!
//! A probe walks the candidate paths in order (the primary path, then at most
//! `max_alternate_paths` alternates) and stops at the first path that answers.
//! Concurrent callers asking about the same backend share one in-flight probe.

use crate::config::HealthSection;
use crate::health::HealthGate;
use crate::observability::metrics::metrics;
use crate::probe_span;
use crate::routing::join_endpoint;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, Instrument};
use url::Url;

/// Probe verdict for a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// Answered, without reporting readiness
    Live,
    /// Answered and reported itself ready
    Ready,
    /// No candidate path answered
    Unreachable,
    /// Answered with a server error or a not-ready body
    Unhealthy,
}

impl HealthStatus {
    pub fn is_routable(&self) -> bool {
        matches!(self, HealthStatus::Live | HealthStatus::Ready)
    }
}

/// Result of probing one backend location
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub backend_key: String,
    pub location: Url,
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    #[serde(rename = "ttl_ms", serialize_with = "serialize_millis")]
    pub ttl: Duration,
    /// Path that produced the verdict, if any answered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub response_time_ms: u64,
    #[serde(skip)]
    observed_at: Instant,
}

fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl HealthRecord {
    pub fn new(
        backend_key: impl Into<String>,
        location: Url,
        status: HealthStatus,
        ttl: Duration,
    ) -> Self {
        Self {
            backend_key: backend_key.into(),
            location,
            status,
            checked_at: Utc::now(),
            ttl,
            probe_path: None,
            detail: None,
            response_time_ms: 0,
            observed_at: Instant::now(),
        }
    }

    pub fn with_probe_path(mut self, path: impl Into<String>) -> Self {
        self.probe_path = Some(path.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn is_expired(&self) -> bool {
        self.observed_at.elapsed() >= self.ttl
    }

    /// Fresh and probed against `location`
    fn is_valid_for(&self, location: &Url) -> bool {
        &self.location == location && !self.is_expired()
    }
}

/// Prober settings
#[derive(Debug, Clone, PartialEq)]
pub struct HealthProberConfig {
    pub ttl: Duration,
    pub probe_timeout: Duration,
    pub probe_paths: Vec<String>,
    pub max_alternate_paths: usize,
}

impl Default for HealthProberConfig {
    fn default() -> Self {
        Self::from(&HealthSection::default())
    }
}

impl From<&HealthSection> for HealthProberConfig {
    fn from(section: &HealthSection) -> Self {
        Self {
            ttl: Duration::from_secs(section.ttl_secs),
            probe_timeout: Duration::from_millis(section.probe_timeout_ms),
            probe_paths: section.probe_paths.clone(),
            max_alternate_paths: section.max_alternate_paths,
        }
    }
}

impl HealthProberConfig {
    /// The primary path plus at most `max_alternate_paths` alternates
    pub fn candidate_paths(&self) -> &[String] {
        let bound = self
            .max_alternate_paths
            .saturating_add(1)
            .min(self.probe_paths.len());
        &self.probe_paths[..bound]
    }
}

type SharedProbe = Shared<BoxFuture<'static, HealthRecord>>;

enum CacheSlot {
    Fresh(HealthRecord),
    InFlight { location: Url, probe: SharedProbe },
}

struct ProberInner {
    client: reqwest::Client,
    config: HealthProberConfig,
    cache: Mutex<HashMap<String, CacheSlot>>,
}

/// Caching, single-flight health prober
///
/// Cheap to clone; clones share the cache.
#[derive(Clone)]
pub struct HealthProber {
    inner: Arc<ProberInner>,
}

impl HealthProber {
    pub fn new(config: HealthProberConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(client: reqwest::Client, config: HealthProberConfig) -> Self {
        Self {
            inner: Arc::new(ProberInner {
                client,
                config,
                cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &HealthProberConfig {
        &self.inner.config
    }

    /// Cached record for a key, if it is still fresh
    pub fn cached(&self, backend_key: &str) -> Option<HealthRecord> {
        let cache = self.lock_cache();
        match cache.get(backend_key) {
            Some(CacheSlot::Fresh(record)) if !record.is_expired() => Some(record.clone()),
            _ => None,
        }
    }

    /// Keys with any cache slot, fresh, expired or in flight
    pub fn cached_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock_cache().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheSlot>> {
        self.inner
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn start_probe(&self, backend_key: &str, location: &Url) -> SharedProbe {
        let inner = self.inner.clone();
        let key = backend_key.to_string();
        let location = location.clone();
        let span = probe_span!(backend_key = %key, location = %location);
        async move { run_probe(&inner, key, location).await }
            .instrument(span)
            .boxed()
            .shared()
    }

    async fn await_and_store(&self, backend_key: &str, probe: SharedProbe) -> HealthRecord {
        let record = probe.await;
        let mut cache = self.lock_cache();
        // Only the slot this probe occupies is replaced; an invalidation or a
        // newer probe for another location wins.
        let ours = matches!(
            cache.get(backend_key),
            Some(CacheSlot::InFlight { location, .. }) if *location == record.location
        );
        if ours {
            cache.insert(backend_key.to_string(), CacheSlot::Fresh(record.clone()));
        }
        record
    }
}

#[async_trait]
impl HealthGate for HealthProber {
    async fn record_for(&self, backend_key: &str, location: &Url) -> HealthRecord {
        let probe = {
            let mut cache = self.lock_cache();
            match cache.get(backend_key) {
                Some(CacheSlot::Fresh(record)) if record.is_valid_for(location) => {
                    metrics().probe_cache_hit();
                    return record.clone();
                }
                Some(CacheSlot::InFlight {
                    location: in_flight,
                    probe,
                }) if in_flight == location
                    && probe.peek().map_or(true, |r| !r.is_expired()) =>
                {
                    metrics().probe_coalesced();
                    probe.clone()
                }
                _ => {
                    let probe = self.start_probe(backend_key, location);
                    cache.insert(
                        backend_key.to_string(),
                        CacheSlot::InFlight {
                            location: location.clone(),
                            probe: probe.clone(),
                        },
                    );
                    probe
                }
            }
        };
        self.await_and_store(backend_key, probe).await
    }

    async fn check(&self, backend_key: &str, location: &Url) -> HealthRecord {
        let probe = self.start_probe(backend_key, location);
        self.lock_cache().insert(
            backend_key.to_string(),
            CacheSlot::InFlight {
                location: location.clone(),
                probe: probe.clone(),
            },
        );
        self.await_and_store(backend_key, probe).await
    }

    fn invalidate(&self, backend_key: &str) {
        self.lock_cache().remove(backend_key);
    }
}

async fn run_probe(inner: &ProberInner, backend_key: String, location: Url) -> HealthRecord {
    metrics().probe_issued();
    let start = Instant::now();
    let config = &inner.config;
    let mut misses = Vec::new();

    for path in config.candidate_paths() {
        let url = join_endpoint(&location, path);
        let response = match inner
            .client
            .get(&url)
            .timeout(config.probe_timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let reason = if e.is_timeout() {
                    "timed out".to_string()
                } else if e.is_connect() {
                    "connection failed".to_string()
                } else {
                    e.to_string()
                };
                debug!(path = %path, "Probe miss: {}", reason);
                misses.push(format!("{path}: {reason}"));
                continue;
            }
        };

        let status = response.status();
        if status.is_server_error() {
            return finish(
                backend_key,
                location,
                config.ttl,
                start,
                HealthStatus::Unhealthy,
                Some(path),
                format!("HTTP {}", status.as_u16()),
            );
        }
        if status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            let verdict = classify_body(&body);
            return finish(
                backend_key,
                location,
                config.ttl,
                start,
                verdict,
                Some(path),
                format!("HTTP {}", status.as_u16()),
            );
        }

        // 404/405 and other client statuses: this path is not a health endpoint
        debug!(path = %path, status = status.as_u16(), "Probe path not served");
        misses.push(format!("{path}: HTTP {}", status.as_u16()));
    }

    finish(
        backend_key,
        location,
        config.ttl,
        start,
        HealthStatus::Unreachable,
        None,
        format!("no probe path answered ({})", misses.join("; ")),
    )
}

fn finish(
    backend_key: String,
    location: Url,
    ttl: Duration,
    start: Instant,
    status: HealthStatus,
    probe_path: Option<&String>,
    detail: String,
) -> HealthRecord {
    let mut record = HealthRecord::new(backend_key, location, status, ttl).with_detail(detail);
    record.probe_path = probe_path.cloned();
    record.response_time_ms = start.elapsed().as_millis() as u64;
    debug!(
        backend_key = %record.backend_key,
        status = ?record.status,
        probe_path = ?record.probe_path,
        response_time_ms = record.response_time_ms,
        "Probe finished"
    );
    record
}

const READY_WORDS: [&str; 4] = ["ready", "ok", "healthy", "pass"];
const NOT_READY_WORDS: [&str; 5] = ["not_ready", "unhealthy", "degraded", "fail", "error"];

/// Interpret a 2xx probe body
fn classify_body(body: &[u8]) -> HealthStatus {
    let word = match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => {
            if let Some(Value::Bool(ready)) = map.get("ready") {
                return if *ready {
                    HealthStatus::Ready
                } else {
                    HealthStatus::Unhealthy
                };
            }
            match map.get("status") {
                Some(Value::String(status)) => status.to_lowercase(),
                _ => return HealthStatus::Live,
            }
        }
        Ok(Value::String(text)) => text.to_lowercase(),
        Ok(_) => return HealthStatus::Live,
        Err(_) => String::from_utf8_lossy(body).trim().to_lowercase(),
    };

    if READY_WORDS.contains(&word.as_str()) {
        HealthStatus::Ready
    } else if NOT_READY_WORDS.contains(&word.as_str()) {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_classify_ready_bodies() {
        assert_eq!(classify_body(br#"{"ready": true}"#), HealthStatus::Ready);
        assert_eq!(classify_body(br#"{"status": "OK"}"#), HealthStatus::Ready);
        assert_eq!(classify_body(br#"{"status": "pass"}"#), HealthStatus::Ready);
        assert_eq!(classify_body(b"ok"), HealthStatus::Ready);
    }

    #[test]
    fn test_classify_not_ready_bodies() {
        assert_eq!(classify_body(br#"{"ready": false}"#), HealthStatus::Unhealthy);
        assert_eq!(
            classify_body(br#"{"status": "degraded"}"#),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            classify_body(br#"{"status": "not_ready"}"#),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_classify_plain_answer_is_live() {
        assert_eq!(classify_body(b""), HealthStatus::Live);
        assert_eq!(classify_body(br#"{"uptime": 12}"#), HealthStatus::Live);
        assert_eq!(classify_body(b"<html>hi</html>"), HealthStatus::Live);
    }

    #[test]
    fn test_candidate_paths_are_bounded() {
        let mut config = HealthProberConfig {
            probe_paths: vec!["/a".into(), "/b".into(), "/c".into(), "/d".into()],
            ..HealthProberConfig::default()
        };
        assert_eq!(config.candidate_paths(), &["/a", "/b", "/c"]);

        config.max_alternate_paths = 0;
        assert_eq!(config.candidate_paths(), &["/a"]);

        config.max_alternate_paths = 10;
        assert_eq!(config.candidate_paths().len(), 4);
    }

    #[test]
    fn test_default_config() {
        let config = HealthProberConfig::default();
        assert_eq!(config.ttl, Duration::from_secs(30));
        assert_eq!(config.candidate_paths(), &["/health", "/healthz", "/ready"]);
    }

    #[test]
    fn test_record_validity() {
        let record = HealthRecord::new(
            "a",
            url("http://a:1"),
            HealthStatus::Ready,
            Duration::from_secs(60),
        );
        assert!(record.is_valid_for(&url("http://a:1")));
        assert!(!record.is_valid_for(&url("http://moved:1")));

        let expired = HealthRecord::new("a", url("http://a:1"), HealthStatus::Ready, Duration::ZERO);
        assert!(expired.is_expired());
    }

    #[test]
    fn test_routable_statuses() {
        assert!(HealthStatus::Live.is_routable());
        assert!(HealthStatus::Ready.is_routable());
        assert!(!HealthStatus::Unhealthy.is_routable());
        assert!(!HealthStatus::Unreachable.is_routable());
    }

    #[test]
    fn test_record_serialization() {
        let record = HealthRecord::new(
            "a",
            url("http://a:1"),
            HealthStatus::Unreachable,
            Duration::from_secs(30),
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "UNREACHABLE");
        assert_eq!(json["ttl_ms"], 30_000);
        assert!(json.get("observed_at").is_none());
    }

    #[tokio::test]
    async fn test_unreachable_backend() {
        let prober = HealthProber::new(HealthProberConfig {
            probe_timeout: Duration::from_millis(200),
            ..HealthProberConfig::default()
        });
        // Port 9 (discard) on localhost is not expected to serve HTTP
        let record = prober.record_for("gone", &url("http://127.0.0.1:9")).await;
        assert_eq!(record.status, HealthStatus::Unreachable);
        assert!(record.probe_path.is_none());
        assert!(prober.cached("gone").is_some());

        prober.invalidate("gone");
        assert!(prober.cached("gone").is_none());
        assert!(prober.cached_keys().is_empty());
    }
}
