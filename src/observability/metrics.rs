//! Thread-safe metrics collection system
//!
//! Provides atomic counters and mutex-protected collections for tracking
//! dispatch outcomes, health probing, registry reloads and per-backend latency.

use crate::protocol::{DispatchPath, ErrorKind};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

const MAX_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Dispatch metrics (atomic for high frequency)
    requests_received: AtomicU64,
    requests_in_flight: AtomicU64,
    primary_successes: AtomicU64,
    fallback_successes: AtomicU64,
    requests_failed: AtomicU64,
    requests_cancelled: AtomicU64,
    fallbacks_triggered: AtomicU64,

    // Health probing
    probes_issued: AtomicU64,
    probe_cache_hits: AtomicU64,
    probes_coalesced: AtomicU64,

    // Registry
    registry_version: AtomicU64,
    registry_reloads: AtomicU64,
    registry_reload_failures: AtomicU64,

    // Mutex protected for complex data
    dispatch_times: Mutex<Vec<u64>>, // in milliseconds
    failures_by_kind: Mutex<BTreeMap<String, u64>>,
    backend_stats: Mutex<HashMap<String, BackendCallStats>>,

    // Lifecycle metrics
    gateway_state: Mutex<String>,
    uptime_start: AtomicU64,
    health_status: AtomicBool,
    last_health_check: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let now = current_timestamp();
        Self {
            requests_received: AtomicU64::new(0),
            requests_in_flight: AtomicU64::new(0),
            primary_successes: AtomicU64::new(0),
            fallback_successes: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            requests_cancelled: AtomicU64::new(0),
            fallbacks_triggered: AtomicU64::new(0),
            probes_issued: AtomicU64::new(0),
            probe_cache_hits: AtomicU64::new(0),
            probes_coalesced: AtomicU64::new(0),
            registry_version: AtomicU64::new(0),
            registry_reloads: AtomicU64::new(0),
            registry_reload_failures: AtomicU64::new(0),
            dispatch_times: Mutex::new(Vec::new()),
            failures_by_kind: Mutex::new(BTreeMap::new()),
            backend_stats: Mutex::new(HashMap::new()),
            gateway_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(now),
            health_status: AtomicBool::new(true),
            last_health_check: AtomicU64::new(now),
        }
    }

    // Dispatch metrics

    /// Count a request as received and in flight until the guard drops
    pub fn dispatch_started(&self) -> InFlightGuard<'_> {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
        self.requests_in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            collector: self,
            settled: false,
        }
    }

    fn dispatch_succeeded(&self, path: DispatchPath, duration: Duration) {
        match path {
            DispatchPath::Primary => self.primary_successes.fetch_add(1, Ordering::Relaxed),
            DispatchPath::Fallback => self.fallback_successes.fetch_add(1, Ordering::Relaxed),
        };
        push_sample(&self.dispatch_times, duration);
    }

    fn dispatch_failed(&self, kind: ErrorKind, duration: Duration) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut failures) = self.failures_by_kind.lock() {
            *failures.entry(kind.to_string()).or_default() += 1;
        }
        push_sample(&self.dispatch_times, duration);
    }

    fn dispatch_left_flight(&self, settled: bool) {
        let _ = self
            .requests_in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
        if !settled {
            self.requests_cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn fallback_triggered(&self) {
        self.fallbacks_triggered.fetch_add(1, Ordering::Relaxed);
    }

    // Health probing metrics
    pub fn probe_issued(&self) {
        self.probes_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn probe_cache_hit(&self) {
        self.probe_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn probe_coalesced(&self) {
        self.probes_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    // Registry metrics
    pub fn registry_loaded(&self, version: u64) {
        self.registry_version.store(version, Ordering::Relaxed);
    }

    pub fn registry_reloaded(&self, success: bool) {
        if success {
            self.registry_reloads.fetch_add(1, Ordering::Relaxed);
        } else {
            self.registry_reload_failures
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    // Backend call metrics
    pub fn backend_called(&self, backend_key: &str, duration: Duration, success: bool) {
        if let Ok(mut stats) = self.backend_stats.lock() {
            let entry = stats
                .entry(backend_key.to_string())
                .or_insert_with(|| BackendCallStats::new(backend_key));
            entry.calls += 1;
            entry.last_call = current_timestamp();
            entry.call_times.push(duration.as_millis() as u64);
            if entry.call_times.len() > MAX_SAMPLES {
                entry.call_times.remove(0);
            }
            if !success {
                entry.failures += 1;
            }
        }
    }

    pub fn backend_timed_out(&self, backend_key: &str) {
        if let Ok(mut stats) = self.backend_stats.lock() {
            stats
                .entry(backend_key.to_string())
                .or_insert_with(|| BackendCallStats::new(backend_key))
                .timeouts += 1;
        }
    }

    // Lifecycle metrics
    pub fn set_gateway_state(&self, state: &str) {
        if let Ok(mut current_state) = self.gateway_state.lock() {
            if *current_state != state {
                *current_state = state.to_string();
            }
        }
    }

    pub fn update_health_status(&self, healthy: bool) {
        self.health_status.store(healthy, Ordering::Relaxed);
        self.last_health_check
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        self.health_status.load(Ordering::Relaxed)
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        let now = current_timestamp();
        for counter in [
            &self.requests_received,
            &self.requests_in_flight,
            &self.primary_successes,
            &self.fallback_successes,
            &self.requests_failed,
            &self.requests_cancelled,
            &self.fallbacks_triggered,
            &self.probes_issued,
            &self.probe_cache_hits,
            &self.probes_coalesced,
            &self.registry_version,
            &self.registry_reloads,
            &self.registry_reload_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.uptime_start.store(now, Ordering::Relaxed);
        self.health_status.store(true, Ordering::Relaxed);
        self.last_health_check.store(now, Ordering::Relaxed);

        if let Ok(mut times) = self.dispatch_times.lock() {
            times.clear();
        }
        if let Ok(mut failures) = self.failures_by_kind.lock() {
            failures.clear();
        }
        if let Ok(mut stats) = self.backend_stats.lock() {
            stats.clear();
        }
        if let Ok(mut state) = self.gateway_state.lock() {
            *state = "initializing".to_string();
        }
    }

    /// Calculate dispatch time statistics (avg, p50, p95, p99)
    fn dispatch_time_statistics(&self) -> (f64, f64, f64, f64) {
        match self.dispatch_times.lock() {
            Ok(times) if !times.is_empty() => {
                let mut sorted = times.clone();
                sorted.sort_unstable();
                let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
                (
                    avg,
                    percentile(&sorted, 50.0),
                    percentile(&sorted, 95.0),
                    percentile(&sorted, 99.0),
                )
            }
            _ => (0.0, 0.0, 0.0, 0.0),
        }
    }

    fn backend_statistics(&self) -> BTreeMap<String, BackendStatsSnapshot> {
        match self.backend_stats.lock() {
            Ok(stats) => stats
                .iter()
                .map(|(key, stats)| (key.clone(), stats.snapshot()))
                .collect(),
            Err(_) => BTreeMap::new(),
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg, p50, p95, p99) = self.dispatch_time_statistics();

        MetricsSnapshot {
            dispatch: DispatchMetrics {
                requests_received: self.requests_received.load(Ordering::Relaxed),
                requests_in_flight: self.requests_in_flight.load(Ordering::Relaxed),
                primary_successes: self.primary_successes.load(Ordering::Relaxed),
                fallback_successes: self.fallback_successes.load(Ordering::Relaxed),
                requests_failed: self.requests_failed.load(Ordering::Relaxed),
                requests_cancelled: self.requests_cancelled.load(Ordering::Relaxed),
                fallbacks_triggered: self.fallbacks_triggered.load(Ordering::Relaxed),
                failures_by_kind: self
                    .failures_by_kind
                    .lock()
                    .map(|f| f.clone())
                    .unwrap_or_default(),
                avg_dispatch_time_ms: avg,
                dispatch_time_p50_ms: p50,
                dispatch_time_p95_ms: p95,
                dispatch_time_p99_ms: p99,
            },
            health: ProbeMetrics {
                probes_issued: self.probes_issued.load(Ordering::Relaxed),
                probe_cache_hits: self.probe_cache_hits.load(Ordering::Relaxed),
                probes_coalesced: self.probes_coalesced.load(Ordering::Relaxed),
            },
            registry: RegistryMetrics {
                version: self.registry_version.load(Ordering::Relaxed),
                reloads: self.registry_reloads.load(Ordering::Relaxed),
                reload_failures: self.registry_reload_failures.load(Ordering::Relaxed),
            },
            backends: self.backend_statistics(),
            lifecycle: LifecycleMetrics {
                current_state: self
                    .gateway_state
                    .lock()
                    .map(|s| s.clone())
                    .unwrap_or_else(|_| "unknown".to_string()),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                healthy: self.health_status.load(Ordering::Relaxed),
                last_health_check: self.last_health_check.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

/// One request in flight
///
/// Dropping the guard without settling it counts the request as cancelled,
/// which is what happens when the caller goes away mid-dispatch.
#[must_use = "the request leaves the in-flight gauge when the guard drops"]
pub struct InFlightGuard<'a> {
    collector: &'a MetricsCollector,
    settled: bool,
}

impl InFlightGuard<'_> {
    pub fn succeeded(mut self, path: DispatchPath, duration: Duration) {
        self.settled = true;
        self.collector.dispatch_succeeded(path, duration);
    }

    pub fn failed(mut self, kind: ErrorKind, duration: Duration) {
        self.settled = true;
        self.collector.dispatch_failed(kind, duration);
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.collector.dispatch_left_flight(self.settled);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn push_sample(samples: &Mutex<Vec<u64>>, duration: Duration) {
    if let Ok(mut times) = samples.lock() {
        times.push(duration.as_millis() as u64);
        if times.len() > MAX_SAMPLES {
            times.remove(0);
        }
    }
}

// Internal per-backend statistics (with timing data)
#[derive(Debug)]
struct BackendCallStats {
    backend_key: String,
    calls: u64,
    failures: u64,
    timeouts: u64,
    call_times: Vec<u64>, // milliseconds
    last_call: u64,
}

impl BackendCallStats {
    fn new(backend_key: &str) -> Self {
        Self {
            backend_key: backend_key.to_string(),
            calls: 0,
            failures: 0,
            timeouts: 0,
            call_times: Vec::new(),
            last_call: 0,
        }
    }

    fn snapshot(&self) -> BackendStatsSnapshot {
        let mut sorted = self.call_times.clone();
        sorted.sort_unstable();
        let avg_call_time_ms = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<u64>() as f64 / sorted.len() as f64
        };
        let success_rate = if self.calls == 0 {
            0.0
        } else {
            (self.calls - self.failures) as f64 / self.calls as f64
        };

        BackendStatsSnapshot {
            backend_key: self.backend_key.clone(),
            calls: self.calls,
            failures: self.failures,
            timeouts: self.timeouts,
            avg_call_time_ms,
            call_time_p95_ms: percentile(&sorted, 95.0),
            last_call: self.last_call,
            success_rate,
        }
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub dispatch: DispatchMetrics,
    pub health: ProbeMetrics,
    pub registry: RegistryMetrics,
    pub backends: BTreeMap<String, BackendStatsSnapshot>,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct DispatchMetrics {
    pub requests_received: u64,
    pub requests_in_flight: u64,
    pub primary_successes: u64,
    pub fallback_successes: u64,
    pub requests_failed: u64,
    /// Requests abandoned before an outcome, e.g. caller disconnects
    pub requests_cancelled: u64,
    pub fallbacks_triggered: u64,
    pub failures_by_kind: BTreeMap<String, u64>,
    pub avg_dispatch_time_ms: f64,
    pub dispatch_time_p50_ms: f64,
    pub dispatch_time_p95_ms: f64,
    pub dispatch_time_p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct ProbeMetrics {
    pub probes_issued: u64,
    pub probe_cache_hits: u64,
    pub probes_coalesced: u64,
}

#[derive(Debug, Serialize)]
pub struct RegistryMetrics {
    pub version: u64,
    pub reloads: u64,
    pub reload_failures: u64,
}

#[derive(Debug, Serialize)]
pub struct BackendStatsSnapshot {
    pub backend_key: String,
    pub calls: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub avg_call_time_ms: f64,
    pub call_time_p95_ms: f64,
    pub last_call: u64,
    pub success_rate: f64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub healthy: bool,
    pub last_health_check: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_index = index.floor() as usize;
        let upper_index = index.ceil() as usize;
        let lower_value = sorted_data[lower_index] as f64;
        let upper_value = sorted_data[upper_index] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}
