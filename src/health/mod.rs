//! Backend health gating
//!
//! The dispatch path asks a [`HealthGate`] whether a backend may receive traffic.
//! [`HealthProber`] is the production gate: it probes a bounded list of
//! candidate paths, caches the verdict for a TTL and coalesces concurrent probes
//! of the same backend.

pub mod prober;

pub use prober::{HealthProber, HealthProberConfig, HealthRecord, HealthStatus};

use async_trait::async_trait;
use url::Url;

/// Decides whether a backend is fit to receive a dispatch
#[async_trait]
pub trait HealthGate: Send + Sync {
    /// Current health record, from cache when still fresh
    async fn record_for(&self, backend_key: &str, location: &Url) -> HealthRecord;

    /// Fresh probe, bypassing any cached record
    async fn check(&self, backend_key: &str, location: &Url) -> HealthRecord {
        self.record_for(backend_key, location).await
    }

    async fn is_routable(&self, backend_key: &str, location: &Url) -> bool {
        self.record_for(backend_key, location)
            .await
            .status
            .is_routable()
    }

    /// Drop whatever is remembered about a key, e.g. once it leaves the registry
    fn invalidate(&self, _backend_key: &str) {}
}
