//! Current-snapshot holder with atomic reload

use crate::observability::metrics::metrics;
use crate::registry::validator::{validate, RawRegistry, RegistryError, RegistrySnapshot};
use arc_swap::ArcSwap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

/// Owner of the registry snapshot lifecycle
///
/// Readers call [`RegistryStore::current`] once per request and keep the returned
/// `Arc` for the whole request, so a concurrent reload never changes the registry
/// under an in-flight dispatch. Superseded snapshots are freed when the last
/// reader drops its `Arc`.
///
/// Reloads are serialized: each successful reload is exactly one version
/// above the snapshot it replaces.
pub struct RegistryStore {
    current: ArcSwap<RegistrySnapshot>,
    reload_lock: Mutex<()>,
}

impl RegistryStore {
    /// Wrap an already validated snapshot
    pub fn new(initial: RegistrySnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            reload_lock: Mutex::new(()),
        }
    }

    /// Validate a raw document as version 1
    pub fn from_raw(raw: &RawRegistry) -> Result<Self, RegistryError> {
        let snapshot = validate(raw, 1)?;
        info!(
            version = snapshot.version(),
            backends = snapshot.len(),
            "Registry loaded"
        );
        Ok(Self::new(snapshot))
    }

    /// The snapshot in effect right now
    pub fn current(&self) -> Arc<RegistrySnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version()
    }

    /// Validate `raw` and, only if it is entirely valid, swap it in
    ///
    /// On failure the previous snapshot stays in effect.
    pub fn reload(&self, raw: &RawRegistry) -> Result<Arc<RegistrySnapshot>, RegistryError> {
        self.replace(raw).map(|(_, current)| current)
    }

    /// [`RegistryStore::reload`], also returning the snapshot it replaced
    pub fn replace(
        &self,
        raw: &RawRegistry,
    ) -> Result<(Arc<RegistrySnapshot>, Arc<RegistrySnapshot>), RegistryError> {
        let _reloading = self
            .reload_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let previous = self.current.load_full();
        match validate(raw, previous.version() + 1) {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                self.current.store(snapshot.clone());
                metrics().registry_reloaded(true);
                info!(
                    previous_version = previous.version(),
                    version = snapshot.version(),
                    backends = snapshot.len(),
                    "Registry reloaded"
                );
                Ok((previous, snapshot))
            }
            Err(e) => {
                metrics().registry_reloaded(false);
                warn!(
                    issues = e.issues.len(),
                    current_version = self.version(),
                    "Registry reload rejected: {}",
                    e
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, &str)]) -> RawRegistry {
        RawRegistry::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn test_store_starts_at_version_one() {
        let store = RegistryStore::from_raw(&raw(&[("a", "http://x:8000")])).unwrap();
        assert_eq!(store.version(), 1);
        assert!(store.current().contains("a"));
    }

    #[test]
    fn test_reload_swaps_snapshot_and_bumps_version() {
        let store = RegistryStore::from_raw(&raw(&[("a", "http://x:8000")])).unwrap();

        let reloaded = store
            .reload(&raw(&[("a", "http://x:8000"), ("b", "http://y:8000")]))
            .unwrap();

        assert_eq!(reloaded.version(), 2);
        assert_eq!(store.current().len(), 2);
    }

    #[test]
    fn test_failed_reload_keeps_previous_snapshot() {
        let store = RegistryStore::from_raw(&raw(&[("a", "http://x:8000")])).unwrap();

        let err = store
            .reload(&raw(&[("a", "http://x:8000"), ("b", "gopher://y")]))
            .unwrap_err();

        assert_eq!(err.issues.len(), 1);
        assert_eq!(store.version(), 1);
        assert!(!store.current().contains("b"));
    }

    #[test]
    fn test_in_flight_reader_keeps_old_snapshot() {
        let store = RegistryStore::from_raw(&raw(&[("a", "http://x:8000")])).unwrap();
        let held = store.current();

        store.reload(&raw(&[("b", "http://y:8000")])).unwrap();

        assert!(held.contains("a"));
        assert!(!held.contains("b"));
        assert!(store.current().contains("b"));
        assert!(!store.current().contains("a"));
    }

    #[test]
    fn test_replace_returns_the_replaced_snapshot() {
        let store = RegistryStore::from_raw(&raw(&[("a", "http://x:8000")])).unwrap();

        let (previous, current) = store.replace(&raw(&[("b", "http://y:8000")])).unwrap();

        assert_eq!(previous.version(), 1);
        assert!(previous.contains("a"));
        assert_eq!(current.version(), 2);
        assert!(Arc::ptr_eq(&current, &store.current()));
    }

    #[test]
    fn test_concurrent_reloads_never_move_version_backwards() {
        let store = Arc::new(RegistryStore::from_raw(&raw(&[("seed", "http://s:8000")])).unwrap());
        let threads = 8;
        let per_thread = 25;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    for i in 0..per_thread {
                        let key = format!("t{t}_{i}");
                        let doc = RawRegistry::from_pairs([(key.as_str(), "http://x:8000")]);
                        let snapshot = store.reload(&doc).unwrap();
                        assert!(snapshot.contains(&key));
                        seen.push(snapshot.version());
                        assert!(store.version() >= snapshot.version());
                    }
                    seen
                })
            })
            .collect();

        let mut versions: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        versions.sort_unstable();

        let expected: Vec<u64> = (2..=(threads * per_thread + 1) as u64).collect();
        assert_eq!(versions, expected);
        assert_eq!(store.version(), threads as u64 * per_thread as u64 + 1);
        let last = store.current();
        assert_eq!(last.version(), store.version());
    }

    #[test]
    fn test_failed_reload_does_not_consume_a_version() {
        let store = RegistryStore::from_raw(&raw(&[("a", "http://x:8000")])).unwrap();

        assert!(store.reload(&raw(&[("a", "ftp://x")])).is_err());
        let next = store.reload(&raw(&[("b", "http://y:8000")])).unwrap();

        assert_eq!(next.version(), 2);
    }
}
