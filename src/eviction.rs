//! TTL and size-bound eviction over the entry store.
//!
//! Runs on tab-hide, on the periodic maintenance pass, and (for
//! byte-bounded caches) synchronously before admitting a new payload.
//! In-flight entries are never evicted.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::entry::EntryStore;
use crate::fetcher::ResourceHandle;

/// What "over budget" means for a given resource class.
#[derive(Debug, Clone, Copy)]
pub enum SizeBound {
    Entries(usize),
    Bytes(u64),
    Unbounded,
}

#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    pub ttl: Duration,
    pub bound: SizeBound,
}

impl EvictionPolicy {
    pub fn new(ttl: Duration, bound: SizeBound) -> Self {
        Self { ttl, bound }
    }

    /// Removes every loaded entry older than the TTL at `now`. Returns
    /// the handles the caller must release.
    pub fn sweep(&self, store: &mut EntryStore, now: Instant) -> Vec<ResourceHandle> {
        let mut released = Vec::new();
        for url in store.expired(now, self.ttl) {
            debug!(url = %url, "evicting expired entry");
            if let Some(entry) = store.remove(&url) {
                if let Some(handle) = entry.handle {
                    released.push(handle);
                }
            }
        }
        released
    }

    /// Evicts oldest-first until the store is back within its bound.
    pub fn trim_to_bound(&self, store: &mut EntryStore) -> Vec<ResourceHandle> {
        let mut released = Vec::new();
        while self.over_bound(store) {
            let Some(victim) = store.oldest_loaded() else {
                break;
            };
            debug!(url = %victim, "evicting for size bound");
            if let Some(entry) = store.remove(&victim) {
                if let Some(handle) = entry.handle {
                    released.push(handle);
                }
            }
        }
        released
    }

    /// Pre-admission trim for byte-bounded caches: evicts oldest-first
    /// until the incoming payload fits, or nothing loaded remains.
    pub fn ensure_headroom(&self, store: &mut EntryStore, incoming: u64) -> Vec<ResourceHandle> {
        let SizeBound::Bytes(max) = self.bound else {
            return Vec::new();
        };
        let mut released = Vec::new();
        while store.loaded_count() > 0 && store.total_bytes() + incoming > max {
            let Some(victim) = store.oldest_loaded() else {
                break;
            };
            debug!(url = %victim, incoming, "evicting for headroom");
            if let Some(entry) = store.remove(&victim) {
                if let Some(handle) = entry.handle {
                    released.push(handle);
                }
            }
        }
        released
    }

    fn over_bound(&self, store: &EntryStore) -> bool {
        match self.bound {
            SizeBound::Entries(max) => store.loaded_count() > max,
            SizeBound::Bytes(max) => store.total_bytes() > max,
            SizeBound::Unbounded => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn loaded(store: &mut EntryStore, url: &str, size: u64, at: Instant) {
        let handle = ResourceHandle::new(Bytes::from(vec![0u8; size as usize]));
        store.finish_loaded(url, Some(handle), Some(size), at);
    }

    #[test]
    fn sweep_removes_only_entries_past_ttl() {
        let mut store = EntryStore::new();
        let policy = EvictionPolicy::new(Duration::from_secs(60), SizeBound::Unbounded);
        let now = Instant::now();
        loaded(&mut store, "old.mp4", 4, now);
        loaded(&mut store, "new.mp4", 4, now + Duration::from_secs(30));

        let released = policy.sweep(&mut store, now + Duration::from_secs(61));
        assert_eq!(released.len(), 1);
        assert!(!store.is_loaded("old.mp4"));
        assert!(store.is_loaded("new.mp4"));
    }

    #[test]
    fn sweep_spares_the_exact_boundary() {
        let mut store = EntryStore::new();
        let policy = EvictionPolicy::new(Duration::from_secs(60), SizeBound::Unbounded);
        let now = Instant::now();
        loaded(&mut store, "edge.mp4", 1, now);

        // Exactly TTL old is not yet expired; strictly older is.
        assert!(policy
            .sweep(&mut store, now + Duration::from_secs(60))
            .is_empty());
        assert!(store.is_loaded("edge.mp4"));
    }

    #[test]
    fn trim_evicts_oldest_first_until_within_bound() {
        let mut store = EntryStore::new();
        let policy = EvictionPolicy::new(Duration::from_secs(600), SizeBound::Entries(2));
        let now = Instant::now();
        loaded(&mut store, "a.jpg", 1, now);
        loaded(&mut store, "b.jpg", 1, now + Duration::from_secs(1));
        loaded(&mut store, "c.jpg", 1, now + Duration::from_secs(2));
        loaded(&mut store, "d.jpg", 1, now + Duration::from_secs(3));

        policy.trim_to_bound(&mut store);
        assert_eq!(store.loaded_count(), 2);
        assert!(!store.is_loaded("a.jpg"));
        assert!(!store.is_loaded("b.jpg"));
        assert!(store.is_loaded("c.jpg"));
        assert!(store.is_loaded("d.jpg"));
    }

    #[test]
    fn headroom_loops_until_the_incoming_payload_fits() {
        let mut store = EntryStore::new();
        let policy = EvictionPolicy::new(Duration::from_secs(600), SizeBound::Bytes(10));
        let now = Instant::now();
        loaded(&mut store, "a.mp4", 4, now);
        loaded(&mut store, "b.mp4", 4, now + Duration::from_secs(1));

        let released = policy.ensure_headroom(&mut store, 8);
        assert_eq!(released.len(), 2);
        assert_eq!(store.total_bytes(), 0);
    }

    #[test]
    fn headroom_is_a_no_op_for_count_bounded_caches() {
        let mut store = EntryStore::new();
        let policy = EvictionPolicy::new(Duration::from_secs(600), SizeBound::Entries(1));
        loaded(&mut store, "a.jpg", 1, Instant::now());
        assert!(policy.ensure_headroom(&mut store, u64::MAX).is_empty());
        assert!(store.is_loaded("a.jpg"));
    }
}
