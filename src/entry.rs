//! Authoritative per-URL cache state. Pure map bookkeeping, no I/O.

use std::collections::HashMap;
use std::time::Instant;

use crate::fetcher::ResourceHandle;

/// Lifecycle of a tracked resource. Absence of an entry means idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Loading,
    Loaded,
    Errored,
}

#[derive(Debug)]
pub struct CacheEntry {
    pub state: EntryState,
    /// Last transition into `Loaded` (or refresh on access where the
    /// resource class bumps on read). Drives TTL and trim ordering.
    pub loaded_at: Instant,
    /// Tie-break for trim ordering when instants collide.
    pub seq: u64,
    pub handle: Option<ResourceHandle>,
    pub size_bytes: Option<u64>,
}

/// In-memory entry store: one entry per URL, mutated only by the
/// scheduler and eviction passes that own it.
#[derive(Debug, Default)]
pub struct EntryStore {
    entries: HashMap<String, CacheEntry>,
    next_seq: u64,
}

impl EntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, url: &str) -> Option<EntryState> {
        self.entries.get(url).map(|e| e.state)
    }

    pub fn get(&self, url: &str) -> Option<&CacheEntry> {
        self.entries.get(url)
    }

    pub fn is_loaded(&self, url: &str) -> bool {
        self.state(url) == Some(EntryState::Loaded)
    }

    /// Marks a URL as in-flight. Returns a handle displaced from a prior
    /// entry (a retried error never holds one, but upserts must not leak).
    pub fn begin_loading(&mut self, url: &str) -> Option<ResourceHandle> {
        let seq = self.bump_seq();
        let old = self.entries.insert(
            url.to_string(),
            CacheEntry {
                state: EntryState::Loading,
                loaded_at: Instant::now(),
                seq,
                handle: None,
                size_bytes: None,
            },
        );
        old.and_then(|e| e.handle)
    }

    /// Records a successful fetch. Returns any displaced handle.
    pub fn finish_loaded(
        &mut self,
        url: &str,
        handle: Option<ResourceHandle>,
        size_bytes: Option<u64>,
        now: Instant,
    ) -> Option<ResourceHandle> {
        let seq = self.bump_seq();
        let old = self.entries.insert(
            url.to_string(),
            CacheEntry {
                state: EntryState::Loaded,
                loaded_at: now,
                seq,
                handle,
                size_bytes,
            },
        );
        old.and_then(|e| e.handle)
    }

    pub fn finish_errored(&mut self, url: &str) {
        let seq = self.bump_seq();
        self.entries.insert(
            url.to_string(),
            CacheEntry {
                state: EntryState::Errored,
                loaded_at: Instant::now(),
                seq,
                handle: None,
                size_bytes: None,
            },
        );
    }

    /// Refreshes the eviction timestamp of a loaded entry.
    pub fn touch(&mut self, url: &str, now: Instant) {
        let seq = self.bump_seq();
        if let Some(entry) = self.entries.get_mut(url) {
            if entry.state == EntryState::Loaded {
                entry.loaded_at = now;
                entry.seq = seq;
            }
        }
    }

    pub fn remove(&mut self, url: &str) -> Option<CacheEntry> {
        self.entries.remove(url)
    }

    /// Number of resident loaded entries. Loading entries hold no payload
    /// yet and are invisible to count bounds.
    pub fn loaded_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state == EntryState::Loaded)
            .count()
    }

    /// Total resident payload bytes across loaded entries.
    pub fn total_bytes(&self) -> u64 {
        self.entries
            .values()
            .filter(|e| e.state == EntryState::Loaded)
            .filter_map(|e| e.size_bytes)
            .sum()
    }

    /// URL of the oldest loaded entry, the next trim victim.
    pub fn oldest_loaded(&self) -> Option<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.state == EntryState::Loaded)
            .min_by_key(|(_, e)| (e.loaded_at, e.seq))
            .map(|(url, _)| url.clone())
    }

    /// Loaded URLs whose age exceeds `ttl` at `now`.
    pub fn expired(&self, now: Instant, ttl: std::time::Duration) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.state == EntryState::Loaded)
            .filter(|(_, e)| now.saturating_duration_since(e.loaded_at) > ttl)
            .map(|(url, _)| url.clone())
            .collect()
    }

    /// Drops every settled (non-loading) entry, returning released
    /// handles. In-flight entries are left alone so their completions
    /// still have a slot to land in.
    pub fn clear_settled(&mut self) -> Vec<ResourceHandle> {
        let settled: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state != EntryState::Loading)
            .map(|(url, _)| url.clone())
            .collect();
        let mut handles = Vec::new();
        for url in settled {
            if let Some(entry) = self.entries.remove(&url) {
                if let Some(handle) = entry.handle {
                    handles.push(handle);
                }
            }
        }
        handles
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}
