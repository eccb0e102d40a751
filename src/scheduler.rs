//! Concurrency-bounded, priority-aware fetch scheduler.
//!
//! Guarantees at most one underlying fetch per URL (fan-in), at most
//! `max_concurrent` overlapping fetches, and High-before-Low dispatch with
//! FIFO order inside each tier. In-flight fetches are never preempted.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::config::MediaCacheConfig;
use crate::entry::{EntryState, EntryStore};
use crate::eviction::{EvictionPolicy, SizeBound};
use crate::fetcher::{FetchError, FetchedResource, ResourceFetcher};

/// Two-tier request priority. High requests dispatch before any Low
/// request regardless of enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Low,
}

/// What a request future resolves with. Failures are reported, never
/// thrown: rendering falls back to a per-resource error affordance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Loaded,
    Failed,
}

#[derive(Debug)]
struct PendingRequest {
    url: String,
    enqueued_at: Instant,
}

/// FIFO-within-tier pending queue. Not a general heap: two tiers are all
/// the feed ever needs.
#[derive(Debug, Default)]
struct PendingQueue {
    high: VecDeque<PendingRequest>,
    low: VecDeque<PendingRequest>,
}

impl PendingQueue {
    fn push(&mut self, url: String, priority: Priority) {
        let request = PendingRequest {
            url,
            enqueued_at: Instant::now(),
        };
        match priority {
            Priority::High => self.high.push_back(request),
            Priority::Low => self.low.push_back(request),
        }
    }

    fn pop(&mut self) -> Option<PendingRequest> {
        self.high.pop_front().or_else(|| self.low.pop_front())
    }

    fn contains(&self, url: &str) -> bool {
        self.high.iter().chain(self.low.iter()).any(|r| r.url == url)
    }

    /// Moves a Low-tier request into the High tier, keeping its fan-in
    /// intact. False when the URL is absent or already High.
    fn raise(&mut self, url: &str) -> bool {
        let Some(pos) = self.low.iter().position(|r| r.url == url) else {
            return false;
        };
        if let Some(request) = self.low.remove(pos) {
            self.high.push_back(request);
            return true;
        }
        false
    }

    fn remove(&mut self, url: &str) -> Option<PendingRequest> {
        if let Some(pos) = self.high.iter().position(|r| r.url == url) {
            return self.high.remove(pos);
        }
        if let Some(pos) = self.low.iter().position(|r| r.url == url) {
            return self.low.remove(pos);
        }
        None
    }

    fn drain_all(&mut self) -> Vec<PendingRequest> {
        self.high.drain(..).chain(self.low.drain(..)).collect()
    }

    fn len(&self) -> usize {
        self.high.len() + self.low.len()
    }
}

struct SchedulerState {
    entries: EntryStore,
    queue: PendingQueue,
    waiters: HashMap<String, Vec<oneshot::Sender<FetchOutcome>>>,
    in_flight: usize,
    draining: bool,
}

struct Inner<F> {
    state: Mutex<SchedulerState>,
    fetcher: F,
    config: MediaCacheConfig,
    policy: EvictionPolicy,
}

/// One scheduler per resource class, shared by every rendering component
/// that touches that class. Cheap to clone.
pub struct FetchScheduler<F: ResourceFetcher> {
    inner: Arc<Inner<F>>,
}

impl<F: ResourceFetcher> Clone for FetchScheduler<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: ResourceFetcher + 'static> FetchScheduler<F> {
    pub fn new(config: MediaCacheConfig, fetcher: F) -> Self {
        let bound = match (config.max_entries, config.max_bytes) {
            (Some(n), _) => SizeBound::Entries(n),
            (None, Some(b)) => SizeBound::Bytes(b),
            (None, None) => SizeBound::Unbounded,
        };
        let policy = EvictionPolicy::new(config.ttl, bound);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedulerState {
                    entries: EntryStore::new(),
                    queue: PendingQueue::default(),
                    waiters: HashMap::new(),
                    in_flight: 0,
                    draining: false,
                }),
                fetcher,
                config,
                policy,
            }),
        }
    }

    /// Requests a resource at a priority and resolves when it settles.
    ///
    /// Loaded entries resolve immediately with no I/O. A URL that is
    /// already in flight or queued fans in on the existing attempt; a
    /// High request against a Low-queued URL raises the queued tier. An
    /// errored entry does not block retry: this counts as a fresh attempt.
    pub async fn request(&self, url: &str, priority: Priority) -> FetchOutcome {
        let rx = {
            let mut state = self.inner.state.lock().await;
            match state.entries.state(url) {
                Some(EntryState::Loaded) => {
                    if self.inner.config.touch_on_access {
                        state.entries.touch(url, Instant::now());
                    }
                    return FetchOutcome::Loaded;
                }
                Some(EntryState::Loading) => self.attach_waiter(&mut state, url),
                _ if state.queue.contains(url) => {
                    // A High caller joining a Low-queued URL raises the
                    // pending request so it inherits High scheduling.
                    if priority == Priority::High && state.queue.raise(url) {
                        debug!(url, "raising queued fetch to high priority");
                    }
                    self.attach_waiter(&mut state, url)
                }
                _ => {
                    let rx = self.attach_waiter(&mut state, url);
                    if state.in_flight < self.inner.config.max_concurrent {
                        self.dispatch(&mut state, url.to_string());
                    } else {
                        debug!(url, ?priority, "queueing fetch, at concurrency limit");
                        state.queue.push(url.to_string(), priority);
                    }
                    rx
                }
            }
        };
        rx.await.unwrap_or(FetchOutcome::Failed)
    }

    /// Moves a pending request to the head of the line: dispatched
    /// immediately if a slot is free, otherwise re-enqueued High. No-op
    /// when the URL is already in flight, loaded, or unknown. Returns
    /// whether a pending request was found.
    pub async fn promote(&self, url: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        match state.entries.state(url) {
            Some(EntryState::Loading) | Some(EntryState::Loaded) => return false,
            _ => {}
        }
        let Some(pending) = state.queue.remove(url) else {
            return false;
        };
        debug!(url, waited_ms = pending.enqueued_at.elapsed().as_millis() as u64, "promoting pending fetch");
        if state.in_flight < self.inner.config.max_concurrent {
            self.dispatch(&mut state, pending.url);
        } else {
            state.queue.push(pending.url, Priority::High);
        }
        true
    }

    /// Promote-or-start: used when the user reaches a resource directly
    /// (carousel swipe, viewport entry). Pending requests are promoted;
    /// unknown or errored URLs start a fresh High attempt that nobody
    /// awaits — interested callers attach via `request` later.
    pub async fn prioritize(&self, url: &str) {
        if self.promote(url).await {
            return;
        }
        let mut state = self.inner.state.lock().await;
        match state.entries.state(url) {
            Some(EntryState::Loading) | Some(EntryState::Loaded) => {}
            _ if state.queue.contains(url) => {}
            _ => {
                if state.in_flight < self.inner.config.max_concurrent {
                    self.dispatch(&mut state, url.to_string());
                } else {
                    state.queue.push(url.to_string(), Priority::High);
                }
            }
        }
    }

    pub async fn is_loaded(&self, url: &str) -> bool {
        self.inner.state.lock().await.entries.is_loaded(url)
    }

    pub async fn status(&self, url: &str) -> Option<EntryState> {
        self.inner.state.lock().await.entries.state(url)
    }

    /// Resident payload for a loaded entry, when the resource class
    /// retains one. Bumps the eviction timestamp where configured.
    pub async fn cached_bytes(&self, url: &str) -> Option<Bytes> {
        let mut state = self.inner.state.lock().await;
        let bytes = state
            .entries
            .get(url)
            .filter(|e| e.state == EntryState::Loaded)
            .and_then(|e| e.handle.as_ref())
            .map(|h| h.bytes());
        if bytes.is_some() && self.inner.config.touch_on_access {
            state.entries.touch(url, Instant::now());
        }
        bytes
    }

    /// TTL sweep plus size-bound trim, as of `now`.
    pub async fn cleanup_at(&self, now: Instant) {
        let released = {
            let mut state = self.inner.state.lock().await;
            let mut released = self.inner.policy.sweep(&mut state.entries, now);
            released.extend(self.inner.policy.trim_to_bound(&mut state.entries));
            released
        };
        for handle in released {
            self.inner.fetcher.release(handle);
        }
    }

    pub async fn cleanup(&self) {
        self.cleanup_at(Instant::now()).await;
    }

    /// Drops every settled entry and the whole pending queue. Queued
    /// waiters resolve `Failed`; in-flight fetches are not interrupted
    /// and their waiters still observe the real outcome.
    pub async fn clear(&self) {
        let released = {
            let mut state = self.inner.state.lock().await;
            for pending in state.queue.drain_all() {
                if let Some(waiters) = state.waiters.remove(&pending.url) {
                    for tx in waiters {
                        let _ = tx.send(FetchOutcome::Failed);
                    }
                }
            }
            state.entries.clear_settled()
        };
        debug!(released = released.len(), "cleared cache");
        for handle in released {
            self.inner.fetcher.release(handle);
        }
    }

    pub async fn in_flight_count(&self) -> usize {
        self.inner.state.lock().await.in_flight
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    pub async fn resident_bytes(&self) -> u64 {
        self.inner.state.lock().await.entries.total_bytes()
    }

    pub async fn resident_count(&self) -> usize {
        self.inner.state.lock().await.entries.loaded_count()
    }

    fn attach_waiter(
        &self,
        state: &mut SchedulerState,
        url: &str,
    ) -> oneshot::Receiver<FetchOutcome> {
        let (tx, rx) = oneshot::channel();
        state.waiters.entry(url.to_string()).or_default().push(tx);
        rx
    }

    /// Starts the fetch for `url` while holding the state lock. The
    /// spawned task re-acquires the lock on completion.
    fn dispatch(&self, state: &mut SchedulerState, url: String) {
        if let Some(displaced) = state.entries.begin_loading(&url) {
            self.inner.fetcher.release(displaced);
        }
        state.in_flight += 1;
        debug!(url = %url, in_flight = state.in_flight, "dispatching fetch");
        let scheduler = self.clone();
        tokio::spawn(async move {
            let result = scheduler.inner.fetcher.fetch(&url).await;
            scheduler.complete(url, result).await;
        });
    }

    async fn complete(&self, url: String, result: Result<FetchedResource, FetchError>) {
        let released = {
            let mut state = self.inner.state.lock().await;
            state.in_flight -= 1;
            let mut released = Vec::new();

            let outcome = match result {
                Ok(resource) => {
                    // Byte-bounded caches make room before admitting the
                    // new payload so the bound holds immediately.
                    if let Some(size) = resource.size_bytes {
                        released.extend(
                            self.inner.policy.ensure_headroom(&mut state.entries, size),
                        );
                    }
                    let displaced = state.entries.finish_loaded(
                        &url,
                        resource.handle,
                        resource.size_bytes,
                        Instant::now(),
                    );
                    released.extend(displaced);
                    FetchOutcome::Loaded
                }
                Err(err) => {
                    warn!(url = %url, error = %err, "fetch failed");
                    state.entries.finish_errored(&url);
                    FetchOutcome::Failed
                }
            };

            if let Some(waiters) = state.waiters.remove(&url) {
                for tx in waiters {
                    let _ = tx.send(outcome);
                }
            }

            self.drain(&mut state);
            released
        };
        for handle in released {
            self.inner.fetcher.release(handle);
        }
    }

    /// Single-pass queue drain. The `draining` flag collapses re-entrant
    /// calls (a dispatch completing synchronously lands back here) into
    /// the already-running pass.
    fn drain(&self, state: &mut SchedulerState) {
        if state.draining {
            return;
        }
        state.draining = true;
        while state.in_flight < self.inner.config.max_concurrent {
            let Some(pending) = state.queue.pop() else {
                break;
            };
            self.dispatch(state, pending.url);
        }
        state.draining = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_orders_high_before_low_fifo_within_tier() {
        let mut queue = PendingQueue::default();
        queue.push("low1".into(), Priority::Low);
        queue.push("high1".into(), Priority::High);
        queue.push("low2".into(), Priority::Low);
        queue.push("high2".into(), Priority::High);

        let order: Vec<String> = std::iter::from_fn(|| queue.pop().map(|r| r.url)).collect();
        assert_eq!(order, ["high1", "high2", "low1", "low2"]);
    }

    #[test]
    fn raise_moves_low_requests_behind_existing_high() {
        let mut queue = PendingQueue::default();
        queue.push("h.jpg".into(), Priority::High);
        queue.push("l1.jpg".into(), Priority::Low);
        queue.push("l2.jpg".into(), Priority::Low);

        assert!(queue.raise("l2.jpg"));
        assert!(!queue.raise("l2.jpg"), "already high");
        assert!(!queue.raise("missing.jpg"));

        let order: Vec<String> = std::iter::from_fn(|| queue.pop().map(|r| r.url)).collect();
        assert_eq!(order, ["h.jpg", "l2.jpg", "l1.jpg"]);
    }

    #[test]
    fn queue_remove_pulls_from_either_tier() {
        let mut queue = PendingQueue::default();
        queue.push("a".into(), Priority::Low);
        queue.push("b".into(), Priority::High);
        assert!(queue.remove("a").is_some());
        assert!(queue.remove("a").is_none());
        assert!(queue.contains("b"));
        assert_eq!(queue.len(), 1);
    }
}
