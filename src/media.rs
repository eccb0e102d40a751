//! Public facade for one media resource class.
//!
//! Rendering components talk to a [`MediaCache`]: ask whether a URL is
//! ready, preload at a priority, register viewport interest, and release
//! it all on unmount. The composition root constructs one instance per
//! resource class (images, videos) and shares it process-wide; nothing
//! in here is a global.

use std::time::Instant;

use bytes::Bytes;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::MediaCacheConfig;
use crate::fetcher::{HttpFetcher, ResourceFetcher};
use crate::scheduler::{FetchOutcome, FetchScheduler, Priority};
use crate::viewport::{PlaybackAudio, Rect, ViewportTracker, Visibility};

pub struct MediaCache<F: ResourceFetcher> {
    scheduler: FetchScheduler<F>,
    tracker: ViewportTracker,
    config: MediaCacheConfig,
}

impl MediaCache<HttpFetcher> {
    /// Image cache over plain HTTP, with the image profile.
    pub fn images() -> Self {
        let config = MediaCacheConfig::images();
        let fetcher = HttpFetcher::new(config.retain_payload);
        Self::with_fetcher(config, fetcher)
    }

    /// Video cache over plain HTTP, with the video profile.
    pub fn videos() -> Self {
        let config = MediaCacheConfig::videos();
        let fetcher = HttpFetcher::new(config.retain_payload);
        Self::with_fetcher(config, fetcher)
    }
}

impl<F: ResourceFetcher + 'static> MediaCache<F> {
    pub fn with_fetcher(config: MediaCacheConfig, fetcher: F) -> Self {
        let tracker = ViewportTracker::new(config.lead_margin_px);
        let scheduler = FetchScheduler::new(config.clone(), fetcher);
        Self {
            scheduler,
            tracker,
            config,
        }
    }

    pub async fn is_loaded(&self, url: &str) -> bool {
        self.scheduler.is_loaded(url).await
    }

    /// Preloads a resource, resolving once it settles. Returns whether
    /// it loaded; failure detail stays inside (rendering shows a
    /// fallback affordance either way).
    pub async fn preload(&self, url: &str, priority: Priority) -> bool {
        self.scheduler.request(url, priority).await == FetchOutcome::Loaded
    }

    /// Preloads a batch: the first `high_count` URLs at High priority
    /// (the ones about to render), the rest at Low. Returns how many
    /// loaded.
    pub async fn preload_batch(&self, urls: &[String], high_count: usize) -> usize {
        let futures = urls.iter().enumerate().map(|(i, url)| {
            let priority = if i < high_count {
                Priority::High
            } else {
                Priority::Low
            };
            self.preload(url, priority)
        });
        join_all(futures).await.into_iter().filter(|ok| *ok).count()
    }

    /// Jumps a resource to the front of the line, e.g. on a carousel
    /// swipe. Starts a fresh High fetch if the URL was never requested.
    pub async fn prioritize(&self, url: &str) {
        self.scheduler.prioritize(url).await;
    }

    /// Registers viewport interest for a mounted element. If it mounts
    /// already near or inside the viewport its fetch is promoted
    /// immediately.
    pub async fn observe(&self, element: &str, url: &str, rect: Rect) {
        if self.tracker.observe(element, url, rect).is_some() {
            self.scheduler.prioritize(url).await;
        }
    }

    /// Releases the watch for an unmounted element. Must pair with every
    /// `observe` or the registration leaks.
    pub fn unobserve(&self, element: &str) {
        self.tracker.unobserve(element);
    }

    /// Layout update for one element; promotes its fetch when the move
    /// brings it near the viewport.
    pub async fn element_moved(&self, element: &str, rect: Rect) {
        if let Some(event) = self.tracker.set_element_rect(element, rect) {
            self.scheduler.prioritize(&event.url).await;
        }
    }

    /// Scroll/resize update; promotes every watched resource that just
    /// came near the viewport. Returns the URLs that became fully
    /// visible so video tiles can start playback.
    pub async fn viewport_changed(&self, viewport: Rect) -> Vec<String> {
        let events = self.tracker.set_viewport(viewport);
        let mut visible = Vec::new();
        for event in events {
            self.scheduler.prioritize(&event.url).await;
            if event.visibility == Visibility::Visible {
                visible.push(event.url);
            }
        }
        visible
    }

    /// Audio mode for the next playback attempt (unmuted until the
    /// browser rejects it once).
    pub fn playback_attempt(&self, url: &str) -> PlaybackAudio {
        self.tracker.playback_attempt(url)
    }

    pub fn playback_rejected(&self, url: &str) {
        self.tracker.playback_rejected(url);
    }

    pub fn playback_succeeded(&self, url: &str) {
        self.tracker.playback_succeeded(url);
    }

    /// Resident payload for a loaded entry (video classes only).
    pub async fn cached_bytes(&self, url: &str) -> Option<Bytes> {
        self.scheduler.cached_bytes(url).await
    }

    /// Eviction pass: TTL sweep then size-bound trim.
    pub async fn cleanup(&self) {
        self.scheduler.cleanup().await;
    }

    /// Eviction pass with an explicit clock, for deterministic callers.
    pub async fn cleanup_at(&self, now: Instant) {
        self.scheduler.cleanup_at(now).await;
    }

    /// Drops all settled entries, pending requests, and watches. Used on
    /// explicit cache busting; in-flight fetches still settle.
    pub async fn clear(&self) {
        self.scheduler.clear().await;
        self.tracker.clear();
    }

    /// Tab visibility hook: an eviction pass runs when the tab hides.
    pub async fn on_visibility_change(&self, visible: bool) {
        if !visible {
            debug!("tab hidden, running eviction pass");
            self.cleanup().await;
        }
    }

    /// Spawns the periodic eviction task. The composition root keeps the
    /// handle and aborts it on shutdown.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        let interval = self.config.maintenance_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                scheduler.cleanup().await;
            }
        })
    }

    pub async fn resident_count(&self) -> usize {
        self.scheduler.resident_count().await
    }

    pub async fn resident_bytes(&self) -> u64 {
        self.scheduler.resident_bytes().await
    }
}
