//! Tunable limits for the media and posts caches.
//!
//! Concurrency limits, size bounds, and TTLs are configuration, not
//! invariants: the presets below reflect the values the feed UI ships with,
//! but callers may construct their own profile per resource class.

use std::time::Duration;

/// Limits for one media cache instance (one per resource class).
#[derive(Debug, Clone)]
pub struct MediaCacheConfig {
    /// Maximum number of overlapping in-flight fetches.
    pub max_concurrent: usize,
    /// Count bound on resident loaded entries, for caches that do not
    /// retain payload bytes (images).
    pub max_entries: Option<usize>,
    /// Byte bound on resident payloads, for caches that do (videos).
    pub max_bytes: Option<u64>,
    /// Age after which a loaded entry is unconditionally evicted.
    pub ttl: Duration,
    /// Whether reading a cached payload refreshes its eviction timestamp.
    pub touch_on_access: bool,
    /// Whether fetches should keep the response body as an in-memory
    /// handle. Images leave this off and lean on the HTTP-layer cache.
    pub retain_payload: bool,
    /// Viewport lead margin: loading starts when an element comes within
    /// this many pixels of the visible area.
    pub lead_margin_px: f64,
    /// Interval for the periodic eviction pass.
    pub maintenance_interval: Duration,
}

impl MediaCacheConfig {
    /// Profile for feed images: wide concurrency, count-bounded, no
    /// payload retention. Re-access is already cheap at the HTTP layer,
    /// so reads do not bump the eviction timestamp.
    pub fn images() -> Self {
        Self {
            max_concurrent: 6,
            max_entries: Some(100),
            max_bytes: None,
            ttl: Duration::from_secs(30 * 60),
            touch_on_access: false,
            retain_payload: false,
            lead_margin_px: 200.0,
            maintenance_interval: Duration::from_secs(5 * 60),
        }
    }

    /// Profile for feed videos: narrow concurrency because of bandwidth
    /// and memory cost, byte-bounded, payload kept as a releasable
    /// handle. Reads bump the timestamp so a looping video survives trim.
    pub fn videos() -> Self {
        Self {
            max_concurrent: 2,
            max_entries: None,
            max_bytes: Some(200 * 1024 * 1024),
            ttl: Duration::from_secs(10 * 60),
            touch_on_access: true,
            retain_payload: true,
            lead_margin_px: 200.0,
            maintenance_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl Default for MediaCacheConfig {
    fn default() -> Self {
        Self::images()
    }
}

/// Limits for the posts-list session cache.
#[derive(Debug, Clone)]
pub struct PostsCacheConfig {
    /// Age up to which a cached page is served as-is.
    pub fresh_ttl: Duration,
    /// Age up to which a cached page is still served, flagged for a
    /// background refetch. Past this the entry is dropped.
    pub stale_ttl: Duration,
    /// Key the serialized snapshot is stored under. The `_v2` suffix is
    /// the schema version: bumping it orphans old snapshots instead of
    /// migrating them.
    pub snapshot_key: String,
}

impl Default for PostsCacheConfig {
    fn default() -> Self {
        Self {
            fresh_ttl: Duration::from_secs(2 * 60),
            stale_ttl: Duration::from_secs(30 * 60),
            snapshot_key: "feedcache_posts_v2".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_profile_is_byte_bounded() {
        let config = MediaCacheConfig::videos();
        assert!(config.max_bytes.is_some());
        assert!(config.max_entries.is_none());
        assert!(config.retain_payload);
        assert!(config.max_concurrent < MediaCacheConfig::images().max_concurrent);
    }

    #[test]
    fn image_profile_is_count_bounded() {
        let config = MediaCacheConfig::images();
        assert!(config.max_entries.is_some());
        assert!(config.max_bytes.is_none());
        assert!(!config.touch_on_access);
    }
}
