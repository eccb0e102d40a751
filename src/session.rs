//! Session-scoped posts-list cache with stale-while-revalidate semantics.
//!
//! Makes the first paint after a reload instant: the last page of posts
//! per query key is kept in memory and mirrored to a per-tab durable
//! store as one JSON snapshot. Entries age on wall-clock time — a page
//! that sat fresh in a backgrounded tab is reclassified the moment the
//! tab regains visibility.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::PostsCacheConfig;

/// A feed post as delivered by the posts-fetching collaborator. Media
/// URLs feed the media caches; everything else is opaque to this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub title: String,
    pub category: String,
    pub images: Vec<String>,
    pub videos: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// One page of posts plus the pagination state to request the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostPage {
    pub posts: Vec<Post>,
    pub cursor: Option<String>,
    pub has_more: bool,
}

/// Result of a cache read. `needs_refresh` tells the caller to kick off
/// a background refetch while rendering the returned posts.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedPosts {
    pub posts: Vec<Post>,
    pub cursor: Option<String>,
    pub needs_refresh: bool,
}

/// Durable per-tab storage for the serialized snapshot. Failures here
/// never propagate: the in-memory cache keeps working without
/// persistence.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>>;
    async fn save(&self, key: &str, payload: &str) -> Result<()>;
}

/// In-memory store, the default for tests and non-persistent sessions.
#[derive(Default)]
pub struct MemorySnapshotStore {
    slots: Mutex<HashMap<String, String>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeds a slot, for exercising rehydration paths.
    pub async fn seed(&self, key: &str, payload: &str) {
        self.slots
            .lock()
            .await
            .insert(key.to_string(), payload.to_string());
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        Ok(self.slots.lock().await.get(key).cloned())
    }

    async fn save(&self, key: &str, payload: &str) -> Result<()> {
        self.slots
            .lock()
            .await
            .insert(key.to_string(), payload.to_string());
        Ok(())
    }
}

/// File-backed store, one file per snapshot key.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(payload) => Ok(Some(payload)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &str, payload: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.path_for(key), payload).await?;
        Ok(())
    }
}

/// Serialized form of one resident entry. Field names are the wire
/// format; renaming any of them means bumping the snapshot key suffix.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotEntry {
    posts: Vec<Post>,
    #[serde(rename = "lastDoc")]
    last_doc: Option<String>,
    timestamp: DateTime<Utc>,
    stale: bool,
}

/// Per-query-key posts cache. One instance per tab.
pub struct PostsCache<S: SnapshotStore> {
    config: PostsCacheConfig,
    store: S,
    entries: Mutex<HashMap<String, SnapshotEntry>>,
}

impl<S: SnapshotStore> PostsCache<S> {
    pub fn new(config: PostsCacheConfig, store: S) -> Self {
        Self {
            config,
            store,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Stores a page of posts for `key` and mirrors all non-stale
    /// entries to the durable store (last write wins, snapshots are
    /// replaced wholesale, never merged).
    pub async fn set(&self, key: &str, posts: Vec<Post>, cursor: Option<String>) {
        self.set_at(key, posts, cursor, Utc::now()).await;
    }

    pub async fn set_at(
        &self,
        key: &str,
        posts: Vec<Post>,
        cursor: Option<String>,
        now: DateTime<Utc>,
    ) {
        {
            let mut entries = self.entries.lock().await;
            entries.insert(
                key.to_string(),
                SnapshotEntry {
                    posts,
                    last_doc: cursor,
                    timestamp: now,
                    stale: false,
                },
            );
        }
        self.persist().await;
    }

    /// Stores a page as returned by the posts-fetching collaborator.
    pub async fn set_page(&self, key: &str, page: PostPage) {
        self.set(key, page.posts, page.cursor).await;
    }

    /// Three-way read: miss past the stale TTL, stale-while-revalidate
    /// between the fresh and stale TTLs, plain hit inside the fresh TTL.
    pub async fn get(&self, key: &str) -> Option<CachedPosts> {
        self.get_at(key, Utc::now()).await
    }

    pub async fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<CachedPosts> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(key)?;
        let age = now.signed_duration_since(entry.timestamp);
        if age > self.stale_ttl() {
            debug!(key, "cached posts past stale TTL, dropping");
            entries.remove(key);
            return None;
        }
        if age > self.fresh_ttl() {
            entry.stale = true;
        }
        Some(CachedPosts {
            posts: entry.posts.clone(),
            cursor: entry.last_doc.clone(),
            needs_refresh: entry.stale,
        })
    }

    /// Loads the durable snapshot on page load. Entries already past the
    /// stale TTL are skipped; entries past the fresh TTL come back
    /// pre-marked stale so the first read triggers revalidation. A
    /// corrupt snapshot is discarded wholesale.
    pub async fn rehydrate(&self) {
        self.rehydrate_at(Utc::now()).await;
    }

    pub async fn rehydrate_at(&self, now: DateTime<Utc>) {
        let payload = match self.store.load(&self.config.snapshot_key).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "snapshot load failed, starting empty");
                return;
            }
        };
        let parsed: HashMap<String, SnapshotEntry> = match serde_json::from_str(&payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "corrupt posts snapshot discarded");
                return;
            }
        };
        let mut entries = self.entries.lock().await;
        for (key, mut entry) in parsed {
            let age = now.signed_duration_since(entry.timestamp);
            if age > self.stale_ttl() {
                continue;
            }
            if age > self.fresh_ttl() {
                entry.stale = true;
            }
            entries.insert(key, entry);
        }
        debug!(entries = entries.len(), "rehydrated posts cache");
    }

    /// Visibility hook: persist on hide; on regaining visibility re-age
    /// every entry against the wall clock, since no timer ran while the
    /// tab was backgrounded.
    pub async fn on_visibility_change(&self, visible: bool) {
        self.on_visibility_change_at(visible, Utc::now()).await;
    }

    pub async fn on_visibility_change_at(&self, visible: bool, now: DateTime<Utc>) {
        if !visible {
            self.persist().await;
            return;
        }
        let mut entries = self.entries.lock().await;
        entries.retain(|key, entry| {
            let age = now.signed_duration_since(entry.timestamp);
            if age > self.stale_ttl() {
                debug!(key, "dropping expired posts entry on refocus");
                return false;
            }
            if age > self.fresh_ttl() {
                entry.stale = true;
            }
            true
        });
    }

    /// Drops one query key, e.g. after a mutation invalidates it.
    pub async fn invalidate(&self, key: &str) {
        self.entries.lock().await.remove(key);
        self.persist().await;
    }

    /// Drops everything, including the durable snapshot.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
        self.persist().await;
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    async fn persist(&self) {
        let payload = {
            let entries = self.entries.lock().await;
            let fresh: HashMap<&String, &SnapshotEntry> =
                entries.iter().filter(|(_, e)| !e.stale).collect();
            match serde_json::to_string(&fresh) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "failed to serialize posts snapshot");
                    return;
                }
            }
        };
        if let Err(e) = self.store.save(&self.config.snapshot_key, &payload).await {
            // Quota exceeded or storage disabled: keep serving from
            // memory, just without cross-reload persistence.
            warn!(error = %e, "posts snapshot write failed, continuing without persistence");
        }
    }

    fn fresh_ttl(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.config.fresh_ttl).unwrap_or(ChronoDuration::MAX)
    }

    fn stale_ttl(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.config.stale_ttl).unwrap_or(ChronoDuration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::time::Duration;

    fn post(id: &str) -> Post {
        Post {
            id: id.to_string(),
            title: format!("post {id}"),
            category: "electronics".to_string(),
            images: vec![format!("https://cdn.example/{id}.jpg")],
            videos: vec![],
            created_at: Utc::now(),
        }
    }

    fn config() -> PostsCacheConfig {
        PostsCacheConfig {
            fresh_ttl: Duration::from_secs(60),
            stale_ttl: Duration::from_secs(600),
            snapshot_key: "feedcache_posts_v2".to_string(),
        }
    }

    fn cache() -> PostsCache<MemorySnapshotStore> {
        PostsCache::new(config(), MemorySnapshotStore::new())
    }

    #[tokio::test]
    async fn fresh_hit_does_not_request_refresh() {
        let cache = cache();
        let t0 = Utc::now();
        cache
            .set_at("all", vec![post("1")], Some("cursor-1".into()), t0)
            .await;

        let hit = cache
            .get_at("all", t0 + ChronoDuration::seconds(30))
            .await
            .unwrap();
        assert!(!hit.needs_refresh);
        assert_eq!(hit.posts.len(), 1);
        assert_eq!(hit.cursor.as_deref(), Some("cursor-1"));
    }

    #[tokio::test]
    async fn stale_entry_is_served_with_refresh_flag() {
        let cache = cache();
        let t0 = Utc::now();
        cache.set_at("all", vec![post("1")], None, t0).await;

        let hit = cache
            .get_at("all", t0 + ChronoDuration::seconds(120))
            .await
            .unwrap();
        assert!(hit.needs_refresh);
        assert_eq!(hit.posts[0].id, "1");
    }

    #[tokio::test]
    async fn set_page_stores_posts_and_cursor() {
        let cache = cache();
        cache
            .set_page(
                "all",
                PostPage {
                    posts: vec![post("1"), post("2")],
                    cursor: Some("next".into()),
                    has_more: true,
                },
            )
            .await;
        let hit = cache.get("all").await.unwrap();
        assert_eq!(hit.posts.len(), 2);
        assert_eq!(hit.cursor.as_deref(), Some("next"));
    }

    #[tokio::test]
    async fn entry_past_stale_ttl_is_a_miss() {
        let cache = cache();
        let t0 = Utc::now();
        cache.set_at("all", vec![post("1")], None, t0).await;

        assert!(cache
            .get_at("all", t0 + ChronoDuration::seconds(601))
            .await
            .is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn rehydrate_skips_expired_and_premarks_stale() {
        let store = MemorySnapshotStore::new();
        let t0 = Utc::now();
        let snapshot = serde_json::json!({
            "expired": {
                "posts": [post("1")],
                "lastDoc": null,
                "timestamp": t0 - ChronoDuration::seconds(700),
                "stale": false
            },
            "aging": {
                "posts": [post("2")],
                "lastDoc": "c2",
                "timestamp": t0 - ChronoDuration::seconds(120),
                "stale": false
            },
            "fresh": {
                "posts": [post("3")],
                "lastDoc": null,
                "timestamp": t0 - ChronoDuration::seconds(10),
                "stale": false
            }
        });
        store
            .seed("feedcache_posts_v2", &snapshot.to_string())
            .await;

        let cache = PostsCache::new(config(), store);
        cache.rehydrate_at(t0).await;

        assert_eq!(cache.len().await, 2);
        assert!(cache.get_at("expired", t0).await.is_none());
        assert!(cache.get_at("aging", t0).await.unwrap().needs_refresh);
        assert!(!cache.get_at("fresh", t0).await.unwrap().needs_refresh);
    }

    #[tokio::test]
    async fn corrupt_snapshot_starts_empty() {
        let store = MemorySnapshotStore::new();
        store.seed("feedcache_posts_v2", "{not json]").await;

        let cache = PostsCache::new(config(), store);
        cache.rehydrate().await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn refocus_reclassifies_by_wall_clock() {
        let cache = cache();
        let t0 = Utc::now();
        cache.set_at("all", vec![post("1")], None, t0).await;
        cache.set_at("cars", vec![post("2")], None, t0).await;

        // Tab was hidden for 2 minutes: both entries exceed the fresh TTL.
        cache
            .on_visibility_change_at(true, t0 + ChronoDuration::seconds(120))
            .await;
        let hit = cache
            .get_at("all", t0 + ChronoDuration::seconds(121))
            .await
            .unwrap();
        assert!(hit.needs_refresh);
    }

    #[tokio::test]
    async fn refocus_drops_entries_past_stale_ttl() {
        let cache = cache();
        let t0 = Utc::now();
        cache.set_at("all", vec![post("1")], None, t0).await;
        cache
            .on_visibility_change_at(true, t0 + ChronoDuration::seconds(700))
            .await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn snapshot_is_replaced_not_merged() {
        let store = MemorySnapshotStore::new();
        let cache = PostsCache::new(config(), store);
        cache.set("all", vec![post("1")], None).await;
        cache.set("cars", vec![post("2")], None).await;
        cache.invalidate("all").await;

        let payload = cache
            .store
            .load("feedcache_posts_v2")
            .await
            .unwrap()
            .unwrap();
        let parsed: HashMap<String, SnapshotEntry> = serde_json::from_str(&payload).unwrap();
        assert!(parsed.contains_key("cars"));
        assert!(!parsed.contains_key("all"));
    }

    struct QuotaExceededStore;

    #[async_trait]
    impl SnapshotStore for QuotaExceededStore {
        async fn load(&self, _key: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn save(&self, _key: &str, _payload: &str) -> Result<()> {
            Err(anyhow!("quota exceeded"))
        }
    }

    #[tokio::test]
    async fn store_failure_is_swallowed() {
        let cache = PostsCache::new(config(), QuotaExceededStore);
        let t0 = Utc::now();
        cache.set_at("all", vec![post("1")], None, t0).await;
        // Memory path keeps working without persistence.
        assert!(cache.get_at("all", t0).await.is_some());
    }

    #[tokio::test]
    async fn file_store_round_trips_and_misses_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().to_path_buf());
        assert!(store.load("feedcache_posts_v2").await.unwrap().is_none());
        store.save("feedcache_posts_v2", "{}").await.unwrap();
        assert_eq!(
            store.load("feedcache_posts_v2").await.unwrap().as_deref(),
            Some("{}")
        );
    }
}
