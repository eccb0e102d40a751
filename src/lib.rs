//! Bounded, priority-aware media cache and fetch scheduler for feed UIs.
//!
//! A feed page renders posts whose images and videos live behind opaque
//! immutable URLs. This crate decides when those resources are fetched,
//! how many fetches overlap, how duplicate requests fan in to one
//! operation, and when cached entries are evicted:
//!
//! - [`MediaCache`] — the facade rendering components call: `is_loaded`,
//!   `preload`, `prioritize`, viewport `observe`/`unobserve`, `cleanup`,
//!   `clear`. One instance per resource class (images, videos).
//! - [`FetchScheduler`] — concurrency-bounded dispatch with a two-tier
//!   (High/Low, FIFO within tier) pending queue and per-URL fan-in.
//! - [`EvictionPolicy`] — TTL sweep plus LRU-by-write trim, with a
//!   pre-admission headroom pass for byte-bounded caches.
//! - [`ViewportTracker`] — lead-margin intersection tracking that
//!   promotes fetches as elements approach the viewport, and the
//!   unmuted-then-muted autoplay state machine.
//! - [`PostsCache`] — the sibling session cache for post lists, with
//!   stale-while-revalidate reads and a per-tab durable snapshot.
//!
//! All media state is memory-local and rebuildable from the origin; only
//! the posts-list snapshot persists across reloads.

pub mod config;
pub mod entry;
pub mod eviction;
pub mod fetcher;
pub mod media;
pub mod scheduler;
pub mod session;
pub mod viewport;

pub use config::{MediaCacheConfig, PostsCacheConfig};
pub use entry::EntryState;
pub use eviction::{EvictionPolicy, SizeBound};
pub use fetcher::{FetchError, FetchedResource, HttpFetcher, ResourceFetcher, ResourceHandle};
pub use media::MediaCache;
pub use scheduler::{FetchOutcome, FetchScheduler, Priority};
pub use session::{
    CachedPosts, FileSnapshotStore, MemorySnapshotStore, Post, PostPage, PostsCache, SnapshotStore,
};
pub use viewport::{IntersectionEvent, PlaybackAudio, Rect, ViewportTracker, Visibility};
