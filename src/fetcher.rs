//! Resource fetching boundary.
//!
//! The scheduler is generic over [`ResourceFetcher`] so tests can drive
//! completion order by hand and the application plugs in [`HttpFetcher`].

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

/// Opaque reference to a decoded payload kept in memory (the browser
/// analog is an object URL over a blob). Must be handed back to the
/// fetcher's `release` when the owning entry is evicted.
#[derive(Debug)]
pub struct ResourceHandle {
    bytes: Bytes,
}

impl ResourceHandle {
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Result of one successful fetch.
#[derive(Debug)]
pub struct FetchedResource {
    /// Retained payload, present only for byte-bounded resource classes.
    pub handle: Option<ResourceHandle>,
    /// Payload size, populated when the cache enforces a byte bound.
    pub size_bytes: Option<u64>,
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("upstream returned status {0}")]
    Status(u16),
    /// The transport abandoned the request before it settled. The
    /// scheduler never interrupts an in-flight fetch itself; this is for
    /// [`ResourceFetcher`] implementations whose underlying transport can
    /// abort (connection pool shutdown, client teardown). Treated like
    /// any other failure: the entry moves to errored and a later request
    /// starts fresh.
    #[error("request canceled")]
    Canceled,
}

/// Performs the actual resource I/O. One implementation per transport;
/// the scheduler guarantees at most one concurrent `fetch` per URL.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedResource, FetchError>;

    /// Called exactly once for every handle displaced or evicted from the
    /// cache. The default is to drop it; transports that allocate an
    /// external reference (object URLs) override this to revoke it.
    fn release(&self, handle: ResourceHandle) {
        drop(handle);
    }
}

#[async_trait]
impl<T: ResourceFetcher + ?Sized> ResourceFetcher for std::sync::Arc<T> {
    async fn fetch(&self, url: &str) -> Result<FetchedResource, FetchError> {
        (**self).fetch(url).await
    }

    fn release(&self, handle: ResourceHandle) {
        (**self).release(handle)
    }
}

/// Plain HTTP GET fetcher backed by a shared reqwest client.
pub struct HttpFetcher {
    client: reqwest::Client,
    retain_payload: bool,
}

impl HttpFetcher {
    pub fn new(retain_payload: bool) -> Self {
        Self {
            client: reqwest::Client::new(),
            retain_payload,
        }
    }

    pub fn with_client(client: reqwest::Client, retain_payload: bool) -> Self {
        Self {
            client,
            retain_payload,
        }
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedResource, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        if self.retain_payload {
            let body = response.bytes().await?;
            let size = body.len() as u64;
            debug!(url, size, "fetched and retained payload");
            Ok(FetchedResource {
                handle: Some(ResourceHandle::new(body)),
                size_bytes: Some(size),
            })
        } else {
            // Drain the body so the transport-level cache is warmed, but
            // keep nothing resident.
            let _ = response.bytes().await?;
            debug!(url, "fetched, payload left to the HTTP layer");
            Ok(FetchedResource {
                handle: None,
                size_bytes: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_exposes_payload() {
        let handle = ResourceHandle::new(Bytes::from_static(b"poster"));
        assert_eq!(handle.len(), 6);
        assert_eq!(handle.bytes(), Bytes::from_static(b"poster"));
    }
}
