//! Cache store: named buckets of request → response entries.
//!
//! ```text
//! CacheStorage
//!     ├── "weather-app-v1.0.0"   (bucket)
//!     │       └── GET http://.../static/css/style.css → CachedResponse
//!     └── "weather-app-v2.0.0"
//! ```
//!
//! Writes are whole-entry overwrites keyed by [`RequestKey`]; concurrent
//! writers for one key resolve as last-writer-wins.

use async_trait::async_trait;

use crate::error::CacheError;
use crate::request::{CachedResponse, Request, RequestKey, Response};

mod memory;
mod sqlite;

pub use memory::MemoryCacheStorage;
pub use sqlite::SqliteCacheStorage;

/// Host-provided, concurrency-safe cache store.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a bucket, creating it if absent. Returns `true` when created.
    async fn open(&self, name: &str) -> Result<bool, CacheError>;

    async fn has(&self, name: &str) -> Result<bool, CacheError>;

    /// Bucket names in creation order.
    async fn keys(&self) -> Result<Vec<String>, CacheError>;

    /// Delete a bucket and its entries. Returns `false` if it did not exist.
    async fn delete(&self, name: &str) -> Result<bool, CacheError>;

    /// Entry for `key`. A missing bucket is a miss, not an error.
    async fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>, CacheError>;

    /// Store one entry. Fails with [`CacheError::BucketMissing`] rather than
    /// creating the bucket.
    async fn put(&self, bucket: &str, key: RequestKey, response: CachedResponse) -> Result<(), CacheError>;

    /// Store all entries or none of them.
    async fn put_all(
        &self,
        bucket: &str,
        entries: Vec<(RequestKey, CachedResponse)>,
    ) -> Result<(), CacheError>;

    /// Keys stored in a bucket.
    async fn entry_keys(&self, bucket: &str) -> Result<Vec<RequestKey>, CacheError>;
}

/// Look a request up in one bucket, honouring method and `Vary`.
///
/// Non-GET requests never match.
pub async fn match_request(
    storage: &dyn CacheStorage,
    bucket: &str,
    request: &Request,
) -> Result<Option<Response>, CacheError> {
    let Ok(key) = RequestKey::for_request(request) else {
        return Ok(None);
    };

    match storage.get(bucket, &key).await? {
        Some(entry) if entry.matches_vary(&request.headers) => entry.to_response().map(Some),
        _ => Ok(None),
    }
}
