//! In-process cache store.

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::RwLock;

use super::CacheStorage;
use crate::error::CacheError;
use crate::request::{CachedResponse, RequestKey};

/// One named bucket.
#[derive(Debug)]
struct Bucket {
    entries: HashMap<RequestKey, CachedResponse>,
    /// Insertion order of keys, for stable `entry_keys`.
    order: Vec<RequestKey>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn put(&mut self, key: RequestKey, response: CachedResponse) {
        if self.entries.insert(key.clone(), response).is_none() {
            self.order.push(key);
        }
    }
}

#[derive(Debug, Default)]
struct Buckets {
    by_name: HashMap<String, Bucket>,
    order: Vec<String>,
}

/// Cache store held in memory. Lost on restart; used by tests and hosts
/// that persist nothing.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    inner: RwLock<Buckets>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in a bucket, `None` if it does not exist.
    pub async fn len(&self, bucket: &str) -> Option<usize> {
        self.inner
            .read()
            .await
            .by_name
            .get(bucket)
            .map(|b| b.entries.len())
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<bool, CacheError> {
        let mut inner = self.inner.write().await;
        if inner.by_name.contains_key(name) {
            return Ok(false);
        }
        inner.by_name.insert(name.to_string(), Bucket::new());
        inner.order.push(name.to_string());
        Ok(true)
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.inner.read().await.by_name.contains_key(name))
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.inner.read().await.order.clone())
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let mut inner = self.inner.write().await;
        if inner.by_name.remove(name).is_none() {
            return Ok(false);
        }
        inner.order.retain(|n| n != name);
        Ok(true)
    }

    async fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>, CacheError> {
        Ok(self
            .inner
            .read()
            .await
            .by_name
            .get(bucket)
            .and_then(|b| b.entries.get(key))
            .cloned())
    }

    async fn put(&self, bucket: &str, key: RequestKey, response: CachedResponse) -> Result<(), CacheError> {
        let mut inner = self.inner.write().await;
        let target = inner
            .by_name
            .get_mut(bucket)
            .ok_or_else(|| CacheError::BucketMissing(bucket.to_string()))?;
        target.put(key, response);
        Ok(())
    }

    async fn put_all(
        &self,
        bucket: &str,
        entries: Vec<(RequestKey, CachedResponse)>,
    ) -> Result<(), CacheError> {
        // Single write-lock section: readers see none or all of the batch.
        let mut inner = self.inner.write().await;
        let target = inner
            .by_name
            .get_mut(bucket)
            .ok_or_else(|| CacheError::BucketMissing(bucket.to_string()))?;
        for (key, response) in entries {
            target.put(key, response);
        }
        Ok(())
    }

    async fn entry_keys(&self, bucket: &str) -> Result<Vec<RequestKey>, CacheError> {
        self.inner
            .read()
            .await
            .by_name
            .get(bucket)
            .map(|b| b.order.clone())
            .ok_or_else(|| CacheError::BucketMissing(bucket.to_string()))
    }
}
