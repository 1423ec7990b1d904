//! Shared fixtures for the offline layer integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use http::{HeaderMap, HeaderValue, StatusCode};
use nimbus_sw::{
    CacheError, CacheStorage, CachedResponse, FetchError, Fetcher, MemoryCacheStorage,
    NotificationCenter, OfflineWorker, Request, RequestKey, RequestMode, Response, ResponseType,
    WindowRegistry, WorkerConfig,
};
use url::Url;

pub const ORIGIN: &str = "http://127.0.0.1:5000/";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("nimbus_sw=debug")
        .with_test_writer()
        .try_init();
}

pub fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

/// In-process network. Serves a body derived from the path for every URL
/// unless told otherwise, and records what was requested.
pub struct ScriptedFetcher {
    origin: Url,
    statuses: Mutex<HashMap<String, StatusCode>>,
    flaky: Mutex<HashMap<String, usize>>,
    offline: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Url::parse(ORIGIN).unwrap(),
            statuses: Mutex::new(HashMap::new()),
            flaky: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn body_for(url: &Url) -> Bytes {
        Bytes::from(format!("content of {}", url))
    }

    pub fn respond_with(&self, url: &Url, status: StatusCode) {
        self.statuses
            .lock()
            .unwrap()
            .insert(url.to_string(), status);
    }

    /// The next `times` requests for `url` fail at the network level.
    pub fn fail_first(&self, url: &Url, times: usize) {
        self.flaky.lock().unwrap().insert(url.to_string(), times);
    }

    pub fn calls_for(&self, url: &Url) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == url.as_str())
            .count()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        self.calls.lock().unwrap().push(request.url.to_string());
        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::Network("network unreachable".into()));
        }
        if let Some(left) = self.flaky.lock().unwrap().get_mut(request.url.as_str()) {
            if *left > 0 {
                *left -= 1;
                return Err(FetchError::Network("connection reset".into()));
            }
        }

        let status = self
            .statuses
            .lock()
            .unwrap()
            .get(request.url.as_str())
            .copied()
            .unwrap_or(StatusCode::OK);

        let response_type = if request.url.origin() == self.origin.origin() {
            ResponseType::Basic
        } else if request.mode == RequestMode::NoCors {
            ResponseType::Opaque
        } else {
            ResponseType::Cors
        };

        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        Ok(Response {
            status,
            headers,
            body: Self::body_for(&request.url),
            url: request.url.clone(),
            response_type,
            redirected: false,
            from_cache: false,
        })
    }
}

/// Memory store with switchable failures.
#[derive(Default)]
pub struct FaultyStorage {
    inner: MemoryCacheStorage,
    undeletable: Mutex<HashSet<String>>,
    fail_puts: AtomicBool,
}

impl FaultyStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refuse_delete(&self, bucket: &str) {
        self.undeletable.lock().unwrap().insert(bucket.to_string());
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self, bucket: &str) -> Option<usize> {
        self.inner.len(bucket).await
    }
}

#[async_trait]
impl CacheStorage for FaultyStorage {
    async fn open(&self, name: &str) -> Result<bool, CacheError> {
        self.inner.open(name).await
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        self.inner.has(name).await
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        self.inner.keys().await
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        if self.undeletable.lock().unwrap().contains(name) {
            return Err(CacheError::Storage(format!("{} is locked", name)));
        }
        self.inner.delete(name).await
    }

    async fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>, CacheError> {
        self.inner.get(bucket, key).await
    }

    async fn put(&self, bucket: &str, key: RequestKey, response: CachedResponse) -> Result<(), CacheError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(CacheError::Storage("disk full".into()));
        }
        self.inner.put(bucket, key, response).await
    }

    async fn put_all(
        &self,
        bucket: &str,
        entries: Vec<(RequestKey, CachedResponse)>,
    ) -> Result<(), CacheError> {
        self.inner.put_all(bucket, entries).await
    }

    async fn entry_keys(&self, bucket: &str) -> Result<Vec<RequestKey>, CacheError> {
        self.inner.entry_keys(bucket).await
    }
}

/// Everything a test needs to drive one worker.
pub struct Harness {
    pub worker: Arc<OfflineWorker>,
    pub network: Arc<ScriptedFetcher>,
    pub store: Arc<dyn CacheStorage>,
    pub windows: Arc<WindowRegistry>,
    pub notifications: Arc<NotificationCenter>,
}

impl Harness {
    pub fn new(config: WorkerConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryCacheStorage::new()))
    }

    pub fn with_store(config: WorkerConfig, store: Arc<dyn CacheStorage>) -> Self {
        init_tracing();
        let network = ScriptedFetcher::new();
        let windows = Arc::new(WindowRegistry::new());
        let notifications = Arc::new(NotificationCenter::new());
        let worker = OfflineWorker::builder(config, network.clone())
            .caches(store.clone())
            .clients(windows.clone())
            .notifications(notifications.clone())
            .build();
        Self {
            worker: Arc::new(worker),
            network,
            store,
            windows,
            notifications,
        }
    }

    /// Install and activate.
    pub async fn start(&self) {
        self.worker.install().await.unwrap();
        self.worker.activate().await.unwrap();
    }
}
