//! Request routing: bypass, cache-first, network with populate, offline
//! fallback.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::event::ExtendableEvent;
use crate::request::{Request, RequestKey, Response};
use crate::storage::{match_request, CacheStorage};
use crate::worker::OfflineWorker;

/// How the worker answered an intercepted request.
#[derive(Debug, Clone)]
pub enum FetchDecision {
    /// Not intercepted. The host performs the request itself, uncached.
    Passthrough,
    /// Answer produced by the worker.
    Respond(Response),
}

impl FetchDecision {
    pub fn response(&self) -> Option<&Response> {
        match self {
            FetchDecision::Respond(r) => Some(r),
            FetchDecision::Passthrough => None,
        }
    }

    pub fn into_response(self) -> Option<Response> {
        match self {
            FetchDecision::Respond(r) => Some(r),
            FetchDecision::Passthrough => None,
        }
    }
}

impl OfflineWorker {
    /// Route one request.
    ///
    /// Writes to the cache are attached to `event`; the response is returned
    /// without waiting for them.
    pub async fn handle_fetch(
        &self,
        request: &Request,
        event: &mut ExtendableEvent,
    ) -> Result<FetchDecision, FetchError> {
        if self.config.is_api_request(&request.url) {
            debug!(url = %request.url, "API request bypassed");
            return Ok(FetchDecision::Passthrough);
        }

        let bucket = self.config.version.as_str();
        match match_request(self.caches.as_ref(), bucket, request).await {
            Ok(Some(hit)) => {
                debug!(url = %request.url, "Cache hit");
                return Ok(FetchDecision::Respond(hit));
            }
            Ok(None) => {}
            Err(e) => warn!(url = %request.url, error = %e, "Cache lookup failed, treating as miss"),
        }

        match self.network.fetch(request).await {
            Ok(response) => Ok(FetchDecision::Respond(self.populate(request, response, event))),
            Err(e) if request.is_navigation() => self.offline_fallback(request, e).await,
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failure propagated");
                Err(e)
            }
        }
    }

    /// Store a copy of a cacheable response in the background and hand back
    /// the original.
    fn populate(&self, request: &Request, response: Response, event: &mut ExtendableEvent) -> Response {
        if !response.is_cacheable() {
            debug!(
                url = %request.url,
                status = %response.status,
                response_type = response.response_type.as_str(),
                "Response not cached"
            );
            return response;
        }
        let Ok(key) = RequestKey::for_request(request) else {
            return response;
        };

        let (returned, stored) = response.duplicate_for_store(request);
        let caches: Arc<dyn CacheStorage> = self.caches.clone();
        let bucket = self.config.version.as_str().to_string();

        event.wait_until(async move {
            match caches.put(&bucket, key.clone(), stored).await {
                Ok(()) => debug!(bucket = %bucket, key = %key, "Populated cache"),
                Err(e) => warn!(bucket = %bucket, key = %key, error = %e, "Cache write failed"),
            }
        });

        returned
    }

    async fn offline_fallback(
        &self,
        request: &Request,
        cause: FetchError,
    ) -> Result<FetchDecision, FetchError> {
        let offline_url = self
            .config
            .offline_document_url()
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;
        let lookup = Request::get(offline_url);

        match match_request(self.caches.as_ref(), self.config.version.as_str(), &lookup).await {
            Ok(Some(document)) => {
                info!(url = %request.url, error = %cause, "Offline, serving offline document");
                Ok(FetchDecision::Respond(document))
            }
            Ok(None) => {
                warn!(url = %request.url, "Offline document not cached");
                Err(cause)
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Offline document lookup failed");
                Err(cause)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{HeaderMap, Method, StatusCode};
    use url::Url;

    use crate::config::WorkerConfig;
    use crate::network::Fetcher;
    use crate::request::ResponseType;
    use crate::storage::MemoryCacheStorage;

    struct Counting {
        calls: AtomicUsize,
        online: bool,
    }

    #[async_trait]
    impl Fetcher for Counting {
        async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.online {
                return Err(FetchError::Network("offline".into()));
            }
            Ok(Response {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Bytes::from_static(b"fresh"),
                url: request.url.clone(),
                response_type: ResponseType::Basic,
                redirected: false,
                from_cache: false,
            })
        }
    }

    fn setup(online: bool) -> (OfflineWorker, Arc<Counting>, Arc<MemoryCacheStorage>) {
        let network = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            online,
        });
        let store = Arc::new(MemoryCacheStorage::new());
        let worker = OfflineWorker::builder(WorkerConfig::default(), network.clone())
            .caches(store.clone())
            .build();
        (worker, network, store)
    }

    fn url(path: &str) -> Url {
        Url::parse("http://127.0.0.1:5000/").unwrap().join(path).unwrap()
    }

    #[tokio::test]
    async fn test_api_bypass() {
        let (worker, network, _) = setup(true);
        let mut event = ExtendableEvent::new();
        let decision = worker
            .handle_fetch(&Request::get(url("/api/weather?city=Bangkok")), &mut event)
            .await
            .unwrap();
        assert!(matches!(decision, FetchDecision::Passthrough));
        assert_eq!(network.calls.load(Ordering::SeqCst), 0);
        assert_eq!(event.pending(), 0);
    }

    #[tokio::test]
    async fn test_miss_populates_then_hits() {
        let (worker, network, store) = setup(true);
        store.open("weather-app-v1.0.0").await.unwrap();
        let request = Request::get(url("/static/js/main.js"));

        let mut event = ExtendableEvent::new();
        let first = worker.handle_fetch(&request, &mut event).await.unwrap();
        assert!(!first.response().unwrap().from_cache);
        event.settled().await;

        let mut event = ExtendableEvent::new();
        let second = worker.handle_fetch(&request, &mut event).await.unwrap();
        let second = second.into_response().unwrap();
        assert!(second.from_cache);
        assert_eq!(&second.body[..], b"fresh");
        assert_eq!(network.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_post_is_never_cached() {
        let (worker, _, store) = setup(true);
        store.open("weather-app-v1.0.0").await.unwrap();
        let request = Request::get(url("/feedback")).with_method(Method::POST);

        let mut event = ExtendableEvent::new();
        worker.handle_fetch(&request, &mut event).await.unwrap();
        assert_eq!(event.pending(), 0);
        event.settled().await;
        assert_eq!(store.len("weather-app-v1.0.0").await, Some(0));
    }

    #[tokio::test]
    async fn test_offline_subresource_propagates() {
        let (worker, _, _) = setup(false);
        let mut event = ExtendableEvent::new();
        let err = worker
            .handle_fetch(&Request::get(url("/static/css/style.css")), &mut event)
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::Network("offline".into()));
    }

    #[tokio::test]
    async fn test_offline_navigation_without_document_propagates() {
        let (worker, _, _) = setup(false);
        let mut event = ExtendableEvent::new();
        assert!(worker
            .handle_fetch(&Request::navigate(url("/forecast")), &mut event)
            .await
            .is_err());
    }

    /// Every navigation ends up on a single sign-on page on another origin.
    struct SsoRedirect;

    #[async_trait]
    impl Fetcher for SsoRedirect {
        async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
            let landed = nimbus_net::Response {
                status: StatusCode::OK,
                version: http::Version::HTTP_11,
                headers: HeaderMap::new(),
                body: Bytes::from_static(b"<form>sign in</form>"),
                url: Url::parse("https://login.example.com/sso").unwrap(),
                redirected: true,
            };
            Ok(crate::network::classify(&url("/"), request.mode, landed))
        }
    }

    #[tokio::test]
    async fn test_cross_origin_navigation_is_not_stored() {
        let store = Arc::new(MemoryCacheStorage::new());
        let worker = OfflineWorker::builder(WorkerConfig::default(), Arc::new(SsoRedirect))
            .caches(store.clone())
            .build();
        store.open("weather-app-v1.0.0").await.unwrap();

        let mut event = ExtendableEvent::new();
        let decision = worker
            .handle_fetch(&Request::navigate(url("/forecast")), &mut event)
            .await
            .unwrap();
        let response = decision.into_response().unwrap();
        assert_eq!(response.url.as_str(), "https://login.example.com/sso");
        event.settled().await;

        assert_eq!(store.len("weather-app-v1.0.0").await, Some(0));
    }
}
