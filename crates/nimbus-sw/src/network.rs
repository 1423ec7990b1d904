//! The network side of the router.

use async_trait::async_trait;
use http::HeaderMap;
use nimbus_net::{Client, HttpRequest};
use tracing::debug;
use url::Url;

use crate::error::FetchError;
use crate::request::{Request, RequestMode, Response, ResponseType};

/// Performs real network requests on behalf of the worker.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// `Err` only when no response was obtained at all. HTTP error statuses
    /// are `Ok` responses.
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// [`Fetcher`] over the Nimbus HTTP client.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    origin: Url,
}

impl HttpFetcher {
    /// `origin` is the app origin; responses from it are `basic`.
    pub fn new(client: Client, origin: Url) -> Self {
        Self { client, origin }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        if request.mode == RequestMode::SameOrigin && request.url.origin() != self.origin.origin() {
            return Err(FetchError::InvalidRequest(format!(
                "cross-origin request in same-origin mode: {}",
                request.url
            )));
        }

        let response = self
            .client
            .send(HttpRequest {
                method: request.method.clone(),
                url: request.url.clone(),
                headers: request.headers.clone(),
                body: request.body.clone(),
            })
            .await?;

        let classified = classify(&self.origin, request.mode, response);
        debug!(
            url = %request.url,
            status = %classified.status,
            response_type = classified.response_type.as_str(),
            "Network response"
        );
        Ok(classified)
    }
}

/// Label a transport response the way the page would see it.
pub fn classify(origin: &Url, mode: RequestMode, response: nimbus_net::Response) -> Response {
    let same_origin = response.url.origin() == origin.origin();

    // Keyed on where the response came from after redirects, so a
    // navigation that lands on another origin is never `basic`.
    let response_type = match mode {
        _ if same_origin => ResponseType::Basic,
        RequestMode::NoCors => ResponseType::Opaque,
        _ => ResponseType::Cors,
    };

    if response_type == ResponseType::Opaque {
        return Response {
            status: response.status,
            headers: HeaderMap::new(),
            body: bytes::Bytes::new(),
            url: response.url,
            response_type,
            redirected: response.redirected,
            from_cache: false,
        };
    }

    Response {
        status: response.status,
        headers: response.headers,
        body: response.body,
        url: response.url,
        response_type,
        redirected: response.redirected,
        from_cache: false,
    }
}
