//! # Nimbus Net
//!
//! Minimal async HTTP/1.1 client backing the network side of the offline
//! layer. One connection per request (`Connection: close`), TLS through
//! native-tls, redirects followed by the client itself so callers can see
//! the final URL and whether a redirect happened.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode, Version};
use native_tls::TlsConnector as NativeTlsConnector;
use nimbus_common::Retryable;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_native_tls::TlsConnector;
use tracing::{debug, trace};
use url::Url;

mod wire;

/// HTTP client errors.
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Request timeout")]
    Timeout,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Too many redirects")]
    TooManyRedirects,

    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),
}

impl Retryable for HttpError {
    fn is_retryable(&self) -> bool {
        match self {
            HttpError::ConnectionFailed(_) | HttpError::Timeout => true,
            HttpError::IoError(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    /// A bodiless GET.
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

/// HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    /// HTTP status code.
    pub status: StatusCode,
    /// HTTP version.
    pub version: Version,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
    /// Final URL (after redirects).
    pub url: Url,
    /// Whether at least one redirect was followed.
    pub redirected: bool,
}

impl Response {
    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Get content-type from headers.
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Check if response is success (2xx).
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Get body as text.
    pub fn text(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body.to_vec())
    }
}

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// User agent string.
    pub user_agent: String,
    /// Per-request transport timeout. `None` waits as long as the peer does.
    pub timeout: Option<Duration>,
    /// Maximum number of redirects to follow.
    pub max_redirects: usize,
    /// Whether to follow redirects.
    pub follow_redirects: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("Nimbus/{}", env!("CARGO_PKG_VERSION")),
            timeout: None,
            max_redirects: 10,
            follow_redirects: true,
        }
    }
}

/// HTTP client.
#[derive(Clone)]
pub struct Client {
    config: ClientConfig,
    tls_connector: TlsConnector,
}

impl Client {
    /// Create a new HTTP client with default configuration.
    pub fn new() -> Result<Self, HttpError> {
        Self::with_config(ClientConfig::default())
    }

    /// Create a new HTTP client with custom configuration.
    pub fn with_config(config: ClientConfig) -> Result<Self, HttpError> {
        let native_connector =
            NativeTlsConnector::new().map_err(|e| HttpError::TlsError(e.to_string()))?;

        Ok(Self {
            config,
            tls_connector: TlsConnector::from(native_connector),
        })
    }

    /// Create a client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Perform a GET request.
    pub async fn get(&self, url: &str) -> Result<Response, HttpError> {
        let url = Url::parse(url).map_err(|e| HttpError::InvalidUrl(e.to_string()))?;
        self.send(HttpRequest::get(url)).await
    }

    /// Send a request, following redirects per the client configuration.
    pub async fn send(&self, request: HttpRequest) -> Result<Response, HttpError> {
        match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, self.send_following(request))
                .await
                .map_err(|_| HttpError::Timeout)?,
            None => self.send_following(request).await,
        }
    }

    async fn send_following(&self, mut request: HttpRequest) -> Result<Response, HttpError> {
        let mut redirects = 0;

        loop {
            let raw = self.send_once(&request).await?;

            let location = raw
                .headers
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);

            match location {
                Some(location) if self.config.follow_redirects && raw.status.is_redirection() => {
                    redirects += 1;
                    if redirects > self.config.max_redirects {
                        return Err(HttpError::TooManyRedirects);
                    }

                    let next = request
                        .url
                        .join(&location)
                        .map_err(|e| HttpError::InvalidUrl(e.to_string()))?;
                    debug!(from = %request.url, to = %next, status = %raw.status, "Following redirect");

                    request = redirect_request(request, raw.status, next);
                }
                _ => {
                    return Ok(Response {
                        status: raw.status,
                        version: raw.version,
                        headers: raw.headers,
                        body: raw.body,
                        url: request.url,
                        redirected: redirects > 0,
                    });
                }
            }
        }
    }

    /// One round trip, no redirect handling.
    async fn send_once(&self, request: &HttpRequest) -> Result<wire::RawResponse, HttpError> {
        let url = &request.url;
        let scheme = url.scheme();
        let host = url
            .host_str()
            .ok_or_else(|| HttpError::InvalidUrl("Missing host".to_string()))?;
        let port = url
            .port_or_known_default()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });

        debug!(method = %request.method, url = %url, "HTTP request");

        let mut headers = request.headers.clone();
        if let Some(auth) = basic_auth(url) {
            headers.entry(header::AUTHORIZATION).or_insert(auth);
        }

        let addr = format!("{}:{}", host, port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| HttpError::ConnectionFailed(e.to_string()))?;

        match scheme {
            "https" => {
                let tls_stream = self
                    .tls_connector
                    .connect(host, stream)
                    .await
                    .map_err(|e| HttpError::TlsError(e.to_string()))?;
                self.exchange(tls_stream, host, request, &headers).await
            }
            "http" => self.exchange(stream, host, request, &headers).await,
            _ => Err(HttpError::UnsupportedScheme(scheme.to_string())),
        }
    }

    async fn exchange<S>(
        &self,
        stream: S,
        host: &str,
        request: &HttpRequest,
        headers: &HeaderMap,
    ) -> Result<wire::RawResponse, HttpError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let head = wire::encode_head(
            &request.method,
            &request.url,
            host,
            &self.config.user_agent,
            headers,
            request.body.as_ref().map(Bytes::len),
        )?;

        let raw = wire::round_trip(stream, &head, request.body.as_ref(), &request.method).await?;
        trace!(status = %raw.status, body_len = raw.body.len(), "Response received");
        Ok(raw)
    }
}

/// Rewrite a request for the next hop of a redirect.
fn redirect_request(request: HttpRequest, status: StatusCode, next: Url) -> HttpRequest {
    let keep_method = matches!(
        status,
        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT
    );

    let mut headers = request.headers;
    // Credentials never follow a hop to another origin.
    if next.origin() != request.url.origin() {
        headers.remove(header::AUTHORIZATION);
        headers.remove(header::COOKIE);
        headers.remove(header::PROXY_AUTHORIZATION);
    }

    if keep_method {
        HttpRequest {
            method: request.method,
            url: next,
            headers,
            body: request.body,
        }
    } else {
        let method = if request.method == Method::HEAD {
            Method::HEAD
        } else {
            Method::GET
        };
        headers.remove(header::CONTENT_TYPE);
        HttpRequest {
            method,
            url: next,
            headers,
            body: None,
        }
    }
}

/// `Authorization: Basic ...` from `user:pass@host` URLs.
fn basic_auth(url: &Url) -> Option<HeaderValue> {
    if url.username().is_empty() {
        return None;
    }
    let credentials = format!("{}:{}", url.username(), url.password().unwrap_or(""));
    HeaderValue::from_str(&format!("Basic {}", BASE64.encode(credentials))).ok()
}

/// Client builder for configuring HTTP client.
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    /// Set user agent.
    pub fn user_agent(mut self, user_agent: &str) -> Self {
        self.config.user_agent = user_agent.to_string();
        self
    }

    /// Set a transport timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Set redirect policy.
    pub fn redirect(mut self, follow: bool, max: usize) -> Self {
        self.config.follow_redirects = follow;
        self.config.max_redirects = max;
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<Client, HttpError> {
        Client::with_config(self.config)
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
