//! Requests, responses and the normalized cache key.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::CacheError;

/// How the page issued a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    /// Top-level page load.
    Navigate,
    SameOrigin,
    NoCors,
    #[default]
    Cors,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub mode: RequestMode,
    pub body: Option<Bytes>,
}

impl Request {
    /// A subresource GET.
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            mode: RequestMode::Cors,
            body: None,
        }
    }

    /// A top-level navigation.
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// Where a response came from, from the page's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Same-origin.
    Basic,
    /// Cross-origin, readable.
    Cors,
    /// Cross-origin `no-cors`; status and body hidden.
    Opaque,
    Error,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Basic => "basic",
            ResponseType::Cors => "cors",
            ResponseType::Opaque => "opaque",
            ResponseType::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "basic" => Some(ResponseType::Basic),
            "cors" => Some(ResponseType::Cors),
            "opaque" => Some(ResponseType::Opaque),
            "error" => Some(ResponseType::Error),
            _ => None,
        }
    }
}

/// A response handed back to the page.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub url: Url,
    pub response_type: ResponseType,
    pub redirected: bool,
    /// Served from the cache store without touching the network.
    pub from_cache: bool,
}

impl Response {
    /// 2xx and readable. Opaque and error responses never count as ok,
    /// whatever status the transport saw.
    pub fn is_ok(&self) -> bool {
        matches!(self.response_type, ResponseType::Basic | ResponseType::Cors)
            && self.status.is_success()
    }

    /// Same-origin with a full 200 body. Partial, opaque, cross-origin and
    /// error responses are never written to the store.
    pub fn is_cacheable(&self) -> bool {
        self.status == StatusCode::OK && self.response_type == ResponseType::Basic
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Split into the copy returned to the caller and an owned copy for the
    /// store. The two never share mutable state.
    pub fn duplicate_for_store(self, request: &Request) -> (Response, CachedResponse) {
        let stored = CachedResponse::capture(request, &self);
        (self, stored)
    }
}

/// Normalized cache key: upper-case method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
    method: String,
    url: String,
}

impl RequestKey {
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_ascii_uppercase(),
            url: url.into(),
        }
    }

    /// Key of a plain GET for `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    /// Key for a request, if the request may be stored at all (GET only).
    pub fn for_request(request: &Request) -> Result<Self, CacheError> {
        if request.method != Method::GET {
            return Err(CacheError::NotCacheable(format!(
                "{} {}",
                request.method, request.url
            )));
        }
        Ok(Self::new(&request.method, &request.url))
    }

    /// Rebuild from stored columns.
    pub(crate) fn from_parts(method: String, url: String) -> Self {
        Self { method, url }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A stored response, owned by the cache store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub url: String,
    pub status: u16,
    /// In arrival order; repeated names are kept.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub response_type: ResponseType,
    pub redirected: bool,
    /// Request header values for each name listed in the response `Vary`.
    pub vary: Vec<(String, Option<String>)>,
    pub cached_at: DateTime<Utc>,
}

impl CachedResponse {
    /// Copy a response for storage, recording the vary-relevant request headers.
    pub fn capture(request: &Request, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let vary = vary_names(&response.headers)
            .into_iter()
            .map(|name| {
                let value = request
                    .headers
                    .get(name.as_str())
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                (name, value)
            })
            .collect();

        Self {
            url: response.url.to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body.clone(),
            response_type: response.response_type,
            redirected: response.redirected,
            vary,
            cached_at: Utc::now(),
        }
    }

    /// Whether this entry may answer a request carrying `headers`.
    pub fn matches_vary(&self, headers: &HeaderMap) -> bool {
        self.vary.iter().all(|(name, stored)| {
            if name == "*" {
                return false;
            }
            let current = headers.get(name.as_str()).and_then(|v| v.to_str().ok());
            current == stored.as_deref()
        })
    }

    /// Rebuild a page-facing response.
    pub fn to_response(&self) -> Result<Response, CacheError> {
        let status = StatusCode::from_u16(self.status)
            .map_err(|_| CacheError::Corrupt(format!("status {} for {}", self.status, self.url)))?;
        let url = Url::parse(&self.url)
            .map_err(|e| CacheError::Corrupt(format!("url {}: {}", self.url, e)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(n, v);
            }
        }

        Ok(Response {
            status,
            headers,
            body: self.body.clone(),
            url,
            response_type: self.response_type,
            redirected: self.redirected,
            from_cache: true,
        })
    }
}

/// Lower-cased header names listed in `Vary`.
fn vary_names(headers: &HeaderMap) -> Vec<String> {
    let mut names: Vec<String> = headers
        .get_all(header::VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|n| n.trim().to_ascii_lowercase())
        .filter(|n| !n.is_empty())
        .collect();
    names.sort();
    names.dedup();
    names
}
