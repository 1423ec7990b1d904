//! Error types for the offline layer.

use nimbus_common::Retryable;
use nimbus_net::HttpError;
use thiserror::Error;

/// Cache store failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache bucket does not exist: {0}")]
    BucketMissing(String),

    #[error("Request is not cacheable: {0}")]
    NotCacheable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupt cache entry: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        CacheError::Storage(e.to_string())
    }
}

/// Network fetch failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The request never produced a response (offline, refused, reset).
    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<HttpError> for FetchError {
    fn from(e: HttpError) -> Self {
        match e {
            HttpError::InvalidUrl(msg) | HttpError::UnsupportedScheme(msg) => {
                FetchError::InvalidRequest(msg)
            }
            other => FetchError::Network(other.to_string()),
        }
    }
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Network(_))
    }
}

/// Reasons an install (pre-warm) fails.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstallError {
    #[error("Asset {url} could not be fetched: {source}")]
    AssetUnreachable { url: String, source: FetchError },

    #[error("Asset {url} returned status {status}")]
    AssetStatus { url: String, status: u16 },

    #[error("Cache error during install: {0}")]
    Cache(#[from] CacheError),

    #[error("Invalid manifest: {0}")]
    Manifest(String),
}

impl Retryable for InstallError {
    fn is_retryable(&self) -> bool {
        match self {
            InstallError::AssetUnreachable { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

/// Window/client host failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Client not found: {0}")]
    NotFound(String),

    #[error("Client is not a window: {0}")]
    NotAWindow(String),

    #[error("Could not open window: {0}")]
    OpenFailed(String),
}

/// Notification host failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotificationError {
    #[error("Notification permission denied")]
    PermissionDenied,

    #[error("Notification display failed: {0}")]
    DisplayFailed(String),
}

/// Configuration failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Invalid URL in config: {0}")]
    Url(#[from] url::ParseError),
}

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Notification(#[from] NotificationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("State error: {0}")]
    State(String),
}

pub type Result<T, E = ServiceWorkerError> = std::result::Result<T, E>;
