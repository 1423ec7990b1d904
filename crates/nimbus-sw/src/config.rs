//! Worker configuration: cache version, asset manifest and routing knobs.
//!
//! Everything here is fixed when a worker is built. Two workers with
//! different versions can coexist in one process (and one cache store),
//! which is how an update is exercised.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use hashbrown::HashSet;
use nimbus_common::RetryConfig;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

/// Identifier of one generation of cached assets. Also the bucket name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheVersion(String);

impl CacheVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Default for CacheVersion {
    fn default() -> Self {
        Self::new("weather-app-v1.0.0")
    }
}

/// Ordered list of resources that must be resolvable offline.
///
/// Entries are absolute paths (resolved against the app origin) or full URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetManifest(Vec<String>);

impl AssetManifest {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(entries.into_iter().map(Into::into).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.0.iter().any(|e| e == identifier)
    }

    /// Resolve every identifier against `origin`, preserving order.
    pub fn resolve(&self, origin: &Url) -> Result<Vec<Url>, ConfigError> {
        self.0
            .iter()
            .map(|id| origin.join(id).map_err(ConfigError::from))
            .collect()
    }
}

impl Default for AssetManifest {
    fn default() -> Self {
        let mut entries = vec![
            "/".to_string(),
            "/offline.html".to_string(),
            "/static/css/style.css".to_string(),
            "/static/js/main.js".to_string(),
            "https://cdn.jsdelivr.net/npm/tailwindcss@2.2.19/dist/tailwind.min.css".to_string(),
            "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.5.1/css/all.min.css".to_string(),
        ];
        entries.extend(
            [72, 96, 128, 144, 152, 192, 384, 512]
                .iter()
                .map(|size| format!("/static/images/icon-{size}x{size}.png")),
        );
        entries.push("/static/images/favicon.png".to_string());
        for code in ["01", "02", "03", "04", "09", "10", "11", "13", "50"] {
            for period in ['d', 'n'] {
                entries.push(format!("/static/images/weather-icons/{code}{period}.png"));
            }
        }
        entries.push("/static/images/weather-icons/unknown.png".to_string());
        Self(entries)
    }
}

/// Presentation of push notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationOptions {
    /// Fixed title of every push notification.
    pub title: String,
    pub icon: Option<String>,
    pub badge: Option<String>,
}

impl Default for NotificationOptions {
    fn default() -> Self {
        Self {
            title: "Weather App".to_string(),
            icon: Some("/static/images/icon-192x192.png".to_string()),
            badge: Some("/static/images/icon-96x96.png".to_string()),
        }
    }
}

/// Retry policy for manifest fetches during install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallRetry {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for InstallRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

impl InstallRetry {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            ..RetryConfig::default()
        }
    }
}

/// Full worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Active cache version (bucket name).
    pub version: CacheVersion,

    /// Origin the app is served from; same-origin responses are `basic`.
    pub origin: Url,

    /// Assets pre-warmed at install.
    pub manifest: AssetManifest,

    /// Path prefix of the backend data API. Never intercepted.
    pub api_prefix: String,

    /// Document served to failed offline navigations.
    pub offline_document: String,

    /// Root URL of the app window, focused or opened on notification click.
    pub root_url: String,

    pub notification: NotificationOptions,

    /// Activate right after a successful install instead of waiting.
    pub skip_waiting: bool,

    /// Take control of already-open windows after activation.
    pub claim_clients: bool,

    pub install_retry: InstallRetry,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            version: CacheVersion::default(),
            origin: default_origin(),
            manifest: AssetManifest::default(),
            api_prefix: "/api/".to_string(),
            offline_document: "/offline.html".to_string(),
            root_url: "/".to_string(),
            notification: NotificationOptions::default(),
            skip_waiting: true,
            claim_clients: true,
            install_retry: InstallRetry::default(),
        }
    }
}

fn default_origin() -> Url {
    Url::parse("http://127.0.0.1:5000/").expect("static origin URL is valid")
}

impl WorkerConfig {
    /// Default configuration for a given version.
    pub fn for_version(version: impl Into<String>) -> Self {
        Self {
            version: CacheVersion::new(version),
            ..Self::default()
        }
    }

    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Parse and validate a JSON config.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: WorkerConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version.as_str().trim().is_empty() {
            return Err(ConfigError::Invalid("cache version is empty".into()));
        }
        if !self.api_prefix.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "api_prefix must start with '/': {}",
                self.api_prefix
            )));
        }
        if !self.manifest.contains(&self.offline_document) {
            return Err(ConfigError::Invalid(format!(
                "manifest does not contain the offline document {}",
                self.offline_document
            )));
        }

        let resolved = self.manifest.resolve(&self.origin)?;
        let mut seen = HashSet::new();
        for url in &resolved {
            if !seen.insert(url.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate manifest entry: {}", url)));
            }
        }

        self.root_url()?;
        Ok(())
    }

    /// Resolve an identifier (path or URL) against the app origin.
    pub fn resolve(&self, identifier: &str) -> Result<Url, ConfigError> {
        Ok(self.origin.join(identifier)?)
    }

    /// Absolute root URL of the app window.
    pub fn root_url(&self) -> Result<Url, ConfigError> {
        self.resolve(&self.root_url)
    }

    /// Absolute URL of the offline document.
    pub fn offline_document_url(&self) -> Result<Url, ConfigError> {
        self.resolve(&self.offline_document)
    }

    /// Whether a request targets the backend data API.
    pub fn is_api_request(&self, url: &Url) -> bool {
        url.path().starts_with(&self.api_prefix)
    }

    /// Whether `url` shares the app's origin.
    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin.origin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.version.as_str(), "weather-app-v1.0.0");
        assert!(config.manifest.contains("/offline.html"));
        assert!(config.manifest.contains("/static/images/weather-icons/50n.png"));
        assert_eq!(config.manifest.len(), 34);
    }

    #[test]
    fn test_manifest_resolution_keeps_full_urls() {
        let config = WorkerConfig::default();
        let urls = config.manifest.resolve(&config.origin).unwrap();
        assert_eq!(urls[0].as_str(), "http://127.0.0.1:5000/");
        assert!(urls
            .iter()
            .any(|u| u.host_str() == Some("cdn.jsdelivr.net")));
    }

    #[test]
    fn test_offline_document_must_be_in_manifest() {
        let config = WorkerConfig {
            manifest: AssetManifest::new(["/", "/static/css/style.css"]),
            ..WorkerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_duplicate_manifest_entries_rejected() {
        let config = WorkerConfig {
            manifest: AssetManifest::new(["/offline.html", "http://127.0.0.1:5000/offline.html"]),
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_api_prefix() {
        let config = WorkerConfig::default();
        let api = Url::parse("http://127.0.0.1:5000/api/weather?city=Bangkok").unwrap();
        let page = Url::parse("http://127.0.0.1:5000/static/js/main.js").unwrap();
        assert!(config.is_api_request(&api));
        assert!(!config.is_api_request(&page));
    }

    #[test]
    fn test_from_json_partial() {
        let config = WorkerConfig::from_json(
            r#"{ "version": "weather-app-v2.0.0", "origin": "https://weather.example/" }"#,
        )
        .unwrap();
        assert_eq!(config.version, CacheVersion::new("weather-app-v2.0.0"));
        assert_eq!(config.root_url().unwrap().as_str(), "https://weather.example/");
        assert_eq!(config.api_prefix, "/api/");
    }

    #[test]
    fn test_from_json_rejects_bad_prefix() {
        let err = WorkerConfig::from_json(r#"{ "api_prefix": "api" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_install_retry_conversion() {
        let retry = InstallRetry {
            max_attempts: 0,
            initial_delay_ms: 5,
            max_delay_ms: 50,
        };
        let config = retry.to_retry_config();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.initial_delay, Duration::from_millis(5));
    }
}
