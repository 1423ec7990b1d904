//! Install and activate.
//!
//! ```text
//! Parsed ── install ──► Installing ──ok──► Waiting ── activate ──► Activating ──► Active
//!                            │
//!                            └──err──► Redundant ◄── superseded by a newer Active
//! ```

use futures::future::{join_all, try_join_all};
use nimbus_common::retry_with_backoff;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::{CacheError, InstallError, Result, ServiceWorkerError};
use crate::request::{CachedResponse, Request, RequestKey, Response};
use crate::worker::{OfflineWorker, WorkerState};

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// Whether install created the bucket (as opposed to reusing one).
    pub bucket_created: bool,
    /// Entries written.
    pub stored: usize,
}

/// Result of an activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    /// Stale buckets removed.
    pub deleted: Vec<String>,
    /// Stale buckets that could not be removed.
    pub failed: Vec<String>,
    /// Clients that switched to this worker.
    pub claimed: usize,
}

impl OfflineWorker {
    /// Pre-warm the bucket for this version with every manifest asset.
    ///
    /// All assets are stored or none are. On failure the worker becomes
    /// redundant and a bucket created by this attempt is removed again.
    pub async fn install(&self) -> Result<InstallReport, InstallError> {
        self.set_state(WorkerState::Installing).await;
        let bucket = self.config.version.as_str();

        let bucket_created = match self.caches.open(bucket).await {
            Ok(created) => created,
            Err(e) => {
                self.set_state(WorkerState::Redundant).await;
                return Err(e.into());
            }
        };

        match self.prewarm(bucket).await {
            Ok(stored) => {
                self.set_state(WorkerState::Waiting).await;
                info!(version = bucket, stored, bucket_created, "Install complete");
                Ok(InstallReport {
                    bucket_created,
                    stored,
                })
            }
            Err(e) => {
                error!(version = bucket, error = %e, "Install failed");
                if bucket_created {
                    if let Err(cleanup) = self.caches.delete(bucket).await {
                        warn!(version = bucket, error = %cleanup, "Failed to remove bucket of failed install");
                    }
                }
                self.set_state(WorkerState::Redundant).await;
                Err(e)
            }
        }
    }

    async fn prewarm(&self, bucket: &str) -> Result<usize, InstallError> {
        let urls = self
            .config
            .manifest
            .resolve(&self.config.origin)
            .map_err(|e| InstallError::Manifest(e.to_string()))?;

        debug!(version = bucket, assets = urls.len(), "Fetching manifest");
        let fetched = try_join_all(urls.iter().map(|url| self.fetch_asset(url))).await?;

        let entries = fetched
            .into_iter()
            .map(|(request, response)| {
                let key = RequestKey::for_request(&request)?;
                Ok((key, CachedResponse::capture(&request, &response)))
            })
            .collect::<Result<Vec<_>, CacheError>>()?;

        let stored = entries.len();
        self.caches.put_all(bucket, entries).await?;
        Ok(stored)
    }

    async fn fetch_asset(&self, url: &Url) -> Result<(Request, Response), InstallError> {
        let retry = self.config.install_retry.to_retry_config();
        retry_with_backoff(&retry, || {
            let request = Request::get(url.clone());
            async move {
                match self.network.fetch(&request).await {
                    Ok(response) if response.is_ok() => Ok((request, response)),
                    Ok(response) => Err(InstallError::AssetStatus {
                        url: url.to_string(),
                        status: response.status.as_u16(),
                    }),
                    Err(source) => Err(InstallError::AssetUnreachable {
                        url: url.to_string(),
                        source,
                    }),
                }
            }
        })
        .await
    }

    /// Retire every bucket not named by this version, then take control of
    /// open windows. Cleanup failures are logged and never stop activation.
    pub async fn activate(&self) -> Result<ActivationReport> {
        let current = self.state().await;
        if current != WorkerState::Waiting {
            return Err(ServiceWorkerError::State(format!(
                "cannot activate a worker in state {}",
                current
            )));
        }
        self.set_state(WorkerState::Activating).await;

        let version = self.config.version.as_str();
        let mut report = ActivationReport::default();

        let names = match self.caches.keys().await {
            Ok(names) => names,
            Err(e) => {
                warn!(version, error = %e, "Cannot enumerate buckets, skipping cleanup");
                Vec::new()
            }
        };

        let stale: Vec<String> = names.into_iter().filter(|n| n != version).collect();
        let results = join_all(stale.iter().map(|name| self.caches.delete(name))).await;
        for (name, result) in stale.into_iter().zip(results) {
            match result {
                Ok(true) => {
                    info!(bucket = %name, "Deleted stale cache");
                    report.deleted.push(name);
                }
                Ok(false) => debug!(bucket = %name, "Stale cache already gone"),
                Err(e) => {
                    warn!(bucket = %name, error = %e, "Failed to delete stale cache");
                    report.failed.push(name);
                }
            }
        }

        self.set_state(WorkerState::Active).await;

        if self.config.claim_clients {
            match self.clients.claim(&self.config.version).await {
                Ok(claimed) => report.claimed = claimed,
                Err(e) => warn!(version, error = %e, "Failed to claim clients"),
            }
        }

        info!(
            version,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            claimed = report.claimed,
            "Activated"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    use crate::config::{AssetManifest, InstallRetry, WorkerConfig};
    use crate::error::FetchError;
    use crate::network::Fetcher;
    use crate::request::ResponseType;
    use crate::storage::{CacheStorage, MemoryCacheStorage};

    /// Serves every URL except those containing `missing`.
    struct Site {
        missing: Option<&'static str>,
    }

    #[async_trait]
    impl Fetcher for Site {
        async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
            let status = match self.missing {
                Some(m) if request.url.as_str().contains(m) => StatusCode::NOT_FOUND,
                _ => StatusCode::OK,
            };
            Ok(Response {
                status,
                headers: HeaderMap::new(),
                body: Bytes::from(request.url.path().to_string()),
                url: request.url.clone(),
                response_type: ResponseType::Basic,
                redirected: false,
                from_cache: false,
            })
        }
    }

    fn config(version: &str) -> WorkerConfig {
        WorkerConfig {
            manifest: AssetManifest::new(["/", "/offline.html", "/static/js/main.js"]),
            install_retry: InstallRetry {
                max_attempts: 1,
                ..InstallRetry::default()
            },
            ..WorkerConfig::for_version(version)
        }
    }

    fn worker(version: &str, missing: Option<&'static str>, store: Arc<MemoryCacheStorage>) -> OfflineWorker {
        OfflineWorker::builder(config(version), Arc::new(Site { missing }))
            .caches(store)
            .build()
    }

    #[tokio::test]
    async fn test_install_stores_every_asset() {
        let store = Arc::new(MemoryCacheStorage::new());
        let w = worker("v1", None, store.clone());

        let report = w.install().await.unwrap();
        assert!(report.bucket_created);
        assert_eq!(report.stored, 3);
        assert_eq!(store.len("v1").await, Some(3));
        assert_eq!(w.state().await, WorkerState::Waiting);
    }

    #[tokio::test]
    async fn test_install_failure_discards_bucket() {
        let store = Arc::new(MemoryCacheStorage::new());
        let w = worker("v1", Some("main.js"), store.clone());

        let err = w.install().await.unwrap_err();
        assert!(matches!(err, InstallError::AssetStatus { status: 404, .. }));
        assert!(!store.has("v1").await.unwrap());
        assert_eq!(w.state().await, WorkerState::Redundant);
    }

    #[tokio::test]
    async fn test_install_failure_keeps_existing_bucket() {
        let store = Arc::new(MemoryCacheStorage::new());
        store.open("v1").await.unwrap();
        let w = worker("v1", Some("offline"), store.clone());

        assert!(w.install().await.is_err());
        assert!(store.has("v1").await.unwrap());
        assert_eq!(store.len("v1").await, Some(0));
    }

    #[tokio::test]
    async fn test_activate_requires_install() {
        let store = Arc::new(MemoryCacheStorage::new());
        let w = worker("v1", None, store);
        assert!(matches!(
            w.activate().await,
            Err(ServiceWorkerError::State(_))
        ));
    }

    #[tokio::test]
    async fn test_activate_removes_stale_buckets() {
        let store = Arc::new(MemoryCacheStorage::new());
        store.open("weather-app-v0.9.0").await.unwrap();
        store.open("other").await.unwrap();

        let w = worker("v1", None, store.clone());
        w.install().await.unwrap();
        let report = w.activate().await.unwrap();

        assert_eq!(report.deleted, vec!["weather-app-v0.9.0", "other"]);
        assert!(report.failed.is_empty());
        assert_eq!(store.keys().await.unwrap(), vec!["v1"]);
        assert_eq!(w.state().await, WorkerState::Active);
    }
}
