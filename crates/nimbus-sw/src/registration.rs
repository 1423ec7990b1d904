//! Registration: the installing, waiting and active workers of one scope,
//! and the handoff between versions.
//!
//! ```text
//! Registration (scope)
//!     ├── installing ─ok─► waiting ─skip_waiting / nothing active─► active
//!     │       └─err─► redundant (active keeps serving)
//!     └── active ─superseded─► redundant
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use url::Url;

use crate::config::CacheVersion;
use crate::error::{FetchError, Result};
use crate::event::ExtendableEvent;
use crate::lifecycle::{ActivationReport, InstallReport};
use crate::request::Request;
use crate::router::FetchDecision;
use crate::worker::{OfflineWorker, WorkerId, WorkerState};

/// Registration events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    /// A worker changed lifecycle state.
    StateChange {
        worker_id: WorkerId,
        version: CacheVersion,
        new_state: WorkerState,
    },
    /// A new worker started installing.
    UpdateFound { version: CacheVersion },
    /// Pages are now controlled by a different worker.
    ControllerChange { version: CacheVersion },
}

/// Outcome of [`Registration::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub install: InstallReport,
    /// Set when the new worker was activated right away.
    pub activation: Option<ActivationReport>,
}

#[derive(Default)]
struct Slots {
    installing: Option<Arc<OfflineWorker>>,
    waiting: Option<Arc<OfflineWorker>>,
    active: Option<Arc<OfflineWorker>>,
}

/// Workers registered for one scope.
pub struct Registration {
    scope: Url,
    slots: RwLock<Slots>,
    event_tx: mpsc::UnboundedSender<RegistrationEvent>,
}

impl Registration {
    pub fn new(scope: Url) -> (Self, mpsc::UnboundedReceiver<RegistrationEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                scope,
                slots: RwLock::new(Slots::default()),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub async fn installing(&self) -> Option<Arc<OfflineWorker>> {
        self.slots.read().await.installing.clone()
    }

    pub async fn waiting(&self) -> Option<Arc<OfflineWorker>> {
        self.slots.read().await.waiting.clone()
    }

    pub async fn active(&self) -> Option<Arc<OfflineWorker>> {
        self.slots.read().await.active.clone()
    }

    /// Install `worker` and, when allowed, hand control over to it.
    ///
    /// A failed install never disturbs the active worker.
    pub async fn update(&self, worker: Arc<OfflineWorker>) -> Result<UpdateOutcome> {
        let version = worker.version().clone();
        info!(scope = %self.scope, version = %version, "Update found");
        self.emit(RegistrationEvent::UpdateFound {
            version: version.clone(),
        });

        let replaced = self.slots.write().await.installing.replace(worker.clone());
        if let Some(replaced) = replaced {
            self.retire(&replaced).await;
        }
        self.emit_state(&worker, WorkerState::Installing);

        let install = match worker.install().await {
            Ok(report) => report,
            Err(e) => {
                self.clear_installing(&worker).await;
                self.emit_state(&worker, WorkerState::Redundant);
                return Err(e.into());
            }
        };

        let previous_waiting = {
            let mut slots = self.slots.write().await;
            if slots
                .installing
                .as_ref()
                .is_some_and(|w| Arc::ptr_eq(w, &worker))
            {
                slots.installing = None;
            }
            slots.waiting.replace(worker.clone())
        };
        if let Some(previous) = previous_waiting {
            self.retire(&previous).await;
        }
        self.emit_state(&worker, WorkerState::Waiting);

        let nothing_active = self.active().await.is_none();
        let activation = if worker.config().skip_waiting || nothing_active {
            self.activate_waiting().await?
        } else {
            debug!(version = %version, "Waiting for existing worker to release control");
            None
        };

        Ok(UpdateOutcome {
            install,
            activation,
        })
    }

    /// Promote the waiting worker, if any, to active.
    pub async fn activate_waiting(&self) -> Result<Option<ActivationReport>> {
        let Some(worker) = self.slots.write().await.waiting.take() else {
            return Ok(None);
        };

        self.emit_state(&worker, WorkerState::Activating);
        let report = worker.activate().await?;

        let previous = self.slots.write().await.active.replace(worker.clone());
        if let Some(previous) = previous {
            self.retire(&previous).await;
        }
        self.emit_state(&worker, WorkerState::Active);
        self.emit(RegistrationEvent::ControllerChange {
            version: worker.version().clone(),
        });

        Ok(Some(report))
    }

    /// Route a request through the active worker. Without one, nothing is
    /// intercepted.
    pub async fn handle_fetch(
        &self,
        request: &Request,
        event: &mut ExtendableEvent,
    ) -> Result<FetchDecision, FetchError> {
        match self.active().await {
            Some(worker) => worker.handle_fetch(request, event).await,
            None => Ok(FetchDecision::Passthrough),
        }
    }

    /// Drop every worker. Cached buckets are left in place.
    pub async fn unregister(&self) {
        let retired = {
            let mut slots = self.slots.write().await;
            [
                slots.installing.take(),
                slots.waiting.take(),
                slots.active.take(),
            ]
        };
        for worker in retired.into_iter().flatten() {
            self.retire(&worker).await;
        }
        info!(scope = %self.scope, "Unregistered");
    }

    async fn clear_installing(&self, worker: &Arc<OfflineWorker>) {
        let mut slots = self.slots.write().await;
        if slots
            .installing
            .as_ref()
            .is_some_and(|w| Arc::ptr_eq(w, worker))
        {
            slots.installing = None;
        }
    }

    async fn retire(&self, worker: &OfflineWorker) {
        worker.set_state(WorkerState::Redundant).await;
        self.emit_state(worker, WorkerState::Redundant);
    }

    fn emit_state(&self, worker: &OfflineWorker, new_state: WorkerState) {
        self.emit(RegistrationEvent::StateChange {
            worker_id: worker.id(),
            version: worker.version().clone(),
            new_state,
        });
    }

    fn emit(&self, event: RegistrationEvent) {
        // Nobody listening is fine.
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    use crate::config::{AssetManifest, WorkerConfig};
    use crate::network::Fetcher;
    use crate::request::{Response, ResponseType};
    use crate::storage::{CacheStorage, MemoryCacheStorage};

    struct Site {
        broken: bool,
    }

    #[async_trait]
    impl Fetcher for Site {
        async fn fetch(&self, request: &Request) -> std::result::Result<Response, FetchError> {
            if self.broken {
                return Err(FetchError::InvalidRequest("broken build".into()));
            }
            Ok(Response {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Bytes::from_static(b"ok"),
                url: request.url.clone(),
                response_type: ResponseType::Basic,
                redirected: false,
                from_cache: false,
            })
        }
    }

    fn worker(version: &str, broken: bool, store: Arc<MemoryCacheStorage>) -> Arc<OfflineWorker> {
        let config = WorkerConfig {
            manifest: AssetManifest::new(["/", "/offline.html"]),
            ..WorkerConfig::for_version(version)
        };
        Arc::new(
            OfflineWorker::builder(config, Arc::new(Site { broken }))
                .caches(store)
                .build(),
        )
    }

    fn scope() -> Url {
        Url::parse("http://127.0.0.1:5000/").unwrap()
    }

    #[tokio::test]
    async fn test_first_update_activates() {
        let store = Arc::new(MemoryCacheStorage::new());
        let (registration, mut events) = Registration::new(scope());

        let outcome = registration
            .update(worker("v1", false, store.clone()))
            .await
            .unwrap();
        assert!(outcome.activation.is_some());

        let active = registration.active().await.unwrap();
        assert_eq!(active.version().as_str(), "v1");
        assert_eq!(active.state().await, WorkerState::Active);
        assert!(registration.waiting().await.is_none());
        assert!(registration.installing().await.is_none());

        assert!(matches!(
            events.recv().await,
            Some(RegistrationEvent::UpdateFound { .. })
        ));
        let mut saw_controller_change = false;
        while let Ok(event) = events.try_recv() {
            if let RegistrationEvent::ControllerChange { version } = event {
                assert_eq!(version.as_str(), "v1");
                saw_controller_change = true;
            }
        }
        assert!(saw_controller_change);
    }

    #[tokio::test]
    async fn test_failed_update_keeps_active() {
        let store = Arc::new(MemoryCacheStorage::new());
        let (registration, _events) = Registration::new(scope());
        registration
            .update(worker("v1", false, store.clone()))
            .await
            .unwrap();

        let broken = worker("v2", true, store.clone());
        assert!(registration.update(broken.clone()).await.is_err());

        assert_eq!(broken.state().await, WorkerState::Redundant);
        assert_eq!(
            registration.active().await.unwrap().version().as_str(),
            "v1"
        );
        assert_eq!(store.keys().await.unwrap(), vec!["v1"]);
    }

    #[tokio::test]
    async fn test_successful_update_supersedes() {
        let store = Arc::new(MemoryCacheStorage::new());
        let (registration, _events) = Registration::new(scope());
        let v1 = worker("v1", false, store.clone());
        registration.update(v1.clone()).await.unwrap();

        let outcome = registration
            .update(worker("v2", false, store.clone()))
            .await
            .unwrap();
        assert_eq!(outcome.activation.unwrap().deleted, vec!["v1"]);
        assert_eq!(v1.state().await, WorkerState::Redundant);
        assert_eq!(store.keys().await.unwrap(), vec!["v2"]);
    }

    #[tokio::test]
    async fn test_waits_when_skip_waiting_disabled() {
        let store = Arc::new(MemoryCacheStorage::new());
        let (registration, _events) = Registration::new(scope());
        registration
            .update(worker("v1", false, store.clone()))
            .await
            .unwrap();

        let config = WorkerConfig {
            manifest: AssetManifest::new(["/", "/offline.html"]),
            skip_waiting: false,
            ..WorkerConfig::for_version("v2")
        };
        let v2 = Arc::new(
            OfflineWorker::builder(config, Arc::new(Site { broken: false }))
                .caches(store.clone())
                .build(),
        );

        let outcome = registration.update(v2.clone()).await.unwrap();
        assert!(outcome.activation.is_none());
        assert_eq!(v2.state().await, WorkerState::Waiting);
        assert_eq!(
            registration.active().await.unwrap().version().as_str(),
            "v1"
        );

        registration.activate_waiting().await.unwrap();
        assert_eq!(
            registration.active().await.unwrap().version().as_str(),
            "v2"
        );
    }

    #[tokio::test]
    async fn test_fetch_without_active_passes_through() {
        let (registration, _events) = Registration::new(scope());
        let mut event = ExtendableEvent::new();
        let decision = registration
            .handle_fetch(&Request::get(scope()), &mut event)
            .await
            .unwrap();
        assert!(matches!(decision, FetchDecision::Passthrough));
    }

    #[tokio::test]
    async fn test_unregister_retires_all() {
        let store = Arc::new(MemoryCacheStorage::new());
        let (registration, _events) = Registration::new(scope());
        let v1 = worker("v1", false, store.clone());
        registration.update(v1.clone()).await.unwrap();

        registration.unregister().await;
        assert!(registration.active().await.is_none());
        assert_eq!(v1.state().await, WorkerState::Redundant);
        assert!(store.has("v1").await.unwrap());
    }
}
