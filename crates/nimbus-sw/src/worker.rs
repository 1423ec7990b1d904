//! One offline worker: a configuration bound to its collaborators.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tracing::debug;

use crate::clients::{ClientsHost, WindowRegistry};
use crate::config::{CacheVersion, WorkerConfig};
use crate::network::Fetcher;
use crate::notify::{NotificationCenter, NotificationHost};
use crate::storage::{CacheStorage, MemoryCacheStorage};

/// Unique identifier for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    /// Built, not yet installed.
    #[default]
    Parsed,
    Installing,
    /// Installed, waiting to take over.
    Waiting,
    Activating,
    Active,
    /// Failed install or superseded by a newer version.
    Redundant,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Parsed => "parsed",
            WorkerState::Installing => "installing",
            WorkerState::Waiting => "waiting",
            WorkerState::Activating => "activating",
            WorkerState::Active => "active",
            WorkerState::Redundant => "redundant",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct StateCell {
    state: WorkerState,
    changed_at: Instant,
}

/// A worker for one cache version.
///
/// The worker owns nothing global: the cache store, network and hosts are
/// injected, so several versions can share one store in the same process.
pub struct OfflineWorker {
    pub(crate) id: WorkerId,
    pub(crate) config: Arc<WorkerConfig>,
    pub(crate) caches: Arc<dyn CacheStorage>,
    pub(crate) network: Arc<dyn Fetcher>,
    pub(crate) clients: Arc<dyn ClientsHost>,
    pub(crate) notifications: Arc<dyn NotificationHost>,
    state: RwLock<StateCell>,
}

impl OfflineWorker {
    /// Worker with in-memory storage and hosts.
    pub fn new(config: WorkerConfig, network: Arc<dyn Fetcher>) -> Self {
        Self::builder(config, network).build()
    }

    pub fn builder(config: WorkerConfig, network: Arc<dyn Fetcher>) -> OfflineWorkerBuilder {
        OfflineWorkerBuilder {
            config,
            network,
            caches: None,
            clients: None,
            notifications: None,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn version(&self) -> &CacheVersion {
        &self.config.version
    }

    pub fn caches(&self) -> &Arc<dyn CacheStorage> {
        &self.caches
    }

    pub async fn state(&self) -> WorkerState {
        self.state.read().await.state
    }

    /// Time since the last state change.
    pub async fn time_in_state(&self) -> std::time::Duration {
        self.state.read().await.changed_at.elapsed()
    }

    pub(crate) async fn set_state(&self, state: WorkerState) {
        let mut cell = self.state.write().await;
        if cell.state != state {
            debug!(
                version = %self.config.version,
                from = %cell.state,
                to = %state,
                "Worker state change"
            );
            cell.state = state;
            cell.changed_at = Instant::now();
        }
    }
}

impl std::fmt::Debug for OfflineWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineWorker")
            .field("id", &self.id)
            .field("version", &self.config.version)
            .finish_non_exhaustive()
    }
}

/// Builder for [`OfflineWorker`]. Unset collaborators default to the
/// in-memory implementations.
pub struct OfflineWorkerBuilder {
    config: WorkerConfig,
    network: Arc<dyn Fetcher>,
    caches: Option<Arc<dyn CacheStorage>>,
    clients: Option<Arc<dyn ClientsHost>>,
    notifications: Option<Arc<dyn NotificationHost>>,
}

impl OfflineWorkerBuilder {
    pub fn caches(mut self, caches: Arc<dyn CacheStorage>) -> Self {
        self.caches = Some(caches);
        self
    }

    pub fn clients(mut self, clients: Arc<dyn ClientsHost>) -> Self {
        self.clients = Some(clients);
        self
    }

    pub fn notifications(mut self, notifications: Arc<dyn NotificationHost>) -> Self {
        self.notifications = Some(notifications);
        self
    }

    pub fn build(self) -> OfflineWorker {
        OfflineWorker {
            id: WorkerId::new(),
            config: Arc::new(self.config),
            caches: self
                .caches
                .unwrap_or_else(|| Arc::new(MemoryCacheStorage::new())),
            network: self.network,
            clients: self
                .clients
                .unwrap_or_else(|| Arc::new(WindowRegistry::new())),
            notifications: self
                .notifications
                .unwrap_or_else(|| Arc::new(NotificationCenter::new())),
            state: RwLock::new(StateCell {
                state: WorkerState::Parsed,
                changed_at: Instant::now(),
            }),
        }
    }
}
