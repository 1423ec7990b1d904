//! # Nimbus Offline Layer
//!
//! Request interception and caching that keeps the weather app usable
//! without a network.
//!
//! ## Features
//!
//! - **Install**: pre-warm a versioned bucket from the asset manifest, all or nothing
//! - **Activate**: retire buckets of previous versions and claim open windows
//! - **Routing**: API bypass, cache-first, network with populate, offline document
//! - **Notifications**: push messages to notifications, clicks to windows
//! - **Storage**: in-memory or SQLite-backed cache store
//!
//! ## Architecture
//!
//! ```text
//! Registration (scope)
//!     └── installing / waiting / active: OfflineWorker
//!             ├── WorkerConfig (version, manifest, api prefix, offline document)
//!             ├── CacheStorage ── bucket per version ── RequestKey → CachedResponse
//!             ├── Fetcher (network)
//!             ├── ClientsHost (windows)
//!             └── NotificationHost
//! ```
//!
//! Every handler is an async method on [`OfflineWorker`]. Cache writes that
//! outlive a fetch response are attached to an [`ExtendableEvent`] the host
//! awaits.

pub mod clients;
pub mod config;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod network;
pub mod notify;
pub mod registration;
pub mod request;
pub mod router;
pub mod storage;
pub mod worker;

pub use clients::{
    Client, ClientMatchOptions, ClientType, ClientsHost, FrameType, VisibilityState, WindowRegistry,
};
pub use config::{AssetManifest, CacheVersion, InstallRetry, NotificationOptions, WorkerConfig};
pub use error::{
    CacheError, ClientError, ConfigError, FetchError, InstallError, NotificationError, Result,
    ServiceWorkerError,
};
pub use event::ExtendableEvent;
pub use lifecycle::{ActivationReport, InstallReport};
pub use network::{Fetcher, HttpFetcher};
pub use notify::{
    ClickOutcome, Notification, NotificationCenter, NotificationClick, NotificationHost,
    PushMessage,
};
pub use registration::{Registration, RegistrationEvent, UpdateOutcome};
pub use request::{CachedResponse, Request, RequestKey, RequestMode, Response, ResponseType};
pub use router::FetchDecision;
pub use storage::{match_request, CacheStorage, MemoryCacheStorage, SqliteCacheStorage};
pub use worker::{OfflineWorker, OfflineWorkerBuilder, WorkerId, WorkerState};
