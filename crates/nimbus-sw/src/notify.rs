//! Notification bridge: push messages in, notifications out, clicks back to
//! windows.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::{Client, ClientMatchOptions};
use crate::error::{NotificationError, Result};
use crate::worker::OfflineWorker;

/// A notification to display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: Option<Url>,
    pub badge: Option<Url>,
    /// Notifications sharing a tag replace each other.
    pub tag: Option<String>,
}

/// An incoming push message.
#[derive(Debug, Clone, Default)]
pub struct PushMessage {
    pub data: Option<Bytes>,
}

impl PushMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            data: Some(Bytes::from(text.into())),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Payload as text. Invalid UTF-8 is replaced, never rejected.
    pub fn as_text(&self) -> Option<String> {
        self.data
            .as_ref()
            .map(|d| String::from_utf8_lossy(d).into_owned())
    }
}

/// A click on a displayed notification.
#[derive(Debug, Clone)]
pub struct NotificationClick {
    /// Id assigned by the host when the notification was shown.
    pub id: String,
    pub notification: Notification,
}

/// What a click did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    Focused(Client),
    Opened(Client),
}

/// Host environment that renders notifications.
#[async_trait]
pub trait NotificationHost: Send + Sync {
    /// Display a notification and return the id it was given.
    async fn show(&self, notification: Notification) -> Result<String, NotificationError>;

    /// Dismiss a notification. `false` if it was not showing.
    async fn close(&self, id: &str) -> Result<bool, NotificationError>;
}

/// In-memory [`NotificationHost`].
#[derive(Debug)]
pub struct NotificationCenter {
    showing: RwLock<HashMap<String, Notification>>,
    next_id: AtomicU64,
    permitted: bool,
}

impl Default for NotificationCenter {
    fn default() -> Self {
        Self {
            showing: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            permitted: true,
        }
    }
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A center where the user declined notifications.
    pub fn denied() -> Self {
        Self {
            permitted: false,
            ..Self::default()
        }
    }

    /// Currently displayed notifications, ordered by id.
    pub async fn showing(&self) -> Vec<(String, Notification)> {
        let mut all: Vec<_> = self
            .showing
            .read()
            .await
            .iter()
            .map(|(id, n)| (id.clone(), n.clone()))
            .collect();
        all.sort_by_key(|(id, _)| id.trim_start_matches("notification-").parse::<u64>().unwrap_or(0));
        all
    }
}

#[async_trait]
impl NotificationHost for NotificationCenter {
    async fn show(&self, notification: Notification) -> Result<String, NotificationError> {
        if !self.permitted {
            return Err(NotificationError::PermissionDenied);
        }

        let mut showing = self.showing.write().await;
        if let Some(tag) = &notification.tag {
            showing.retain(|_, n| n.tag.as_ref() != Some(tag));
        }

        let id = format!("notification-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        showing.insert(id.clone(), notification);
        Ok(id)
    }

    async fn close(&self, id: &str) -> Result<bool, NotificationError> {
        Ok(self.showing.write().await.remove(id).is_some())
    }
}

impl OfflineWorker {
    /// Turn a push message into one notification. The future completes once
    /// the host has displayed it. A push without a payload shows nothing.
    pub async fn handle_push(&self, message: PushMessage) -> Result<Option<String>> {
        let Some(body) = message.as_text() else {
            info!(version = %self.config.version, "Push without payload ignored");
            return Ok(None);
        };

        let options = &self.config.notification;
        let resolve = |asset: &Option<String>| {
            asset
                .as_deref()
                .and_then(|a| self.config.resolve(a).ok())
        };

        let notification = Notification {
            title: options.title.clone(),
            body,
            icon: resolve(&options.icon),
            badge: resolve(&options.badge),
            tag: None,
        };

        let id = self.notifications.show(notification).await?;
        debug!(id = %id, "Push notification displayed");
        Ok(Some(id))
    }

    /// Close the clicked notification, then focus the window already at the
    /// app root, or open one there if none is.
    pub async fn handle_notification_click(&self, click: NotificationClick) -> Result<ClickOutcome> {
        match self.notifications.close(&click.id).await {
            Ok(true) => {}
            Ok(false) => debug!(id = %click.id, "Clicked notification already closed"),
            Err(e) => warn!(id = %click.id, error = %e, "Failed to close notification"),
        }

        let root = self.config.root_url()?;
        // Uncontrolled windows count too, so a page opened before
        // activation is reused rather than duplicated.
        let windows = self
            .clients
            .match_all(ClientMatchOptions::all_windows())
            .await?;

        if let Some(existing) = windows.iter().find(|c| same_document(&c.url, &root)) {
            let focused = self.clients.focus(&existing.id).await?;
            return Ok(ClickOutcome::Focused(focused));
        }

        let opened = self.clients.open_window(&root).await?;
        Ok(ClickOutcome::Opened(opened))
    }
}

/// URL equality ignoring the fragment.
fn same_document(a: &Url, b: &Url) -> bool {
    let mut a = a.clone();
    let mut b = b.clone();
    a.set_fragment(None);
    b.set_fragment(None);
    a == b
}
