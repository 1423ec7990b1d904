//! Clients API: the windows the offline layer can see and control.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use crate::config::CacheVersion;
use crate::error::ClientError;

/// A client (controlled page).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub id: String,
    pub url: Url,
    pub client_type: ClientType,
    pub frame_type: FrameType,
    pub visibility_state: VisibilityState,
    pub focused: bool,
    /// Cache version of the worker controlling this client, if any.
    pub controller: Option<CacheVersion>,
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
    All,
}

/// Frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Auxiliary,
    TopLevel,
    Nested,
    None,
}

/// Visibility state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityState {
    Hidden,
    Visible,
}

/// Options for [`ClientsHost::match_all`].
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    /// Also return clients no worker controls yet.
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

impl ClientMatchOptions {
    /// Every window, controlled or not.
    pub fn all_windows() -> Self {
        Self {
            include_uncontrolled: true,
            client_type: ClientType::Window,
        }
    }

    fn matches(&self, client: &Client) -> bool {
        let type_ok = match self.client_type {
            ClientType::All => true,
            t => client.client_type == t,
        };
        type_ok && (self.include_uncontrolled || client.controller.is_some())
    }
}

/// Host environment that owns the app's windows.
#[async_trait]
pub trait ClientsHost: Send + Sync {
    async fn match_all(&self, options: ClientMatchOptions) -> Result<Vec<Client>, ClientError>;

    /// Focus a window client. Returns the updated client.
    async fn focus(&self, id: &str) -> Result<Client, ClientError>;

    /// Open a new top-level window at `url`.
    async fn open_window(&self, url: &Url) -> Result<Client, ClientError>;

    /// Make the worker for `version` the controller of every window.
    /// Returns how many clients changed controller.
    async fn claim(&self, version: &CacheVersion) -> Result<usize, ClientError>;
}

/// In-memory [`ClientsHost`].
#[derive(Debug, Default)]
pub struct WindowRegistry {
    clients: RwLock<HashMap<String, Client>>,
    next_id: AtomicU64,
}

impl WindowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an existing, uncontrolled window at `url`.
    pub async fn add_window(&self, url: Url) -> Client {
        let client = Client {
            id: self.allocate_id(),
            url,
            client_type: ClientType::Window,
            frame_type: FrameType::TopLevel,
            visibility_state: VisibilityState::Hidden,
            focused: false,
            controller: None,
        };
        self.clients
            .write()
            .await
            .insert(client.id.clone(), client.clone());
        client
    }

    pub async fn add(&self, client: Client) {
        self.clients.write().await.insert(client.id.clone(), client);
    }

    pub async fn get(&self, id: &str) -> Option<Client> {
        self.clients.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Client> {
        self.clients.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    fn allocate_id(&self) -> String {
        format!("client-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Sort key for ids: `client-2` before `client-10`.
fn creation_order(id: &str) -> (&str, u64, &str) {
    match id.rsplit_once('-') {
        Some((prefix, n)) => match n.parse() {
            Ok(n) => (prefix, n, id),
            Err(_) => (id, 0, id),
        },
        None => (id, 0, id),
    }
}

#[async_trait]
impl ClientsHost for WindowRegistry {
    async fn match_all(&self, options: ClientMatchOptions) -> Result<Vec<Client>, ClientError> {
        let clients = self.clients.read().await;
        let mut matched: Vec<Client> = clients
            .values()
            .filter(|c| options.matches(c))
            .cloned()
            .collect();
        matched.sort_by(|a, b| creation_order(&a.id).cmp(&creation_order(&b.id)));
        Ok(matched)
    }

    async fn focus(&self, id: &str) -> Result<Client, ClientError> {
        let mut clients = self.clients.write().await;
        let target = clients
            .get(id)
            .ok_or_else(|| ClientError::NotFound(id.to_string()))?;
        if target.client_type != ClientType::Window {
            return Err(ClientError::NotAWindow(id.to_string()));
        }

        for client in clients.values_mut() {
            client.focused = client.id == id;
        }
        let focused = clients
            .get_mut(id)
            .ok_or_else(|| ClientError::NotFound(id.to_string()))?;
        focused.visibility_state = VisibilityState::Visible;

        debug!(client = id, url = %focused.url, "Focused window");
        Ok(focused.clone())
    }

    async fn open_window(&self, url: &Url) -> Result<Client, ClientError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ClientError::OpenFailed(url.to_string()));
        }

        let client = Client {
            id: self.allocate_id(),
            url: url.clone(),
            client_type: ClientType::Window,
            frame_type: FrameType::TopLevel,
            visibility_state: VisibilityState::Visible,
            focused: true,
            controller: None,
        };

        let mut clients = self.clients.write().await;
        for other in clients.values_mut() {
            other.focused = false;
        }
        clients.insert(client.id.clone(), client.clone());

        debug!(client = %client.id, url = %url, "Opened window");
        Ok(client)
    }

    async fn claim(&self, version: &CacheVersion) -> Result<usize, ClientError> {
        let mut clients = self.clients.write().await;
        let mut changed = 0;
        for client in clients
            .values_mut()
            .filter(|c| c.client_type == ClientType::Window)
        {
            if client.controller.as_ref() != Some(version) {
                client.controller = Some(version.clone());
                changed += 1;
            }
        }
        Ok(changed)
    }
}
