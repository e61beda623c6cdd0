use std::{fmt, sync::Arc, time::Duration};

use anyhow::anyhow;
use async_trait::async_trait;
use shared::domain::{Chat, Contact, ContactId, SessionId};
use tokio::sync::broadcast;

pub mod bridge;

pub use bridge::BridgeConnector;

/// Browser flags used for remotely persisted sessions, where the sidecar
/// usually runs inside a container without a sandbox or GPU.
pub const REMOTE_BROWSER_ARGS: &[&str] = &[
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-accelerated-2d-canvas",
    "--disable-gpu",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientSignal {
    Qr(String),
    Ready,
    Authenticated,
    AuthFailure(String),
    Disconnected(String),
    StateChanged(String),
    RemoteSessionSaved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserOptions {
    pub headless: bool,
    pub executable_path: Option<String>,
    pub args: Vec<String>,
    pub navigation_timeout: Duration,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            headless: true,
            executable_path: None,
            args: Vec::new(),
            navigation_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub enum AuthStrategy {
    /// Credentials stay in the driver's local data directory.
    Local,
    /// Credentials are backed up to an external session store.
    Remote {
        store: Arc<dyn SessionStore>,
        backup_sync_interval: Duration,
    },
}

impl fmt::Debug for AuthStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("Local"),
            Self::Remote {
                backup_sync_interval,
                ..
            } => f
                .debug_struct("Remote")
                .field("backup_sync_interval", backup_sync_interval)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub session_id: Option<SessionId>,
    pub auth: AuthStrategy,
    pub browser: BrowserOptions,
    pub takeover_on_conflict: bool,
    pub qr_max_retries: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub mentions: Vec<ContactId>,
}

/// One live chat-client session as exposed by the automation layer.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Starts the client. Readiness, pairing and auth failures are reported
    /// through [`ChatClient::subscribe_signals`], not through this call.
    async fn initialize(&self) -> anyhow::Result<()>;
    fn subscribe_signals(&self) -> broadcast::Receiver<ClientSignal>;
    async fn own_address(&self) -> anyhow::Result<ContactId>;
    async fn chats(&self) -> anyhow::Result<Vec<Chat>>;
    async fn chat_by_id(&self, chat_id: &str) -> anyhow::Result<Chat>;
    async fn contact_by_id(&self, contact_id: &str) -> anyhow::Result<Contact>;
    /// Directory lookup of a phone number; `None` when it has no account.
    async fn number_id(&self, number: &str) -> anyhow::Result<Option<ContactId>>;
    async fn send_message(&self, to: &str, body: &str, options: SendOptions)
        -> anyhow::Result<()>;
    async fn destroy(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ChatClientConnector: Send + Sync {
    async fn connect(&self, options: ClientOptions) -> anyhow::Result<Arc<dyn ChatClient>>;
}

/// Key-value blob store holding serialized session credentials.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, session_id: &SessionId) -> anyhow::Result<Option<Vec<u8>>>;
    async fn save(&self, session_id: &SessionId, blob: &[u8]) -> anyhow::Result<()>;
    async fn delete(&self, session_id: &SessionId) -> anyhow::Result<()>;
    async fn disconnect(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait SessionStoreConnector: Send + Sync {
    async fn connect(&self, uri: &str) -> anyhow::Result<Arc<dyn SessionStore>>;
}

pub struct MissingChatConnector;

#[async_trait]
impl ChatClientConnector for MissingChatConnector {
    async fn connect(&self, _options: ClientOptions) -> anyhow::Result<Arc<dyn ChatClient>> {
        Err(anyhow!("chat driver is unavailable"))
    }
}

pub struct MissingSessionStoreConnector;

#[async_trait]
impl SessionStoreConnector for MissingSessionStoreConnector {
    async fn connect(&self, uri: &str) -> anyhow::Result<Arc<dyn SessionStore>> {
        Err(anyhow!("session store backend unavailable for '{uri}'"))
    }
}
