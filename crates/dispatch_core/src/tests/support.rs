use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chat_driver::{
    AuthStrategy, ChatClient, ChatClientConnector, ClientOptions, ClientSignal, SendOptions,
    SessionStore, SessionStoreConnector,
};
use shared::domain::{Chat, ChatId, Contact, ContactId, Participant, SessionId};
use tokio::{sync::broadcast, time::Instant};

use crate::{
    actions::Messenger,
    config::{EngineConfig, SessionConfig},
    lifecycle::ConnectionManager,
};

pub const OWN_USER: &str = "51900000000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub to: String,
    pub body: String,
    pub mentions: Vec<ContactId>,
    pub at: Instant,
}

pub struct FakeClient {
    signals: broadcast::Sender<ClientSignal>,
    on_initialize: Vec<ClientSignal>,
    initialize_error: Option<String>,
    own_address_error: Option<String>,
    destroy_error: Option<String>,
    own: ContactId,
    chats: HashMap<String, Chat>,
    contacts: HashMap<String, Contact>,
    numbers: HashMap<String, ContactId>,
    failing_sends: HashSet<String>,
    number_lookup_error: Option<String>,
    sent: Mutex<Vec<SentMessage>>,
    number_lookups: AtomicUsize,
    destroy_calls: AtomicUsize,
}

impl FakeClient {
    /// A client that reports `ready` as soon as it is initialized.
    pub fn ready() -> Self {
        Self::scripted(vec![ClientSignal::Ready])
    }

    pub fn scripted(on_initialize: Vec<ClientSignal>) -> Self {
        let (signals, _) = broadcast::channel(64);
        Self {
            signals,
            on_initialize,
            initialize_error: None,
            own_address_error: None,
            destroy_error: None,
            own: ContactId::for_user(OWN_USER),
            chats: HashMap::new(),
            contacts: HashMap::new(),
            numbers: HashMap::new(),
            failing_sends: HashSet::new(),
            number_lookup_error: None,
            sent: Mutex::new(Vec::new()),
            number_lookups: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_initialize(mut self, message: &str) -> Self {
        self.initialize_error = Some(message.to_string());
        self
    }

    pub fn failing_own_address(mut self, message: &str) -> Self {
        self.own_address_error = Some(message.to_string());
        self
    }

    pub fn failing_destroy(mut self, message: &str) -> Self {
        self.destroy_error = Some(message.to_string());
        self
    }

    pub fn with_group(mut self, id: &str, name: &str, users: &[&str]) -> Self {
        let participants = users
            .iter()
            .map(|user| Participant {
                id: ContactId::for_user(*user),
                is_admin: false,
                is_super_admin: false,
            })
            .collect();
        self.chats.insert(
            id.to_string(),
            Chat {
                id: ChatId::new(id),
                name: name.to_string(),
                is_group: true,
                participants: Some(participants),
            },
        );
        self
    }

    pub fn with_direct_chat(mut self, id: &str, name: &str) -> Self {
        self.chats.insert(
            id.to_string(),
            Chat {
                id: ChatId::new(id),
                name: name.to_string(),
                is_group: false,
                participants: None,
            },
        );
        self
    }

    pub fn with_contact(mut self, user: &str, name: &str) -> Self {
        let id = ContactId::for_user(user);
        self.contacts.insert(
            id.serialized(),
            Contact {
                id,
                name: Some(name.to_string()),
                push_name: None,
                number: Some(user.to_string()),
                is_my_contact: true,
            },
        );
        self
    }

    pub fn with_number(mut self, number: &str, user: &str) -> Self {
        self.numbers
            .insert(number.to_string(), ContactId::for_user(user));
        self
    }

    pub fn failing_number_lookups(mut self, message: &str) -> Self {
        self.number_lookup_error = Some(message.to_string());
        self
    }

    pub fn failing_send_to(mut self, address: &str) -> Self {
        self.failing_sends.insert(address.to_string());
        self
    }

    pub fn emit(&self, signal: ClientSignal) {
        let _ = self.signals.send(signal);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub fn sent_to(&self) -> Vec<String> {
        self.sent().into_iter().map(|message| message.to).collect()
    }

    pub fn number_lookups(&self) -> usize {
        self.number_lookups.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatClient for FakeClient {
    async fn initialize(&self) -> Result<()> {
        for signal in &self.on_initialize {
            let _ = self.signals.send(signal.clone());
        }
        match &self.initialize_error {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(()),
        }
    }

    fn subscribe_signals(&self) -> broadcast::Receiver<ClientSignal> {
        self.signals.subscribe()
    }

    async fn own_address(&self) -> Result<ContactId> {
        match &self.own_address_error {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(self.own.clone()),
        }
    }

    async fn chats(&self) -> Result<Vec<Chat>> {
        let mut chats: Vec<Chat> = self.chats.values().cloned().collect();
        chats.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(chats)
    }

    async fn chat_by_id(&self, chat_id: &str) -> Result<Chat> {
        self.chats
            .get(chat_id)
            .cloned()
            .ok_or_else(|| anyhow!("chat {chat_id} not found"))
    }

    async fn contact_by_id(&self, contact_id: &str) -> Result<Contact> {
        self.contacts
            .get(contact_id)
            .cloned()
            .ok_or_else(|| anyhow!("contact {contact_id} not found"))
    }

    async fn number_id(&self, number: &str) -> Result<Option<ContactId>> {
        self.number_lookups.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.number_lookup_error {
            return Err(anyhow!(message.clone()));
        }
        Ok(self.numbers.get(number).cloned())
    }

    async fn send_message(&self, to: &str, body: &str, options: SendOptions) -> Result<()> {
        if self.failing_sends.contains(to) {
            return Err(anyhow!("recipient {to} unreachable"));
        }
        self.sent.lock().expect("sent lock").push(SentMessage {
            to: to.to_string(),
            body: body.to_string(),
            mentions: options.mentions,
            at: Instant::now(),
        });
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        match &self.destroy_error {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(()),
        }
    }
}

/// Hands out the same fake client on every connect.
pub struct FakeConnector {
    client: Arc<FakeClient>,
    connects: AtomicUsize,
    remote_connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(client: Arc<FakeClient>) -> Self {
        Self {
            client,
            connects: AtomicUsize::new(0),
            remote_connects: AtomicUsize::new(0),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn remote_connects(&self) -> usize {
        self.remote_connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatClientConnector for FakeConnector {
    async fn connect(&self, options: ClientOptions) -> Result<Arc<dyn ChatClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if matches!(options.auth, AuthStrategy::Remote { .. }) {
            self.remote_connects.fetch_add(1, Ordering::SeqCst);
        }
        Ok(self.client.clone() as Arc<dyn ChatClient>)
    }
}

#[derive(Default)]
pub struct FakeStore {
    blobs: Mutex<HashMap<SessionId, Vec<u8>>>,
    disconnects: AtomicUsize,
}

impl FakeStore {
    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionStore for FakeStore {
    async fn load(&self, session_id: &SessionId) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().expect("blob lock").get(session_id).cloned())
    }

    async fn save(&self, session_id: &SessionId, blob: &[u8]) -> Result<()> {
        self.blobs
            .lock()
            .expect("blob lock")
            .insert(session_id.clone(), blob.to_vec());
        Ok(())
    }

    async fn delete(&self, session_id: &SessionId) -> Result<()> {
        self.blobs.lock().expect("blob lock").remove(session_id);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeStoreConnector {
    pub store: Arc<FakeStore>,
    pub fail: bool,
}

#[async_trait]
impl SessionStoreConnector for FakeStoreConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn SessionStore>> {
        if self.fail {
            return Err(anyhow!("cannot reach session store at {uri}"));
        }
        Ok(self.store.clone() as Arc<dyn SessionStore>)
    }
}

pub fn fast_engine() -> EngineConfig {
    EngineConfig {
        settle_delay: None,
        ..EngineConfig::default()
    }
}

pub fn local_session(id: &str) -> SessionConfig {
    fast_engine().session(SessionId::new(id))
}

pub fn remote_session(id: &str) -> SessionConfig {
    EngineConfig {
        settle_delay: None,
        pairing_window: Duration::from_secs(300),
        ..EngineConfig::remote("sqlite::memory:")
    }
    .session(SessionId::new(id))
}

pub fn manager_for(client: &Arc<FakeClient>) -> ConnectionManager {
    ConnectionManager::new(
        Arc::new(FakeConnector::new(Arc::clone(client))),
        Arc::new(FakeStoreConnector::default()),
    )
}

pub fn messenger_for(client: &Arc<FakeClient>) -> Messenger {
    Messenger::new(manager_for(client), fast_engine())
}
