//! WebSocket bridge to an out-of-process automation sidecar.
//!
//! Every [`DriverRequest`] is sent as a [`DriverCommand`] carrying a fresh
//! request id; the sidecar answers with a matching [`DriverReply`] and pushes
//! client signals as unsolicited frames.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use shared::{
    domain::{Chat, Contact, ContactId, SessionId},
    protocol::{
        AuthMode, DriverCommand, DriverFrame, DriverReply, DriverRequest, DriverSignal,
        OpenClientOptions,
    },
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    AuthStrategy, ChatClient, ChatClientConnector, ClientOptions, ClientSignal, SendOptions,
    SessionStore,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const SIGNAL_CHANNEL_CAPACITY: usize = 64;

type PendingReplies = Arc<Mutex<HashMap<String, oneshot::Sender<DriverReply>>>>;

pub struct BridgeConnector {
    url: Url,
    request_timeout: Duration,
}

impl BridgeConnector {
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url).with_context(|| format!("invalid driver url '{url}'"))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            bail!("driver url must start with ws:// or wss://, got '{url}'");
        }
        Ok(Self {
            url,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

#[async_trait]
impl ChatClientConnector for BridgeConnector {
    async fn connect(&self, options: ClientOptions) -> Result<Arc<dyn ChatClient>> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("failed to connect driver websocket: {}", self.url))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let writer_task = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(message).await {
                    warn!(%err, "bridge: websocket send failed");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let store = match &options.auth {
            AuthStrategy::Local => None,
            AuthStrategy::Remote { store, .. } => Some(Arc::clone(store)),
        };
        let (signals, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));

        let reader_task = {
            let pending = Arc::clone(&pending);
            let signals = signals.clone();
            let store = store.clone();
            let session_id = options.session_id.clone();
            tokio::spawn(async move {
                while let Some(message) = ws_reader.next().await {
                    match message {
                        Ok(Message::Text(text)) => match serde_json::from_str::<DriverFrame>(&text)
                        {
                            Ok(DriverFrame::Reply(reply)) => {
                                let waiter = pending.lock().await.remove(&reply.request_id);
                                match waiter {
                                    Some(tx) => {
                                        let _ = tx.send(reply);
                                    }
                                    None => debug!(
                                        request_id = %reply.request_id,
                                        "bridge: reply for unknown request"
                                    ),
                                }
                            }
                            Ok(DriverFrame::Signal(signal)) => {
                                if let Some(signal) =
                                    translate_signal(signal, store.as_deref(), session_id.as_ref())
                                        .await
                                {
                                    let _ = signals.send(signal);
                                }
                            }
                            Err(err) => warn!(%err, "bridge: invalid driver frame"),
                        },
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            warn!(%err, "bridge: websocket receive failed");
                            break;
                        }
                    }
                }
                pending.lock().await.clear();
                let _ = signals.send(ClientSignal::Disconnected(
                    "driver bridge closed".to_string(),
                ));
            })
        };

        let client = Arc::new(BridgeClient {
            outbound,
            pending,
            signals,
            request_timeout: self.request_timeout,
            tasks: vec![writer_task, reader_task],
        });

        let open = open_options(&options).await?;
        if let Err(err) = client.call::<()>(DriverRequest::Open { options: open }).await {
            client.shutdown();
            return Err(err.context("driver refused to open client"));
        }
        info!(url = %self.url, session_id = ?options.session_id, "bridge: client opened");
        Ok(client as Arc<dyn ChatClient>)
    }
}

struct BridgeClient {
    outbound: mpsc::UnboundedSender<Message>,
    pending: PendingReplies,
    signals: broadcast::Sender<ClientSignal>,
    request_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeClient {
    async fn call<T: DeserializeOwned>(&self, request: DriverRequest) -> Result<T> {
        let op = request_name(&request);
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        let frame = serde_json::to_string(&DriverCommand {
            request_id: request_id.clone(),
            request,
        })?;
        if self.outbound.send(Message::Text(frame)).is_err() {
            self.pending.lock().await.remove(&request_id);
            bail!("driver bridge is closed");
        }

        let reply = match timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => bail!("driver bridge closed before replying to {op}"),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                bail!(
                    "driver request {op} timed out after {}ms",
                    self.request_timeout.as_millis()
                );
            }
        };

        if !reply.ok {
            return Err(anyhow!(reply
                .error
                .unwrap_or_else(|| format!("driver request {op} failed"))));
        }
        serde_json::from_value(reply.result)
            .with_context(|| format!("invalid driver reply for {op}"))
    }

    fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl ChatClient for BridgeClient {
    async fn initialize(&self) -> Result<()> {
        self.call(DriverRequest::Initialize).await
    }

    fn subscribe_signals(&self) -> broadcast::Receiver<ClientSignal> {
        self.signals.subscribe()
    }

    async fn own_address(&self) -> Result<ContactId> {
        self.call(DriverRequest::OwnAddress).await
    }

    async fn chats(&self) -> Result<Vec<Chat>> {
        self.call(DriverRequest::GetChats).await
    }

    async fn chat_by_id(&self, chat_id: &str) -> Result<Chat> {
        self.call(DriverRequest::GetChatById {
            chat_id: chat_id.to_string(),
        })
        .await
    }

    async fn contact_by_id(&self, contact_id: &str) -> Result<Contact> {
        self.call(DriverRequest::GetContactById {
            contact_id: contact_id.to_string(),
        })
        .await
    }

    async fn number_id(&self, number: &str) -> Result<Option<ContactId>> {
        self.call(DriverRequest::GetNumberId {
            number: number.to_string(),
        })
        .await
    }

    async fn send_message(&self, to: &str, body: &str, options: SendOptions) -> Result<()> {
        self.call(DriverRequest::SendMessage {
            to: to.to_string(),
            body: body.to_string(),
            mentions: options.mentions.iter().map(ContactId::serialized).collect(),
        })
        .await
    }

    async fn destroy(&self) -> Result<()> {
        let result = self.call(DriverRequest::Destroy).await;
        self.shutdown();
        result
    }
}

fn request_name(request: &DriverRequest) -> &'static str {
    match request {
        DriverRequest::Open { .. } => "open",
        DriverRequest::Initialize => "initialize",
        DriverRequest::OwnAddress => "own_address",
        DriverRequest::GetChats => "get_chats",
        DriverRequest::GetChatById { .. } => "get_chat_by_id",
        DriverRequest::GetContactById { .. } => "get_contact_by_id",
        DriverRequest::GetNumberId { .. } => "get_number_id",
        DriverRequest::SendMessage { .. } => "send_message",
        DriverRequest::Destroy => "destroy",
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn open_options(options: &ClientOptions) -> Result<OpenClientOptions> {
    let (auth, session_b64, backup_sync_interval_ms) = match &options.auth {
        AuthStrategy::Local => (AuthMode::Local, None, None),
        AuthStrategy::Remote {
            store,
            backup_sync_interval,
        } => {
            let snapshot = match &options.session_id {
                Some(session_id) => store
                    .load(session_id)
                    .await
                    .with_context(|| format!("failed to load stored session '{session_id}'"))?,
                None => None,
            };
            (
                AuthMode::Remote,
                snapshot.map(|blob| STANDARD.encode(blob)),
                Some(millis(*backup_sync_interval)),
            )
        }
    };

    Ok(OpenClientOptions {
        session_id: options.session_id.as_ref().map(ToString::to_string),
        auth,
        session_b64,
        backup_sync_interval_ms,
        headless: options.browser.headless,
        executable_path: options.browser.executable_path.clone(),
        browser_args: options.browser.args.clone(),
        navigation_timeout_ms: millis(options.browser.navigation_timeout),
        takeover_on_conflict: options.takeover_on_conflict,
        qr_max_retries: options.qr_max_retries,
    })
}

/// Maps a wire signal onto [`ClientSignal`]. A saved remote session is
/// written to the store first; the signal is withheld if that write fails so
/// listeners never observe a save that did not happen.
async fn translate_signal(
    signal: DriverSignal,
    store: Option<&dyn SessionStore>,
    session_id: Option<&SessionId>,
) -> Option<ClientSignal> {
    let translated = match signal {
        DriverSignal::Qr { code } => ClientSignal::Qr(code),
        DriverSignal::Ready => ClientSignal::Ready,
        DriverSignal::Authenticated => ClientSignal::Authenticated,
        DriverSignal::AuthFailure { message } => ClientSignal::AuthFailure(message),
        DriverSignal::Disconnected { reason } => ClientSignal::Disconnected(reason),
        DriverSignal::ChangeState { state } => ClientSignal::StateChanged(state),
        DriverSignal::RemoteSessionSaved { session_b64 } => {
            if let (Some(store), Some(session_id), Some(encoded)) =
                (store, session_id, session_b64)
            {
                if let Err(err) = save_session(store, session_id, &encoded).await {
                    warn!(%session_id, error = %err, "bridge: failed to persist remote session");
                    return None;
                }
            }
            ClientSignal::RemoteSessionSaved
        }
    };
    Some(translated)
}

async fn save_session(store: &dyn SessionStore, session_id: &SessionId, encoded: &str) -> Result<()> {
    let blob = STANDARD
        .decode(encoded)
        .context("remote session snapshot is not valid base64")?;
    store.save(session_id, &blob).await
}

#[cfg(test)]
#[path = "tests/bridge_tests.rs"]
mod tests;
