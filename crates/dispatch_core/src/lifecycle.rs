//! Brings a chat client from created to ready exactly once per operation and
//! guarantees its teardown.
//!
//! Readiness is a race between the client's `ready` signal, an auth failure,
//! a failed `initialize()` call and a wall-clock deadline. The race is settled
//! by a [`ReadinessArbiter`]: the first event offered while initializing wins,
//! everything after it is ignored.

use std::{future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use anyhow::anyhow;
use chat_driver::{
    AuthStrategy, ChatClient, ChatClientConnector, ClientOptions, ClientSignal, SessionStore,
    SessionStoreConnector,
};
use futures::FutureExt;
use shared::domain::{RecipientAddress, SessionId};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::{Persistence, SessionConfig},
    error::SessionError,
    registry::{SessionEvent, SessionRegistry},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Initializing,
    Ready,
    /// A pairing token was handed out; waiting for the credentials to be saved.
    AwaitingPairing,
    AuthFailed,
    TimedOut,
    Failed,
}

/// What the caller is waiting for while the client initializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessGoal {
    Ready,
    PairingToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessEvent {
    Ready,
    Qr(String),
    AuthFailure(String),
    Timeout,
    InitializeFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    Ready,
    PairingToken(String),
    /// `ready` arrived while a pairing token was expected.
    AlreadyPaired,
    AuthFailed(String),
    TimedOut,
    Failed,
}

#[derive(Debug)]
pub struct ReadinessArbiter {
    goal: ReadinessGoal,
    state: ConnectionState,
    outcome: Option<ReadinessOutcome>,
}

impl ReadinessArbiter {
    pub fn new(goal: ReadinessGoal) -> Self {
        Self {
            goal,
            state: ConnectionState::Created,
            outcome: None,
        }
    }

    pub fn begin(&mut self) {
        if self.state == ConnectionState::Created {
            self.state = ConnectionState::Initializing;
        }
    }

    /// Returns `true` when the event settled the race.
    pub fn offer(&mut self, event: ReadinessEvent) -> bool {
        if self.state != ConnectionState::Initializing {
            return false;
        }
        let (state, outcome) = match (self.goal, event) {
            (ReadinessGoal::Ready, ReadinessEvent::Ready) => {
                (ConnectionState::Ready, ReadinessOutcome::Ready)
            }
            (ReadinessGoal::PairingToken, ReadinessEvent::Ready) => {
                (ConnectionState::Ready, ReadinessOutcome::AlreadyPaired)
            }
            (ReadinessGoal::PairingToken, ReadinessEvent::Qr(code)) => (
                ConnectionState::AwaitingPairing,
                ReadinessOutcome::PairingToken(code),
            ),
            (ReadinessGoal::Ready, ReadinessEvent::Qr(_)) => return false,
            (_, ReadinessEvent::AuthFailure(message)) => (
                ConnectionState::AuthFailed,
                ReadinessOutcome::AuthFailed(message),
            ),
            (_, ReadinessEvent::Timeout) => (ConnectionState::TimedOut, ReadinessOutcome::TimedOut),
            (_, ReadinessEvent::InitializeFailed) => {
                (ConnectionState::Failed, ReadinessOutcome::Failed)
            }
        };
        self.state = state;
        self.outcome = Some(outcome);
        true
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn outcome(&self) -> Option<&ReadinessOutcome> {
        self.outcome.as_ref()
    }
}

/// A client that reached `ready`, as handed to a unit of work.
#[derive(Clone)]
pub struct ReadyConnection {
    pub session_id: SessionId,
    pub client: Arc<dyn ChatClient>,
    pub own_address: RecipientAddress,
}

/// Exclusive owner of one session's client and persistence resource.
///
/// Teardown runs once: explicitly through [`ConnectionHandle::release`], or
/// scheduled on the runtime when the handle is dropped unreleased.
pub struct ConnectionHandle {
    session_id: SessionId,
    state: ConnectionState,
    client: Option<Arc<dyn ChatClient>>,
    store: Option<Arc<dyn SessionStore>>,
    ready: Option<ReadyConnection>,
    registry: Arc<SessionRegistry>,
    released: bool,
}

impl ConnectionHandle {
    fn new(session_id: SessionId, registry: Arc<SessionRegistry>) -> Self {
        Self {
            session_id,
            state: ConnectionState::Created,
            client: None,
            store: None,
            ready: None,
            registry,
            released: false,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Only `Some` once the handle reached [`ConnectionState::Ready`].
    pub fn connection(&self) -> Option<&ReadyConnection> {
        self.ready.as_ref()
    }

    /// Destroys the client, disconnects the persistence resource and frees
    /// the session id. Failures are logged and reported, never returned.
    pub async fn release(mut self) {
        if let Some(teardown) = self.take_teardown() {
            teardown.run().await;
        }
    }

    fn take_teardown(&mut self) -> Option<Teardown> {
        if self.released {
            return None;
        }
        self.released = true;
        self.ready = None;
        Some(Teardown {
            session_id: self.session_id.clone(),
            client: self.client.take(),
            store: self.store.take(),
            registry: Arc::clone(&self.registry),
        })
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        let Some(teardown) = self.take_teardown() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(session_id = %self.session_id, "session: scheduling teardown of dropped handle");
                runtime.spawn(teardown.run());
            }
            Err(_) => {
                error!(session_id = %self.session_id, "session: handle dropped outside a runtime; client not destroyed");
                self.registry.evict(&self.session_id);
            }
        }
    }
}

struct Teardown {
    session_id: SessionId,
    client: Option<Arc<dyn ChatClient>>,
    store: Option<Arc<dyn SessionStore>>,
    registry: Arc<SessionRegistry>,
}

impl Teardown {
    async fn run(self) {
        let session_id = self.session_id;
        if let Some(client) = self.client {
            if let Err(err) = client.destroy().await {
                warn!(%session_id, error = %format!("{err:#}"), "session: client destroy failed");
                self.registry.report(SessionEvent::TeardownFailed {
                    session_id: session_id.clone(),
                    error: format!("{err:#}"),
                });
            }
        }
        if let Some(store) = self.store {
            if let Err(err) = store.disconnect().await {
                error!(%session_id, error = %format!("{err:#}"), "session: store disconnect failed");
                self.registry.report(SessionEvent::TeardownFailed {
                    session_id: session_id.clone(),
                    error: format!("{err:#}"),
                });
            }
        }
        self.registry.evict(&session_id);
        info!(%session_id, "session: released");
    }
}

enum Settled {
    Ready,
    PairingToken(String),
}

/// Opens sessions against a chat driver and an optional session store.
pub struct ConnectionManager {
    connector: Arc<dyn ChatClientConnector>,
    store_connector: Arc<dyn SessionStoreConnector>,
    registry: Arc<SessionRegistry>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn ChatClientConnector>,
        store_connector: Arc<dyn SessionStoreConnector>,
    ) -> Self {
        Self {
            connector,
            store_connector,
            registry: Arc::new(SessionRegistry::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Resolves once the client reported `ready`, the optional settle delay
    /// elapsed and the own address is known. Every failure path tears the
    /// session down before returning.
    pub async fn acquire_ready(
        &self,
        config: &SessionConfig,
    ) -> Result<ConnectionHandle, SessionError> {
        let (mut handle, client) = self.open(config).await?;
        let session_id = config.session_id.clone();

        let signals = client.subscribe_signals();
        info!(%session_id, timeout_secs = config.ready_timeout.as_secs(), "session: initializing");
        let (state, settled) = race_readiness(
            client.as_ref(),
            signals,
            ReadinessGoal::Ready,
            config.ready_timeout,
            &session_id,
        )
        .await;
        handle.state = state;
        if let Err(err) = settled {
            error!(%session_id, ?state, error = %err, "session: failed to become ready");
            return abandon(handle, err).await;
        }

        if let Some(delay) = config.settle_delay {
            debug!(%session_id, delay_ms = delay.as_millis() as u64, "session: settling");
            sleep(delay).await;
        }

        let own_address = match client.own_address().await {
            Ok(id) => id.address(),
            Err(err) => {
                handle.state = ConnectionState::Failed;
                let err = SessionError::Initialization(err.context("failed to read own address"));
                return abandon(handle, err).await;
            }
        };

        handle.ready = Some(ReadyConnection {
            session_id: session_id.clone(),
            client,
            own_address,
        });
        self.registry.report(SessionEvent::Acquired {
            session_id: session_id.clone(),
        });
        info!(%session_id, "session: ready");
        Ok(handle)
    }

    pub async fn release(&self, handle: ConnectionHandle) {
        handle.release().await;
    }

    /// Runs `body` against a ready connection and always releases it
    /// afterwards. A body error is returned unchanged; a panicking body is
    /// resumed after teardown.
    pub async fn with_session<T, F, Fut>(
        &self,
        config: &SessionConfig,
        body: F,
    ) -> Result<T, SessionError>
    where
        F: FnOnce(ReadyConnection) -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        let handle = self.acquire_ready(config).await?;
        let Some(connection) = handle.connection().cloned() else {
            handle.release().await;
            return Err(SessionError::Other(anyhow!(
                "session {} acquired without a ready connection",
                config.session_id
            )));
        };

        let outcome = AssertUnwindSafe(body(connection)).catch_unwind().await;
        handle.release().await;
        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Starts a remote-persisted session and returns the first pairing token
    /// the client emits. The session stays open in a background task tracked
    /// by the registry until its credentials are saved or the pairing window
    /// closes.
    pub async fn acquire_pairing_token(&self, config: &SessionConfig) -> Result<String, SessionError> {
        if !config.persistence.is_remote() {
            return Err(SessionError::InvalidRequest(
                "pairing requires a remote session store".to_string(),
            ));
        }
        let (mut handle, client) = self.open(config).await?;
        let session_id = config.session_id.clone();

        let signals = client.subscribe_signals();
        let watch = client.subscribe_signals();
        info!(%session_id, "session: initializing for pairing");
        let (state, settled) = race_readiness(
            client.as_ref(),
            signals,
            ReadinessGoal::PairingToken,
            config.ready_timeout,
            &session_id,
        )
        .await;
        handle.state = state;

        match settled {
            Ok(Settled::PairingToken(token)) => {
                self.registry.report(SessionEvent::PairingTokenIssued {
                    session_id: session_id.clone(),
                });
                info!(%session_id, window_secs = config.pairing_window.as_secs(), "session: pairing token issued");
                self.registry.spawn_pairing(
                    &session_id,
                    watch_pairing(handle, watch, config.pairing_window),
                );
                Ok(token)
            }
            Ok(Settled::Ready) => {
                abandon(handle, SessionError::AlreadyPaired(session_id)).await
            }
            Err(err) => {
                warn!(%session_id, ?state, error = %err, "session: pairing failed");
                abandon(handle, err).await
            }
        }
    }

    /// Claims the session id, connects the persistence resource when needed
    /// and connects the client. The returned handle owns both.
    async fn open(
        &self,
        config: &SessionConfig,
    ) -> Result<(ConnectionHandle, Arc<dyn ChatClient>), SessionError> {
        let session_id = config.session_id.clone();
        if !self.registry.claim(&session_id) {
            return Err(SessionError::SessionBusy(session_id));
        }
        let mut handle = ConnectionHandle::new(session_id.clone(), Arc::clone(&self.registry));

        let auth = match &config.persistence {
            Persistence::Local => AuthStrategy::Local,
            Persistence::Remote {
                store_uri,
                backup_sync_interval,
            } => match self.store_connector.connect(store_uri).await {
                Ok(store) => {
                    handle.store = Some(Arc::clone(&store));
                    AuthStrategy::Remote {
                        store,
                        backup_sync_interval: *backup_sync_interval,
                    }
                }
                Err(err) => {
                    handle.state = ConnectionState::Failed;
                    return abandon(handle, SessionError::Store(err)).await;
                }
            },
        };

        let options = ClientOptions {
            session_id: Some(session_id.clone()),
            auth,
            browser: config.browser.clone(),
            takeover_on_conflict: config.takeover_on_conflict,
            qr_max_retries: config.qr_max_retries,
        };
        match self.connector.connect(options).await {
            Ok(client) => {
                handle.client = Some(Arc::clone(&client));
                debug!(%session_id, "session: client connected");
                Ok((handle, client))
            }
            Err(err) => {
                handle.state = ConnectionState::Failed;
                let err = SessionError::Initialization(err.context("failed to connect chat client"));
                abandon(handle, err).await
            }
        }
    }
}

async fn abandon<T>(handle: ConnectionHandle, err: SessionError) -> Result<T, SessionError> {
    handle.release().await;
    Err(err)
}

/// Drives `initialize()` against the signal stream and the deadline until the
/// arbiter settles. `signals` must be subscribed before this is called.
async fn race_readiness(
    client: &dyn ChatClient,
    mut signals: broadcast::Receiver<ClientSignal>,
    goal: ReadinessGoal,
    ready_timeout: Duration,
    session_id: &SessionId,
) -> (ConnectionState, Result<Settled, SessionError>) {
    let mut arbiter = ReadinessArbiter::new(goal);
    arbiter.begin();

    let mut initialize = client.initialize();
    let mut initialized = false;
    let mut init_error = None;
    let deadline = sleep(ready_timeout);
    tokio::pin!(deadline);

    while arbiter.outcome().is_none() {
        let event = tokio::select! {
            result = &mut initialize, if !initialized => {
                initialized = true;
                match result {
                    Ok(()) => continue,
                    Err(err) => {
                        init_error = Some(err);
                        ReadinessEvent::InitializeFailed
                    }
                }
            }
            signal = signals.recv() => match signal {
                Ok(ClientSignal::Ready) => ReadinessEvent::Ready,
                Ok(ClientSignal::Qr(code)) => {
                    if goal == ReadinessGoal::Ready {
                        warn!(%session_id, "session: not paired; waiting for the pairing code to be scanned");
                    }
                    ReadinessEvent::Qr(code)
                }
                Ok(ClientSignal::AuthFailure(message)) => ReadinessEvent::AuthFailure(message),
                Ok(ClientSignal::Authenticated) => {
                    info!(%session_id, "session: authenticated");
                    continue;
                }
                Ok(ClientSignal::Disconnected(reason)) => {
                    warn!(%session_id, %reason, "session: client disconnected while initializing");
                    continue;
                }
                Ok(ClientSignal::StateChanged(state)) => {
                    debug!(%session_id, %state, "session: client state changed");
                    continue;
                }
                Ok(ClientSignal::RemoteSessionSaved) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%session_id, skipped, "session: signal receiver lagged");
                    continue;
                }
                Err(RecvError::Closed) => {
                    init_error = Some(anyhow!("client signal channel closed"));
                    ReadinessEvent::InitializeFailed
                }
            },
            _ = &mut deadline => ReadinessEvent::Timeout,
        };
        arbiter.offer(event);
    }

    let result = match arbiter.outcome() {
        Some(ReadinessOutcome::Ready) => Ok(Settled::Ready),
        Some(ReadinessOutcome::PairingToken(token)) => Ok(Settled::PairingToken(token.clone())),
        Some(ReadinessOutcome::AlreadyPaired) => Err(SessionError::AlreadyPaired(session_id.clone())),
        Some(ReadinessOutcome::AuthFailed(message)) => Err(SessionError::AuthFailure {
            session_id: session_id.clone(),
            message: message.clone(),
        }),
        Some(ReadinessOutcome::TimedOut) => Err(SessionError::InitializationTimeout {
            after: ready_timeout,
        }),
        Some(ReadinessOutcome::Failed) | None => Err(SessionError::Initialization(
            init_error.unwrap_or_else(|| anyhow!("client initialization failed")),
        )),
    };
    (arbiter.state(), result)
}

/// Keeps a paired-but-unsaved session open until the client confirms its
/// credentials were stored, then releases it.
async fn watch_pairing(
    mut handle: ConnectionHandle,
    mut signals: broadcast::Receiver<ClientSignal>,
    window: Duration,
) {
    let session_id = handle.session_id.clone();
    let saved = async {
        loop {
            match signals.recv().await {
                Ok(ClientSignal::RemoteSessionSaved) => return Ok(()),
                Ok(ClientSignal::AuthFailure(message)) => {
                    return Err(format!("authentication failed: {message}"))
                }
                Ok(ClientSignal::Disconnected(reason)) => {
                    return Err(format!("client disconnected: {reason}"))
                }
                Ok(ClientSignal::Ready) => {
                    info!(%session_id, "session: paired; waiting for credentials to be saved")
                }
                Ok(other) => debug!(%session_id, signal = ?other, "session: pairing signal"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%session_id, skipped, "session: pairing receiver lagged")
                }
                Err(RecvError::Closed) => return Err("client signal channel closed".to_string()),
            }
        }
    };
    let outcome = timeout(window, saved).await.unwrap_or_else(|_| {
        Err(format!(
            "no session saved within {}s",
            window.as_secs()
        ))
    });

    handle.state = if outcome.is_ok() {
        ConnectionState::Ready
    } else {
        ConnectionState::Failed
    };
    let registry = Arc::clone(&handle.registry);
    handle.release().await;

    match outcome {
        Ok(()) => {
            info!(%session_id, "session: pairing completed");
            registry.report(SessionEvent::PairingCompleted { session_id });
        }
        Err(reason) => {
            warn!(%session_id, %reason, "session: pairing failed");
            registry.report(SessionEvent::PairingFailed { session_id, reason });
        }
    }
}

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod tests;
