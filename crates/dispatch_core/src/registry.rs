use std::{
    collections::HashMap,
    future::Future,
    sync::{Mutex, PoisonError},
};

use shared::domain::SessionId;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle notifications for operators; delivery is best effort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Acquired { session_id: SessionId },
    Released { session_id: SessionId },
    PairingTokenIssued { session_id: SessionId },
    PairingCompleted { session_id: SessionId },
    PairingFailed { session_id: SessionId, reason: String },
    TeardownFailed { session_id: SessionId, error: String },
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Acquired { session_id }
            | Self::Released { session_id }
            | Self::PairingTokenIssued { session_id }
            | Self::PairingCompleted { session_id }
            | Self::PairingFailed { session_id, .. }
            | Self::TeardownFailed { session_id, .. } => session_id,
        }
    }
}

#[derive(Debug)]
enum SessionSlot {
    Operation,
    Pairing(JoinHandle<()>),
}

/// Tracks which session ids are currently held by an operation or a detached
/// pairing task. At most one holder per id.
pub struct SessionRegistry {
    slots: Mutex<HashMap<SessionId, SessionSlot>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            slots: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Returns `false` when the id is already held.
    pub fn claim(&self, session_id: &SessionId) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.contains_key(session_id) {
            return false;
        }
        slots.insert(session_id.clone(), SessionSlot::Operation);
        debug!(%session_id, "registry: session claimed");
        true
    }

    /// Spawns `task` and hands the session's slot over to it. The slot is
    /// swapped while the lock is held, so the task cannot evict itself (and
    /// a new claim cannot land) before its handle is recorded.
    pub fn spawn_pairing<F>(&self, session_id: &SessionId, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(task);
        slots.insert(session_id.clone(), SessionSlot::Pairing(handle));
        debug!(%session_id, "registry: slot handed to pairing task");
    }

    pub fn evict(&self, session_id: &SessionId) {
        let removed = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        if removed.is_some() {
            self.report(SessionEvent::Released {
                session_id: session_id.clone(),
            });
        }
    }

    pub fn is_active(&self, session_id: &SessionId) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(session_id)
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn pending_pairings(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| matches!(slot, SessionSlot::Pairing(_)))
            .count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn report(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Aborts every pending pairing task. Aborted tasks drop their connection
    /// handle, which schedules its teardown. Slots held by running operations
    /// stay until those operations release them.
    pub fn shutdown(&self) {
        let drained: Vec<(SessionId, JoinHandle<()>)> = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            let pairing: Vec<SessionId> = slots
                .iter()
                .filter(|(_, slot)| matches!(slot, SessionSlot::Pairing(_)))
                .map(|(session_id, _)| session_id.clone())
                .collect();
            pairing
                .into_iter()
                .filter_map(|session_id| match slots.remove(&session_id) {
                    Some(SessionSlot::Pairing(task)) => Some((session_id, task)),
                    _ => None,
                })
                .collect()
        };
        for (session_id, task) in drained {
            task.abort();
            info!(%session_id, "registry: pairing task aborted");
        }
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
