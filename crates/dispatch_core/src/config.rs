use std::time::Duration;

use chat_driver::{BrowserOptions, REMOTE_BROWSER_ARGS};
use shared::domain::SessionId;

pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_SEND_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_PAIRING_WINDOW: Duration = Duration::from_secs(300);
pub const DEFAULT_BACKUP_SYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Where the chat client keeps its credentials between operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Persistence {
    Local,
    Remote {
        store_uri: String,
        backup_sync_interval: Duration,
    },
}

impl Persistence {
    pub fn remote(store_uri: impl Into<String>) -> Self {
        Self::Remote {
            store_uri: store_uri.into(),
            backup_sync_interval: DEFAULT_BACKUP_SYNC_INTERVAL,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

/// Everything needed to bring one session from created to ready.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session_id: SessionId,
    pub persistence: Persistence,
    pub browser: BrowserOptions,
    pub ready_timeout: Duration,
    /// Extra wait after `ready` for state the automation layer propagates late.
    pub settle_delay: Option<Duration>,
    /// How long a pairing session waits for its credentials to be saved.
    pub pairing_window: Duration,
    pub takeover_on_conflict: bool,
    pub qr_max_retries: u32,
}

impl SessionConfig {
    pub fn local(session_id: impl Into<SessionId>) -> Self {
        EngineConfig::default().session(session_id.into())
    }

    pub fn remote(session_id: impl Into<SessionId>, store_uri: impl Into<String>) -> Self {
        EngineConfig::remote(store_uri).session(session_id.into())
    }
}

/// Engine-wide defaults from which per-session configs are stamped out.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub persistence: Persistence,
    pub browser: BrowserOptions,
    pub ready_timeout: Duration,
    pub settle_delay: Option<Duration>,
    pub pairing_window: Duration,
    pub takeover_on_conflict: bool,
    pub qr_max_retries: u32,
    pub dispatch: DispatchSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            persistence: Persistence::Local,
            browser: BrowserOptions::default(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            settle_delay: Some(DEFAULT_SETTLE_DELAY),
            pairing_window: DEFAULT_PAIRING_WINDOW,
            takeover_on_conflict: true,
            qr_max_retries: 1,
            dispatch: DispatchSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn remote(store_uri: impl Into<String>) -> Self {
        Self {
            persistence: Persistence::remote(store_uri),
            browser: BrowserOptions {
                args: REMOTE_BROWSER_ARGS.iter().map(|arg| arg.to_string()).collect(),
                ..BrowserOptions::default()
            },
            ..Self::default()
        }
    }

    pub fn session(&self, session_id: SessionId) -> SessionConfig {
        SessionConfig {
            session_id,
            persistence: self.persistence.clone(),
            browser: self.browser.clone(),
            ready_timeout: self.ready_timeout,
            settle_delay: self.settle_delay,
            pairing_window: self.pairing_window,
            takeover_on_conflict: self.takeover_on_conflict,
            qr_max_retries: self.qr_max_retries,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Minimum wait before every non-skipped send, including the first.
    pub send_interval: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            send_interval: DEFAULT_SEND_INTERVAL,
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
