use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    Local,
    Remote,
}

/// Launch parameters forwarded to the automation sidecar when a client is
/// opened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenClientOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub auth: AuthMode,
    /// Previously saved remote session, base64 encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_sync_interval_ms: Option<u64>,
    pub headless: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable_path: Option<String>,
    #[serde(default)]
    pub browser_args: Vec<String>,
    pub navigation_timeout_ms: u64,
    pub takeover_on_conflict: bool,
    pub qr_max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum DriverRequest {
    Open {
        options: OpenClientOptions,
    },
    Initialize,
    OwnAddress,
    GetChats,
    GetChatById {
        chat_id: String,
    },
    GetContactById {
        contact_id: String,
    },
    GetNumberId {
        number: String,
    },
    SendMessage {
        to: String,
        body: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        mentions: Vec<String>,
    },
    Destroy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriverCommand {
    pub request_id: String,
    pub request: DriverRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverReply {
    pub request_id: String,
    pub ok: bool,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum DriverSignal {
    Qr {
        code: String,
    },
    Ready,
    Authenticated,
    AuthFailure {
        message: String,
    },
    Disconnected {
        reason: String,
    },
    ChangeState {
        state: String,
    },
    RemoteSessionSaved {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_b64: Option<String>,
    },
}

/// Everything the sidecar writes back: replies correlated by request id, or
/// unsolicited client signals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum DriverFrame {
    Reply(DriverReply),
    Signal(DriverSignal),
}

/// Session lifecycle notifications pushed to operators over `/events`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    SessionAcquired { session_id: String },
    SessionReleased { session_id: String },
    PairingTokenIssued { session_id: String },
    PairingCompleted { session_id: String },
    PairingFailed { session_id: String, reason: String },
    TeardownFailed { session_id: String, error: String },
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
