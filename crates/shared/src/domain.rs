use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Server suffix used by individual accounts.
pub const USER_SERVER: &str = "c.us";
/// Server suffix used by group chats.
pub const GROUP_SERVER: &str = "g.us";

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(SessionId);
id_newtype!(ChatId);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressParseError {
    #[error("address is empty")]
    Empty,
    #[error("address '{0}' is missing the '@server' suffix")]
    MissingServer(String),
    #[error("address '{0}' has an empty user part")]
    EmptyUser(String),
}

/// Platform identity of an account or chat, `user@server`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContactId {
    pub user: String,
    pub server: String,
}

impl ContactId {
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
        }
    }

    pub fn for_user(user: impl Into<String>) -> Self {
        Self::new(user, USER_SERVER)
    }

    pub fn parse(raw: &str) -> Result<Self, AddressParseError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AddressParseError::Empty);
        }
        let Some((user, server)) = raw.split_once('@') else {
            return Err(AddressParseError::MissingServer(raw.to_string()));
        };
        if user.is_empty() {
            return Err(AddressParseError::EmptyUser(raw.to_string()));
        }
        if server.is_empty() {
            return Err(AddressParseError::MissingServer(raw.to_string()));
        }
        Ok(Self::new(user, server.to_ascii_lowercase()))
    }

    pub fn serialized(&self) -> String {
        format!("{}@{}", self.user, self.server)
    }

    pub fn address(&self) -> RecipientAddress {
        RecipientAddress(self.serialized())
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.server)
    }
}

/// Normalized, platform-native recipient identifier. Only constructed from a
/// parsed [`ContactId`], so two addresses compare equal exactly when they
/// reach the same account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecipientAddress(String);

impl RecipientAddress {
    pub fn parse(raw: &str) -> Result<Self, AddressParseError> {
        ContactId::parse(raw).map(|id| id.address())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecipientAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RecipientAddress {
    type Error = AddressParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RecipientAddress> for String {
    fn from(value: RecipientAddress) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ContactId,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub is_super_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    #[serde(default)]
    pub name: String,
    pub is_group: bool,
    /// Only populated for group chats; `None` when the platform did not
    /// return a participant list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<Participant>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    #[serde(default)]
    pub is_my_contact: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDetail {
    pub id: ChatId,
    pub name: String,
    pub participant_count: usize,
}

impl GroupDetail {
    pub fn from_chat(chat: &Chat) -> Option<Self> {
        chat.is_group.then(|| Self {
            id: chat.id.clone(),
            name: chat.name.clone(),
            participant_count: chat.participants.as_ref().map_or(0, Vec::len),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchFailure {
    pub recipient: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: Vec<DispatchFailure>,
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
