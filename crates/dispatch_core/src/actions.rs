use chat_driver::SendOptions;
use shared::domain::{ChatId, Contact, ContactId, DispatchResult, GroupDetail, Participant, SessionId};
use storage::ContactSnapshotStore;
use tracing::info;

use crate::{
    config::{EngineConfig, SessionConfig},
    dispatch::dispatch,
    error::SessionError,
    lifecycle::ConnectionManager,
    resolver::{load_group, participant_entries, resolve_recipients, ExclusionSet},
};

pub const DEFAULT_TAG_MESSAGE: &str = "Attention everyone:";
pub const MESSAGE_SEPARATOR: &str = "\n\n";

/// The operations exposed to callers. Each one runs inside its own scoped
/// session; nothing is shared between calls except the registry.
pub struct Messenger {
    manager: ConnectionManager,
    config: EngineConfig,
}

impl Messenger {
    pub fn new(manager: ConnectionManager, config: EngineConfig) -> Self {
        Self { manager, config }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn session(&self, session_id: &SessionId) -> SessionConfig {
        self.config.session(session_id.clone())
    }

    pub async fn get_connection_token(&self, session_id: &SessionId) -> Result<String, SessionError> {
        self.manager
            .acquire_pairing_token(&self.session(session_id))
            .await
    }

    pub async fn list_groups(&self, session_id: &SessionId) -> Result<Vec<GroupDetail>, SessionError> {
        self.manager
            .with_session(&self.session(session_id), |conn| async move {
                let chats = conn.client.chats().await?;
                Ok(chats.iter().filter_map(GroupDetail::from_chat).collect())
            })
            .await
    }

    /// Sends one message to the group mentioning every participant.
    pub async fn tag_everyone_in_group(
        &self,
        session_id: &SessionId,
        group_id: &ChatId,
        message: Option<&str>,
    ) -> Result<(), SessionError> {
        let message = message
            .filter(|message| !message.trim().is_empty())
            .unwrap_or(DEFAULT_TAG_MESSAGE);
        self.manager
            .with_session(&self.session(session_id), |conn| async move {
                let participants = load_group(conn.client.as_ref(), group_id).await?;
                let (body, mentions) = mention_everyone(message, &participants);
                conn.client
                    .send_message(group_id.as_str(), &body, SendOptions { mentions })
                    .await?;
                info!(%session_id, %group_id, mentioned = participants.len(), "actions: tagged group");
                Ok(())
            })
            .await
    }

    pub async fn send_direct_messages_to_group_members(
        &self,
        session_id: &SessionId,
        group_id: &ChatId,
        message: &str,
        exclusions: &[String],
    ) -> Result<DispatchResult, SessionError> {
        if message.trim().is_empty() {
            return Err(SessionError::InvalidRequest("message must not be empty".to_string()));
        }
        let settings = self.config.dispatch;
        self.manager
            .with_session(&self.session(session_id), |conn| async move {
                let participants = load_group(conn.client.as_ref(), group_id).await?;
                let recipients = participant_entries(&participants);
                let exclusions = ExclusionSet::resolve(conn.client.as_ref(), exclusions).await?;
                Ok(dispatch(
                    conn.client.as_ref(),
                    &recipients,
                    message,
                    &conn.own_address,
                    &exclusions,
                    &settings,
                )
                .await)
            })
            .await
    }

    pub async fn broadcast_to_address_list(
        &self,
        session_id: &SessionId,
        addresses: &[String],
        messages: &[String],
        exclusions: &[String],
    ) -> Result<DispatchResult, SessionError> {
        if addresses.is_empty() {
            return Err(SessionError::InvalidRequest(
                "address list must not be empty".to_string(),
            ));
        }
        let body = compose_message(messages)?;
        self.dispatch_to_raw(session_id, addresses, &body, exclusions)
            .await
    }

    /// Full contact record of every participant. Any failed lookup fails the
    /// whole call.
    pub async fn group_contacts(
        &self,
        session_id: &SessionId,
        group_id: &ChatId,
    ) -> Result<Vec<Contact>, SessionError> {
        self.manager
            .with_session(&self.session(session_id), |conn| async move {
                let participants = load_group(conn.client.as_ref(), group_id).await?;
                let mut contacts = Vec::with_capacity(participants.len());
                for participant in &participants {
                    let contact = conn
                        .client
                        .contact_by_id(&participant.id.serialized())
                        .await
                        .map_err(|err| {
                            err.context(format!("failed to fetch contact {}", participant.id))
                        })?;
                    contacts.push(contact);
                }
                Ok(contacts)
            })
            .await
    }

    /// Captures the group's contacts into `store`, replacing any earlier
    /// snapshot. Returns the number of contacts saved.
    pub async fn snapshot_group_contacts(
        &self,
        session_id: &SessionId,
        group_id: &ChatId,
        store: &dyn ContactSnapshotStore,
    ) -> Result<usize, SessionError> {
        let contacts = self.group_contacts(session_id, group_id).await?;
        store.save_contacts(&contacts).await?;
        info!(%session_id, %group_id, count = contacts.len(), "actions: contact snapshot saved");
        Ok(contacts.len())
    }

    pub async fn send_to_contacts(
        &self,
        session_id: &SessionId,
        contacts: &[Contact],
        messages: &[String],
        exclusions: &[String],
    ) -> Result<DispatchResult, SessionError> {
        if contacts.is_empty() {
            return Err(SessionError::InvalidRequest(
                "contact list must not be empty".to_string(),
            ));
        }
        let body = compose_message(messages)?;
        let addresses: Vec<String> = contacts.iter().map(|contact| contact.id.serialized()).collect();
        self.dispatch_to_raw(session_id, &addresses, &body, exclusions)
            .await
    }

    pub async fn send_to_saved_contacts(
        &self,
        session_id: &SessionId,
        store: &dyn ContactSnapshotStore,
        messages: &[String],
        exclusions: &[String],
    ) -> Result<DispatchResult, SessionError> {
        let contacts = store.load_contacts().await?;
        self.send_to_contacts(session_id, &contacts, messages, exclusions)
            .await
    }

    async fn dispatch_to_raw(
        &self,
        session_id: &SessionId,
        addresses: &[String],
        body: &str,
        exclusions: &[String],
    ) -> Result<DispatchResult, SessionError> {
        let settings = self.config.dispatch;
        self.manager
            .with_session(&self.session(session_id), |conn| async move {
                let recipients = resolve_recipients(conn.client.as_ref(), addresses).await;
                let exclusions = ExclusionSet::resolve(conn.client.as_ref(), exclusions).await?;
                Ok(dispatch(
                    conn.client.as_ref(),
                    &recipients,
                    body,
                    &conn.own_address,
                    &exclusions,
                    &settings,
                )
                .await)
            })
            .await
    }
}

/// Joins message parts with a blank line. Rejects an empty list or a list
/// with no visible text.
pub fn compose_message(messages: &[String]) -> Result<String, SessionError> {
    if messages.iter().all(|message| message.trim().is_empty()) {
        return Err(SessionError::InvalidRequest(
            "at least one non-empty message is required".to_string(),
        ));
    }
    Ok(messages.join(MESSAGE_SEPARATOR))
}

/// Builds `"{message}\n\n@u1 @u2 ..."` and the matching mention list.
pub fn mention_everyone(message: &str, participants: &[Participant]) -> (String, Vec<ContactId>) {
    let mentions: Vec<ContactId> = participants
        .iter()
        .map(|participant| ContactId::for_user(participant.id.user.clone()))
        .collect();
    let tags = mentions
        .iter()
        .map(|id| format!("@{}", id.user))
        .collect::<Vec<_>>()
        .join(" ");
    (format!("{message}{MESSAGE_SEPARATOR}{tags}"), mentions)
}

#[cfg(test)]
#[path = "tests/actions_tests.rs"]
mod tests;
