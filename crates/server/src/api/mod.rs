use std::sync::Arc;

use chat_driver::SessionStore;
use dispatch_core::{Messenger, SessionError};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ChatId, Contact, DispatchResult, GroupDetail, SessionId},
    error::{ApiError, ErrorCode},
};
use storage::{ContactSnapshotStore, Storage};
use tracing::{info, warn};

#[derive(Clone)]
pub struct ApiContext {
    pub messenger: Arc<Messenger>,
    pub contacts: Arc<dyn ContactSnapshotStore>,
    pub storage: Storage,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PairingResponse {
    pub session_id: SessionId,
    pub token: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct TagRequest {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DirectMessagesRequest {
    pub message: String,
    #[serde(default)]
    pub exclusions: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BroadcastRequest {
    pub addresses: Vec<String>,
    pub messages: Vec<String>,
    #[serde(default)]
    pub exclusions: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ContactBroadcastRequest {
    pub messages: Vec<String>,
    #[serde(default)]
    pub exclusions: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SnapshotResponse {
    pub saved: usize,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SessionListResponse {
    pub active: Vec<SessionId>,
    pub stored: Vec<SessionId>,
}

pub async fn pairing_token(ctx: &ApiContext, session_id: SessionId) -> Result<PairingResponse, ApiError> {
    let token = ctx
        .messenger
        .get_connection_token(&session_id)
        .await
        .map_err(session_error)?;
    Ok(PairingResponse { session_id, token })
}

pub async fn list_groups(ctx: &ApiContext, session_id: SessionId) -> Result<Vec<GroupDetail>, ApiError> {
    ctx.messenger
        .list_groups(&session_id)
        .await
        .map_err(session_error)
}

pub async fn tag_group(
    ctx: &ApiContext,
    session_id: SessionId,
    group_id: ChatId,
    req: TagRequest,
) -> Result<(), ApiError> {
    ctx.messenger
        .tag_everyone_in_group(&session_id, &group_id, req.message.as_deref())
        .await
        .map_err(session_error)
}

pub async fn direct_message_group(
    ctx: &ApiContext,
    session_id: SessionId,
    group_id: ChatId,
    req: DirectMessagesRequest,
) -> Result<DispatchResult, ApiError> {
    ctx.messenger
        .send_direct_messages_to_group_members(&session_id, &group_id, &req.message, &req.exclusions)
        .await
        .map_err(session_error)
}

pub async fn broadcast(
    ctx: &ApiContext,
    session_id: SessionId,
    req: BroadcastRequest,
) -> Result<DispatchResult, ApiError> {
    ctx.messenger
        .broadcast_to_address_list(&session_id, &req.addresses, &req.messages, &req.exclusions)
        .await
        .map_err(session_error)
}

pub async fn snapshot_group_contacts(
    ctx: &ApiContext,
    session_id: SessionId,
    group_id: ChatId,
) -> Result<SnapshotResponse, ApiError> {
    let saved = ctx
        .messenger
        .snapshot_group_contacts(&session_id, &group_id, ctx.contacts.as_ref())
        .await
        .map_err(session_error)?;
    Ok(SnapshotResponse { saved })
}

pub async fn saved_contacts(ctx: &ApiContext) -> Result<Vec<Contact>, ApiError> {
    ctx.contacts.load_contacts().await.map_err(internal)
}

pub async fn broadcast_to_saved_contacts(
    ctx: &ApiContext,
    session_id: SessionId,
    req: ContactBroadcastRequest,
) -> Result<DispatchResult, ApiError> {
    ctx.messenger
        .send_to_saved_contacts(&session_id, ctx.contacts.as_ref(), &req.messages, &req.exclusions)
        .await
        .map_err(session_error)
}

pub async fn list_sessions(ctx: &ApiContext) -> Result<SessionListResponse, ApiError> {
    let stored = ctx.storage.list_sessions().await.map_err(internal)?;
    Ok(SessionListResponse {
        active: ctx.messenger.manager().registry().active_sessions(),
        stored,
    })
}

pub async fn forget_session(ctx: &ApiContext, session_id: SessionId) -> Result<(), ApiError> {
    if ctx.messenger.manager().registry().is_active(&session_id) {
        return Err(session_error(SessionError::SessionBusy(session_id)));
    }
    let Some(saved_at) = ctx
        .storage
        .session_saved_at(&session_id)
        .await
        .map_err(internal)?
    else {
        return Err(ApiError::new(
            ErrorCode::NotFound,
            format!("no stored credentials for session {session_id}"),
        ));
    };
    SessionStore::delete(&ctx.storage, &session_id)
        .await
        .map_err(internal)?;
    info!(%session_id, %saved_at, "api: stored session credentials removed");
    Ok(())
}

fn session_error(err: SessionError) -> ApiError {
    if err.is_connection_failure() {
        warn!(error = %err, "api: session failed to connect");
    }
    ApiError::from(err)
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, format!("{err:#}"))
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
