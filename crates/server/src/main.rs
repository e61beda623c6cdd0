use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{DefaultBodyLimit, Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chat_driver::BridgeConnector;
use dispatch_core::{ConnectionManager, Messenger, SessionEvent};
use shared::{
    domain::{ChatId, Contact, DispatchResult, GroupDetail, SessionId},
    error::{ApiError, ErrorCode},
    protocol::ServerEvent,
};
use storage::{ContactSnapshotStore, JsonContactFile, SqliteSessionStoreConnector, Storage};
use tokio::sync::broadcast;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};

mod api;
mod config;

use api::{
    ApiContext, BroadcastRequest, ContactBroadcastRequest, DirectMessagesRequest, PairingResponse,
    SessionListResponse, SnapshotResponse, TagRequest,
};
use config::{load_settings, prepare_database_url};

const MAX_REQUEST_BYTES: usize = 1024 * 1024;

type HttpError = (StatusCode, Json<ApiError>);

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    events: broadcast::Sender<ServerEvent>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let connector = BridgeConnector::new(&settings.driver_url)?
        .with_request_timeout(Duration::from_secs(settings.driver_request_timeout_secs));
    let manager = ConnectionManager::new(Arc::new(connector), Arc::new(SqliteSessionStoreConnector));
    let messenger = Arc::new(Messenger::new(manager, settings.engine_config(&database_url)));
    let contacts: Arc<dyn ContactSnapshotStore> = match &settings.contacts_path {
        Some(path) => Arc::new(JsonContactFile::new(path)),
        None => Arc::new(storage.clone()),
    };

    let (events, _) = broadcast::channel(256);
    tokio::spawn(forward_session_events(
        messenger.manager().registry().subscribe(),
        events.clone(),
    ));

    let state = AppState {
        api: ApiContext {
            messenger: Arc::clone(&messenger),
            contacts,
            storage,
        },
        events,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, driver_url = %settings.driver_url, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    messenger.manager().registry().shutdown();
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sessions", get(http_list_sessions))
        .route("/sessions/:session_id", delete(http_forget_session))
        .route("/sessions/:session_id/pairing", post(http_pairing))
        .route("/sessions/:session_id/groups", get(http_list_groups))
        .route("/sessions/:session_id/groups/:group_id/tag", post(http_tag_group))
        .route(
            "/sessions/:session_id/groups/:group_id/direct-messages",
            post(http_direct_messages),
        )
        .route(
            "/sessions/:session_id/groups/:group_id/contacts/snapshot",
            post(http_snapshot_contacts),
        )
        .route("/sessions/:session_id/broadcasts", post(http_broadcast))
        .route(
            "/sessions/:session_id/contacts/broadcast",
            post(http_broadcast_contacts),
        )
        .route("/contacts", get(http_saved_contacts))
        .route("/events", get(ws_handler))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn http_error(err: ApiError) -> HttpError {
    (status_for(err.code), Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.api.storage.health_check().await.map_err(|e| {
        http_error(ApiError::new(ErrorCode::Unavailable, e.to_string()))
    })?;
    Ok("ok")
}

async fn http_list_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SessionListResponse>, HttpError> {
    let sessions = api::list_sessions(&state.api).await.map_err(http_error)?;
    Ok(Json(sessions))
}

async fn http_forget_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, HttpError> {
    api::forget_session(&state.api, SessionId(session_id))
        .await
        .map_err(http_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_pairing(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<PairingResponse>, HttpError> {
    let pairing = api::pairing_token(&state.api, SessionId(session_id))
        .await
        .map_err(http_error)?;
    Ok(Json(pairing))
}

async fn http_list_groups(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<GroupDetail>>, HttpError> {
    let groups = api::list_groups(&state.api, SessionId(session_id))
        .await
        .map_err(http_error)?;
    Ok(Json(groups))
}

async fn http_tag_group(
    State(state): State<Arc<AppState>>,
    Path((session_id, group_id)): Path<(String, String)>,
    req: Option<Json<TagRequest>>,
) -> Result<StatusCode, HttpError> {
    let req = req.map(|Json(req)| req).unwrap_or_default();
    api::tag_group(&state.api, SessionId(session_id), ChatId(group_id), req)
        .await
        .map_err(http_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_direct_messages(
    State(state): State<Arc<AppState>>,
    Path((session_id, group_id)): Path<(String, String)>,
    Json(req): Json<DirectMessagesRequest>,
) -> Result<Json<DispatchResult>, HttpError> {
    let result = api::direct_message_group(&state.api, SessionId(session_id), ChatId(group_id), req)
        .await
        .map_err(http_error)?;
    Ok(Json(result))
}

async fn http_snapshot_contacts(
    State(state): State<Arc<AppState>>,
    Path((session_id, group_id)): Path<(String, String)>,
) -> Result<Json<SnapshotResponse>, HttpError> {
    let saved = api::snapshot_group_contacts(&state.api, SessionId(session_id), ChatId(group_id))
        .await
        .map_err(http_error)?;
    Ok(Json(saved))
}

async fn http_broadcast(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<BroadcastRequest>,
) -> Result<Json<DispatchResult>, HttpError> {
    let result = api::broadcast(&state.api, SessionId(session_id), req)
        .await
        .map_err(http_error)?;
    Ok(Json(result))
}

async fn http_broadcast_contacts(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<ContactBroadcastRequest>,
) -> Result<Json<DispatchResult>, HttpError> {
    let result = api::broadcast_to_saved_contacts(&state.api, SessionId(session_id), req)
        .await
        .map_err(http_error)?;
    Ok(Json(result))
}

async fn http_saved_contacts(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Contact>>, HttpError> {
    let contacts = api::saved_contacts(&state.api).await.map_err(http_error)?;
    Ok(Json(contacts))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: axum::extract::ws::WebSocket) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.events.subscribe();

    let send_task = tokio::spawn(async move {
        while let Ok(event) = events_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

/// Logs registry events and republishes them to `/events` subscribers.
async fn forward_session_events(
    mut registry_rx: broadcast::Receiver<SessionEvent>,
    events: broadcast::Sender<ServerEvent>,
) {
    loop {
        let event = match registry_rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "session event forwarder lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match &event {
            SessionEvent::TeardownFailed { session_id, error } => {
                error!(%session_id, %error, "session teardown failed")
            }
            SessionEvent::PairingFailed { session_id, reason } => {
                warn!(%session_id, %reason, "pairing failed")
            }
            other => info!(session_id = %other.session_id(), event = ?other, "session event"),
        }
        let _ = events.send(server_event(event));
    }
}

fn server_event(event: SessionEvent) -> ServerEvent {
    match event {
        SessionEvent::Acquired { session_id } => ServerEvent::SessionAcquired {
            session_id: session_id.0,
        },
        SessionEvent::Released { session_id } => ServerEvent::SessionReleased {
            session_id: session_id.0,
        },
        SessionEvent::PairingTokenIssued { session_id } => ServerEvent::PairingTokenIssued {
            session_id: session_id.0,
        },
        SessionEvent::PairingCompleted { session_id } => ServerEvent::PairingCompleted {
            session_id: session_id.0,
        },
        SessionEvent::PairingFailed { session_id, reason } => ServerEvent::PairingFailed {
            session_id: session_id.0,
            reason,
        },
        SessionEvent::TeardownFailed { session_id, error } => ServerEvent::TeardownFailed {
            session_id: session_id.0,
            error,
        },
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
