//! HTTP API.

use std::{fmt, sync::Arc};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{StatusCode, header::CONTENT_TYPE},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use termhub_buffer::{BufferError, TerminalManager, encode_snapshot};
use termhub_core::{ControlDir, ShutdownState};
use termhub_hq::{RegistryError, RemoteRegistration, RemoteRegistry};
use thiserror::Error;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    aggregator::BufferAggregator,
    auth::{AuthConfig, require_auth},
    websocket::buffers_ws_handler,
};

/// Role this server plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    Standalone,
    Remote,
    Hq,
}

impl fmt::Display for ServerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Standalone => "standalone",
            Self::Remote => "remote",
            Self::Hq => "hq",
        };
        f.write_str(name)
    }
}

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub mode: ServerMode,
    pub control_dir: ControlDir,
    pub terminals: Arc<TerminalManager>,
    pub aggregator: Arc<BufferAggregator>,
    /// Present in HQ mode only.
    pub registry: Option<Arc<RemoteRegistry>>,
    pub shutdown: ShutdownState,
}

/// API error, rendered as `{"error": message}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Server is shutting down")]
    ShuttingDown,
    #[error("{0}")]
    BadGateway(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    const fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<BufferError> for ApiError {
    fn from(e: BufferError) -> Self {
        match e {
            BufferError::SessionNotFound(_) => Self::NotFound(e.to_string()),
            BufferError::InvalidSessionId(_) => Self::BadRequest(e.to_string()),
            BufferError::Io(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::AlreadyRegistered(_) => Self::Conflict(e.to_string()),
            RegistryError::NotFound(_) => Self::NotFound(e.to_string()),
            RegistryError::Http(_) | RegistryError::RemoteStatus { .. } => {
                Self::BadGateway(e.to_string())
            }
        }
    }
}

/// Build the application router.
pub fn router(state: AppState, auth: AuthConfig) -> Router {
    let protected = Router::new()
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}/buffer", get(get_buffer))
        .route("/api/sessions/{id}/buffer/stats", get(get_buffer_stats))
        .route("/api/remotes", get(list_remotes))
        .route("/api/remotes/register", post(register_remote))
        .route("/api/remotes/{id}", delete(unregister_remote))
        .route("/api/remotes/{name}/refresh-sessions", post(refresh_sessions))
        .route("/buffers", get(buffers_ws_handler))
        .layer(middleware::from_fn_with_state(Arc::new(auth), require_auth));

    Router::new()
        .route("/api/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "mode": state.mode,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn list_sessions(State(state): State<AppState>) -> Result<Json<Vec<Value>>, ApiError> {
    let local = state
        .control_dir
        .list_sessions()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let mut sessions: Vec<Value> = local
        .into_iter()
        .filter_map(|metadata| {
            let mut value = serde_json::to_value(metadata).ok()?;
            if let Some(object) = value.as_object_mut() {
                object.insert("source".to_string(), json!("local"));
            }
            Some(value)
        })
        .collect();

    if let Some(registry) = &state.registry {
        registry.refresh_all_sessions().await;
        for remote in registry.get_remotes() {
            sessions.extend(remote.session_ids.iter().map(|id| {
                json!({
                    "id": id,
                    "source": "remote",
                    "remoteId": remote.id,
                    "remoteName": remote.name,
                })
            }));
        }
    }
    Ok(Json(sessions))
}

async fn get_buffer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.terminals.get_buffer_snapshot(&id).await?;
    Ok((
        [(CONTENT_TYPE, "application/octet-stream")],
        encode_snapshot(&snapshot),
    ))
}

async fn get_buffer_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.terminals.get_buffer_stats(&id).await?))
}

fn hq_registry(state: &AppState) -> Result<&Arc<RemoteRegistry>, ApiError> {
    state
        .registry
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("Not running in HQ mode".to_string()))
}

async fn list_remotes(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(hq_registry(&state)?.get_remotes()))
}

#[derive(Debug, Default, Deserialize)]
struct RegisterBody {
    id: Option<String>,
    name: Option<String>,
    url: Option<String>,
    token: Option<String>,
}

async fn register_remote(
    State(state): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> Result<impl IntoResponse, ApiError> {
    let registry = hq_registry(&state)?;
    let present = |field: Option<String>| field.filter(|value| !value.is_empty());
    let (Some(id), Some(name), Some(url), Some(token)) = (
        present(body.id),
        present(body.name),
        present(body.url),
        present(body.token),
    ) else {
        return Err(ApiError::BadRequest(
            "Missing required fields: id, name, url, token".to_string(),
        ));
    };

    let remote = registry.register(RemoteRegistration {
        id,
        name,
        url,
        token,
    })?;
    match registry.sync_remote_sessions(&remote).await {
        Ok(count) => tracing::info!(remote_id = %remote.id, count, "Fetched sessions from new remote"),
        Err(e) => tracing::warn!(remote_id = %remote.id, "Failed to fetch sessions from new remote: {e}"),
    }
    Ok(Json(json!({
        "success": true,
        "remote": {
            "id": remote.id,
            "name": remote.name,
            "url": remote.url,
        },
    })))
}

async fn unregister_remote(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let registry = hq_registry(&state)?;
    if registry.unregister(&id).is_none() {
        return Err(ApiError::NotFound(format!("Remote not found: {id}")));
    }
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshBody {
    action: Option<String>,
    session_id: Option<String>,
}

async fn refresh_sessions(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    if state.shutdown.is_shutting_down() {
        return Err(ApiError::ShuttingDown);
    }
    let registry = hq_registry(&state)?;

    if let Ok(RefreshBody { action, session_id }) = serde_json::from_slice(&body) {
        tracing::debug!(remote = %name, ?action, ?session_id, "Remote reported session change");
    }

    let count = registry.refresh_remote_sessions(&name).await?;
    Ok(Json(json!({ "success": true, "sessionCount": count })))
}
