//! HTTP surface: a thin adapter mapping requests to lifecycle operations.

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::StatusCode,
    http::header::AUTHORIZATION,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::agents;
use crate::api::protocol::{
    ArchiveRequest, CreateSessionRequest, ForkSessionRequest, HealthResponse, InputRequest,
    PatchSessionRequest, PositionsRequest, TailQuery,
};
use crate::api::ws::ws_handler;
use crate::config::Config;
use crate::core::errors::SessionError;
use crate::core::manager::{CreateSessionParams, ForkParams, SessionManager, SessionPatch};
use crate::core::status::StatusUpdate;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub config: Arc<Config>,
}

/// Build the full router: `/api/*` plus the `/ws` terminal stream.
///
/// When a bearer token is configured, every route except the plugin webhook
/// requires it (the webhook is fired by local hook scripts; the WebSocket
/// checks its own query token since browsers cannot set headers there).
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut protected = Router::new()
        .route("/api/agents", get(list_agents))
        .route("/api/health", get(health))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}", patch(patch_session))
        .route("/api/sessions/{id}", delete(delete_session))
        .route("/api/sessions/{id}/restart", post(restart_session))
        .route("/api/sessions/{id}/fork", post(fork_session))
        .route("/api/sessions/{id}/archive", patch(archive_session))
        .route("/api/sessions/{id}/tail", get(tail_session))
        .route("/api/sessions/{id}/input", post(session_input))
        .route("/api/state/positions", post(save_positions))
        .route("/api/auto-resume/progress", get(auto_resume_progress));

    if state.config.token.is_some() {
        protected = protected.route_layer(middleware::from_fn_with_state(
            state.clone(),
            bearer_auth_middleware,
        ));
    }

    Router::new()
        // Plugin webhook stays public; hooks are fire-and-forget
        .route("/api/status-update", post(status_update))
        .route("/ws", get(ws_handler))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn bearer_auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.config.token else {
        return next.run(request).await;
    };

    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected);

    if authorized {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized"})),
        )
            .into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    #[serde(default)]
    archived: Option<String>,
}

async fn list_agents() -> Json<serde_json::Value> {
    Json(json!({ "agents": agents::AGENTS }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions: state.manager.session_count(),
        queue: state.manager.queue().progress(),
        worktrees: state.manager.registry().stats().await,
    })
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<serde_json::Value> {
    let archived = query.archived.as_deref() == Some("true");
    let sessions = state.manager.list_sessions(archived).await;
    Json(json!(sessions))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let session = state
        .manager
        .get_session(&id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("Session not found: {id}")))?;
    Ok(Json(json!(session)))
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let response = state
        .manager
        .create_session(CreateSessionParams {
            agent_id: request.agent_id,
            agent_name: request.agent_name,
            command: request.command,
            cwd: request.cwd,
            node_id: request.node_id,
            canvas_id: request.canvas_id,
            custom_name: request.custom_name,
            custom_color: request.custom_color,
            ticket_id: request.ticket_id,
            ticket_title: request.ticket_title,
            ticket_url: request.ticket_url,
            branch_name: request.branch_name,
            base_branch: request.base_branch,
            create_worktree: request.create_worktree_flag,
            sparse_checkout: request.sparse_checkout,
            pr_number: request.pr_number,
        })
        .await?;
    Ok(Json(json!(response)))
}

async fn patch_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<PatchSessionRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let session = state
        .manager
        .patch_session(
            &id,
            SessionPatch {
                custom_name: request.custom_name,
                custom_color: request.custom_color,
                icon: request.icon,
                notes: request.notes,
            },
        )
        .await?;
    Ok(Json(json!(session)))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.manager.delete_session(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restart_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.manager.restart_session(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn fork_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Option<Json<ForkSessionRequest>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let response = state
        .manager
        .fork_session(
            &id,
            ForkParams {
                branch_name: request.branch_name,
                base_branch: request.base_branch,
                create_worktree: request.create_worktree_flag,
                pr_number: request.pr_number,
            },
        )
        .await?;
    Ok(Json(json!(response)))
}

async fn archive_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ArchiveRequest>,
) -> Result<StatusCode, AppError> {
    state.manager.set_archived(&id, request.archived).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn tail_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TailQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let strip = query.strip == Some(1);
    let tail = state.manager.tail(&id, query.bytes, strip)?;
    Ok(Json(json!(tail)))
}

async fn session_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<InputRequest>,
) -> Result<StatusCode, AppError> {
    state.manager.write_input(&id, &request.data).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Plugin webhook (state machine input). Unknown sessions get a 200: the
/// hook already fired, there is nothing for the plugin to retry.
async fn status_update(
    State(state): State<AppState>,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<serde_json::Value>, AppError> {
    let handled = state.manager.apply_status_update(&update)?;
    Ok(Json(json!({ "ok": true, "handled": handled })))
}

async fn save_positions(
    State(state): State<AppState>,
    Json(request): Json<PositionsRequest>,
) -> StatusCode {
    state.manager.save_positions(request.positions).await;
    StatusCode::NO_CONTENT
}

async fn auto_resume_progress(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!(state.manager.queue().progress()))
}

/// Handler-level error mapped onto the error taxonomy.
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            e @ SessionError::NotFound { .. } => Self::NotFound(e.to_string()),
            e @ SessionError::PtyAlreadyRunning { .. } => Self::Conflict(e.to_string()),
            e @ (SessionError::NoPty { .. }
            | SessionError::InputTooLarge { .. }
            | SessionError::NotAClaudeSession { .. }
            | SessionError::MissingClaudeSessionId { .. }
            | SessionError::InvalidRepoPath { .. }
            | SessionError::MissingStatus) => Self::BadRequest(e.to_string()),
            e @ (SessionError::WorktreeSetupFailed { .. } | SessionError::SpawnFailed { .. }) => {
                Self::Internal(e.into())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            // Conflicts surface as 400 with an explanatory message
            Self::BadRequest(msg) | Self::Conflict(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Internal(err) => {
                tracing::error!("Request failed: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal error: {err}"),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
