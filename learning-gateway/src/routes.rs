//! REST routes
//!
//! Thin handlers over the session coordinator. Every failure is rendered as
//! `{"errorType": ..., "message": ...}` with a status derived from its kind.
//!
//! Session routes take `?tenantId=&learnerId=` and act only on a session
//! owned by that pair, the same check the WebSocket handshake makes.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

use narrative_engine::{
    ChoiceReply, EngineError, LearnerProgress, Origin, SessionMessage, SessionSnapshot,
    StartSession, TurnReply, UpstreamKind,
};

use crate::realtime;
use crate::SharedState;

/// Default and maximum page size for the message log.
const DEFAULT_MESSAGE_LIMIT: usize = 50;
const MAX_MESSAGE_LIMIT: usize = 500;

/// Create the gateway router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:session_id", get(get_session))
        .route("/api/sessions/:session_id/turn", post(post_turn))
        .route("/api/sessions/:session_id/choice", post(post_choice))
        .route("/api/sessions/:session_id/complete", post(complete_session))
        .route("/api/sessions/:session_id/messages", get(list_messages))
        .route("/api/learners/:learner_id/progress", get(learner_progress))
        .route("/api/learners/:learner_id/gaps/identify", post(identify_gaps))
        .route("/ws", get(realtime::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// === Errors ===

/// Engine error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(EngineError::Validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError(EngineError::Validation(rejection.body_text()))
    }
}

/// HTTP status for an engine error kind.
pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::ResourceNotFound(_)
        | EngineError::ChoiceNotFound(_)
        | EngineError::TargetNodeNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        EngineError::InvalidState(_) | EngineError::NoCurrentNode(_) => StatusCode::CONFLICT,
        EngineError::SessionBusy(_) => StatusCode::TOO_MANY_REQUESTS,
        EngineError::Upstream {
            kind: UpstreamKind::Timeout,
            ..
        } => StatusCode::GATEWAY_TIMEOUT,
        EngineError::Upstream { .. } => StatusCode::BAD_GATEWAY,
        EngineError::System(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(error = %self.0, status = status.as_u16(), "Request failed");
        }
        (status, Json(self.0.to_payload())).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// === Handlers ===

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    dev_mode: bool,
}

/// GET /health
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        dev_mode: state.dev_mode,
    })
}

/// POST /api/sessions
async fn create_session(
    State(state): State<SharedState>,
    body: Result<Json<StartSession>, JsonRejection>,
) -> Result<(StatusCode, Json<SessionSnapshot>), ApiError> {
    let Json(params) = body?;
    let snapshot = state.coordinator.start_session(params).await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

/// Identity a session route acts for.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerQuery {
    pub tenant_id: String,
    pub learner_id: String,
}

async fn authorize(
    state: &SharedState,
    session_id: &str,
    query: Result<Query<OwnerQuery>, QueryRejection>,
) -> Result<(), ApiError> {
    let Query(owner) = query?;
    state
        .coordinator
        .authorize(session_id, &owner.tenant_id, &owner.learner_id)
        .await?;
    Ok(())
}

/// GET /api/sessions/:session_id
async fn get_session(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    owner: Result<Query<OwnerQuery>, QueryRejection>,
) -> ApiResult<SessionSnapshot> {
    authorize(&state, &session_id, owner).await?;
    Ok(Json(state.coordinator.snapshot(&session_id).await?))
}

#[derive(Deserialize)]
pub struct TurnRequest {
    pub text: String,
}

/// POST /api/sessions/:session_id/turn
async fn post_turn(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    owner: Result<Query<OwnerQuery>, QueryRejection>,
    body: Result<Json<TurnRequest>, JsonRejection>,
) -> ApiResult<TurnReply> {
    authorize(&state, &session_id, owner).await?;
    let Json(req) = body?;
    let reply = state
        .coordinator
        .turn(&session_id, &req.text, Origin::Rest)
        .await?;
    Ok(Json(reply))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChoiceRequest {
    pub choice_id: String,
}

/// POST /api/sessions/:session_id/choice
async fn post_choice(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    owner: Result<Query<OwnerQuery>, QueryRejection>,
    body: Result<Json<ChoiceRequest>, JsonRejection>,
) -> ApiResult<ChoiceReply> {
    authorize(&state, &session_id, owner).await?;
    let Json(req) = body?;
    let reply = state
        .coordinator
        .choose(&session_id, &req.choice_id, Origin::Rest)
        .await?;
    Ok(Json(reply))
}

/// POST /api/sessions/:session_id/complete
async fn complete_session(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    owner: Result<Query<OwnerQuery>, QueryRejection>,
) -> ApiResult<SessionSnapshot> {
    authorize(&state, &session_id, owner).await?;
    Ok(Json(state.coordinator.complete_session(&session_id).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesQuery {
    pub tenant_id: String,
    pub learner_id: String,
    pub limit: Option<usize>,
}

/// GET /api/sessions/:session_id/messages
async fn list_messages(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    query: Result<Query<MessagesQuery>, QueryRejection>,
) -> ApiResult<Vec<SessionMessage>> {
    let Query(query) = query?;
    state
        .coordinator
        .authorize(&session_id, &query.tenant_id, &query.learner_id)
        .await?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_MESSAGE_LIMIT)
        .clamp(1, MAX_MESSAGE_LIMIT);
    Ok(Json(state.coordinator.messages(&session_id, limit).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantQuery {
    pub tenant_id: String,
}

/// GET /api/learners/:learner_id/progress
async fn learner_progress(
    State(state): State<SharedState>,
    Path(learner_id): Path<String>,
    query: Result<Query<TenantQuery>, QueryRejection>,
) -> ApiResult<LearnerProgress> {
    let Query(query) = query?;
    Ok(Json(
        state
            .coordinator
            .progress(&learner_id, &query.tenant_id)
            .await?,
    ))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GapsResponse {
    pub learner_id: String,
    pub gaps: BTreeSet<String>,
}

/// POST /api/learners/:learner_id/gaps/identify
async fn identify_gaps(
    State(state): State<SharedState>,
    Path(learner_id): Path<String>,
    query: Result<Query<TenantQuery>, QueryRejection>,
) -> ApiResult<GapsResponse> {
    let Query(query) = query?;
    let gaps = state
        .coordinator
        .identify_gaps(&learner_id, &query.tenant_id)
        .await?;
    Ok(Json(GapsResponse { learner_id, gaps }))
}
