//! HTTP request handlers

use super::sse::sse_stream;
use super::types::{
    AppendRequest, ApprovalListResponse, ApproveRequest, BulkApproveRequest, EditRequest,
    ErrorResponse, HealthResponse, IngestRequest, ManualMessageRequest, DEFAULT_ACTOR,
    DEFAULT_SOURCE,
};
use super::AppState;
use crate::bulk::{BulkAction, BulkResult, FilterSpec};
use crate::db::{AuditEntry, ConversationDetail, ConversationFilter, ConversationId};
use crate::error::{ApprovalError, ErrorKind};
use crate::state_machine::Verb;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Upstream generation
        .route("/api/v1/conversations", post(ingest))
        .route("/api/v1/conversations/:id/messages", post(append_generated))
        // Review listing and detail
        .route("/api/v1/conversations/approval", get(list_for_approval))
        .route("/api/v1/conversations/:id", get(get_conversation))
        .route("/api/v1/conversations/:id/audit", get(get_audit_trail))
        // Reviewer actions
        .route("/api/v1/conversations/approve", post(decide))
        .route("/api/v1/conversations/:id/edit", post(edit_and_approve))
        .route("/api/v1/conversations/bulk_approve", post(bulk_approve))
        .route("/api/v1/conversations/manual_message", post(manual_message))
        // Change feed
        .route("/api/v1/changes", get(stream_changes))
        .with_state(state)
}

fn or_default(value: Option<String>, default: &str) -> String {
    value.unwrap_or_else(|| default.to_string())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================
// Upstream Generation
// ============================================================

async fn ingest(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Result<(StatusCode, Json<ConversationDetail>), AppError> {
    let source = or_default(req.source, DEFAULT_SOURCE);
    let detail = state
        .engine
        .ingest(req.farmer_id, &source, &req.message)
        .await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn append_generated(
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
    Json(req): Json<AppendRequest>,
) -> Result<Json<ConversationDetail>, AppError> {
    let source = or_default(req.source, DEFAULT_SOURCE);
    let detail = state
        .engine
        .append_generated(id, &source, &req.message)
        .await?;
    Ok(Json(detail))
}

// ============================================================
// Review Listing and Detail
// ============================================================

async fn list_for_approval(
    State(state): State<AppState>,
) -> Result<Json<ApprovalListResponse>, AppError> {
    let partitions = state.query.list_partitioned().await?;
    Ok(Json(ApprovalListResponse::from(partitions.as_ref())))
}

async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
) -> Result<Json<ConversationDetail>, AppError> {
    Ok(Json(state.query.get_detail(id).await?))
}

async fn get_audit_trail(
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
) -> Result<Json<Vec<AuditEntry>>, AppError> {
    Ok(Json(state.query.audit_trail(id).await?))
}

// ============================================================
// Reviewer Actions
// ============================================================

async fn decide(
    State(state): State<AppState>,
    Json(req): Json<ApproveRequest>,
) -> Result<Json<ConversationDetail>, AppError> {
    let verb: Verb = req.action.parse().map_err(ApprovalError::InvalidInput)?;
    let actor = or_default(req.actor, DEFAULT_ACTOR);
    let id = req.conversation_id;

    let detail = match verb {
        Verb::Approve => state.engine.approve(id, &actor).await?,
        Verb::Reject => state.engine.reject(id, &actor).await?,
        Verb::Reopen => state.engine.reopen(id, &actor, req.reason).await?,
    };
    Ok(Json(detail))
}

async fn edit_and_approve(
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
    Json(req): Json<EditRequest>,
) -> Result<Json<ConversationDetail>, AppError> {
    let actor = or_default(req.actor, DEFAULT_ACTOR);
    let detail = state
        .engine
        .edit_and_approve(id, &actor, &req.message)
        .await?;
    Ok(Json(detail))
}

async fn bulk_approve(
    State(state): State<AppState>,
    Json(req): Json<BulkApproveRequest>,
) -> Result<Json<BulkResult>, AppError> {
    let action: BulkAction = req.action.parse()?;
    let filter = match (req.filter, req.farmer_id) {
        (Some(spec), _) => spec.parse()?,
        (None, Some(farmer_id)) => FilterSpec {
            kind: "by_farmer".to_string(),
            farmer_id: Some(farmer_id),
            status: None,
        }
        .parse()?,
        (None, None) => ConversationFilter::All,
    };
    let actor = or_default(req.actor, DEFAULT_ACTOR);

    let result = state
        .bulk
        .bulk_apply(action, filter, &actor, state.shutdown.child_token())
        .await?;
    Ok(Json(result))
}

async fn manual_message(
    State(state): State<AppState>,
    Json(req): Json<ManualMessageRequest>,
) -> Result<(StatusCode, Json<ConversationDetail>), AppError> {
    let actor = or_default(req.actor, DEFAULT_ACTOR);
    let detail = state
        .injector
        .inject(req.farmer_id, &req.message, &actor)
        .await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

// ============================================================
// Change Feed
// ============================================================

async fn stream_changes(State(state): State<AppState>) -> impl IntoResponse {
    sse_stream(state.query.subscribe(), state.shutdown.clone())
}

// ============================================================
// Error Handling
// ============================================================

pub struct AppError(ApprovalError);

impl From<ApprovalError> for AppError {
    fn from(err: ApprovalError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidTransition | ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::InvalidFilter | ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        };
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "Request failed");
        }

        let body = Json(ErrorResponse::new(kind, self.0.to_string()));
        (status, body).into_response()
    }
}
