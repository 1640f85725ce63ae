//! HTTP API v1: entry points into the automation engine.
//!
//! Endpoints:
//!
//! - `POST   /v1/events`: fire a user event through the rules
//! - `POST   /v1/enrollments`: enroll a user in a sequence
//! - `DELETE /v1/enrollments/{id}`: exit an enrollment
//! - `GET    /v1/users/{user_id}/enrollments`: list a user's enrollments
//! - `GET    /v1/users/{user_id}/tags`: current tag snapshot
//! - `POST   /v1/users/{user_id}/tags`: write a tag (may auto-enroll)
//! - `DELETE /v1/users/{user_id}/tags/{key}`: remove a tag
//! - `POST   /v1/tick`: run one scheduler tick now
//! - `GET    /v1/sequences`, `PATCH /v1/sequences/{id}`: list, activate, deactivate
//! - `GET    /v1/rules`, `PATCH /v1/rules/{id}`: same, for workflow rules

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, patch, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use coachflow_core::{Enrollment, Error, Event, Sequence, Tag, TagSet, WorkflowRule};
use coachflow_engine::{AutomationEngine, FireReport, TickReport};

// ── State ─────────────────────────────────────────────────────────────────

pub struct ApiV1State {
    pub engine: Arc<AutomationEngine>,
}

pub type SharedApiState = Arc<ApiV1State>;

// ── Router ────────────────────────────────────────────────────────────────

/// Build the v1 API router. Nest this under "/v1" in the main router.
pub fn v1_router(state: SharedApiState) -> Router {
    Router::new()
        .route("/events", post(fire_event_handler))
        .route("/enrollments", post(enroll_handler))
        .route(
            "/enrollments/{id}",
            axum::routing::delete(exit_enrollment_handler),
        )
        .route("/users/{user_id}/enrollments", get(list_enrollments_handler))
        .route(
            "/users/{user_id}/tags",
            get(get_tags_handler).post(tag_user_handler),
        )
        .route(
            "/users/{user_id}/tags/{key}",
            axum::routing::delete(remove_tag_handler),
        )
        .route("/tick", post(tick_handler))
        .route("/sequences", get(list_sequences_handler))
        .route("/sequences/{id}", patch(set_sequence_active_handler))
        .route("/rules", get(list_rules_handler))
        .route("/rules/{id}", patch(set_rule_active_handler))
        .with_state(state)
}

// ── DTOs ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

#[derive(Debug, Deserialize)]
pub struct FireEventRequest {
    pub user_id: String,
    pub trigger: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub dedupe_key: Option<String>,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    pub user_id: String,
    pub sequence_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnrollResponse {
    pub created: bool,
    pub enrollment: Enrollment,
}

#[derive(Debug, Deserialize)]
pub struct ExitQuery {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TagRequest {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemovedResponse {
    pub removed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnrollmentListResponse {
    pub enrollments: Vec<Enrollment>,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct ActiveRequest {
    pub active: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdatedResponse {
    pub updated: bool,
}

/// Map an engine error to a status code.
fn api_error(e: Error) -> ApiError {
    let status = match &e {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::SequenceInactive(_) => StatusCode::CONFLICT,
        Error::Configuration { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Send(_) => StatusCode::BAD_GATEWAY,
        Error::Store(_) | Error::Serialization(_) | Error::Internal(_) => {
            error!(error = %e, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

fn bad_request(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn fire_event_handler(
    State(state): State<SharedApiState>,
    Json(req): Json<FireEventRequest>,
) -> Result<Json<FireReport>, ApiError> {
    if req.user_id.is_empty() || req.trigger.is_empty() {
        return Err(bad_request("user_id and trigger are required"));
    }

    let mut event = Event::new(
        req.user_id,
        req.trigger,
        req.payload,
        req.occurred_at.unwrap_or_else(Utc::now),
    );
    if let Some(key) = req.dedupe_key {
        event = event.with_dedupe_key(key);
    }

    info!(user_id = %event.user_id, trigger = %event.trigger, "Event received");
    state
        .engine
        .fire_event(&event)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn enroll_handler(
    State(state): State<SharedApiState>,
    Json(req): Json<EnrollRequest>,
) -> Result<(StatusCode, Json<EnrollResponse>), ApiError> {
    let outcome = state
        .engine
        .enroll(&req.user_id, &req.sequence_id, Utc::now())
        .await
        .map_err(api_error)?;

    let status = if outcome.was_created() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(EnrollResponse {
            created: outcome.was_created(),
            enrollment: outcome.into_enrollment(),
        }),
    ))
}

async fn exit_enrollment_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
    Query(query): Query<ExitQuery>,
) -> Result<Json<Enrollment>, ApiError> {
    let reason = query.reason.unwrap_or_else(|| "manual".into());
    state
        .engine
        .exit_enrollment(&id, &reason, Utc::now())
        .await
        .map(Json)
        .map_err(api_error)
}

async fn list_enrollments_handler(
    State(state): State<SharedApiState>,
    Path(user_id): Path<String>,
) -> Result<Json<EnrollmentListResponse>, ApiError> {
    let enrollments = state
        .engine
        .store()
        .list_enrollments_for_user(&user_id)
        .await
        .map_err(|e| api_error(e.into()))?;
    let count = enrollments.len();
    Ok(Json(EnrollmentListResponse { enrollments, count }))
}

async fn get_tags_handler(
    State(state): State<SharedApiState>,
    Path(user_id): Path<String>,
) -> Result<Json<TagSet>, ApiError> {
    state
        .engine
        .store()
        .get_tag_set(&user_id)
        .await
        .map(Json)
        .map_err(|e| api_error(e.into()))
}

async fn tag_user_handler(
    State(state): State<SharedApiState>,
    Path(user_id): Path<String>,
    Json(req): Json<TagRequest>,
) -> Result<Json<Tag>, ApiError> {
    if req.key.is_empty() {
        return Err(bad_request("tag key is required"));
    }
    state
        .engine
        .tag_user(&user_id, &req.key, req.value.as_deref(), Utc::now())
        .await
        .map(Json)
        .map_err(api_error)
}

async fn remove_tag_handler(
    State(state): State<SharedApiState>,
    Path((user_id, key)): Path<(String, String)>,
) -> Result<Json<RemovedResponse>, ApiError> {
    state
        .engine
        .remove_tag(&user_id, &key)
        .await
        .map(|removed| Json(RemovedResponse { removed }))
        .map_err(api_error)
}

async fn tick_handler(State(state): State<SharedApiState>) -> Result<Json<TickReport>, ApiError> {
    state
        .engine
        .run_scheduler_tick(Utc::now())
        .await
        .map(Json)
        .map_err(api_error)
}

async fn list_sequences_handler(
    State(state): State<SharedApiState>,
) -> Result<Json<Vec<Sequence>>, ApiError> {
    state
        .engine
        .store()
        .list_sequences()
        .await
        .map(Json)
        .map_err(|e| api_error(e.into()))
}

async fn set_sequence_active_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
    Json(req): Json<ActiveRequest>,
) -> Result<Json<UpdatedResponse>, ApiError> {
    match state.engine.set_sequence_active(&id, req.active).await {
        Ok(true) => Ok(Json(UpdatedResponse { updated: true })),
        Ok(false) => Err(api_error(Error::NotFound(format!("sequence '{id}'")))),
        Err(e) => Err(api_error(e)),
    }
}

async fn list_rules_handler(
    State(state): State<SharedApiState>,
) -> Result<Json<Vec<WorkflowRule>>, ApiError> {
    state
        .engine
        .store()
        .list_rules()
        .await
        .map(Json)
        .map_err(|e| api_error(e.into()))
}

async fn set_rule_active_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
    Json(req): Json<ActiveRequest>,
) -> Result<Json<UpdatedResponse>, ApiError> {
    match state.engine.set_rule_active(&id, req.active).await {
        Ok(true) => Ok(Json(UpdatedResponse { updated: true })),
        Ok(false) => Err(api_error(Error::NotFound(format!("rule '{id}'")))),
        Err(e) => Err(api_error(e)),
    }
}
