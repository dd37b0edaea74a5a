//! HTTP route handlers.

use std::collections::BTreeSet;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, error};

use super::sse::events_handler;
use super::types::{
    AnswerRequest, AttentionItem, CreateUnitRequest, ErrorBody, StatusReport, VerdictRequest,
};
use super::AppState;
use crate::core::{UnitId, UnitStatus, WorkUnit};
use crate::util::blocking;
use crate::Error;

/// Build the API router, mounted under `/api`.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/units", get(list_units).post(create_unit))
        .route("/units/{id}", get(get_unit).delete(delete_unit))
        .route("/units/{id}/answer", post(answer))
        .route("/units/{id}/verdict", post(verdict))
        .route("/units/{id}/retry", post(retry))
        .route("/attention", get(attention))
        .route("/events", get(events_handler))
}

/// [`Error`] as an HTTP response with a JSON body.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::UnitNotFound(_) => StatusCode::NOT_FOUND,
            Error::UnitExists(_)
            | Error::InvalidTransition { .. }
            | Error::InvalidPhaseAdvance { .. }
            | Error::InvalidState(_) => StatusCode::CONFLICT,
            Error::InvalidUnitId(_) | Error::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        } else {
            debug!(error = %self.0, %status, "request rejected");
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

fn parse_id(raw: &str) -> Result<UnitId, ApiError> {
    Ok(UnitId::new(raw)?)
}

async fn health() -> &'static str {
    "ok"
}

/// GET /api/status
async fn status(State(state): State<AppState>) -> ApiResult<StatusReport> {
    let store = state.store.clone();
    let counts = blocking(move || store.counts()).await?;
    let uptime = Utc::now() - state.started_at;
    Ok(Json(StatusReport {
        pid: state.pid,
        started_at: state.started_at,
        uptime_secs: uptime.num_seconds().max(0) as u64,
        counts,
        max_agents: state.max_agents,
    }))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
}

/// GET /api/units?status=READY
async fn list_units(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<WorkUnit>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<UnitStatus>)
        .transpose()?;
    let store = state.store.clone();
    Ok(Json(blocking(move || store.list(status)).await?))
}

/// POST /api/units
async fn create_unit(
    State(state): State<AppState>,
    Json(req): Json<CreateUnitRequest>,
) -> std::result::Result<(StatusCode, Json<WorkUnit>), ApiError> {
    let id = parse_id(&req.id)?;
    let footprint = req.footprint.map(|paths| paths.into_iter().collect::<BTreeSet<_>>());
    let unit = state.scheduler.create(id, footprint, req.priority).await?;
    Ok((StatusCode::CREATED, Json(unit)))
}

/// GET /api/units/{id}, with full history.
async fn get_unit(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<WorkUnit> {
    let id = parse_id(&id)?;
    let store = state.store.clone();
    Ok(Json(blocking(move || store.load(&id)).await?))
}

/// DELETE /api/units/{id}
async fn delete_unit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<StatusCode, ApiError> {
    state.scheduler.delete(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/attention
async fn attention(State(state): State<AppState>) -> ApiResult<Vec<AttentionItem>> {
    let store = state.store.clone();
    let units = blocking(move || store.list(Some(UnitStatus::NeedsAttention))).await?;
    Ok(Json(units.iter().filter_map(AttentionItem::from_unit).collect()))
}

/// POST /api/units/{id}/answer
async fn answer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AnswerRequest>,
) -> ApiResult<WorkUnit> {
    Ok(Json(state.scheduler.answer(parse_id(&id)?, req.answer).await?))
}

/// POST /api/units/{id}/verdict
async fn verdict(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<VerdictRequest>,
) -> ApiResult<WorkUnit> {
    Ok(Json(state.scheduler.verdict(parse_id(&id)?, req.verdict).await?))
}

/// POST /api/units/{id}/retry
async fn retry(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<WorkUnit> {
    Ok(Json(state.scheduler.retry(parse_id(&id)?).await?))
}
