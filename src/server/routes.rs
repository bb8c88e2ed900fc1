use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AppState;
use crate::daemon::orchestrator::BatchRequest;
use crate::errors::DjrError;

/// Header carrying the authenticated user, set by the auth proxy in front.
pub const REMOTE_USER_HEADER: &str = "x-remote-user";

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn status_for(err: &DjrError) -> StatusCode {
    match err {
        DjrError::NotFound(_) => StatusCode::NOT_FOUND,
        DjrError::Validation(_) => StatusCode::BAD_REQUEST,
        DjrError::Conflict(_) => StatusCode::CONFLICT,
        DjrError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        DjrError::Spawn(_) | DjrError::Storage(_) | DjrError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub fn api_error(err: DjrError) -> ApiError {
    let status = status_for(&err);
    if status.is_server_error() {
        tracing::error!("Request failed: {}", err);
    } else {
        tracing::warn!("Request rejected: {}", err);
    }
    (
        status,
        Json(ErrorResponse {
            error: err.code().to_string(),
            message: err.to_string(),
        }),
    )
}

fn parse_job_id(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id).map_err(|_| {
        api_error(DjrError::Validation(format!(
            "'{}' is not a valid job id",
            id
        )))
    })
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/jobs/batch
pub async fn start_batch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<BatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let requested_by = headers
        .get(REMOTE_USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let result = state
        .orchestrator
        .start_batch(&request.urls, &request.options, requested_by)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::OK, Json(result)))
}

/// GET /api/jobs
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.list().await)
}

/// GET /api/jobs/{id}
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = parse_job_id(&id)?;
    let record = state
        .registry
        .get(job_id)
        .await
        .ok_or_else(|| api_error(DjrError::NotFound(format!("Job {}", job_id))))?;
    Ok(Json(record))
}

/// DELETE /api/jobs/{id}
pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = parse_job_id(&id)?;
    let outcome = state
        .orchestrator
        .delete_job(job_id)
        .await
        .map_err(api_error)?;
    Ok(Json(outcome))
}

/// POST /api/jobs/{id}/cancel
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = parse_job_id(&id)?;
    let record = state
        .orchestrator
        .cancel_job(job_id)
        .await
        .map_err(api_error)?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub struct LookupParams {
    pub url: String,
}

/// GET /api/site-rules/lookup?url=
pub async fn lookup_site(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LookupParams>,
) -> impl IntoResponse {
    Json(state.orchestrator.resolver().resolve(&params.url).await)
}
