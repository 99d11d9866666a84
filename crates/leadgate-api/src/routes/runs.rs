//! Run ledger routes.
//!
//! ## Routes
//!
//! - `GET /runs` - List recorded runs
//! - `GET /runs/{id}` - Get a run by ID

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use leadgate_core::id::RunId;
use leadgate_intake::{EnrichmentResult, Run, RunFilter, RunStatus};

use crate::error::ApiError;
use crate::server::AppState;

const MAX_PAGE_SIZE: usize = 200;

/// Query parameters for listing runs.
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ListRunsQuery {
    /// Only runs with this status (`success` or `failed`).
    pub status: Option<String>,
    /// Only success runs with this qualification verdict.
    pub qualified: Option<bool>,
    /// Maximum number of runs to return (default 50, max 200).
    pub limit: Option<usize>,
    /// Number of runs to skip, newest first.
    pub offset: Option<usize>,
}

/// A recorded run.
#[derive(Debug, Serialize, ToSchema)]
pub struct RunResponse {
    /// Run ID (ULID).
    pub id: String,
    /// Dedup key the run was executed under.
    pub dedup_key: String,
    /// Source attribution extracted from the payload.
    pub source: String,
    /// Terminal status (`success` or `failed`).
    pub status: String,
    /// The validated enrichment result (success runs only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<EnrichmentResult>,
    /// Failure description (failed runs only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the run was recorded (RFC 3339).
    pub created_at: String,
}

impl From<Run> for RunResponse {
    fn from(run: Run) -> Self {
        Self {
            id: run.id.to_string(),
            dedup_key: run.dedup_key.to_string(),
            source: run.source,
            status: run.status.as_str().to_string(),
            result: run.result,
            error: run.error,
            created_at: run.created_at.to_rfc3339(),
        }
    }
}

/// List runs response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ListRunsResponse {
    /// Page of runs, newest first.
    pub runs: Vec<RunResponse>,
    /// Total number of matching runs before pagination.
    pub total: usize,
}

/// Creates run ledger routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/runs", get(list_runs))
        .route("/runs/:id", get(get_run))
}

/// List recorded runs.
///
/// GET /runs
#[utoipa::path(
    get,
    path = "/runs",
    tag = "runs",
    params(ListRunsQuery),
    responses(
        (status = 200, description = "Runs listed", body = ListRunsResponse),
        (status = 400, description = "Invalid filter", body = ApiErrorBody),
        (status = 500, description = "Durable store unavailable", body = ApiErrorBody),
    )
)]
pub(crate) async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRunsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match query.status.as_deref() {
        None => None,
        Some("success") => Some(RunStatus::Success),
        Some("failed") => Some(RunStatus::Failed),
        Some(other) => {
            return Err(ApiError::bad_request(format!(
                "status must be success or failed (got {other})"
            )));
        }
    };

    let filter = RunFilter {
        status,
        qualified: query.qualified,
        limit: query.limit.unwrap_or(50).min(MAX_PAGE_SIZE),
        offset: query.offset.unwrap_or(0),
    };

    let (runs, total) = state.run_ledger.list(&filter).await?;

    Ok(Json(ListRunsResponse {
        runs: runs.into_iter().map(RunResponse::from).collect(),
        total,
    }))
}

/// Get a run by ID.
///
/// GET /runs/{id}
#[utoipa::path(
    get,
    path = "/runs/{id}",
    tag = "runs",
    params(
        ("id" = String, Path, description = "Run ID (ULID)")
    ),
    responses(
        (status = 200, description = "Run found", body = RunResponse),
        (status = 400, description = "Malformed run ID", body = ApiErrorBody),
        (status = 404, description = "Run not found", body = ApiErrorBody),
        (status = 500, description = "Durable store unavailable", body = ApiErrorBody),
    )
)]
pub(crate) async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id: RunId = id.parse().map_err(ApiError::from)?;

    let run = state
        .run_ledger
        .get(&run_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("run not found: {run_id}")))?;

    Ok(Json(RunResponse::from(run)))
}
