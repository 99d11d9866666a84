//! Lead intake route.
//!
//! ## Routes
//!
//! - `POST /enrich-lead` - Submit a lead for deduplicated enrichment

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;

use leadgate_intake::Outcome;

use crate::error::ApiError;
use crate::server::AppState;

/// Creates intake routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/enrich-lead", post(enrich_lead))
}

/// Submit a lead for enrichment.
///
/// POST /enrich-lead
///
/// Duplicate submissions of the same lead replay the original result
/// without invoking the enrichment provider again.
#[utoipa::path(
    post,
    path = "/enrich-lead",
    tag = "intake",
    request_body = Value,
    responses(
        (status = 200, description = "Enrichment completed or cached result replayed", body = EnrichmentResult),
        (status = 400, description = "Payload is not an object or has no identity fields", body = ApiErrorBody),
        (status = 409, description = "Lead is already being processed (Retry-After set)", body = ApiErrorBody),
        (status = 502, description = "Enrichment provider failed", body = ApiErrorBody),
        (status = 500, description = "Durable store unavailable", body = ApiErrorBody),
    )
)]
pub(crate) async fn enrich_lead(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    if !payload.is_object() {
        return Err(ApiError::bad_request("Payload must be a JSON object"));
    }

    let outcome = state.coordinator.process(payload).await?;

    match outcome {
        Outcome::Completed { run_id, result } => {
            tracing::info!(run_id = %run_id, "Lead enriched");
            Ok(Json(result))
        }
        Outcome::Cached { result } => Ok(Json(result)),
        Outcome::InProgress { retry_after_secs } => {
            Err(ApiError::conflict_in_progress(retry_after_secs))
        }
        Outcome::Failed { run_id, error } => {
            tracing::warn!(run_id = %run_id, error = %error, "Enrichment failed");
            Err(ApiError::bad_gateway(error))
        }
    }
}
