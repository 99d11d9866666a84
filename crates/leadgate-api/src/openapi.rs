//! `OpenAPI` (3.1) specification generation for `leadgate-api`.
//!
//! Served at `/openapi.json` and used to generate external clients.

use utoipa::OpenApi;

/// `OpenAPI` documentation for the leadgate REST API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Leadgate API",
        description = "Deduplicated lead enrichment intake API"
    ),
    paths(
        crate::routes::enrich::enrich_lead,
        crate::routes::runs::list_runs,
        crate::routes::runs::get_run,
    ),
    components(
        schemas(
            crate::error::ApiErrorBody,
            crate::routes::runs::RunResponse,
            crate::routes::runs::ListRunsResponse,
            leadgate_intake::EnrichmentResult,
            leadgate_intake::LeadProfile,
            leadgate_intake::Urgency,
        )
    ),
    tags(
        (name = "intake", description = "Lead submission and enrichment"),
        (name = "runs", description = "Run ledger queries"),
    )
)]
pub struct ApiDoc;

/// Returns the generated `OpenAPI` spec.
#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

/// Returns the generated `OpenAPI` spec serialized as pretty JSON.
///
/// # Errors
///
/// Returns an error if JSON serialization fails (should not happen).
pub fn openapi_json() -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&openapi())
}
