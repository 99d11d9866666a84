//! API server implementation.
//!
//! Provides health, ready, intake, and run ledger endpoints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use leadgate_core::Result;
use leadgate_core::storage::{MemoryBackend, StorageBackend};
use leadgate_intake::{
    Coordinator, CoordinatorSettings, DurableClaimStore, DurableRunLedger, Enricher, RunLedger,
};

use crate::config::{Config, CorsConfig};
use crate::enrichment_client::EnrichmentClient;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ReadyResponse {
    /// Service readiness status.
    pub ready: bool,
    /// Optional message about readiness state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Shared application state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Durable store holding claims and run records.
    pub storage: Arc<dyn StorageBackend>,
    /// Read access to the run ledger.
    pub run_ledger: Arc<dyn RunLedger>,
    /// Drives lead submissions through claim, enrichment, and ledger.
    pub coordinator: Arc<Coordinator>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("storage", &"<StorageBackend>")
            .field("run_ledger", &"<RunLedger>")
            .field("coordinator", &"<Coordinator>")
            .finish()
    }
}

impl AppState {
    /// Creates new application state with the given storage backend and
    /// enricher.
    #[must_use]
    pub fn new(
        config: Config,
        storage: Arc<dyn StorageBackend>,
        enricher: Arc<dyn Enricher>,
    ) -> Self {
        let claims = Arc::new(DurableClaimStore::new(Arc::clone(&storage)));
        let ledger = Arc::new(DurableRunLedger::new(Arc::clone(&storage)));
        let settings = CoordinatorSettings {
            invoke_timeout: config.invoke_timeout(),
            claim_stale_timeout: config.claim_stale_timeout(),
        };
        let coordinator = Arc::new(Coordinator::new(
            claims,
            Arc::clone(&ledger) as Arc<dyn RunLedger>,
            enricher,
            settings,
        ));
        Self {
            config,
            storage,
            run_ledger: ledger,
            coordinator,
        }
    }
}

/// Health check endpoint handler.
///
/// Returns 200 OK if the service is alive. This is a shallow check
/// that doesn't verify dependencies.
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Readiness check endpoint handler.
///
/// Returns 200 OK if the service is ready to accept requests.
/// Checks storage connectivity.
async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    // Shallow connectivity check. A `head` on a missing key is sufficient to
    // validate that the backend can be reached.
    let check_key = "__leadgate/ready-check";
    match state.storage.head(check_key).await {
        Ok(_) => (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                message: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                message: Some(format!("storage check failed: {e}")),
            }),
        ),
    }
}

/// Echoes a client-supplied `x-request-id` header onto the response.
///
/// Error responses built through [`crate::error::ApiError`] may already carry
/// the header; this only fills it in when absent.
async fn request_id_middleware(
    request: axum::extract::Request,
    next: middleware::Next,
) -> axum::response::Response {
    let request_id = request.headers().get("x-request-id").cloned();
    let mut response = next.run(request).await;
    if let Some(value) = request_id {
        response
            .headers_mut()
            .entry(header::HeaderName::from_static("x-request-id"))
            .or_insert(value);
    }
    response
}

/// Handler for the `/openapi.json` endpoint.
async fn serve_openapi() -> impl IntoResponse {
    match crate::openapi::openapi_json() {
        Ok(json) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            json,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            format!("failed to render OpenAPI spec: {e}"),
        ),
    }
}

/// The leadgate API server.
pub struct Server {
    config: Config,
    storage: Arc<dyn StorageBackend>,
    enricher: Arc<dyn Enricher>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("storage", &"<StorageBackend>")
            .field("enricher", &"<Enricher>")
            .finish()
    }
}

impl Server {
    /// Creates a new server with the given configuration.
    ///
    /// Defaults to in-memory storage and the HTTP enrichment client; use the
    /// builder to override either for production or tests.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let enricher = Arc::new(EnrichmentClient::new(&config.enricher));
        Self {
            config,
            storage: Arc::new(MemoryBackend::new()),
            enricher,
        }
    }

    /// Creates a new `ServerBuilder`.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Returns the server configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Creates the router with all routes and middleware.
    fn create_router(&self) -> Router {
        let state = Arc::new(AppState::new(
            self.config.clone(),
            Arc::clone(&self.storage),
            Arc::clone(&self.enricher),
        ));

        let cors = self.build_cors_layer();
        let metrics_layer = middleware::from_fn(crate::metrics::metrics_middleware);

        Router::new()
            .route("/health", get(health))
            .route("/ready", get(ready))
            .route("/metrics", get(crate::metrics::serve_metrics))
            .route("/openapi.json", get(serve_openapi))
            .merge(crate::routes::enrich::routes())
            .merge(crate::routes::runs::routes())
            // Middleware (order matters): Metrics outermost for timing, then trace, then CORS.
            .layer(middleware::from_fn(request_id_middleware))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(metrics_layer)
            .with_state(state)
    }

    /// Builds the CORS layer from configuration.
    fn build_cors_layer(&self) -> CorsLayer {
        let cors_config = &self.config.cors;
        let cors = Self::build_cors_base(cors_config);
        Self::apply_cors_allowed_origins(cors, cors_config)
    }

    fn build_cors_base(cors_config: &CorsConfig) -> CorsLayer {
        CorsLayer::new()
            .allow_methods([Method::GET, Method::HEAD, Method::POST, Method::OPTIONS])
            .allow_headers([
                header::AUTHORIZATION,
                header::CONTENT_TYPE,
                header::ACCEPT,
                header::HeaderName::from_static("x-request-id"),
            ])
            .expose_headers([
                header::CONTENT_TYPE,
                header::CONTENT_LENGTH,
                header::RETRY_AFTER,
                header::HeaderName::from_static("x-request-id"),
            ])
            .max_age(Duration::from_secs(cors_config.max_age_seconds))
    }

    fn cors_allows_any_origin(cors_config: &CorsConfig) -> bool {
        cors_config.allowed_origins.len() == 1
            && cors_config
                .allowed_origins
                .first()
                .is_some_and(|origin| origin == "*")
    }

    fn parse_cors_origins(cors_config: &CorsConfig) -> Vec<HeaderValue> {
        let mut allowed = Vec::new();
        for origin in &cors_config.allowed_origins {
            match HeaderValue::from_str(origin) {
                Ok(value) => allowed.push(value),
                Err(_) => {
                    tracing::error!(
                        origin = %origin,
                        "Invalid CORS origin; expected a valid HeaderValue"
                    );
                }
            }
        }
        allowed
    }

    fn apply_cors_allowed_origins(cors: CorsLayer, cors_config: &CorsConfig) -> CorsLayer {
        if cors_config.allowed_origins.is_empty() {
            return cors;
        }

        if Self::cors_allows_any_origin(cors_config) {
            return cors.allow_origin(Any);
        }

        if cors_config
            .allowed_origins
            .iter()
            .any(|origin| origin == "*")
        {
            tracing::error!(
                origins = ?cors_config.allowed_origins,
                "Invalid CORS config: '*' must be the only allowed origin"
            );
            return cors;
        }

        let allowed = Self::parse_cors_origins(cors_config);

        if allowed.is_empty() {
            tracing::warn!("All configured CORS origins were invalid; disabling CORS");
            cors
        } else {
            tracing::info!(origins = ?cors_config.allowed_origins, "CORS configured");
            cors.allow_origin(AllowOrigin::list(allowed))
        }
    }

    /// Starts the server and blocks until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the server cannot
    /// bind to the port.
    pub async fn serve(&self) -> Result<()> {
        self.validate_config()?;

        // Initialize metrics before starting the server
        crate::metrics::init_metrics();

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let router = self.create_router();

        tracing::info!(
            http_port = self.config.http_port,
            "Starting leadgate API server"
        );

        let listener =
            tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| leadgate_core::Error::Internal {
                    message: format!("failed to bind to {addr}: {e}"),
                })?;

        axum::serve(listener, router)
            .await
            .map_err(|e| leadgate_core::Error::Internal {
                message: format!("server error: {e}"),
            })?;

        Ok(())
    }

    /// Creates a test router for the server.
    ///
    /// This is useful for integration tests where you want to test
    /// the routes without actually binding to a port.
    #[doc(hidden)]
    pub fn test_router(&self) -> Router {
        self.create_router()
    }

    fn validate_config(&self) -> Result<()> {
        // Enforce "no wildcard in production" for CORS.
        if !self.config.debug
            && self
                .config
                .cors
                .allowed_origins
                .iter()
                .any(|origin| origin == "*")
        {
            return Err(leadgate_core::Error::InvalidInput(
                "cors.allowed_origins cannot include '*' when debug=false".to_string(),
            ));
        }

        if !self.config.debug && self.config.storage.data_dir.is_none() {
            return Err(leadgate_core::Error::InvalidInput(
                "storage.data_dir is required when debug=false".to_string(),
            ));
        }

        if !self.config.debug && self.config.enricher.api_key.is_none() {
            return Err(leadgate_core::Error::InvalidInput(
                "enricher.api_key is required when debug=false".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for constructing a server.
pub struct ServerBuilder {
    config: Config,
    storage: Arc<dyn StorageBackend>,
    enricher: Option<Arc<dyn Enricher>>,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("storage", &"<StorageBackend>")
            .field("enricher", &self.enricher.is_some())
            .finish()
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            storage: Arc::new(MemoryBackend::new()),
            enricher: None,
        }
    }
}

impl ServerBuilder {
    /// Creates a new server builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the full configuration.
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the HTTP port.
    #[must_use]
    pub fn http_port(mut self, port: u16) -> Self {
        self.config.http_port = port;
        self
    }

    /// Enables debug mode.
    ///
    /// See `Config::debug` for the guardrails this relaxes.
    #[must_use]
    pub fn debug(mut self, enabled: bool) -> Self {
        self.config.debug = enabled;
        self
    }

    /// Sets the storage backend used by request handlers.
    ///
    /// By default, the server uses an in-memory backend intended only for tests/dev.
    #[must_use]
    pub fn storage_backend(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = storage;
        self
    }

    /// Sets the enricher used for lead qualification.
    ///
    /// Defaults to the HTTP enrichment client built from the configuration.
    #[must_use]
    pub fn enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    /// Builds the server.
    #[must_use]
    pub fn build(self) -> Server {
        let enricher = self
            .enricher
            .unwrap_or_else(|| Arc::new(EnrichmentClient::new(&self.config.enricher)));
        Server {
            config: self.config,
            storage: self.storage,
            enricher,
        }
    }
}

#[cfg(test)]
pub(crate) use test_support::{test_router, test_router_with_failing_enricher};

#[cfg(test)]
mod test_support {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::Router;
    use serde_json::{Value, json};

    use leadgate_intake::{EnrichError, Enricher, EnrichmentResult, validate_result};

    use super::ServerBuilder;

    /// Enricher that qualifies every lead with a fixed score.
    struct StubEnricher;

    #[async_trait]
    impl Enricher for StubEnricher {
        async fn enrich(&self, payload: &Value) -> Result<EnrichmentResult, EnrichError> {
            let email = payload
                .get("email")
                .and_then(Value::as_str)
                .unwrap_or_default();
            validate_result(&json!({
                "qualified": true,
                "score": 80,
                "reasons": ["stub"],
                "lead": { "email": email }
            }))
        }
    }

    /// Enricher that always fails upstream.
    struct FailingEnricher;

    #[async_trait]
    impl Enricher for FailingEnricher {
        async fn enrich(&self, _payload: &Value) -> Result<EnrichmentResult, EnrichError> {
            Err(EnrichError::Upstream {
                message: "provider unavailable".to_string(),
            })
        }
    }

    pub(crate) fn test_router() -> Router {
        ServerBuilder::new()
            .debug(true)
            .enricher(Arc::new(StubEnricher))
            .build()
            .test_router()
    }

    pub(crate) fn test_router_with_failing_enricher() -> Router {
        ServerBuilder::new()
            .debug(true)
            .enricher(Arc::new(FailingEnricher))
            .build()
            .test_router()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_endpoint() -> Result<()> {
        let router = test_router();

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .context("build request")?;

        let response = router.oneshot(request).await.map_err(|err| -> anyhow::Error { match err {} })?;

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .context("read response body")?;
        let health: HealthResponse = serde_json::from_slice(&body).context("parse JSON body")?;
        assert_eq!(health.status, "ok");
        Ok(())
    }

    #[tokio::test]
    async fn test_ready_endpoint() -> Result<()> {
        let router = test_router();

        let request = Request::builder()
            .uri("/ready")
            .body(Body::empty())
            .context("build request")?;

        let response = router.oneshot(request).await.map_err(|err| -> anyhow::Error { match err {} })?;

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .context("read response body")?;
        let ready: ReadyResponse = serde_json::from_slice(&body).context("parse JSON body")?;
        assert!(ready.ready);
        Ok(())
    }

    #[tokio::test]
    async fn test_request_id_is_echoed() -> Result<()> {
        let router = test_router();

        let request = Request::builder()
            .uri("/health")
            .header("x-request-id", "req-42")
            .body(Body::empty())
            .context("build request")?;

        let response = router.oneshot(request).await.map_err(|err| -> anyhow::Error { match err {} })?;

        assert_eq!(
            response
                .headers()
                .get("x-request-id")
                .and_then(|value| value.to_str().ok()),
            Some("req-42")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_openapi_endpoint() -> Result<()> {
        let router = test_router();

        let request = Request::builder()
            .uri("/openapi.json")
            .body(Body::empty())
            .context("build request")?;

        let response = router.oneshot(request).await.map_err(|err| -> anyhow::Error { match err {} })?;

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .context("read response body")?;
        let spec: serde_json::Value = serde_json::from_slice(&body).context("parse JSON body")?;
        assert!(spec.pointer("/paths/~1enrich-lead").is_some());
        Ok(())
    }

    #[test]
    fn validate_config_rejects_wildcard_cors_in_production() {
        let mut config = Config::default();
        config.cors.allowed_origins = vec!["*".to_string()];
        config.storage.data_dir = Some("/var/lib/leadgate".to_string());
        config.enricher.api_key = Some("sk-test".to_string());
        let server = ServerBuilder::new().config(config).build();

        assert!(server.validate_config().is_err());
    }

    #[test]
    fn validate_config_requires_data_dir_in_production() {
        let mut config = Config::default();
        config.enricher.api_key = Some("sk-test".to_string());
        let server = ServerBuilder::new().config(config).build();

        assert!(server.validate_config().is_err());
    }

    #[test]
    fn validate_config_requires_api_key_in_production() {
        let mut config = Config::default();
        config.storage.data_dir = Some("/var/lib/leadgate".to_string());
        let server = ServerBuilder::new().config(config).build();

        assert!(server.validate_config().is_err());
    }

    #[test]
    fn validate_config_accepts_debug_defaults() {
        let server = ServerBuilder::new().debug(true).build();
        assert!(server.validate_config().is_ok());
    }
}
