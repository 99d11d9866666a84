//! # leadgate-api
//!
//! HTTP composition layer for the leadgate intake service.
//!
//! This crate provides the API surface for leadgate, handling:
//!
//! - **Routing**: HTTP endpoint configuration
//! - **Service Wiring**: Composition of the intake coordinator and stores
//! - **Enrichment**: HTTP client for the chat-completions provider
//! - **Observability**: Metrics, tracing, and health checks
//!
//! ## Design Principles
//!
//! This crate is a **thin composition layer** with no domain policy.
//! All intake logic lives in `leadgate-intake`.
//!
//! ## Endpoints
//!
//! ```text
//! GET  /health        - Health check
//! GET  /ready         - Readiness check
//! GET  /metrics       - Prometheus metrics
//! GET  /openapi.json  - OpenAPI spec
//! POST /enrich-lead   - Submit a lead for deduplicated enrichment
//! GET  /runs          - List recorded runs
//! GET  /runs/{id}     - Get a run by ID
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use leadgate_api::server::Server;
//!
//! let server = Server::builder()
//!     .http_port(8080)
//!     .build();
//!
//! server.serve().await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod enrichment_client;
pub mod error;
pub mod metrics;
pub mod openapi;
pub mod routes;
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{ApiError, ApiResult};
    pub use crate::server::Server;
}
