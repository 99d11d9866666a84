//! The enrichment seam.
//!
//! The coordinator only ever sees this trait. The production implementation
//! calls an external classification service; tests substitute scripted
//! implementations to exercise every failure path deterministically.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EnrichError;
use crate::result::EnrichmentResult;

/// Classifies and extracts structure from a raw lead payload.
#[async_trait]
pub trait Enricher: Send + Sync {
    /// Enriches a single lead payload.
    ///
    /// Implementations must return only results that already passed the
    /// contract validation in [`crate::result::validate_result`]; the
    /// coordinator records whatever comes back verbatim.
    async fn enrich(&self, payload: &Value) -> Result<EnrichmentResult, EnrichError>;
}
