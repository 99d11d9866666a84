//! Error types for leadgate-intake operations.

use thiserror::Error;

/// Result type alias for intake operations.
pub type Result<T> = std::result::Result<T, IntakeError>;

/// Errors that can occur during intake processing.
///
/// Enrichment failures are not errors at this level: a failed enrichment is
/// a normal coordinator outcome that gets its own ledger run. These variants
/// cover the cases where the intake machinery itself cannot make progress.
#[derive(Debug, Error)]
pub enum IntakeError {
    /// The payload carried no identity fields to derive a dedup key from.
    #[error("payload has no identity fields (email or phone) to derive a dedup key")]
    IdentityMissing,

    /// The durable store rejected or failed an operation.
    #[error("durable store unavailable: {message}")]
    Store {
        /// Description of the store failure.
        message: String,
    },

    /// An invariant was violated that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl IntakeError {
    /// Creates a new store error with the given message.
    #[must_use]
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<leadgate_core::Error> for IntakeError {
    fn from(e: leadgate_core::Error) -> Self {
        match e {
            leadgate_core::Error::Storage { message, .. } => Self::Store { message },
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}

/// Errors from an enrichment invocation.
///
/// The coordinator treats the two variants identically (release the claim,
/// record a failed run); the split exists so the failure reason recorded in
/// the ledger distinguishes a misbehaving upstream from a contract breach.
#[derive(Debug, Error)]
pub enum EnrichError {
    /// The enrichment output did not satisfy the result contract.
    #[error("enrichment result failed validation: {detail}")]
    SchemaInvalid {
        /// Description of the contract violation.
        detail: String,
    },

    /// The upstream enrichment service failed, timed out, or returned
    /// an unusable response envelope.
    #[error("enrichment upstream failure: {message}")]
    Upstream {
        /// Description of the upstream failure.
        message: String,
    },
}
