//! Deduplication key derivation for lead payloads.
//!
//! Inbound payloads arrive from heterogeneous sources (web forms, CRM
//! webhooks, CSV imports) with inconsistent field casing and naming. The
//! dedup key is derived from the lead's identity fields only, so the same
//! person submitted through two channels collapses onto one key regardless
//! of how the rest of the payload differs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use serde_json::Value;

/// Length of a dedup key in characters (hex-encoded SHA-256).
pub const KEY_LEN: usize = 64;

/// Field aliases accepted for the email identity component.
const EMAIL_FIELDS: &[&str] = &["email", "Email", "EMAIL"];

/// Field aliases accepted for the phone identity component.
const PHONE_FIELDS: &[&str] = &["phone", "Phone", "PHONE", "mobile", "tel"];

/// Field aliases accepted for the source attribution field.
const SOURCE_FIELDS: &[&str] = &["source", "Source", "SOURCE", "origin", "channel"];

/// Source value reported when the payload carries no attribution field.
pub const UNKNOWN_SOURCE: &str = "unknown";

/// A deduplication key: the hex-encoded SHA-256 of a lead's normalized
/// identity fields.
///
/// Two payloads with the same normalized email and phone always derive the
/// same key, which is what the claim protocol and the run ledger are keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    /// Returns the key as a hex string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the first two hex characters, used to shard storage paths
    /// so no single directory accumulates every object.
    #[must_use]
    pub fn shard_prefix(&self) -> &str {
        &self.0[..2]
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors from dedup key derivation.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// The payload carried no usable identity field.
    #[error("payload has no identity fields (email or phone) to derive a dedup key")]
    IdentityMissing,
}

/// Derives the dedup key from a lead payload.
///
/// The email component is trimmed and lowercased; the phone component is
/// trimmed. A payload where both components are absent or empty has no
/// identity and is rejected rather than being collapsed onto a shared key.
pub fn derive_key(payload: &Value) -> Result<DedupKey, KeyError> {
    let email = extract_field(payload, EMAIL_FIELDS)
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_default();
    let phone = extract_field(payload, PHONE_FIELDS)
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    if email.is_empty() && phone.is_empty() {
        return Err(KeyError::IdentityMissing);
    }

    let digest = Sha256::digest(format!("{email}{phone}").as_bytes());
    Ok(DedupKey(hex::encode(digest)))
}

/// Extracts the source attribution from a payload, defaulting to
/// [`UNKNOWN_SOURCE`] when absent or empty.
#[must_use]
pub fn extract_source(payload: &Value) -> String {
    extract_field(payload, SOURCE_FIELDS)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| UNKNOWN_SOURCE.to_string())
}

/// Returns the first present alias as a string. Numeric values are accepted
/// (phone numbers show up as JSON numbers from some form builders).
fn extract_field(payload: &Value, aliases: &[&str]) -> Option<String> {
    let obj = payload.as_object()?;
    for alias in aliases {
        match obj.get(*alias) {
            Some(Value::String(s)) => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}
