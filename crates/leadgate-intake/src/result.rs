//! The enrichment result contract.
//!
//! Whatever the upstream model returns is untrusted text until it passes
//! validation here. Only values of [`EnrichmentResult`] ever reach the run
//! ledger or an HTTP response, so a malformed completion can never leak a
//! half-shaped object to callers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::error::EnrichError;

/// Urgency bucket assigned by enrichment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    /// No pressing timeline.
    Low,
    /// Active evaluation.
    Medium,
    /// Ready to buy.
    High,
}

/// Structured lead fields extracted from the raw payload.
///
/// Every field is nullable: the extractor reports only what the payload
/// actually contained, it never invents values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(default, deny_unknown_fields)]
pub struct LeadProfile {
    /// Contact name.
    pub name: Option<String>,
    /// Contact email.
    pub email: Option<String>,
    /// Contact phone.
    pub phone: Option<String>,
    /// Stated budget as a number, when the payload gave one.
    pub budget: Option<f64>,
    /// What the lead is trying to accomplish.
    pub intent: Option<String>,
    /// Urgency bucket.
    pub urgency: Option<Urgency>,
    /// Industry or vertical.
    pub industry: Option<String>,
}

/// A validated enrichment result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct EnrichmentResult {
    /// Whether the lead is worth routing to sales.
    pub qualified: bool,
    /// Qualification score in `[0, 100]`.
    pub score: u8,
    /// Human-readable reasons behind the verdict.
    pub reasons: Vec<String>,
    /// Extracted lead fields.
    pub lead: LeadProfile,
}

/// Validates a raw JSON value against the enrichment result contract.
///
/// Rejects missing fields, wrong types, unknown fields, out-of-range scores,
/// and urgency values outside the allowed set. The error detail names the
/// first offending field so ledger entries stay debuggable.
pub fn validate_result(raw: &Value) -> std::result::Result<EnrichmentResult, EnrichError> {
    let result: EnrichmentResult =
        serde_json::from_value(raw.clone()).map_err(|e| EnrichError::SchemaInvalid {
            detail: e.to_string(),
        })?;

    if result.score > 100 {
        return Err(EnrichError::SchemaInvalid {
            detail: format!("score {} is out of range [0, 100]", result.score),
        });
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_raw() -> Value {
        json!({
            "qualified": true,
            "score": 85,
            "reasons": ["stated budget", "decision maker"],
            "lead": {
                "name": "Jane Doe",
                "email": "jane@example.com",
                "phone": null,
                "budget": 125000.0,
                "intent": "replace CRM",
                "urgency": "high",
                "industry": "saas"
            }
        })
    }

    #[test]
    fn test_valid_result_accepted() {
        let result = validate_result(&valid_raw()).expect("should validate");
        assert!(result.qualified);
        assert_eq!(result.score, 85);
        assert_eq!(result.lead.urgency, Some(Urgency::High));
        assert_eq!(result.lead.budget, Some(125_000.0));
        assert_eq!(result.lead.phone, None);
    }

    #[test]
    fn test_non_numeric_budget_rejected() {
        let mut raw = valid_raw();
        raw["lead"]["budget"] = json!("10k");
        let err = validate_result(&raw).expect_err("should reject");
        assert!(matches!(err, EnrichError::SchemaInvalid { .. }));
    }

    #[test]
    fn test_integer_budget_accepted() {
        let mut raw = valid_raw();
        raw["lead"]["budget"] = json!(50000);
        let result = validate_result(&raw).expect("integers widen to the budget number");
        assert_eq!(result.lead.budget, Some(50_000.0));
    }

    #[test]
    fn test_missing_field_rejected() {
        let mut raw = valid_raw();
        raw.as_object_mut().unwrap().remove("score");

        let err = validate_result(&raw).expect_err("should reject");
        assert!(matches!(err, EnrichError::SchemaInvalid { ref detail } if detail.contains("score")));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let mut raw = valid_raw();
        raw["qualified"] = json!("yes");
        assert!(validate_result(&raw).is_err());
    }

    #[test]
    fn test_out_of_range_score_rejected() {
        let mut raw = valid_raw();
        raw["score"] = json!(150);
        let err = validate_result(&raw).expect_err("should reject");
        assert!(matches!(err, EnrichError::SchemaInvalid { ref detail } if detail.contains("score")));

        raw["score"] = json!(-5);
        assert!(validate_result(&raw).is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut raw = valid_raw();
        raw["confidence"] = json!(0.9);
        assert!(validate_result(&raw).is_err());
    }

    #[test]
    fn test_omitted_lead_fields_default_to_null() {
        let mut raw = valid_raw();
        raw["lead"].as_object_mut().unwrap().remove("industry");
        let result = validate_result(&raw).expect("absent nullable fields are fine");
        assert_eq!(result.lead.industry, None);
    }

    #[test]
    fn test_invalid_urgency_rejected() {
        let mut raw = valid_raw();
        raw["lead"]["urgency"] = json!("immediately");
        assert!(validate_result(&raw).is_err());
    }

    #[test]
    fn test_serialization_is_stable() {
        let result = validate_result(&valid_raw()).unwrap();
        let first = serde_json::to_vec(&result).unwrap();
        let second = serde_json::to_vec(&result).unwrap();
        assert_eq!(first, second);
    }
}
