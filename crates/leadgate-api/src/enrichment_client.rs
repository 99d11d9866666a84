//! HTTP client for the chat-completions enrichment provider.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use leadgate_intake::{EnrichError, Enricher, EnrichmentResult, validate_result};

use crate::config::EnricherConfig;

const SYSTEM_PROMPT: &str = "You are a lead qualification analyst. Given a raw lead payload, \
respond with a single JSON object and nothing else. The object must have exactly these fields: \
\"qualified\" (boolean), \"score\" (integer 0-100), \"reasons\" (array of strings), and \"lead\" \
(object with nullable fields name, email, phone, budget, intent, urgency, industry; budget is a \
number, urgency is one of \"low\", \"medium\", \"high\", and the rest are strings). \
Do not add any other fields.";

/// HTTP client that enriches leads through a chat-completions endpoint.
#[derive(Clone)]
pub struct EnrichmentClient {
    base_url: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

impl EnrichmentClient {
    /// Creates a new client from provider configuration.
    #[must_use]
    pub fn new(config: &EnricherConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            client,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

impl std::fmt::Debug for EnrichmentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrichmentClient")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Enricher for EnrichmentClient {
    async fn enrich(&self, payload: &Value) -> Result<EnrichmentResult, EnrichError> {
        let body = json!({
            "model": self.model,
            "temperature": 0.1,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": payload.to_string() },
            ],
        });

        let mut request = self.client.post(self.completions_url()).json(&body);
        if let Some(key) = self.api_key.as_deref() {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| EnrichError::Upstream {
            message: format!("enrichment request failed: {e}"),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            let message = serde_json::from_slice::<Value>(&body)
                .ok()
                .and_then(|value| {
                    value
                        .pointer("/error/message")
                        .or_else(|| value.get("message"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                })
                .unwrap_or_else(|| String::from_utf8_lossy(&body).to_string());
            return Err(EnrichError::Upstream {
                message: format!("enrichment provider returned {status}: {message}"),
            });
        }

        let completion =
            response
                .json::<ChatCompletion>()
                .await
                .map_err(|e| EnrichError::Upstream {
                    message: format!("invalid completion envelope: {e}"),
                })?;

        let content = completion
            .choices
            .first()
            .map(|choice| choice.message.content.as_str())
            .ok_or_else(|| EnrichError::Upstream {
                message: "completion contained no choices".to_string(),
            })?;

        let raw = serde_json::from_str::<Value>(strip_code_fences(content)).map_err(|e| {
            EnrichError::SchemaInvalid {
                detail: format!("completion content is not JSON: {e}"),
            }
        })?;

        validate_result(&raw)
    }
}

/// Strips a markdown code fence wrapper from model output, if present.
///
/// Providers sometimes wrap the JSON in ```json ... ``` despite instructions.
fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(inner) = inner.strip_suffix("```") else {
        return trimmed;
    };
    // Drop the optional language tag on the opening fence line.
    match inner.split_once('\n') {
        Some((first_line, rest))
            if first_line.trim().chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            rest.trim()
        }
        _ => inner.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::post;
    use reqwest::StatusCode;
    use serde_json::json;

    async fn spawn_status_server(status: StatusCode, body: serde_json::Value) -> String {
        let app = Router::new().route(
            "/chat/completions",
            post(move || {
                let status = status;
                let body = body.clone();
                async move { (status, axum::Json(body)) }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        format!("http://{addr}")
    }

    fn client_for(base_url: String) -> EnrichmentClient {
        EnrichmentClient::new(&EnricherConfig {
            base_url,
            api_key: None,
            model: "test-model".to_string(),
            timeout_secs: 5,
        })
    }

    fn completion_with(content: &str) -> serde_json::Value {
        json!({
            "choices": [
                { "message": { "role": "assistant", "content": content } }
            ]
        })
    }

    fn valid_result_json() -> String {
        json!({
            "qualified": true,
            "score": 85,
            "reasons": ["stated budget"],
            "lead": {
                "name": "Dana",
                "email": "dana@example.com",
                "phone": null,
                "budget": 10000.0,
                "intent": "buy",
                "urgency": "high",
                "industry": null
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn enrich_parses_valid_completion() {
        let base_url =
            spawn_status_server(StatusCode::OK, completion_with(&valid_result_json())).await;
        let client = client_for(base_url);

        let result = client
            .enrich(&json!({ "email": "dana@example.com" }))
            .await
            .expect("enrich should succeed");
        assert!(result.qualified);
        assert_eq!(result.score, 85);
    }

    #[tokio::test]
    async fn enrich_strips_code_fences() {
        let fenced = format!("```json\n{}\n```", valid_result_json());
        let base_url = spawn_status_server(StatusCode::OK, completion_with(&fenced)).await;
        let client = client_for(base_url);

        let result = client
            .enrich(&json!({ "email": "dana@example.com" }))
            .await
            .expect("fenced content should be accepted");
        assert_eq!(result.score, 85);
    }

    #[tokio::test]
    async fn enrich_maps_provider_error_to_upstream() {
        let base_url = spawn_status_server(
            StatusCode::TOO_MANY_REQUESTS,
            json!({ "error": { "message": "rate limited" } }),
        )
        .await;
        let client = client_for(base_url);

        let err = client
            .enrich(&json!({ "email": "dana@example.com" }))
            .await
            .expect_err("provider error should surface");
        let EnrichError::Upstream { message } = err else {
            panic!("unexpected error: {err:?}");
        };
        assert!(message.contains("rate limited"));
    }

    #[tokio::test]
    async fn enrich_rejects_non_json_content() {
        let base_url =
            spawn_status_server(StatusCode::OK, completion_with("sorry, I cannot help")).await;
        let client = client_for(base_url);

        let err = client
            .enrich(&json!({ "email": "dana@example.com" }))
            .await
            .expect_err("prose content should be rejected");
        assert!(matches!(err, EnrichError::SchemaInvalid { .. }));
    }

    #[tokio::test]
    async fn enrich_rejects_contract_breaking_content() {
        let breaking = json!({
            "qualified": "yes",
            "score": 85,
            "reasons": [],
            "lead": {}
        })
        .to_string();
        let base_url = spawn_status_server(StatusCode::OK, completion_with(&breaking)).await;
        let client = client_for(base_url);

        let err = client
            .enrich(&json!({ "email": "dana@example.com" }))
            .await
            .expect_err("wrong field type should be rejected");
        assert!(matches!(err, EnrichError::SchemaInvalid { .. }));
    }

    #[test]
    fn strip_code_fences_handles_plain_and_fenced() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1}  "), "{\"a\":1}");
    }
}
