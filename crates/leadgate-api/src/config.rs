//! Server configuration.

use serde::{Deserialize, Serialize};

use leadgate_core::{Error, Result};

/// Configuration for the leadgate API server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server port.
    pub http_port: u16,

    /// Enable debug mode.
    ///
    /// When enabled:
    /// - an in-memory storage backend is allowed when no data directory is set
    /// - wildcard CORS origins are allowed
    /// - the enrichment API key may be absent
    pub debug: bool,

    /// CORS configuration.
    #[serde(default)]
    pub cors: CorsConfig,

    /// Storage configuration (data directory selection).
    #[serde(default)]
    pub storage: StorageConfig,

    /// Enrichment provider configuration.
    #[serde(default)]
    pub enricher: EnricherConfig,

    /// Stale timeout for in-progress claims in seconds.
    ///
    /// Claims older than this timeout can be taken over by a new request,
    /// which prevents crashed workers from blocking a lead forever.
    ///
    /// Default: 300 (5 minutes).
    #[serde(default = "default_claim_stale_timeout_secs")]
    pub claim_stale_timeout_secs: u64,
}

const MIN_CLAIM_STALE_TIMEOUT_SECS: u64 = 10;
const MAX_CLAIM_STALE_TIMEOUT_SECS: u64 = 3600; // 1 hour max

fn default_claim_stale_timeout_secs() -> u64 {
    300 // 5 minutes, matching leadgate_intake::claim::DEFAULT_STALE_TIMEOUT
}

/// CORS configuration for browser-based access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins. Use `["*"]` to allow all origins (development only).
    /// Empty list disables CORS entirely.
    pub allowed_origins: Vec<String>,

    /// Max age for preflight cache (seconds).
    pub max_age_seconds: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            // Default: disabled (secure-by-default).
            // Set to `["*"]` for local development, or explicit origins for production.
            allowed_origins: Vec::new(),
            max_age_seconds: 3600, // 1 hour
        }
    }
}

/// Storage configuration for the API server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory that holds claims and run records.
    ///
    /// When unset in debug mode the server falls back to an in-memory
    /// backend, which loses all state on restart.
    #[serde(default)]
    pub data_dir: Option<String>,
}

/// Enrichment provider configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct EnricherConfig {
    /// Base URL of the chat-completions provider.
    pub base_url: String,

    /// API key attached as a bearer token. Required outside debug mode.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Model name sent with every completion request.
    pub model: String,

    /// Per-request timeout in seconds for the enrichment call.
    pub timeout_secs: u64,
}

impl Default for EnricherConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 30,
        }
    }
}

impl std::fmt::Debug for EnricherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnricherConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("model", &self.model)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            debug: false,
            cors: CorsConfig::default(),
            storage: StorageConfig::default(),
            enricher: EnricherConfig::default(),
            claim_stale_timeout_secs: default_claim_stale_timeout_secs(),
        }
    }
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Supported env vars:
    /// - `LEADGATE_HTTP_PORT`
    /// - `LEADGATE_DEBUG`
    /// - `LEADGATE_CORS_ALLOWED_ORIGINS` (comma-separated, or `*`)
    /// - `LEADGATE_CORS_MAX_AGE_SECONDS`
    /// - `LEADGATE_DATA_DIR`
    /// - `LEADGATE_ENRICHER_BASE_URL`
    /// - `LEADGATE_ENRICHER_API_KEY`
    /// - `LEADGATE_ENRICHER_MODEL`
    /// - `LEADGATE_ENRICHER_TIMEOUT_SECS`
    /// - `LEADGATE_CLAIM_STALE_TIMEOUT_SECS` (10-3600, default: 300)
    ///
    /// # Errors
    ///
    /// Returns an error if any environment variable is present but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = env_u16("LEADGATE_HTTP_PORT")? {
            config.http_port = port;
        }
        if let Some(debug) = env_bool("LEADGATE_DEBUG")? {
            config.debug = debug;
        }

        if let Some(origins) = env_string("LEADGATE_CORS_ALLOWED_ORIGINS") {
            config.cors.allowed_origins = parse_cors_allowed_origins(&origins);
        }
        if let Some(max_age) = env_u64("LEADGATE_CORS_MAX_AGE_SECONDS")? {
            config.cors.max_age_seconds = max_age;
        }

        if let Some(dir) = env_string("LEADGATE_DATA_DIR") {
            config.storage.data_dir = Some(dir);
        }

        if let Some(url) = env_string("LEADGATE_ENRICHER_BASE_URL") {
            config.enricher.base_url = url;
        }
        if let Some(key) = env_string("LEADGATE_ENRICHER_API_KEY") {
            config.enricher.api_key = Some(key);
        }
        if let Some(model) = env_string("LEADGATE_ENRICHER_MODEL") {
            config.enricher.model = model;
        }
        if let Some(secs) = env_u64("LEADGATE_ENRICHER_TIMEOUT_SECS")? {
            if secs == 0 {
                return Err(Error::InvalidInput(
                    "LEADGATE_ENRICHER_TIMEOUT_SECS must be greater than 0".to_string(),
                ));
            }
            config.enricher.timeout_secs = secs;
        }

        if let Some(secs) = env_u64("LEADGATE_CLAIM_STALE_TIMEOUT_SECS")? {
            if secs < MIN_CLAIM_STALE_TIMEOUT_SECS {
                return Err(Error::InvalidInput(format!(
                    "LEADGATE_CLAIM_STALE_TIMEOUT_SECS must be at least {MIN_CLAIM_STALE_TIMEOUT_SECS} seconds"
                )));
            }
            if secs > MAX_CLAIM_STALE_TIMEOUT_SECS {
                return Err(Error::InvalidInput(format!(
                    "LEADGATE_CLAIM_STALE_TIMEOUT_SECS must be at most {MAX_CLAIM_STALE_TIMEOUT_SECS} seconds"
                )));
            }
            config.claim_stale_timeout_secs = secs;
        }

        Ok(config)
    }

    /// Returns the claim stale timeout as a `chrono::Duration`.
    #[must_use]
    pub fn claim_stale_timeout(&self) -> chrono::Duration {
        let secs = self
            .claim_stale_timeout_secs
            .min(MAX_CLAIM_STALE_TIMEOUT_SECS);
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
    }

    /// Returns the enrichment invoke timeout as a `std::time::Duration`.
    #[must_use]
    pub fn invoke_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.enricher.timeout_secs)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u16(name: &str) -> Result<Option<u16>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u16>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u16: {e}")))
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    parse_bool(name, &v).map(Some)
}

fn parse_cors_allowed_origins(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed == "*" {
        return vec!["*".to_string()];
    }

    trimmed
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_true_values() {
        assert!(parse_bool("TEST", "true").unwrap());
        assert!(parse_bool("TEST", "1").unwrap());
        assert!(parse_bool("TEST", "yes").unwrap());
        assert!(parse_bool("TEST", "TRUE").unwrap());
    }

    #[test]
    fn parse_bool_accepts_false_values() {
        assert!(!parse_bool("TEST", "false").unwrap());
        assert!(!parse_bool("TEST", "0").unwrap());
        assert!(!parse_bool("TEST", "no").unwrap());
        assert!(!parse_bool("TEST", "FALSE").unwrap());
    }

    #[test]
    fn parse_bool_rejects_invalid_values() {
        assert!(parse_bool("TEST", "maybe").is_err());
        assert!(parse_bool("TEST", "").is_err());
    }

    #[test]
    fn parse_cors_origins_splits_and_trims() {
        let origins = parse_cors_allowed_origins("https://a.example , https://b.example,");
        assert_eq!(origins, vec!["https://a.example", "https://b.example"]);
    }

    #[test]
    fn parse_cors_origins_wildcard() {
        assert_eq!(parse_cors_allowed_origins(" * "), vec!["*"]);
        assert!(parse_cors_allowed_origins("  ").is_empty());
    }

    #[test]
    fn enricher_debug_redacts_api_key() {
        let enricher = EnricherConfig {
            api_key: Some("sk-super-secret".to_string()),
            ..EnricherConfig::default()
        };
        let dbg = format!("{enricher:?}");
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains("sk-super-secret"));
    }

    #[test]
    fn claim_stale_timeout_is_clamped() {
        let config = Config {
            claim_stale_timeout_secs: 10_000,
            ..Config::default()
        };
        assert_eq!(config.claim_stale_timeout(), chrono::Duration::seconds(3600));
    }

    #[test]
    fn defaults_are_production_safe() {
        let config = Config::default();
        assert!(!config.debug);
        assert!(config.cors.allowed_origins.is_empty());
        assert_eq!(config.claim_stale_timeout_secs, 300);
        assert_eq!(config.enricher.timeout_secs, 30);
    }
}
