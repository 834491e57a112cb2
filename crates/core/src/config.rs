//! Configuration types shared across crates.

use crate::endpoint::EndpointEntry;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry configuration for per-endpoint network calls.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied per attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Apply +/-25% uniform jitter to each delay.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Base delay as a Duration.
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Max delay as a Duration.
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Validate retry settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(format!(
                "retry.backoff_factor must be >= 1.0, got {}",
                self.backoff_factor
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            ));
        }
        Ok(())
    }
}

/// Authorization token cache configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenCacheConfig {
    /// A cached token is reused only until this long before it expires.
    #[serde(default = "default_safety_margin_secs")]
    pub safety_margin_secs: u64,
    /// Interval between background sweeps of expired entries.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Lifetime requested from the issuer for new tokens.
    #[serde(default = "default_token_lifetime_secs")]
    pub token_lifetime_secs: u64,
}

fn default_safety_margin_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_token_lifetime_secs() -> u64 {
    300
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            safety_margin_secs: default_safety_margin_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            token_lifetime_secs: default_token_lifetime_secs(),
        }
    }
}

impl TokenCacheConfig {
    /// Safety margin as a Duration.
    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_secs)
    }

    /// Sweep interval as a Duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Token lifetime as a Duration.
    pub fn token_lifetime(&self) -> Duration {
        Duration::from_secs(self.token_lifetime_secs)
    }

    /// Validate token cache settings.
    pub fn validate(&self) -> Result<(), String> {
        // tokio::time::interval panics on a zero period
        if self.sweep_interval_secs == 0 {
            return Err("tokens.sweep_interval_secs cannot be 0".to_string());
        }
        if self.token_lifetime_secs <= self.safety_margin_secs {
            return Err(format!(
                "tokens.token_lifetime_secs ({}) must exceed tokens.safety_margin_secs ({}) \
                 or no token would ever be reused",
                self.token_lifetime_secs, self.safety_margin_secs
            ));
        }
        Ok(())
    }
}

/// Request coalescing configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoalescingConfig {
    /// How long an in-flight entry may be joined by new callers.
    #[serde(default = "default_coalescing_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_coalescing_ttl_secs() -> u64 {
    30
}

impl Default for CoalescingConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_coalescing_ttl_secs(),
        }
    }
}

impl CoalescingConfig {
    /// TTL as a Duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Retry policy for per-endpoint calls.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Token cache.
    #[serde(default)]
    pub tokens: TokenCacheConfig,
    /// Request coalescing.
    #[serde(default)]
    pub coalescing: CoalescingConfig,
    /// Per-call timeout for metadata requests (list, delete, probe, mirror).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Per-call timeout for body transfers (upload, download, source fetch).
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
    /// Largest blob the engine will upload, in bytes.
    #[serde(default = "default_max_blob_size")]
    pub max_blob_size: u64,
    /// Scheme placed before the token in the `Authorization` header.
    #[serde(default = "default_auth_scheme")]
    pub auth_scheme: String,
    /// When a target has no mirror route, upload the source bytes instead.
    #[serde(default = "default_true")]
    pub mirror_upload_fallback: bool,
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_transfer_timeout_secs() -> u64 {
    900 // 15 minutes for large media
}

fn default_max_blob_size() -> u64 {
    crate::DEFAULT_MAX_BLOB_SIZE
}

fn default_auth_scheme() -> String {
    "Nostr".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            tokens: TokenCacheConfig::default(),
            coalescing: CoalescingConfig::default(),
            request_timeout_secs: default_request_timeout_secs(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
            max_blob_size: default_max_blob_size(),
            auth_scheme: default_auth_scheme(),
            mirror_upload_fallback: true,
        }
    }
}

impl EngineConfig {
    /// Metadata request timeout as a Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Transfer timeout as a Duration.
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    /// Validate the whole engine configuration.
    pub fn validate(&self) -> Result<(), String> {
        self.retry.validate()?;
        self.tokens.validate()?;

        if self.request_timeout_secs == 0 {
            return Err("request_timeout_secs cannot be 0".to_string());
        }
        if self.transfer_timeout_secs == 0 {
            return Err("transfer_timeout_secs cannot be 0".to_string());
        }
        if self.auth_scheme.trim().is_empty() || self.auth_scheme.contains(char::is_whitespace) {
            return Err(format!(
                "auth_scheme must be a single non-empty word, got '{}'",
                self.auth_scheme
            ));
        }
        Ok(())
    }
}

/// Client configuration as loaded by the CLI.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Hex-encoded Ed25519 secret key.
    /// WARNING: Prefer the KEEPSAKE_SECRET_KEY env var over storing it in a file.
    #[serde(default)]
    pub secret_key: Option<String>,
    /// Ordered endpoint list; the first entry is the primary.
    #[serde(default)]
    pub endpoints: Vec<EndpointEntry>,
    /// Engine settings.
    #[serde(default)]
    pub engine: EngineConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_defaults_validate() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tokens.safety_margin_secs, 30);
        assert_eq!(config.max_blob_size, 200 * 1024 * 1024);
        assert!(config.mirror_upload_fallback);
    }

    #[test]
    fn test_engine_config_deserialize_partial() {
        let json = r#"{"retry": {"max_attempts": 5}, "auth_scheme": "Bearer"}"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert!(config.retry.jitter);
        assert_eq!(config.auth_scheme, "Bearer");
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[test]
    fn test_retry_config_rejects_shrinking_backoff() {
        let config = RetryConfig {
            backoff_factor: 0.5,
            ..RetryConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_config_rejects_inverted_delays() {
        let config = RetryConfig {
            base_delay_ms: 10_000,
            max_delay_ms: 1_000,
            ..RetryConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_token_config_rejects_zero_sweep() {
        let config = TokenCacheConfig {
            sweep_interval_secs: 0,
            ..TokenCacheConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_token_config_rejects_lifetime_inside_margin() {
        let config = TokenCacheConfig {
            token_lifetime_secs: 30,
            ..TokenCacheConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_engine_config_rejects_multiword_scheme() {
        let config = EngineConfig {
            auth_scheme: "Not Valid".to_string(),
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_client_config_from_toml() {
        let toml = r#"
            [[endpoints]]
            url = "https://a.example.com/"

            [[endpoints]]
            url = "https://b.example.com"
            name = "Backup"

            [engine.retry]
            max_attempts = 4

            [engine.coalescing]
            ttl_secs = 10
        "#;
        let config: ClientConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[1].name.as_deref(), Some("Backup"));
        assert!(config.secret_key.is_none());
        assert_eq!(config.engine.retry.max_attempts, 4);
        assert_eq!(config.engine.coalescing.ttl_secs, 10);
        assert_eq!(config.engine.tokens.sweep_interval_secs, 60);
    }
}
