use serde::{Deserialize, Serialize};

/// Main configuration for a pressbill deployment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub logging: LoggingConfig,
    pub cache: CacheConfig,
    pub stripe: ProviderConfig,
    pub paddle: ProviderConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_json")]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Maximum number of cached entries before eviction.
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
    /// Default TTL for entries that don't specify one, in seconds.
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_seconds: u64,
}

/// Connection settings for one payment provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// Secret API key. Loaded from the environment; handed to clients as a
    /// `SecretString` so it never appears in debug output.
    #[serde(default)]
    pub api_key: String,
    /// Shared secret for webhook signature verification.
    #[serde(default)]
    pub webhook_secret: String,
    /// Override of the provider API base URL (tests point this at a fake).
    #[serde(default)]
    pub base_url: Option<String>,
    /// Bound on any single provider API call, in seconds.
    #[serde(default = "default_provider_timeout")]
    pub timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            cache: CacheConfig::default(),
            stripe: ProviderConfig::default(),
            paddle: ProviderConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_json(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            default_ttl_seconds: default_cache_ttl(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            webhook_secret: String::new(),
            base_url: None,
            timeout_seconds: default_provider_timeout(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json() -> bool {
    false
}

fn default_max_entries() -> u64 {
    10_000
}

fn default_cache_ttl() -> u64 {
    86_400
}

fn default_provider_timeout() -> u64 {
    30
}

/// Builder for [`Config`] with environment variable overrides.
///
/// Environment variables use the `PRESSBILL_` prefix:
/// `PRESSBILL_LOG_LEVEL`, `PRESSBILL_LOG_JSON`, `PRESSBILL_CACHE_MAX_ENTRIES`,
/// `PRESSBILL_STRIPE_SECRET_KEY`, `PRESSBILL_STRIPE_WEBHOOK_SECRET`,
/// `PRESSBILL_PADDLE_API_KEY`, `PRESSBILL_PADDLE_WEBHOOK_SECRET`.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply environment variable overrides.
    #[must_use]
    pub fn from_env(mut self) -> Self {
        if let Ok(level) = std::env::var("PRESSBILL_LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Ok(json) = std::env::var("PRESSBILL_LOG_JSON") {
            self.config.logging.json = json.parse().unwrap_or(false);
        }
        if let Ok(max) = std::env::var("PRESSBILL_CACHE_MAX_ENTRIES") {
            if let Ok(max) = max.parse() {
                self.config.cache.max_entries = max;
            }
        }
        if let Ok(ttl) = std::env::var("PRESSBILL_CACHE_TTL_SECONDS") {
            if let Ok(ttl) = ttl.parse() {
                self.config.cache.default_ttl_seconds = ttl;
            }
        }
        if let Ok(key) = std::env::var("PRESSBILL_STRIPE_SECRET_KEY") {
            self.config.stripe.api_key = key;
        }
        if let Ok(secret) = std::env::var("PRESSBILL_STRIPE_WEBHOOK_SECRET") {
            self.config.stripe.webhook_secret = secret;
        }
        if let Ok(key) = std::env::var("PRESSBILL_PADDLE_API_KEY") {
            self.config.paddle.api_key = key;
        }
        if let Ok(secret) = std::env::var("PRESSBILL_PADDLE_WEBHOOK_SECRET") {
            self.config.paddle.webhook_secret = secret;
        }
        self
    }

    #[must_use]
    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.config.logging = logging;
        self
    }

    #[must_use]
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    #[must_use]
    pub fn stripe(mut self, stripe: ProviderConfig) -> Self {
        self.config.stripe = stripe;
        self
    }

    #[must_use]
    pub fn paddle(mut self, paddle: ProviderConfig) -> Self {
        self.config.paddle = paddle;
        self
    }

    #[must_use]
    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert_eq!(config.cache.max_entries, 10_000);
        assert_eq!(config.stripe.timeout_seconds, 30);
        assert!(config.paddle.base_url.is_none());
    }

    #[test]
    fn builder_overrides() {
        let config = ConfigBuilder::new()
            .stripe(ProviderConfig {
                api_key: "sk_test_1234567890abcdef".into(),
                timeout_seconds: 5,
                ..ProviderConfig::default()
            })
            .build();
        assert_eq!(config.stripe.timeout_seconds, 5);
        assert_eq!(config.paddle.timeout_seconds, 30);
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "logging": {},
                "cache": {"max_entries": 500},
                "stripe": {"api_key": "sk_test_1234567890abcdef"},
                "paddle": {}
            }"#,
        )
        .unwrap();
        assert_eq!(config.cache.max_entries, 500);
        assert_eq!(config.cache.default_ttl_seconds, 86_400);
        assert_eq!(config.stripe.api_key, "sk_test_1234567890abcdef");
    }
}
