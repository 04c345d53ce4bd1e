use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::{Error, ProviderKind};

/// Default number of concurrent outbound calls.
pub const DEFAULT_CONCURRENCY: usize = 6;
/// Default outbound request budget per rate-limit interval.
pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 60;
/// Default directory of the file-backed cache.
pub const DEFAULT_CACHE_DIR: &str = "_cache";

/// Token-bucket admission settings shared by every outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Tokens available per interval.
    pub max_requests: u32,
    /// Length of the refill window.
    pub interval: Duration,
}

impl RateLimitConfig {
    pub fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            interval: Duration::from_secs(60),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::per_minute(DEFAULT_REQUESTS_PER_MINUTE)
    }
}

/// Configuration for the request gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Size of the worker pool bounding concurrent outbound calls.
    pub concurrency: usize,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryPolicy,
    /// Directory used by [`FileCache`](crate::cache::FileCache).
    pub cache_dir: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
        }
    }
}

impl GatewayConfig {
    /// Create configuration from environment variables, falling back to defaults.
    ///
    /// Reads `GATEWAY_CONCURRENCY`, `GATEWAY_REQUESTS_PER_MINUTE` and
    /// `GATEWAY_CACHE_DIR`.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();

        if let Ok(value) = env::var("GATEWAY_CONCURRENCY") {
            config.concurrency = value.parse().map_err(|_| {
                Error::config(format!("GATEWAY_CONCURRENCY must be a number, got '{value}'"))
            })?;
        }
        if let Ok(value) = env::var("GATEWAY_REQUESTS_PER_MINUTE") {
            let max_requests = value.parse().map_err(|_| {
                Error::config(format!(
                    "GATEWAY_REQUESTS_PER_MINUTE must be a number, got '{value}'"
                ))
            })?;
            config.rate_limit = RateLimitConfig::per_minute(max_requests);
        }
        if let Ok(value) = env::var("GATEWAY_CACHE_DIR") {
            config.cache_dir = PathBuf::from(value);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.concurrency == 0 {
            return Err(Error::config("concurrency must be at least 1"));
        }
        if self.rate_limit.max_requests == 0 {
            return Err(Error::config("rate limit must allow at least 1 request"));
        }
        if self.rate_limit.interval.is_zero() {
            return Err(Error::config("rate limit interval must be non-zero"));
        }
        Ok(())
    }
}

/// Connection and body defaults for one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSettings {
    /// Missing keys surface as a configuration error when a call is made.
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ProviderSettings {
    /// Defaults for the Anthropic Messages API.
    pub fn anthropic(api_key: Option<String>) -> Self {
        Self {
            api_key,
            base_url: "https://api.anthropic.com".to_string(),
            model: "claude-3-5-sonnet-20240620".to_string(),
            max_tokens: 400,
            temperature: 0.5,
        }
    }

    /// Defaults for the OpenAI Chat Completions API.
    pub fn openai(api_key: Option<String>) -> Self {
        Self {
            api_key,
            base_url: "https://api.openai.com".to_string(),
            model: "gpt-4o".to_string(),
            max_tokens: 400,
            temperature: 0.5,
        }
    }

    /// Defaults for `kind`, with the key read from the environment.
    pub fn from_env(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Anthropic => Self::anthropic(env::var("ANTHROPIC_API_KEY").ok()),
            ProviderKind::OpenAI => Self::openai(env::var("OPENAI_API_KEY").ok()),
        }
    }

    /// Point the provider at another host (used for testing).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// The API key, or a configuration error naming the provider.
    pub fn require_api_key(&self, provider: &str) -> Result<&str, Error> {
        self.api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| Error::config(format!("no API key configured for {provider}")))
    }
}
