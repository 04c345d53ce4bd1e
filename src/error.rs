use thiserror::Error;

/// Errors that can occur when using the tagstream-gateway library.
#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Transport error: {provider} returned status {status} - {message}")]
    Transport {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("Rate limit exhausted: {provider} still rate limited after {attempts} attempts")]
    RateLimitExhausted { provider: String, attempts: u32 },

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Field transform failed: {0}")]
    Transform(String),

    #[error("Cache write failed: {0}")]
    CacheWrite(String),

    #[error("Cache read failed: {0}")]
    CacheRead(String),

    #[error("Streaming error: {0}")]
    Streaming(String),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Error::InvalidRequest(message.into())
    }

    pub fn transport(provider: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Error::Transport {
            provider: provider.into(),
            status,
            message: message.into(),
        }
    }

    pub fn malformed_event(message: impl Into<String>) -> Self {
        Error::MalformedEvent(message.into())
    }

    pub fn transform(message: impl Into<String>) -> Self {
        Error::Transform(message.into())
    }

    pub fn cache_write(message: impl Into<String>) -> Self {
        Error::CacheWrite(message.into())
    }

    pub fn cache_read(message: impl Into<String>) -> Self {
        Error::CacheRead(message.into())
    }

    pub fn streaming(message: impl Into<String>) -> Self {
        Error::Streaming(message.into())
    }

    /// HTTP-style status a request boundary should answer with for this error.
    ///
    /// Only a malformed request is the caller's fault; every failed generation
    /// is a server error.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::InvalidRequest(_) => 400,
            _ => 500,
        }
    }

    /// Whether this error is meant to reach the caller.
    ///
    /// Malformed event lines and cache failures are contained by the component
    /// that detects them.
    pub fn is_caller_visible(&self) -> bool {
        !matches!(
            self,
            Error::MalformedEvent(_) | Error::CacheWrite(_) | Error::CacheRead(_)
        )
    }
}
