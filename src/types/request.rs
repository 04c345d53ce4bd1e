use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

use crate::Error;

/// Supported LLM providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Anthropic,
    #[serde(rename = "openai")]
    OpenAI,
}

impl ProviderKind {
    /// Human-readable provider name used in errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "Anthropic",
            ProviderKind::OpenAI => "OpenAI",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A provider-agnostic generation request.
///
/// Requests are immutable once built; the builder methods consume `self`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
    pub system_prompt: String,
    pub user_prompt: String,
    /// Fields shallow-merged over the provider's request body.
    #[serde(default)]
    pub config_overrides: Map<String, Value>,
    #[serde(default)]
    pub provider: ProviderKind,
}

impl RequestSpec {
    /// Create a request for the default provider with no overrides.
    pub fn new(system_prompt: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            config_overrides: Map::new(),
            provider: ProviderKind::default(),
        }
    }

    /// Target a specific provider.
    pub fn provider(mut self, provider: ProviderKind) -> Self {
        self.provider = provider;
        self
    }

    /// Add a single body override, e.g. `("max_tokens", 600)`.
    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config_overrides.insert(key.into(), value.into());
        self
    }

    /// Replace all body overrides.
    pub fn with_overrides(mut self, overrides: Map<String, Value>) -> Self {
        self.config_overrides = overrides;
        self
    }

    /// Reject requests that cannot be sent to any provider.
    pub fn validate(&self) -> Result<(), Error> {
        if self.system_prompt.is_empty() || self.user_prompt.is_empty() {
            return Err(Error::invalid_request(
                "system prompt and user prompt must both be set",
            ));
        }
        Ok(())
    }

    /// Deterministic cache key over every field of the request.
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::for_request(self)
    }
}

/// Content address of a request: hex MD5 of its canonical JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

/// Rebuild objects with sorted keys so serialization ignores insertion order,
/// even when serde_json is built with `preserve_order`.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

impl CacheKey {
    pub fn for_request(spec: &RequestSpec) -> Self {
        let canonical = canonicalize(&json!({
            "system": spec.system_prompt,
            "prompt": spec.user_prompt,
            "configOverrides": spec.config_overrides,
            "provider": spec.provider,
        }));
        CacheKey(format!("{:x}", md5::compute(canonical.to_string())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
