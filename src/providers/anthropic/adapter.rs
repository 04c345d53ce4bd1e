use serde_json::Value;
use tracing::warn;

use super::types::*;
use crate::provider::{merge_overrides, ProviderAdapter, ProviderRequest};
use crate::sse_stream::data_payload;
use crate::types::ProviderSettings;
use crate::{Error, ProviderKind, RequestSpec};

/// Version header value expected by the Messages API.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API adapter.
#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    settings: ProviderSettings,
}

impl AnthropicAdapter {
    pub fn new(settings: ProviderSettings) -> Self {
        Self { settings }
    }

    /// Create an adapter with default settings and the given key.
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self::new(ProviderSettings::anthropic(Some(api_key.into())))
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.settings.base_url.trim_end_matches('/'))
    }

    fn convert_request(&self, spec: &RequestSpec, streaming: bool) -> AnthropicRequest {
        AnthropicRequest {
            model: self.settings.model.clone(),
            system: spec.system_prompt.clone(),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: spec.user_prompt.clone(),
            }],
            max_tokens: self.settings.max_tokens,
            stream: streaming,
            temperature: self.settings.temperature,
        }
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn build_request(&self, spec: &RequestSpec, streaming: bool) -> Result<ProviderRequest, Error> {
        let api_key = self.settings.require_api_key(self.kind().name())?;

        let mut body: Value = serde_json::to_value(self.convert_request(spec, streaming))?;
        merge_overrides(&mut body, &spec.config_overrides);

        Ok(ProviderRequest {
            url: self.endpoint(),
            headers: vec![
                ("content-type".to_string(), "application/json".to_string()),
                ("x-api-key".to_string(), api_key.to_string()),
                ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
            ],
            body,
        })
    }

    fn parse_delta(&self, line: &str) -> Result<Option<String>, Error> {
        let Some(data) = data_payload(line) else {
            return Ok(None);
        };

        let event: AnthropicStreamEvent = serde_json::from_str(data)
            .map_err(|e| Error::malformed_event(format!("Anthropic event: {e}")))?;

        match event {
            AnthropicStreamEvent::ContentBlockDelta {
                delta: AnthropicContentDelta::TextDelta { text },
            } => Ok(Some(text)),
            AnthropicStreamEvent::Error { error } => {
                warn!(kind = %error.kind, "Anthropic stream reported an error: {}", error.message);
                Err(Error::transport(
                    self.kind().name(),
                    200,
                    format!("{}: {}", error.kind, error.message),
                ))
            }
            _ => Ok(None),
        }
    }

    fn parse_completion(&self, body: &str) -> Result<String, Error> {
        let response: AnthropicResponse = serde_json::from_str(body)?;

        response
            .content
            .into_iter()
            .find_map(|block| match block {
                AnthropicContentBlock::Text { text } => Some(text.trim().to_string()),
                AnthropicContentBlock::Other => None,
            })
            .ok_or_else(|| {
                Error::transport(self.kind().name(), 200, "response contained no text content")
            })
    }
}
