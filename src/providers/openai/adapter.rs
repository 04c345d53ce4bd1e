use serde_json::Value;
use tracing::warn;

use super::types::*;
use crate::provider::{merge_overrides, ProviderAdapter, ProviderRequest};
use crate::sse_stream::data_payload;
use crate::types::ProviderSettings;
use crate::{Error, ProviderKind, RequestSpec};

/// Terminal payload of an OpenAI event stream.
const DONE_MARKER: &str = "[DONE]";

/// OpenAI Chat Completions adapter.
#[derive(Debug, Clone)]
pub struct OpenAIAdapter {
    settings: ProviderSettings,
}

impl OpenAIAdapter {
    pub fn new(settings: ProviderSettings) -> Self {
        Self { settings }
    }

    /// Create an adapter with default settings and the given key.
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self::new(ProviderSettings::openai(Some(api_key.into())))
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    fn convert_request(&self, spec: &RequestSpec, streaming: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.settings.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: Some(spec.system_prompt.clone()),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: Some(spec.user_prompt.clone()),
                },
            ],
            max_tokens: self.settings.max_tokens,
            stream: streaming,
            temperature: self.settings.temperature,
        }
    }
}

impl ProviderAdapter for OpenAIAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAI
    }

    fn build_request(&self, spec: &RequestSpec, streaming: bool) -> Result<ProviderRequest, Error> {
        let api_key = self.settings.require_api_key(self.kind().name())?;

        let mut body: Value = serde_json::to_value(self.convert_request(spec, streaming))?;
        merge_overrides(&mut body, &spec.config_overrides);

        Ok(ProviderRequest {
            url: self.endpoint(),
            headers: vec![
                ("content-type".to_string(), "application/json".to_string()),
                ("authorization".to_string(), format!("Bearer {api_key}")),
            ],
            body,
        })
    }

    fn parse_delta(&self, line: &str) -> Result<Option<String>, Error> {
        let Some(data) = data_payload(line) else {
            return Ok(None);
        };
        if data.trim() == DONE_MARKER {
            return Ok(None);
        }

        let chunk: ChatCompletionChunk = serde_json::from_str(data)
            .map_err(|e| Error::malformed_event(format!("OpenAI event: {e}")))?;

        if let Some(error) = chunk.error {
            let kind = error.kind.unwrap_or_else(|| "error".to_string());
            warn!(%kind, "OpenAI stream reported an error: {}", error.message);
            return Err(Error::transport(
                self.kind().name(),
                200,
                format!("{kind}: {}", error.message),
            ));
        }

        Ok(chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|content| !content.is_empty()))
    }

    fn parse_completion(&self, body: &str) -> Result<String, Error> {
        let response: ChatCompletionResponse = serde_json::from_str(body)?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .ok_or_else(|| {
                Error::transport(self.kind().name(), 200, "response contained no text content")
            })
    }
}
