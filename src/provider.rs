use serde_json::{Map, Value};

use crate::{Error, ProviderKind, RequestSpec};

/// A fully described outbound HTTP call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl ProviderRequest {
    /// Value of the first header named `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Translation between provider-agnostic requests and one provider's wire format.
///
/// The gateway and the tag processor only ever talk to this trait; adding a
/// provider means adding an implementation.
pub trait ProviderAdapter: Send + Sync + 'static {
    fn kind(&self) -> ProviderKind;

    /// Build the endpoint, auth headers and JSON body for `spec`.
    fn build_request(&self, spec: &RequestSpec, streaming: bool) -> Result<ProviderRequest, Error>;

    /// Extract a text delta from one event-stream line.
    ///
    /// Lines without the data prefix and well-formed events that carry no
    /// text yield `Ok(None)`; payloads that fail to parse yield
    /// [`Error::MalformedEvent`]. An error event reported by the provider
    /// yields [`Error::Transport`] and ends the stream.
    fn parse_delta(&self, line: &str) -> Result<Option<String>, Error>;

    /// Extract the trimmed text of a non-streaming response body.
    fn parse_completion(&self, body: &str) -> Result<String, Error>;
}

/// Shallow-merge `overrides` over a JSON object body; override keys win.
pub fn merge_overrides(body: &mut Value, overrides: &Map<String, Value>) {
    if let Value::Object(fields) = body {
        for (key, value) in overrides {
            fields.insert(key.clone(), value.clone());
        }
    }
}
