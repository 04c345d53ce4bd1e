//! Per-field rendering of captured tag content.
//!
//! Captured content looks like ` name="Support Likelihood">42%`: the
//! attributes of the opening marker followed by the field value. The
//! registry picks a transform by the `name` attribute and renders the value.

use regex::{Regex, RegexBuilder};
use std::sync::Arc;

use crate::processor::FieldTransform;
use crate::Error;

/// Escape text for inclusion in HTML.
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#039;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Replaces a field with a fixed marker so it never reaches the caller.
#[derive(Debug, Clone)]
pub struct HiddenField {
    marker: String,
}

impl HiddenField {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }
}

#[async_trait::async_trait]
impl FieldTransform for HiddenField {
    async fn transform(&self, _value: &str) -> Result<String, Error> {
        Ok(self.marker.clone())
    }
}

/// Renders a percentage as a marker coloured from red (0) to green (100).
#[derive(Debug, Clone, Default)]
pub struct PercentageField;

impl PercentageField {
    /// Hue for the first run of digits in `value`, or 0 when there is none.
    pub fn hue(value: &str) -> f64 {
        let digits: String = value
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit())
            .collect();
        let percentage = digits.parse::<f64>().unwrap_or(0.0).clamp(0.0, 100.0);
        percentage * 120.0 / 100.0
    }
}

#[async_trait::async_trait]
impl FieldTransform for PercentageField {
    async fn transform(&self, value: &str) -> Result<String, Error> {
        let value = value.trim();
        Ok(format!(
            "<code class=\"support\" style=\"background: hsl({}, 100%, 40%);\">{}</code>",
            Self::hue(value),
            escape_html(value)
        ))
    }
}

/// Renders a field as an escaped paragraph.
#[derive(Debug, Clone, Default)]
pub struct ParagraphField;

#[async_trait::async_trait]
impl FieldTransform for ParagraphField {
    async fn transform(&self, value: &str) -> Result<String, Error> {
        Ok(format!("<p>{}</p>", escape_html(value.trim())))
    }
}

struct FieldRule {
    pattern: Regex,
    transform: Arc<dyn FieldTransform>,
}

/// Dispatches captured fields to transforms by field name.
///
/// Rules are tried in registration order. Content whose name matches no rule
/// (and no fallback is set), or whose opening marker has no `name`
/// attribute, is passed through as escaped text.
#[derive(Default)]
pub struct FieldTransformRegistry {
    rules: Vec<FieldRule>,
    fallback: Option<Arc<dyn FieldTransform>>,
}

impl FieldTransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route names matching `pattern` (a case-insensitive regex) to `transform`.
    pub fn with_field(
        mut self,
        pattern: &str,
        transform: impl FieldTransform + 'static,
    ) -> Result<Self, Error> {
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::config(format!("invalid field pattern: {e}")))?;
        self.rules.push(FieldRule {
            pattern,
            transform: Arc::new(transform),
        });
        Ok(self)
    }

    /// Transform for names no rule matches.
    pub fn with_fallback(mut self, transform: impl FieldTransform + 'static) -> Self {
        self.fallback = Some(Arc::new(transform));
        self
    }

    /// Registry for simulated policy responses: pros and cons are working
    /// notes hidden behind `marker`, likelihoods become percentage markers and
    /// everything else a paragraph.
    pub fn policy_fields(marker: &str) -> Result<Self, Error> {
        Ok(Self::new()
            .with_field("pros|cons", HiddenField::new(marker))?
            .with_field("likelihood", PercentageField)?
            .with_fallback(ParagraphField))
    }

    fn lookup(&self, name: &str) -> Option<&Arc<dyn FieldTransform>> {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(name))
            .map(|rule| &rule.transform)
            .or(self.fallback.as_ref())
    }
}

/// Split captured content into the `name` attribute and the field value.
fn split_field(content: &str) -> Option<(&str, &str)> {
    let name_start = content.find("name=\"")? + "name=\"".len();
    let name_len = content[name_start..].find('"')?;
    let name = &content[name_start..name_start + name_len];
    let rest = &content[name_start + name_len + 1..];
    let value_start = rest.find('>')? + 1;
    Some((name, &rest[value_start..]))
}

#[async_trait::async_trait]
impl FieldTransform for FieldTransformRegistry {
    async fn transform(&self, content: &str) -> Result<String, Error> {
        let Some((name, value)) = split_field(content) else {
            tracing::debug!("Field without a name attribute, passing through");
            return Ok(escape_html(content));
        };

        match self.lookup(name) {
            Some(transform) => transform.transform(value).await,
            None => {
                tracing::debug!(field = name, "No transform registered, passing through");
                Ok(escape_html(value))
            }
        }
    }
}

impl std::fmt::Debug for FieldTransformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldTransformRegistry")
            .field(
                "rules",
                &self.rules.iter().map(|r| r.pattern.as_str()).collect::<Vec<_>>(),
            )
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}
