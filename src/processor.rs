//! Incremental extraction of tagged fields from a stream of text deltas.
//!
//! A [`TagStreamProcessor`] recognises one configured tag pair. Text outside
//! the tags passes through unchanged as soon as it cannot be the start of a
//! tag; each complete `start_tag ... end_tag` occurrence is replaced by the
//! result of a [`FieldTransform`]. While a tag is open, every `feed` emits
//! the placeholder instead of the partial content.
//!
//! For a fixed input the emitted text, placeholders aside, does not depend on
//! how the input is split into chunks (unless `discard_after_close` is set,
//! which drops whatever trails the end tag in the chunk that closed it).

use std::sync::Arc;
use tracing::debug;

use crate::Error;

/// Renders the content captured between a start and end tag.
#[async_trait::async_trait]
pub trait FieldTransform: Send + Sync {
    async fn transform(&self, content: &str) -> Result<String, Error>;
}

#[async_trait::async_trait]
impl<F> FieldTransform for F
where
    F: Fn(&str) -> Result<String, Error> + Send + Sync,
{
    async fn transform(&self, content: &str) -> Result<String, Error> {
        self(content)
    }
}

/// Markers recognised by a processor.
#[derive(Debug, Clone, PartialEq)]
pub struct TagSpec {
    /// Shortest prefix that may begin a start tag split across chunks.
    pub start_prospect: String,
    pub start_tag: String,
    pub end_tag: String,
    /// Emitted by each `feed` that ends with a tag still open.
    pub placeholder: String,
    /// Clear the whole buffer after a tag closes instead of only the match.
    pub discard_after_close: bool,
}

impl TagSpec {
    pub fn new(
        start_prospect: impl Into<String>,
        start_tag: impl Into<String>,
        end_tag: impl Into<String>,
        placeholder: impl Into<String>,
    ) -> Self {
        Self {
            start_prospect: start_prospect.into(),
            start_tag: start_tag.into(),
            end_tag: end_tag.into(),
            placeholder: placeholder.into(),
            discard_after_close: false,
        }
    }

    pub fn discard_after_close(mut self, discard: bool) -> Self {
        self.discard_after_close = discard;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.start_prospect.is_empty() || self.start_tag.is_empty() || self.end_tag.is_empty() {
            return Err(Error::config("tag markers must be non-empty"));
        }
        if !self.start_tag.starts_with(&self.start_prospect) {
            return Err(Error::config(format!(
                "start tag {:?} must begin with its prospect {:?}",
                self.start_tag, self.start_prospect
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No tag open.
    Scanning,
    /// A start tag has been consumed; waiting for the end tag.
    Capturing,
}

/// Per-stream tag state machine. Not shared between streams.
pub struct TagStreamProcessor {
    spec: TagSpec,
    transform: Arc<dyn FieldTransform>,
    buffer: String,
    mode: Mode,
    failed: bool,
}

impl TagStreamProcessor {
    pub fn new(spec: TagSpec, transform: Arc<dyn FieldTransform>) -> Result<Self, Error> {
        spec.validate()?;
        Ok(Self {
            spec,
            transform,
            buffer: String::new(),
            mode: Mode::Scanning,
            failed: false,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Input received but not yet emitted.
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    /// Consume one chunk and return everything that can be emitted so far.
    ///
    /// A transform failure is returned immediately and every later call
    /// fails as well.
    pub async fn feed(&mut self, chunk: &str) -> Result<String, Error> {
        if self.failed {
            return Err(Error::transform("processor stopped after a failed transform"));
        }

        self.buffer.push_str(chunk);
        let mut output = String::new();

        loop {
            match self.mode {
                Mode::Scanning => {
                    if let Some(start) = self.buffer.find(&self.spec.start_tag) {
                        output.push_str(&self.buffer[..start]);
                        self.buffer.drain(..start + self.spec.start_tag.len());
                        self.mode = Mode::Capturing;
                        continue;
                    }

                    // Anything from the prospect on may still become a start tag
                    let held = self
                        .buffer
                        .find(&self.spec.start_prospect)
                        .unwrap_or(self.buffer.len());
                    output.push_str(&self.buffer[..held]);
                    self.buffer.drain(..held);
                    break;
                }
                Mode::Capturing => {
                    let Some(end) = self.buffer.find(&self.spec.end_tag) else {
                        debug!(captured = self.buffer.len(), "Tag still open");
                        output.push_str(&self.spec.placeholder);
                        break;
                    };

                    let rendered = match self.transform.transform(&self.buffer[..end]).await {
                        Ok(rendered) => rendered,
                        Err(e) => {
                            self.failed = true;
                            return Err(e);
                        }
                    };
                    output.push_str(&rendered);

                    if self.spec.discard_after_close {
                        self.buffer.clear();
                    } else {
                        self.buffer.drain(..end + self.spec.end_tag.len());
                    }
                    self.mode = Mode::Scanning;
                }
            }
        }

        Ok(output)
    }

    /// Finish the stream.
    ///
    /// Text held back as a possible start tag is returned as plain text. The
    /// content of a tag that never closed is dropped.
    pub fn flush(&mut self) -> String {
        match self.mode {
            Mode::Scanning => std::mem::take(&mut self.buffer),
            Mode::Capturing => {
                if !self.buffer.is_empty() {
                    debug!(bytes = self.buffer.len(), "Dropping content of unterminated tag");
                }
                self.buffer.clear();
                self.mode = Mode::Scanning;
                String::new()
            }
        }
    }
}

impl std::fmt::Debug for TagStreamProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagStreamProcessor")
            .field("spec", &self.spec)
            .field("mode", &self.mode)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}
