//! Stream adapter splitting a provider's event-stream body into lines.

use futures_util::{Stream, StreamExt};
use memchr::memchr;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tracing::warn;

use crate::Error;

/// Upper bound on a single unterminated line.
const MAX_LINE_BYTES: usize = 1_000_000;

/// Prefix of an event-stream line carrying a payload.
pub const DATA_PREFIX: &str = "data: ";

/// Payload of a `data: ` line, or `None` for any other line.
pub fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix(DATA_PREFIX)
}

/// A stream adapter that yields complete text lines from a byte stream.
/// Partial lines, including UTF-8 sequences split across chunks, are held
/// until their terminating newline arrives.
pub struct EventLineStream<S> {
    /// The underlying byte stream
    inner: S,
    /// Bytes of the current unterminated line
    buffer: Vec<u8>,
    /// Complete lines ready to be yielded
    lines: VecDeque<String>,
    finished: bool,
}

impl<S> EventLineStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            inner: stream,
            buffer: Vec::new(),
            lines: VecDeque::new(),
            finished: false,
        }
    }

    /// Move every complete line out of the buffer.
    fn split_lines(&mut self) {
        let mut start = 0;

        while let Some(pos) = memchr(b'\n', &self.buffer[start..]) {
            let end = start + pos;
            if let Some(line) = decode_line(&self.buffer[start..end]) {
                self.lines.push_back(line);
            }
            start = end + 1;
        }

        if start > 0 {
            self.buffer.drain(..start);
        }
    }

    /// Whatever is left once the body ends without a final newline.
    fn take_remainder(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let remainder = std::mem::take(&mut self.buffer);
        decode_line(&remainder).filter(|line| !line.is_empty())
    }
}

/// Text of one line without its `\r`, or `None` when it is not valid UTF-8.
fn decode_line(line: &[u8]) -> Option<String> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    match std::str::from_utf8(line) {
        Ok(text) => Some(text.to_string()),
        Err(e) => {
            warn!("Skipping event line with invalid UTF-8: {e}");
            None
        }
    }
}

impl<S, E> Stream for EventLineStream<S>
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Unpin,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Item = Result<String, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(line) = self.lines.pop_front() {
                return Poll::Ready(Some(Ok(line)));
            }

            if self.finished {
                return Poll::Ready(None);
            }

            let chunk = match ready!(self.inner.poll_next_unpin(cx)) {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(Error::streaming(format!(
                        "Stream error: {}",
                        e.into()
                    )))));
                }
                None => {
                    self.finished = true;
                    return Poll::Ready(self.take_remainder().map(Ok));
                }
            };

            self.buffer.extend_from_slice(&chunk);
            self.split_lines();

            if self.buffer.len() > MAX_LINE_BYTES {
                self.buffer.clear();
                self.finished = true;
                return Poll::Ready(Some(Err(Error::streaming(
                    "event line exceeded maximum size",
                ))));
            }
        }
    }
}

/// Extension trait to split byte streams into event lines.
pub trait EventLineStreamExt: Stream {
    fn event_lines(self) -> EventLineStream<Self>
    where
        Self: Sized,
    {
        EventLineStream::new(self)
    }
}

impl<S: Stream> EventLineStreamExt for S {}
