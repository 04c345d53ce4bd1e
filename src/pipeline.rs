//! Driving gateway delta streams through a tag processor.

use async_stream::try_stream;
use futures::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use std::sync::Arc;

use crate::fields::FieldTransformRegistry;
use crate::gateway::Gateway;
use crate::processor::{TagSpec, TagStreamProcessor};
use crate::{Error, RequestSpec};

/// Placeholder emitted while a field is still streaming (a private-use
/// character the presentation layer renders as a loading indicator).
pub const LOADING_PLACEHOLDER: &str = "\u{E081}";

/// Marker the model writes before every field.
pub const FIELD_PROSPECT: &str = "Œ";
pub const FIELD_START_TAG: &str = "Œ<field";
pub const FIELD_END_TAG: &str = "</field>";

/// Display-ready fragments produced from a delta stream.
pub type FieldStream = BoxStream<'static, Result<String, Error>>;

/// Processor for `Œ<field name="...">value</field>` output with the policy
/// field registry.
pub fn policy_field_processor() -> Result<TagStreamProcessor, Error> {
    let spec = TagSpec::new(
        FIELD_PROSPECT,
        FIELD_START_TAG,
        FIELD_END_TAG,
        LOADING_PLACEHOLDER,
    );
    let registry = FieldTransformRegistry::policy_fields(LOADING_PLACEHOLDER)?;
    TagStreamProcessor::new(spec, Arc::new(registry))
}

/// Feed every delta through `processor` in arrival order.
///
/// Only non-empty output is yielded. The processor is flushed once the
/// deltas are exhausted; the first error ends the stream.
pub fn process_deltas<S>(deltas: S, mut processor: TagStreamProcessor) -> FieldStream
where
    S: Stream<Item = Result<String, Error>> + Send + Unpin + 'static,
{
    let fragments = try_stream! {
        let mut deltas = deltas;
        while let Some(delta) = deltas.next().await {
            let output = processor.feed(&delta?).await?;
            if !output.is_empty() {
                yield output;
            }
        }

        let rest = processor.flush();
        if !rest.is_empty() {
            yield rest;
        }
    };
    fragments.boxed()
}

/// Request `spec` as a stream and render its fields with `processor`.
pub async fn stream_fields(
    gateway: &Gateway,
    spec: &RequestSpec,
    processor: TagStreamProcessor,
) -> Result<FieldStream, Error> {
    let deltas = gateway.stream(spec).await?;
    Ok(process_deltas(deltas, processor))
}
