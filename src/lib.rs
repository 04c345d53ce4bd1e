//! A cached, rate-limited gateway to LLM providers with incremental tag-stream processing.
//!
//! This library sends provider-agnostic generation requests to Anthropic or
//! OpenAI through a bounded worker pool, a shared token-bucket rate limiter
//! and exponential-backoff retries, caching completed text by request. Streamed
//! output can be fed through a tag processor that turns embedded
//! `Œ<field name="...">...</field>` markers into display-ready fragments as
//! they arrive.

pub mod cache;
pub mod error;
pub mod factory;
pub mod fields;
pub mod gateway;
pub mod pipeline;
pub mod processor;
pub mod provider;
pub mod providers;
pub mod rate_limiter;
pub mod retry;
pub mod sse_stream;
pub mod types;

// Re-export core types for easy usage
pub use cache::{CacheStore, FileCache, MemoryCache};
pub use error::Error;
pub use factory::{AdapterFactory, AdapterSet};
pub use fields::FieldTransformRegistry;
pub use gateway::{DeltaStream, Gateway};
pub use pipeline::{policy_field_processor, process_deltas, stream_fields, FieldStream};
pub use processor::{FieldTransform, Mode, TagSpec, TagStreamProcessor};
pub use provider::{ProviderAdapter, ProviderRequest};
pub use providers::*;
pub use rate_limiter::RateLimiter;
pub use retry::RetryPolicy;
pub use types::*;
