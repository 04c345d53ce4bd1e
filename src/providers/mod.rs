//! Provider adapters for the supported LLM services.

pub mod anthropic;
pub mod openai;

// Re-export commonly used provider types
pub use anthropic::AnthropicAdapter;
pub use openai::OpenAIAdapter;
