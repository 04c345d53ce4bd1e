pub mod adapter;
pub mod types;

pub use adapter::AnthropicAdapter;
