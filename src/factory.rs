use std::collections::HashMap;
use std::sync::Arc;

use crate::provider::ProviderAdapter;
use crate::providers::{AnthropicAdapter, OpenAIAdapter};
use crate::types::ProviderSettings;
use crate::{Error, ProviderKind};

/// The adapters a gateway can dispatch to, one per provider.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own provider kind, replacing any previous one.
    pub fn with_adapter(mut self, adapter: impl ProviderAdapter) -> Self {
        self.adapters.insert(adapter.kind(), Arc::new(adapter));
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn ProviderAdapter>, Error> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::config(format!("no adapter registered for {kind}")))
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.adapters.keys()).finish()
    }
}

/// Factory for creating provider adapters.
pub struct AdapterFactory;

impl AdapterFactory {
    /// Create the adapter for `kind` from explicit settings.
    pub fn create(kind: ProviderKind, settings: ProviderSettings) -> Arc<dyn ProviderAdapter> {
        match kind {
            ProviderKind::Anthropic => Arc::new(AnthropicAdapter::new(settings)),
            ProviderKind::OpenAI => Arc::new(OpenAIAdapter::new(settings)),
        }
    }

    /// Create every adapter, reading API keys from `ANTHROPIC_API_KEY` and
    /// `OPENAI_API_KEY`.
    ///
    /// A missing key is not an error here; calls to that provider fail with a
    /// configuration error instead.
    pub fn from_env() -> AdapterSet {
        let anthropic = ProviderSettings::from_env(ProviderKind::Anthropic);
        let openai = ProviderSettings::from_env(ProviderKind::OpenAI);

        tracing::info!(
            anthropic_key = anthropic.api_key.is_some(),
            openai_key = openai.api_key.is_some(),
            "Loaded provider credentials from environment"
        );

        AdapterSet::new()
            .with_adapter(AnthropicAdapter::new(anthropic))
            .with_adapter(OpenAIAdapter::new(openai))
    }
}
