use anyhow::{Result, bail};
use std::sync::Arc;

use super::assemblyai::AssemblyAi;
use super::deepgram::Deepgram;
use super::{Provider, ProviderMetadata};

/// Providers known to the daemon, in registration order.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in backend.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.providers.push(Arc::new(AssemblyAi::new()));
        registry.providers.push(Arc::new(Deepgram::new()));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) -> Result<()> {
        let id = provider.metadata().id;
        if self.get(id).is_some() {
            bail!("Provider already registered: {id}");
        }
        self.providers.push(provider);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .iter()
            .find(|p| p.metadata().id == id)
            .cloned()
    }

    pub fn all(&self) -> impl Iterator<Item = &ProviderMetadata> {
        self.providers.iter().map(|p| p.metadata())
    }

    /// Providers whose metadata declares them usable.
    pub fn available(&self) -> impl Iterator<Item = &ProviderMetadata> {
        self.all().filter(|m| m.available)
    }
}
