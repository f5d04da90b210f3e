//! Static registry of plugin modules.
//!
//! Plugins are compiled into the host. Each module registers a
//! [`PluginDescriptor`] whose classes carry factory closures; manifests found
//! at discovery time pick which of those classes to instantiate.

use std::sync::Arc;

use crate::audio::{self, AudioEngine};
use crate::config::AudioConfig;
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::plugin::PluginDescriptor;

/// Ordered set of built-in plugin modules.
#[derive(Debug, Clone, Default)]
pub struct PluginCatalog {
    modules: Vec<PluginDescriptor>,
}

impl PluginCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding the modules shipped with the host.
    pub fn builtin(audio: &AudioConfig) -> Self {
        let mut catalog = Self::new();
        catalog.register(audio::descriptor(audio));
        catalog
    }

    /// Built-in modules with the audio sub-system driven by `engine`.
    pub fn builtin_with_engine(audio: &AudioConfig, engine: Arc<dyn AudioEngine>) -> Self {
        let mut catalog = Self::new();
        catalog.register(audio::descriptor_with_engine(audio, engine));
        catalog
    }

    /// Register a module, replacing any earlier module of the same name.
    pub fn register(&mut self, descriptor: PluginDescriptor) -> &mut Self {
        if let Some(existing) = self.modules.iter_mut().find(|d| d.name == descriptor.name) {
            tracing::warn!(module = %descriptor.name, "replacing catalog entry");
            *existing = descriptor;
        } else {
            self.modules.push(descriptor);
        }
        self
    }

    /// Look up a module by name.
    pub fn get(&self, module: &str) -> Option<&PluginDescriptor> {
        self.modules.iter().find(|d| d.name == module)
    }

    /// All registered modules in registration order.
    pub fn descriptors(&self) -> &[PluginDescriptor] {
        &self.modules
    }

    /// Number of registered modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Build the descriptor a manifest asks for.
    ///
    /// Version and description come from the manifest; each listed class must
    /// exist in the catalog entry, unknown classes are logged and skipped.
    pub fn resolve(&self, manifest: &Manifest) -> Result<PluginDescriptor> {
        let entry = self
            .get(&manifest.name)
            .ok_or_else(|| Error::plugin_not_found(&manifest.name))?;

        let mut descriptor = PluginDescriptor::new(&manifest.name, &manifest.version)
            .with_description(manifest.description_or_default());

        for class in &manifest.classes {
            match entry.class(class) {
                Some(found) => descriptor = descriptor.with_class(found.clone()),
                None => tracing::warn!(
                    module = %manifest.name,
                    class = %class,
                    "manifest names a class the module does not provide"
                ),
            }
        }

        Ok(descriptor)
    }
}
