//! Declarative plugin manifests.
//!
//! A plugin directory holds one `<module>.toml` file per plugin module:
//!
//! ```toml
//! name = "AudioPlugin"
//! version = "1.0.0.0"
//! description = "Audio sub-system"
//! classes = ["AudioSubSystem"]
//! ```
//!
//! The manifest only names classes; the code behind each class comes from the
//! [`PluginCatalog`](crate::PluginCatalog).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Module name reserved for the abstract base definition; never loaded.
pub const RESERVED_MODULE: &str = "base";

/// Plugin manifest defining a module and its capability classes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Module name (unique identifier).
    pub name: String,

    /// Module version.
    pub version: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,

    /// Capability classes to instantiate.
    #[serde(default)]
    pub classes: Vec<String>,
}

impl Manifest {
    /// Create a new manifest with required fields.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            classes: Vec::new(),
        }
    }

    /// Load manifest from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse manifest from TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ManifestParse(e.to_string()))
    }

    /// Serialize to TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::ManifestParse(e.to_string()))
    }

    /// Validate the manifest.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_manifest("missing module name"));
        }

        if self.version.trim().is_empty() {
            return Err(Error::invalid_manifest(format!(
                "module {} has no version",
                self.name
            )));
        }

        if self.name == RESERVED_MODULE {
            return Err(Error::invalid_manifest(format!(
                "module name `{}` is reserved",
                RESERVED_MODULE
            )));
        }

        if let Some(dup) = self
            .classes
            .iter()
            .enumerate()
            .find(|(i, c)| self.classes[..*i].contains(*c))
            .map(|(_, c)| c)
        {
            return Err(Error::invalid_manifest(format!(
                "class {} listed twice in {}",
                dup, self.name
            )));
        }

        Ok(())
    }

    /// Description or an empty string.
    pub fn description_or_default(&self) -> &str {
        self.description.as_deref().unwrap_or("")
    }
}

/// Builder for creating manifests.
pub struct ManifestBuilder {
    manifest: Manifest,
}

impl ManifestBuilder {
    /// Create a new manifest builder.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            manifest: Manifest::new(name, version),
        }
    }

    /// Set the description.
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.manifest.description = Some(desc.into());
        self
    }

    /// Add a capability class.
    pub fn class(mut self, class: impl Into<String>) -> Self {
        self.manifest.classes.push(class.into());
        self
    }

    /// Build and validate the manifest.
    pub fn build(self) -> Result<Manifest> {
        self.manifest.validate()?;
        Ok(self.manifest)
    }

    /// Build without validation.
    pub fn build_unchecked(self) -> Manifest {
        self.manifest
    }
}
