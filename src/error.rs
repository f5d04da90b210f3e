//! Error types for host, bus and plugin operations.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the host.
#[derive(Error, Debug)]
pub enum Error {
    /// Signal name was empty or otherwise malformed.
    #[error("invalid signal name: {0:?}")]
    InvalidSignalName(String),

    /// Plugin directory does not exist.
    #[error("plugin directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    /// Plugin not found.
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    /// Plugin already loaded.
    #[error("plugin already loaded: {0}")]
    PluginAlreadyLoaded(String),

    /// Plugin construction failed.
    #[error("plugin initialization failed: {0}")]
    InitializationFailed(String),

    /// Plugin in invalid state for operation.
    #[error("invalid plugin state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// A signal handler reported a failure.
    #[error("handler failed: {0}")]
    Handler(String),

    /// Signal payload was missing a field or carried the wrong type.
    #[error("invalid payload field `{field}`: {reason}")]
    InvalidPayload {
        /// Field name.
        field: String,
        /// What was wrong with it.
        reason: String,
    },

    /// External engine process failed.
    #[error("engine error: {0}")]
    Engine(String),

    /// Invalid manifest.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Manifest parse error.
    #[error("manifest parse error: {0}")]
    ManifestParse(String),

    /// Host configuration could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Registry error.
    #[error("registry error: {0}")]
    Registry(String),
}

impl Error {
    /// Create a plugin not found error.
    pub fn plugin_not_found(name: impl Into<String>) -> Self {
        Self::PluginNotFound(name.into())
    }

    /// Create an invalid manifest error.
    pub fn invalid_manifest(msg: impl Into<String>) -> Self {
        Self::InvalidManifest(msg.into())
    }

    /// Create an initialization failed error.
    pub fn init_failed(msg: impl Into<String>) -> Self {
        Self::InitializationFailed(msg.into())
    }

    /// Create a handler failure.
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    /// Create an engine failure.
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    /// Create an invalid payload error.
    pub fn invalid_payload(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Returns true if this error must abort host start-up.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DirectoryNotFound(_) | Self::Config(_))
    }

    /// Returns true if this error only affects a single plugin.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InitializationFailed(_)
                | Self::Handler(_)
                | Self::InvalidPayload { .. }
                | Self::Engine(_)
                | Self::InvalidManifest(_)
                | Self::ManifestParse(_)
        )
    }
}
