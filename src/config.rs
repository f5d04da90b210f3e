//! Host configuration.
//!
//! Read once at start-up from a TOML file. Every section and field has a
//! default, so an empty file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level host configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Plugin module discovery.
    pub modules: ModulesConfig,
    /// Class filtering.
    pub classes: ClassesConfig,
    /// Host behaviour.
    pub host: HostSection,
    /// Logging.
    pub logging: LoggingConfig,
    /// Audio sub-system.
    pub audio: AudioConfig,
}

impl HostConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Set the plugin directory.
    pub fn with_plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.modules.path = dir.into();
        self
    }

    /// Disable a module by name.
    pub fn with_disabled_module(mut self, module: impl Into<String>) -> Self {
        self.modules.disabled.push(module.into());
        self
    }

    /// Disable a class by name.
    pub fn with_disabled_class(mut self, class: impl Into<String>) -> Self {
        self.classes.disabled.push(class.into());
        self
    }

    /// Set the teardown grace period.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.host.grace_period_ms = grace.as_millis() as u64;
        self
    }

    /// Set (or clear) the start-up greeting.
    pub fn with_welcome(mut self, welcome: Option<String>) -> Self {
        self.host.welcome = welcome;
        self
    }

    /// Set the audio configuration.
    pub fn with_audio(mut self, audio: AudioConfig) -> Self {
        self.audio = audio;
        self
    }
}

/// `[modules]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulesConfig {
    /// Directory holding `<module>.toml` manifests.
    pub path: PathBuf,
    /// Modules never loaded.
    pub disabled: Vec<String>,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("plugins"),
            disabled: Vec::new(),
        }
    }
}

/// `[classes]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassesConfig {
    /// Classes never instantiated.
    pub disabled: Vec<String>,
}

/// `[host]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSection {
    /// Time plugin workers get to exit during teardown.
    pub grace_period_ms: u64,
    /// Greeting published as `SayResponse` once plugins are loaded.
    pub welcome: Option<String>,
}

impl HostSection {
    /// Grace period as a duration.
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl Default for HostSection {
    fn default() -> Self {
        Self {
            grace_period_ms: 5000,
            welcome: Some("Welcome".to_string()),
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, overridden by `RUST_LOG`.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

/// `[audio]`
///
/// Command templates are argv vectors; `$file$`, `$time$`, `$dict$` and
/// `$lang$` are substituted in each element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Phrases that count as a wake word.
    pub hot_words: Vec<String>,
    /// Start listening when the plugin is constructed.
    pub auto_start: bool,
    /// Delay before the automatic start.
    pub auto_start_delay_ms: u64,
    /// How often waiting loops re-check the shutdown condition.
    pub poll_interval_ms: u64,
    /// Upper bound (and default) for recordings, in seconds.
    pub max_record_time: u32,
    /// Recognizer dictionary, substituted for `$dict$`.
    pub dictionary: String,
    /// Recognizer language model, substituted for `$lang$`.
    pub lang_model: String,
    /// Wake-word detection command.
    pub detection: Vec<String>,
    /// Playback command.
    pub playback: Vec<String>,
    /// Record command.
    pub record: Vec<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            hot_words: vec!["aria".to_string()],
            auto_start: false,
            auto_start_delay_ms: 10_000,
            poll_interval_ms: 100,
            max_record_time: 10,
            dictionary: "configuration/aria.dic".to_string(),
            lang_model: "configuration/aria.lm".to_string(),
            detection: argv(&["pocketsphinx_continuous", "-inmic", "yes", "-dict", "$dict$", "-lm", "$lang$"]),
            playback: argv(&["aplay", "$file$"]),
            record: argv(&["arecord", "-d", "$time$", "-f", "cd", "$file$"]),
        }
    }
}

impl AudioConfig {
    /// Polling interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Automatic start delay as a duration.
    pub fn auto_start_delay(&self) -> Duration {
        Duration::from_millis(self.auto_start_delay_ms)
    }

    /// Set the wake words.
    pub fn with_hot_words(mut self, words: Vec<String>) -> Self {
        self.hot_words = words;
        self
    }

    /// Enable automatic listening after `delay`.
    pub fn with_auto_start(mut self, delay: Duration) -> Self {
        self.auto_start = true;
        self.auto_start_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the maximum record time in seconds.
    pub fn with_max_record_time(mut self, seconds: u32) -> Self {
        self.max_record_time = seconds;
        self
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
