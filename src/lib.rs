//! # aria-host
//!
//! Home-assistant host: loads independent plugins at start-up and lets them
//! talk to each other only through a shared signal bus.
//!
//! This crate provides:
//! - **Event Bus** - publish/subscribe with per-handler failure isolation
//! - **Plugin Lifecycle** - discovery from TOML manifests, isolated
//!   construction, deterministic teardown
//! - **Audio Arbitration** - one device shared by wake-word listening,
//!   playback and recording
//! - **Shutdown Coordination** - a monotonic stop condition every loop waits on
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use aria_host::{Host, HostConfig};
//!
//! let config = HostConfig::from_file(std::path::Path::new("configuration/main.toml"))?;
//! let host = Host::new(config);
//! host.start()?;
//! host.run();
//! host.stop();
//! # Ok::<(), aria_host::Error>(())
//! ```
//!
//! ## Feature Flags
//!
//! - `metrics-prometheus`: Prometheus counters for plugins and the bus

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod audio;
mod bus;
mod catalog;
mod config;
mod error;
mod host;
mod lifecycle;
mod manager;
mod manifest;
mod plugin;
mod shutdown;
pub mod signal;

#[cfg(feature = "metrics-prometheus")]
mod metrics;

pub use audio::{AudioActivity, AudioArbiter, AudioEngine, AudioSubSystem, CommandEngine, DetectionPoll, DetectionProcess};
pub use bus::{BindingId, BusStats, DeliveryReport, EventBus, Handler, SenderFilter};
pub use catalog::PluginCatalog;
pub use config::{AudioConfig, ClassesConfig, HostConfig, HostSection, LoggingConfig, ModulesConfig};
pub use error::{Error, Result};
pub use host::Host;
pub use lifecycle::{LifecycleEvent, LifecycleHooks, LifecycleState};
pub use manager::{LoadReport, ManagerConfig, ManagerStats, PluginFailure, PluginManager};
pub use manifest::{Manifest, ManifestBuilder, RESERVED_MODULE};
pub use plugin::{
    Plugin, PluginClass, PluginContext, PluginDescriptor, PluginFactory, PluginHandle, PluginInfo, PluginInstance,
};
pub use shutdown::{Shutdown, WorkerSet};
pub use signal::{names, Callback, Payload, Signal, Value};

#[cfg(feature = "metrics-prometheus")]
pub use metrics::{HostMetrics, MetricsConfig};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
