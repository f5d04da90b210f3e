//! Prometheus metrics for the host.

use prometheus::{Counter, Histogram, HistogramOpts, Registry};

use crate::error::{Error, Result};

/// Configuration for host metrics collection.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Metric prefix for all host metrics.
    pub prefix: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prefix: "aria".to_string(),
        }
    }
}

impl MetricsConfig {
    /// Create a new metrics configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the metric prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

/// Plugin and bus counters.
pub struct HostMetrics {
    config: MetricsConfig,
    registry: Registry,
    plugins_loaded: Counter,
    plugins_failed: Counter,
    plugins_unloaded: Counter,
    signals_published: Counter,
    handler_failures: Counter,
    load_duration: Histogram,
}

impl HostMetrics {
    /// Create and register every collector.
    pub fn new(config: MetricsConfig) -> Result<Self> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| -> Result<Counter> {
            let counter = Counter::new(format!("{}_{}", config.prefix, name), help).map_err(registry_error)?;
            registry.register(Box::new(counter.clone())).map_err(registry_error)?;
            Ok(counter)
        };

        let plugins_loaded = counter("plugins_loaded_total", "Plugin instances that became active")?;
        let plugins_failed = counter("plugins_failed_total", "Plugin constructions that failed")?;
        let plugins_unloaded = counter("plugins_unloaded_total", "Plugin instances torn down")?;
        let signals_published = counter("signals_published_total", "Signals published on the bus")?;
        let handler_failures = counter("handler_failures_total", "Signal handlers that failed or panicked")?;

        let load_duration = Histogram::with_opts(
            HistogramOpts::new(
                format!("{}_plugin_load_duration_seconds", config.prefix),
                "Plugin construction time in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .map_err(registry_error)?;
        registry
            .register(Box::new(load_duration.clone()))
            .map_err(registry_error)?;

        Ok(Self {
            config,
            registry,
            plugins_loaded,
            plugins_failed,
            plugins_unloaded,
            signals_published,
            handler_failures,
            load_duration,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Get the Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a plugin instance becoming active.
    pub fn record_load(&self, duration_secs: f64) {
        self.plugins_loaded.inc();
        self.load_duration.observe(duration_secs);
    }

    /// Record a failed construction.
    pub fn record_failure(&self) {
        self.plugins_failed.inc();
    }

    /// Record a teardown.
    pub fn record_unload(&self) {
        self.plugins_unloaded.inc();
    }

    /// Record one publish and its handler failures.
    pub fn record_publish(&self, failed: usize) {
        self.signals_published.inc();
        if failed > 0 {
            self.handler_failures.inc_by(failed as f64);
        }
    }

    /// Total plugin instances loaded.
    pub fn plugins_loaded_total(&self) -> u64 {
        self.plugins_loaded.get() as u64
    }

    /// Total failed constructions.
    pub fn plugins_failed_total(&self) -> u64 {
        self.plugins_failed.get() as u64
    }

    /// Total plugin instances unloaded.
    pub fn plugins_unloaded_total(&self) -> u64 {
        self.plugins_unloaded.get() as u64
    }

    /// Total signals published.
    pub fn signals_published_total(&self) -> u64 {
        self.signals_published.get() as u64
    }

    /// Total handler failures.
    pub fn handler_failures_total(&self) -> u64 {
        self.handler_failures.get() as u64
    }
}

fn registry_error(e: prometheus::Error) -> Error {
    Error::Registry(e.to_string())
}

impl std::fmt::Debug for HostMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMetrics")
            .field("config", &self.config)
            .field("plugins_loaded", &self.plugins_loaded_total())
            .field("plugins_failed", &self.plugins_failed_total())
            .field("plugins_unloaded", &self.plugins_unloaded_total())
            .field("signals_published", &self.signals_published_total())
            .finish()
    }
}
