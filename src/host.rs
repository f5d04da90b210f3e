//! Host wiring: one bus, one shutdown condition, one plugin manager.

use parking_lot::Mutex;

use crate::bus::{BindingId, EventBus};
use crate::catalog::PluginCatalog;
use crate::config::HostConfig;
use crate::error::Result;
use crate::manager::{LoadReport, ManagerConfig, PluginManager};
use crate::shutdown::Shutdown;
use crate::signal::{names, Payload};

/// A running home-assistant host.
pub struct Host {
    config: HostConfig,
    bus: EventBus,
    shutdown: Shutdown,
    manager: PluginManager,
    emergency: Mutex<Option<BindingId>>,
}

impl Host {
    /// Create a host with the built-in plugin catalog.
    pub fn new(config: HostConfig) -> Self {
        let catalog = PluginCatalog::builtin(&config.audio);
        Self::with_catalog(config, catalog)
    }

    /// Create a host resolving manifests against `catalog`.
    pub fn with_catalog(config: HostConfig, catalog: PluginCatalog) -> Self {
        let bus = EventBus::new();
        let shutdown = Shutdown::new();
        let manager_config = ManagerConfig::new()
            .with_teardown_grace(config.host.grace_period())
            .with_disabled_classes(config.classes.disabled.clone());
        let manager = PluginManager::new(manager_config, catalog, bus.clone(), shutdown.clone());

        Self {
            config,
            bus,
            shutdown,
            manager,
            emergency: Mutex::new(None),
        }
    }

    /// Get the host configuration.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// The shared bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The host shutdown condition.
    pub fn shutdown_token(&self) -> &Shutdown {
        &self.shutdown
    }

    /// The plugin manager.
    pub fn manager(&self) -> &PluginManager {
        &self.manager
    }

    /// Export counters to Prometheus.
    #[cfg(feature = "metrics-prometheus")]
    pub fn enable_metrics(&self, config: crate::metrics::MetricsConfig) -> Result<std::sync::Arc<crate::metrics::HostMetrics>> {
        let metrics = std::sync::Arc::new(crate::metrics::HostMetrics::new(config)?);
        self.bus.set_metrics(metrics.clone());
        self.manager.set_metrics(metrics.clone());
        Ok(metrics)
    }

    /// Bind emergency shutdown, discover and load plugins, then greet.
    ///
    /// Only fatal errors are returned; a plugin failing to load is reported
    /// in the [`LoadReport`].
    pub fn start(&self) -> Result<LoadReport> {
        let shutdown = self.shutdown.clone();
        let id = self.bus.subscribe_fn(names::EMERGENCY_SHUTDOWN, move |signal| {
            if shutdown.request() {
                tracing::warn!(sender = signal.sender.as_deref().unwrap_or("-"), "emergency shutdown requested");
            }
            Ok(())
        })?;
        *self.emergency.lock() = Some(id);

        let descriptors = self.manager.discover(
            &self.config.modules.path,
            &self.config.modules.disabled,
            &self.config.classes.disabled,
        )?;
        let report = self.manager.load_all(&descriptors);

        if let Some(welcome) = &self.config.host.welcome {
            self.bus
                .emit(names::SAY_RESPONSE, Payload::new().with("response", welcome.as_str()));
        }

        tracing::info!(
            active = report.active.len(),
            failed = report.failures.len(),
            "host started"
        );
        Ok(report)
    }

    /// Block until shutdown is requested.
    pub fn run(&self) {
        tracing::info!("host running, waiting for shutdown");
        self.shutdown.wait();
    }

    /// Request shutdown and release every plugin. Idempotent.
    pub fn stop(&self) {
        if self.shutdown.request() {
            tracing::info!("shutdown requested");
        }
        if let Some(id) = self.emergency.lock().take() {
            self.bus.unsubscribe(id);
        }
        self.manager.shutdown();
        tracing::info!("host stopped");
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("plugin_dir", &self.config.modules.path)
            .field("shutdown", &self.shutdown)
            .field("manager", &self.manager)
            .finish()
    }
}
