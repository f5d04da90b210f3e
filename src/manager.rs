//! Plugin lifecycle manager.
//!
//! Turns plugin manifests into running instances and releases them again.
//! Every failure is contained to the plugin that caused it: a bad manifest is
//! skipped, a failing constructor leaves its instance `Failed`, and teardown
//! errors are only logged.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::bus::EventBus;
use crate::catalog::PluginCatalog;
use crate::error::{Error, Result};
use crate::lifecycle::{LifecycleEvent, LifecycleHooks};
use crate::manifest::{Manifest, RESERVED_MODULE};
use crate::plugin::{PluginDescriptor, PluginHandle, PluginInstance};
use crate::shutdown::Shutdown;

/// Configuration for the plugin manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Time each instance's workers get to exit during teardown.
    pub teardown_grace: Duration,
    /// Maximum number of live instances.
    pub max_plugins: usize,
    /// Classes never instantiated, whatever the descriptor says.
    pub disabled_classes: Vec<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            teardown_grace: Duration::from_secs(5),
            max_plugins: 100,
            disabled_classes: Vec::new(),
        }
    }
}

impl ManagerConfig {
    /// Create a new manager configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the teardown grace period.
    pub fn with_teardown_grace(mut self, grace: Duration) -> Self {
        self.teardown_grace = grace;
        self
    }

    /// Set the maximum number of instances.
    pub fn with_max_plugins(mut self, max: usize) -> Self {
        self.max_plugins = max;
        self
    }

    /// Set the disabled classes.
    pub fn with_disabled_classes(mut self, classes: Vec<String>) -> Self {
        self.disabled_classes = classes;
        self
    }
}

/// A class that could not be brought up.
#[derive(Debug, Clone)]
pub struct PluginFailure {
    /// Module name.
    pub module: String,
    /// Class name.
    pub class: String,
    /// Instance name (`Module.Class`).
    pub name: String,
    /// Rendered error.
    pub error: String,
}

/// Outcome of instantiating one or more descriptors.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Instances that reached `Active`.
    pub active: Vec<PluginHandle>,
    /// Classes whose construction failed.
    pub failures: Vec<PluginFailure>,
}

impl LoadReport {
    fn merge(&mut self, other: LoadReport) {
        self.active.extend(other.active);
        self.failures.extend(other.failures);
    }
}

/// Manager statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Instances currently active.
    pub active: usize,
    /// Construction failures recorded.
    pub failed: usize,
    /// Instances torn down.
    pub unloaded: usize,
    /// All instances ever attempted.
    pub total: usize,
}

/// Owns every live plugin instance.
pub struct PluginManager {
    config: ManagerConfig,
    catalog: PluginCatalog,
    bus: EventBus,
    shutdown: Shutdown,
    instances: DashMap<String, PluginHandle>,
    order: RwLock<Vec<String>>,
    failures: RwLock<Vec<PluginFailure>>,
    unloaded: AtomicUsize,
    hooks: Arc<RwLock<LifecycleHooks>>,
    #[cfg(feature = "metrics-prometheus")]
    metrics: RwLock<Option<Arc<crate::metrics::HostMetrics>>>,
}

impl PluginManager {
    /// Create a manager whose plugins share `bus` and hang off `shutdown`.
    pub fn new(config: ManagerConfig, catalog: PluginCatalog, bus: EventBus, shutdown: Shutdown) -> Self {
        Self {
            config,
            catalog,
            bus,
            shutdown,
            instances: DashMap::new(),
            order: RwLock::new(Vec::new()),
            failures: RwLock::new(Vec::new()),
            unloaded: AtomicUsize::new(0),
            hooks: Arc::new(RwLock::new(LifecycleHooks::new())),
            #[cfg(feature = "metrics-prometheus")]
            metrics: RwLock::new(None),
        }
    }

    /// Get the manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Get the plugin catalog.
    pub fn catalog(&self) -> &PluginCatalog {
        &self.catalog
    }

    /// Attach a metrics collector.
    #[cfg(feature = "metrics-prometheus")]
    pub fn set_metrics(&self, metrics: Arc<crate::metrics::HostMetrics>) {
        *self.metrics.write() = Some(metrics);
    }

    /// Add a lifecycle event handler.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.hooks.write().on_event(handler);
    }

    /// Scan `dir` for `*.toml` manifests and resolve them against the catalog.
    ///
    /// The reserved `base` module and anything in `disabled_modules` are
    /// excluded; classes in `disabled_classes` are dropped from the returned
    /// descriptors. A missing directory is fatal, a bad manifest is not.
    pub fn discover(
        &self,
        dir: &Path,
        disabled_modules: &[String],
        disabled_classes: &[String],
    ) -> Result<Vec<PluginDescriptor>> {
        if !dir.is_dir() {
            return Err(Error::DirectoryNotFound(dir.to_path_buf()));
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().map_or(false, |ext| ext == "toml"))
            .collect();
        paths.sort();

        let mut descriptors = Vec::new();
        for path in paths {
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            if stem == RESERVED_MODULE {
                tracing::trace!(path = %path.display(), "skipping reserved module");
                continue;
            }

            let manifest = match Manifest::from_file(&path).and_then(|m| m.validate().map(|_| m)) {
                Ok(manifest) => manifest,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping plugin manifest");
                    continue;
                }
            };

            if disabled_modules.contains(&manifest.name) {
                tracing::info!(module = %manifest.name, "module disabled");
                continue;
            }

            match self.catalog.resolve(&manifest) {
                Ok(descriptor) => {
                    let descriptor = without_classes(descriptor, disabled_classes);
                    self.hooks.read().emit_discovered(&descriptor.name);
                    tracing::debug!(
                        module = %descriptor.name,
                        version = %descriptor.version,
                        classes = ?descriptor.class_names(),
                        "plugin discovered"
                    );
                    descriptors.push(descriptor);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "manifest names no built-in module");
                }
            }
        }

        tracing::info!(dir = %dir.display(), count = descriptors.len(), "plugin discovery finished");
        Ok(descriptors)
    }

    /// Every catalog module, minus the disabled ones, without reading manifests.
    pub fn discover_builtin(&self, disabled_modules: &[String], disabled_classes: &[String]) -> Vec<PluginDescriptor> {
        self.catalog
            .descriptors()
            .iter()
            .filter(|d| d.name != RESERVED_MODULE && !disabled_modules.contains(&d.name))
            .map(|d| {
                self.hooks.read().emit_discovered(&d.name);
                without_classes(d.clone(), disabled_classes)
            })
            .collect()
    }

    /// Construct one class of `descriptor`.
    pub fn instantiate_class(&self, descriptor: &PluginDescriptor, class: &str) -> Result<PluginHandle> {
        let plugin_class = descriptor
            .class(class)
            .ok_or_else(|| Error::plugin_not_found(format!("{}.{}", descriptor.name, class)))?;

        let name = format!("{}.{}", descriptor.name, class);
        if self.instances.contains_key(&name) {
            return Err(Error::PluginAlreadyLoaded(name));
        }
        if self.instances.len() >= self.config.max_plugins {
            return Err(Error::Registry(format!(
                "instance limit reached: max {} plugins",
                self.config.max_plugins
            )));
        }

        let started = Instant::now();
        let instance = PluginInstance::new(descriptor, class, self.bus.clone(), &self.shutdown);
        if let Err(e) = instance.construct(&plugin_class.factory) {
            self.record_failure(descriptor, class, &e);
            return Err(e);
        }

        let handle = PluginHandle::new(instance);
        match self.instances.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                let _ = handle.inner().teardown(Duration::ZERO);
                return Err(Error::PluginAlreadyLoaded(name));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handle.clone());
            }
        }
        self.order.write().push(name.clone());

        #[cfg(feature = "metrics-prometheus")]
        if let Some(metrics) = self.metrics.read().as_ref() {
            metrics.record_load(started.elapsed().as_secs_f64());
        }

        self.hooks.read().emit_activated(&name);
        tracing::info!(
            plugin = %name,
            version = %descriptor.version,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "plugin active"
        );
        Ok(handle)
    }

    /// Construct every enabled class of `descriptor`.
    ///
    /// Never fails; failures are collected in the report.
    pub fn instantiate(&self, descriptor: &PluginDescriptor) -> LoadReport {
        let mut report = LoadReport::default();

        for class in &descriptor.classes {
            if self.config.disabled_classes.contains(&class.name) {
                tracing::info!(module = %descriptor.name, class = %class.name, "class disabled");
                continue;
            }

            match self.instantiate_class(descriptor, &class.name) {
                Ok(handle) => report.active.push(handle),
                Err(e) => report.failures.push(PluginFailure {
                    module: descriptor.name.clone(),
                    class: class.name.clone(),
                    name: format!("{}.{}", descriptor.name, class.name),
                    error: e.to_string(),
                }),
            }
        }

        report
    }

    /// Instantiate every descriptor in order.
    pub fn load_all(&self, descriptors: &[PluginDescriptor]) -> LoadReport {
        let mut report = LoadReport::default();
        for descriptor in descriptors {
            report.merge(self.instantiate(descriptor));
        }

        tracing::info!(
            active = report.active.len(),
            failed = report.failures.len(),
            "plugins loaded"
        );
        report
    }

    fn record_failure(&self, descriptor: &PluginDescriptor, class: &str, error: &Error) {
        let name = format!("{}.{}", descriptor.name, class);
        tracing::error!(plugin = %name, error = %error, "plugin construction failed");
        self.hooks.read().emit_failed(&name, &error.to_string());

        #[cfg(feature = "metrics-prometheus")]
        if let Some(metrics) = self.metrics.read().as_ref() {
            metrics.record_failure();
        }

        self.failures.write().push(PluginFailure {
            module: descriptor.name.clone(),
            class: class.to_string(),
            name,
            error: error.to_string(),
        });
    }

    /// Release one instance. Errors are logged, never returned.
    pub fn teardown(&self, handle: &PluginHandle) {
        let name = handle.name();
        let state = handle.state();
        if state.is_terminal() {
            tracing::debug!(plugin = %name, state = state.description(), "nothing to release");
            return;
        }
        self.hooks.read().emit_tearing_down(&name);

        match handle.inner().teardown(self.config.teardown_grace) {
            Ok(()) => tracing::info!(plugin = %name, "plugin unloaded"),
            Err(e @ Error::InvalidState { .. }) => {
                tracing::warn!(plugin = %name, error = %e, state = handle.state().description(), "plugin was not active");
                return;
            }
            Err(e) => tracing::error!(plugin = %name, error = %e, "plugin teardown failed"),
        }

        self.unloaded.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics-prometheus")]
        if let Some(metrics) = self.metrics.read().as_ref() {
            metrics.record_unload();
        }
        self.hooks.read().emit_unloaded(&name);
    }

    /// Unload a single instance by name.
    pub fn unload(&self, name: &str) -> Result<()> {
        let (_, handle) = self
            .instances
            .remove(name)
            .ok_or_else(|| Error::plugin_not_found(name))?;
        self.order.write().retain(|n| n != name);
        self.teardown(&handle);
        Ok(())
    }

    /// Tear down every instance in load order, each exactly once.
    pub fn shutdown(&self) {
        let order = std::mem::take(&mut *self.order.write());
        if order.is_empty() {
            return;
        }

        tracing::info!(count = order.len(), "tearing down plugins");
        for name in order {
            if let Some((_, handle)) = self.instances.remove(&name) {
                self.teardown(&handle);
            }
        }
    }

    /// Get an active instance by name.
    pub fn get(&self, name: &str) -> Option<PluginHandle> {
        self.instances.get(name).map(|r| r.clone())
    }

    /// Active instance names in load order.
    pub fn names(&self) -> Vec<String> {
        self.order.read().clone()
    }

    /// Active instances in load order.
    pub fn active(&self) -> Vec<PluginHandle> {
        self.order.read().iter().filter_map(|n| self.get(n)).collect()
    }

    /// Construction failures recorded so far.
    pub fn failures(&self) -> Vec<PluginFailure> {
        self.failures.read().clone()
    }

    /// Number of active instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// True if nothing is active.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Get manager statistics.
    pub fn stats(&self) -> ManagerStats {
        let active = self.instances.len();
        let failed = self.failures.read().len();
        let unloaded = self.unloaded.load(Ordering::Relaxed);
        ManagerStats {
            active,
            failed,
            unloaded,
            total: active + failed + unloaded,
        }
    }
}

fn without_classes(mut descriptor: PluginDescriptor, disabled: &[String]) -> PluginDescriptor {
    descriptor.classes.retain(|c| {
        let keep = !disabled.contains(&c.name);
        if !keep {
            tracing::info!(module = %descriptor.name, class = %c.name, "class disabled");
        }
        keep
    });
    descriptor
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("config", &self.config)
            .field("active", &self.instances.len())
            .field("failed", &self.failures.read().len())
            .finish()
    }
}

impl Drop for PluginManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleState;
    use crate::plugin::{Plugin, PluginClass, PluginContext};
    use crate::signal::Payload;
    use std::sync::atomic::AtomicBool;

    struct Nothing;
    impl Plugin for Nothing {}

    fn ok_class(name: &str) -> PluginClass {
        PluginClass::new(name, |ctx: &PluginContext| {
            ctx.subscribe_fn("Ping", |_| Ok(()))?;
            Ok(Box::new(Nothing) as Box<dyn Plugin>)
        })
    }

    fn failing_class(name: &str) -> PluginClass {
        PluginClass::new(name, |ctx: &PluginContext| {
            ctx.subscribe_fn("Ping", |_| Ok(()))?;
            Err(Error::init_failed("credentials missing"))
        })
    }

    fn manager() -> (PluginManager, EventBus, Shutdown) {
        let bus = EventBus::new();
        let shutdown = Shutdown::new();
        let manager = PluginManager::new(
            ManagerConfig::new().with_teardown_grace(Duration::from_millis(200)),
            PluginCatalog::new(),
            bus.clone(),
            shutdown.clone(),
        );
        (manager, bus, shutdown)
    }

    #[test]
    fn test_manager_config_builder() {
        let config = ManagerConfig::new()
            .with_max_plugins(3)
            .with_teardown_grace(Duration::from_secs(1))
            .with_disabled_classes(vec!["Radar".to_string()]);

        assert_eq!(config.max_plugins, 3);
        assert_eq!(config.teardown_grace, Duration::from_secs(1));
        assert_eq!(config.disabled_classes, vec!["Radar".to_string()]);
    }

    #[test]
    fn test_one_failure_does_not_abort_loading() {
        let (manager, bus, _) = manager();
        let descriptors: Vec<_> = (0..5)
            .map(|i| {
                let class = if i == 2 { failing_class("Main") } else { ok_class("Main") };
                PluginDescriptor::new(format!("Module{}", i), "1.0").with_class(class)
            })
            .collect();

        let report = manager.load_all(&descriptors);
        assert_eq!(report.active.len(), 4);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].name, "Module2.Main");
        assert!(report.failures[0].error.contains("credentials missing"));

        assert_eq!(bus.binding_count("Ping"), 4);
        assert!(manager.get("Module2.Main").is_none());
        assert_eq!(
            manager.stats(),
            ManagerStats {
                active: 4,
                failed: 1,
                unloaded: 0,
                total: 5
            }
        );
    }

    #[test]
    fn test_disabled_class_is_skipped() {
        let bus = EventBus::new();
        let manager = PluginManager::new(
            ManagerConfig::new().with_disabled_classes(vec!["Radar".to_string()]),
            PluginCatalog::new(),
            bus,
            Shutdown::new(),
        );
        let descriptor = PluginDescriptor::new("Weather", "1.0")
            .with_class(ok_class("Forecast"))
            .with_class(ok_class("Radar"));

        let report = manager.instantiate(&descriptor);
        assert_eq!(report.active.len(), 1);
        assert_eq!(manager.names(), vec!["Weather.Forecast".to_string()]);
    }

    #[test]
    fn test_duplicate_and_limit() {
        let bus = EventBus::new();
        let manager = PluginManager::new(
            ManagerConfig::new().with_max_plugins(1),
            PluginCatalog::new(),
            bus,
            Shutdown::new(),
        );
        let descriptor = PluginDescriptor::new("Weather", "1.0")
            .with_class(ok_class("Forecast"))
            .with_class(ok_class("Radar"));

        manager.instantiate_class(&descriptor, "Forecast").unwrap();
        assert!(matches!(
            manager.instantiate_class(&descriptor, "Forecast"),
            Err(Error::PluginAlreadyLoaded(_))
        ));
        assert!(matches!(
            manager.instantiate_class(&descriptor, "Radar"),
            Err(Error::Registry(_))
        ));
        assert!(matches!(
            manager.instantiate_class(&descriptor, "Satellite"),
            Err(Error::PluginNotFound(_))
        ));
    }

    #[test]
    fn test_shutdown_tears_down_in_load_order_once() {
        let (manager, bus, _) = manager();
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let log = events.clone();
        manager.on_event(move |event| {
            if let LifecycleEvent::Unloaded { name, .. } = event {
                log.lock().push(name.clone());
            }
        });

        let descriptors: Vec<_> = ["First", "Second", "Third"]
            .iter()
            .map(|m| PluginDescriptor::new(*m, "1.0").with_class(ok_class("Main")))
            .collect();
        manager.load_all(&descriptors);

        manager.shutdown();
        manager.shutdown();

        assert_eq!(
            *events.lock(),
            vec!["First.Main".to_string(), "Second.Main".to_string(), "Third.Main".to_string()]
        );
        assert!(manager.is_empty());
        assert_eq!(bus.total_bindings(), 0);
        assert_eq!(manager.stats().unloaded, 3);
    }

    #[test]
    fn test_unload_single_instance() {
        let (manager, bus, host) = manager();
        let stopped = Arc::new(AtomicBool::new(false));

        let flag = stopped.clone();
        let descriptor = PluginDescriptor::new("Clock", "1.0").with_class(PluginClass::new(
            "Ticker",
            move |ctx: &PluginContext| {
                let shutdown = ctx.shutdown().clone();
                let flag = flag.clone();
                ctx.spawn("tick", move || {
                    while !shutdown.wait_timeout(Duration::from_millis(10)) {}
                    flag.store(true, Ordering::SeqCst);
                })?;
                Ok(Box::new(Nothing) as Box<dyn Plugin>)
            },
        ));
        manager.instantiate(&descriptor);
        manager.instantiate(&PluginDescriptor::new("Echo", "1.0").with_class(ok_class("Main")));

        manager.unload("Clock.Ticker").unwrap();
        assert!(stopped.load(Ordering::SeqCst));
        assert!(!host.is_requested());
        assert_eq!(manager.names(), vec!["Echo.Main".to_string()]);
        assert!(matches!(manager.unload("Clock.Ticker"), Err(Error::PluginNotFound(_))));

        bus.publish("Ping", None, Payload::new()).unwrap();
        assert_eq!(bus.binding_count("Ping"), 1);
    }

    #[test]
    fn test_teardown_error_is_contained() {
        struct Grumpy;
        impl Plugin for Grumpy {
            fn on_teardown(&mut self) -> Result<()> {
                Err(Error::handler("device still open"))
            }
        }

        let (manager, _, _) = manager();
        let descriptor = PluginDescriptor::new("Grumpy", "1.0").with_class(PluginClass::new(
            "Main",
            |_: &PluginContext| Ok(Box::new(Grumpy) as Box<dyn Plugin>),
        ));
        manager.instantiate(&descriptor);

        manager.shutdown();
        assert!(manager.is_empty());
        assert_eq!(manager.stats().unloaded, 1);
    }

    #[test]
    fn test_discover_builtin_filters_catalog() {
        let mut catalog = PluginCatalog::new();
        catalog
            .register(
                PluginDescriptor::new("Weather", "1.0")
                    .with_class(ok_class("Forecast"))
                    .with_class(ok_class("Radar")),
            )
            .register(PluginDescriptor::new("Joke", "1.0").with_class(ok_class("Main")))
            .register(PluginDescriptor::new(RESERVED_MODULE, "1.0").with_class(ok_class("Main")));
        let manager = PluginManager::new(ManagerConfig::new(), catalog, EventBus::new(), Shutdown::new());

        let discovered = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = discovered.clone();
        manager.on_event(move |event| {
            if let LifecycleEvent::Discovered { name, .. } = event {
                log.lock().push(name.clone());
            }
        });

        let descriptors = manager.discover_builtin(&["Joke".to_string()], &["Radar".to_string()]);
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].name, "Weather");
        assert_eq!(descriptors[0].class_names(), vec!["Forecast"]);
        assert_eq!(*discovered.lock(), vec!["Weather".to_string()]);
    }

    #[test]
    fn test_teardown_of_released_instance_is_skipped() {
        let (manager, _, _) = manager();
        let handle = manager
            .instantiate_class(&PluginDescriptor::new("Echo", "1.0").with_class(ok_class("Main")), "Main")
            .unwrap();

        manager.shutdown();
        assert_eq!(handle.state(), LifecycleState::Unloaded);
        manager.teardown(&handle);
        assert_eq!(manager.stats().unloaded, 1);
    }

    #[test]
    fn test_discover_missing_directory() {
        let (manager, _, _) = manager();
        let result = manager.discover(Path::new("/definitely/not/here"), &[], &[]);
        match result {
            Err(e @ Error::DirectoryNotFound(_)) => assert!(e.is_fatal()),
            other => panic!("unexpected result: {:?}", other.map(|d| d.len())),
        }
    }
}
