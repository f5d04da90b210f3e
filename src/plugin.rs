//! Plugin capability interface, construction context and live instances.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::bus::{panic_message, BindingId, EventBus, Handler, SenderFilter};
use crate::error::{Error, Result};
use crate::lifecycle::LifecycleState;
use crate::shutdown::{Shutdown, WorkerSet};
use crate::signal::Signal;

static NEXT_PLUGIN_ID: AtomicU64 = AtomicU64::new(1);

/// A constructed plugin.
///
/// Construction is done by the class factory, which reads configuration,
/// subscribes handlers through the [`PluginContext`] and may spawn workers.
/// Everything acquired through the context is released by the manager after
/// [`Plugin::on_teardown`] returns, whether or not it succeeded.
pub trait Plugin: Send {
    /// Called once when the host unloads the instance.
    fn on_teardown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builds one plugin instance.
pub type PluginFactory = Arc<dyn Fn(&PluginContext) -> Result<Box<dyn Plugin>> + Send + Sync>;

/// Everything a plugin may touch while it lives.
#[derive(Clone)]
pub struct PluginContext {
    name: Arc<str>,
    bus: EventBus,
    shutdown: Shutdown,
    workers: WorkerSet,
    bindings: Arc<Mutex<Vec<BindingId>>>,
}

impl PluginContext {
    /// Create a context whose shutdown token is a child of `host_shutdown`.
    pub fn new(name: impl Into<String>, bus: EventBus, host_shutdown: &Shutdown) -> Self {
        let name: String = name.into();
        Self {
            workers: WorkerSet::new(name.clone()),
            name: name.into(),
            bus,
            shutdown: host_shutdown.child(),
            bindings: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Instance name (`Module.Class`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shared bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// This instance's shutdown token.
    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// This instance's worker threads.
    pub fn workers(&self) -> &WorkerSet {
        &self.workers
    }

    /// Subscribe a handler; the binding is released at teardown.
    pub fn subscribe(&self, signal: &str, handler: Handler, filter: SenderFilter) -> Result<BindingId> {
        let id = self.bus.subscribe(signal, handler, filter)?;
        self.bindings.lock().push(id);
        Ok(id)
    }

    /// Subscribe a closure for any sender; the binding is released at teardown.
    pub fn subscribe_fn<F>(&self, signal: &str, f: F) -> Result<BindingId>
    where
        F: Fn(&Signal) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe(signal, Arc::new(f), SenderFilter::Any)
    }

    /// Spawn a worker thread tracked for the teardown grace period.
    pub fn spawn<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.workers.spawn(name, f)
    }

    /// Bindings made through this context and not yet released.
    pub fn bindings(&self) -> Vec<BindingId> {
        self.bindings.lock().clone()
    }

    /// Unsubscribe everything bound through this context.
    pub(crate) fn release_bindings(&self) -> usize {
        let ids = std::mem::take(&mut *self.bindings.lock());
        ids.into_iter().filter(|id| self.bus.unsubscribe(*id)).count()
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("name", &self.name)
            .field("bindings", &self.bindings.lock().len())
            .field("workers", &self.workers.active())
            .finish()
    }
}

/// An instantiable capability class inside a plugin module.
#[derive(Clone)]
pub struct PluginClass {
    /// Class name.
    pub name: String,
    /// Constructor.
    pub factory: PluginFactory,
}

impl PluginClass {
    /// Create a class from a constructor closure.
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&PluginContext) -> Result<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Arc::new(factory),
        }
    }
}

impl std::fmt::Debug for PluginClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginClass").field("name", &self.name).finish()
    }
}

/// A discovered plugin module.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    /// Module name.
    pub name: String,
    /// Module version.
    pub version: String,
    /// Human-readable description.
    pub description: String,
    /// Capability classes.
    pub classes: Vec<PluginClass>,
}

impl PluginDescriptor {
    /// Create a descriptor without classes.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            classes: Vec::new(),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a class.
    pub fn with_class(mut self, class: PluginClass) -> Self {
        self.classes.push(class);
        self
    }

    /// Look up a class by name.
    pub fn class(&self, name: &str) -> Option<&PluginClass> {
        self.classes.iter().find(|c| c.name == name)
    }

    /// Class names in declaration order.
    pub fn class_names(&self) -> Vec<&str> {
        self.classes.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Information about a plugin instance.
#[derive(Debug, Clone)]
pub struct PluginInfo {
    /// Unique instance ID.
    pub id: u64,
    /// Instance name (`Module.Class`).
    pub name: String,
    /// Module name.
    pub module: String,
    /// Class name.
    pub class: String,
    /// Module version.
    pub version: String,
    /// Module description.
    pub description: String,
    /// When the instance was created.
    pub created_at: Instant,
    /// When construction finished successfully.
    pub activated_at: Option<Instant>,
    /// Current lifecycle state.
    pub state: LifecycleState,
}

/// A plugin instance and the resources it holds.
pub struct PluginInstance {
    info: RwLock<PluginInfo>,
    plugin: Mutex<Option<Box<dyn Plugin>>>,
    context: PluginContext,
}

impl PluginInstance {
    /// Create an instance of `class` from `descriptor`, not yet constructed.
    pub fn new(descriptor: &PluginDescriptor, class: &str, bus: EventBus, host_shutdown: &Shutdown) -> Self {
        let id = NEXT_PLUGIN_ID.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}.{}", descriptor.name, class);
        let context = PluginContext::new(name.clone(), bus, host_shutdown);

        Self {
            info: RwLock::new(PluginInfo {
                id,
                name,
                module: descriptor.name.clone(),
                class: class.to_string(),
                version: descriptor.version.clone(),
                description: descriptor.description.clone(),
                created_at: Instant::now(),
                activated_at: None,
                state: LifecycleState::Discovered,
            }),
            plugin: Mutex::new(None),
            context,
        }
    }

    /// Get the instance ID.
    pub fn id(&self) -> u64 {
        self.info.read().id
    }

    /// Get the instance name.
    pub fn name(&self) -> String {
        self.info.read().name.clone()
    }

    /// Get the module version.
    pub fn version(&self) -> String {
        self.info.read().version.clone()
    }

    /// Get instance information.
    pub fn info(&self) -> PluginInfo {
        self.info.read().clone()
    }

    /// Get the current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.info.read().state
    }

    /// The context handed to the factory.
    pub fn context(&self) -> &PluginContext {
        &self.context
    }

    fn transition(&self, next: LifecycleState) -> Result<()> {
        let mut info = self.info.write();
        let current = info.state;
        if !current.can_transition_to(next) {
            return Err(Error::invalid_state(
                format!("a state preceding {}", next),
                current.to_string(),
            ));
        }
        info.state = next;
        Ok(())
    }

    /// Run the factory.
    ///
    /// A factory error or panic leaves the instance `Failed`, with any bindings
    /// it made released and its shutdown token tripped.
    pub fn construct(&self, factory: &PluginFactory) -> Result<()> {
        self.transition(LifecycleState::Constructing)?;

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| factory(&self.context)));
        let error = match outcome {
            Ok(Ok(plugin)) => {
                *self.plugin.lock() = Some(plugin);
                let mut info = self.info.write();
                info.activated_at = Some(Instant::now());
                info.state = LifecycleState::Active;
                return Ok(());
            }
            Ok(Err(e)) => Error::init_failed(e.to_string()),
            Err(panic) => Error::init_failed(format!("constructor panicked: {}", panic_message(panic.as_ref()))),
        };

        self.context.release_bindings();
        self.context.shutdown().request();
        self.info.write().state = LifecycleState::Failed;
        Err(error)
    }

    /// Release the instance.
    ///
    /// Bindings are dropped first so no new signal reaches the plugin, then the
    /// instance's shutdown token is tripped and its workers get up to `grace` to
    /// exit before [`Plugin::on_teardown`] runs. Resources are released even if
    /// the hook fails; the hook's error is returned for logging.
    pub fn teardown(&self, grace: Duration) -> Result<()> {
        self.transition(LifecycleState::TearingDown)?;
        let plugin = self.plugin.lock().take();

        let unbound = self.context.release_bindings();
        self.context.shutdown().request();
        let drained = self.context.workers().wait_idle(grace);
        tracing::debug!(plugin = %self.name(), unbound, drained, "plugin resources released");

        let result = match plugin {
            Some(mut plugin) => {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| plugin.on_teardown()));
                drop(plugin);
                match outcome {
                    Ok(result) => result,
                    Err(panic) => Err(Error::handler(format!(
                        "teardown panicked: {}",
                        panic_message(panic.as_ref())
                    ))),
                }
            }
            None => Ok(()),
        };

        self.info.write().state = LifecycleState::Unloaded;
        result
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.info.read();
        f.debug_struct("PluginInstance")
            .field("id", &info.id)
            .field("name", &info.name)
            .field("version", &info.version)
            .field("state", &info.state)
            .finish()
    }
}

/// Shared handle to a plugin instance.
#[derive(Clone)]
pub struct PluginHandle {
    instance: Arc<PluginInstance>,
}

impl PluginHandle {
    /// Create a new plugin handle.
    pub fn new(instance: PluginInstance) -> Self {
        Self {
            instance: Arc::new(instance),
        }
    }

    /// Get the instance ID.
    pub fn id(&self) -> u64 {
        self.instance.id()
    }

    /// Get the instance name.
    pub fn name(&self) -> String {
        self.instance.name()
    }

    /// Get the lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.instance.state()
    }

    /// Get instance info.
    pub fn info(&self) -> PluginInfo {
        self.instance.info()
    }

    /// Get the underlying instance.
    pub fn inner(&self) -> &PluginInstance {
        &self.instance
    }
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Payload;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct Recorder {
        torn_down: Arc<AtomicBool>,
    }

    impl Plugin for Recorder {
        fn on_teardown(&mut self) -> Result<()> {
            self.torn_down.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn make_factory<F>(f: F) -> PluginFactory
    where
        F: Fn(&PluginContext) -> Result<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    fn descriptor() -> PluginDescriptor {
        PluginDescriptor::new("Test", "1.0.0").with_description("test module")
    }

    #[test]
    fn test_instance_lifecycle() {
        let bus = EventBus::new();
        let host = Shutdown::new();
        let torn_down = Arc::new(AtomicBool::new(false));
        let hits = Arc::new(AtomicUsize::new(0));

        let flag = torn_down.clone();
        let counter = hits.clone();
        let factory = make_factory(move |ctx| {
            let counter = counter.clone();
            ctx.subscribe_fn("Ping", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })?;
            Ok(Box::new(Recorder {
                torn_down: flag.clone(),
            }) as Box<dyn Plugin>)
        });

        let instance = PluginInstance::new(&descriptor(), "Recorder", bus.clone(), &host);
        assert_eq!(instance.name(), "Test.Recorder");
        assert_eq!(instance.state(), LifecycleState::Discovered);

        instance.construct(&factory).unwrap();
        assert_eq!(instance.state(), LifecycleState::Active);
        assert_eq!(instance.context().bindings().len(), 1);

        bus.publish("Ping", None, Payload::new()).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        instance.teardown(Duration::from_millis(100)).unwrap();
        assert_eq!(instance.state(), LifecycleState::Unloaded);
        assert!(torn_down.load(Ordering::SeqCst));
        assert!(instance.context().shutdown().is_requested());
        assert!(!host.is_requested());

        bus.publish("Ping", None, Payload::new()).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.total_bindings(), 0);
    }

    #[test]
    fn test_failed_construction_releases_bindings() {
        let bus = EventBus::new();
        let host = Shutdown::new();
        let factory = make_factory(|ctx| {
            ctx.subscribe_fn("Ping", |_| Ok(()))?;
            Err(Error::init_failed("missing api token"))
        });

        let instance = PluginInstance::new(&descriptor(), "Broken", bus.clone(), &host);
        let result = instance.construct(&factory);

        assert!(matches!(result, Err(Error::InitializationFailed(_))));
        assert_eq!(instance.state(), LifecycleState::Failed);
        assert_eq!(bus.total_bindings(), 0);
        assert!(instance.context().shutdown().is_requested());

        // Failed is terminal.
        assert!(instance.construct(&factory).is_err());
        assert!(instance.teardown(Duration::ZERO).is_err());
    }

    #[test]
    fn test_panicking_constructor_is_contained() {
        let bus = EventBus::new();
        let host = Shutdown::new();
        let factory = make_factory(|_| panic!("config file unreadable"));

        let instance = PluginInstance::new(&descriptor(), "Panicky", bus, &host);
        let err = instance.construct(&factory).unwrap_err();

        assert!(err.to_string().contains("config file unreadable"));
        assert_eq!(instance.state(), LifecycleState::Failed);
    }

    #[test]
    fn test_teardown_waits_for_workers() {
        let bus = EventBus::new();
        let host = Shutdown::new();
        let exited = Arc::new(AtomicBool::new(false));

        let flag = exited.clone();
        let factory = make_factory(move |ctx| {
            let shutdown = ctx.shutdown().clone();
            let flag = flag.clone();
            ctx.spawn("refresh", move || {
                while !shutdown.wait_timeout(Duration::from_millis(10)) {}
                flag.store(true, Ordering::SeqCst);
            })?;
            Ok(Box::new(Recorder {
                torn_down: Arc::new(AtomicBool::new(false)),
            }) as Box<dyn Plugin>)
        });

        let instance = PluginInstance::new(&descriptor(), "Looper", bus, &host);
        instance.construct(&factory).unwrap();
        assert_eq!(instance.context().workers().active(), 1);

        instance.teardown(Duration::from_secs(5)).unwrap();
        assert!(exited.load(Ordering::SeqCst));
        assert_eq!(instance.context().workers().active(), 0);
    }

    #[test]
    fn test_plugin_handle() {
        let bus = EventBus::new();
        let host = Shutdown::new();
        let handle = PluginHandle::new(PluginInstance::new(&descriptor(), "Recorder", bus, &host));

        assert!(handle.id() > 0);
        assert_eq!(handle.name(), "Test.Recorder");
        assert_eq!(handle.info().module, "Test");
        assert_eq!(handle.info().version, "1.0.0");

        let handle2 = handle.clone();
        assert_eq!(handle.id(), handle2.id());
    }
}
