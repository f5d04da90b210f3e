//! Integration tests for aria-host.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use aria_host::{
    names, AudioConfig, AudioEngine, DetectionPoll, DetectionProcess, Error, EventBus, Host, HostConfig,
    LifecycleEvent, LifecycleState, ManagerConfig, Payload, Plugin, PluginCatalog, PluginClass, PluginContext,
    PluginDescriptor, PluginManager, Result, SenderFilter, Shutdown, Signal,
};

// Engine that never hears a wake word and whose I/O takes a fixed time.
struct QuietEngine {
    io_time: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
    done: Mutex<Vec<String>>,
}

impl QuietEngine {
    fn new(io_time: Duration) -> Arc<Self> {
        Arc::new(Self {
            io_time,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            done: Mutex::new(Vec::new()),
        })
    }

    fn io(&self, entry: String) -> Result<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.io_time);
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.done.lock().push(entry);
        Ok(())
    }
}

struct Silence;

impl DetectionProcess for Silence {
    fn poll_line(&mut self, timeout: Duration) -> Result<DetectionPoll> {
        std::thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(DetectionPoll::Idle)
    }

    fn terminate(&mut self) {}
}

impl AudioEngine for QuietEngine {
    fn start_detection(&self) -> Result<Box<dyn DetectionProcess>> {
        Ok(Box::new(Silence))
    }

    fn play(&self, file: &str, _cancel: &Shutdown) -> Result<()> {
        self.io(format!("play:{}", file))
    }

    fn record(&self, file: &str, seconds: u32, _cancel: &Shutdown) -> Result<()> {
        self.io(format!("record:{}:{}", file, seconds))
    }
}

struct Nothing;
impl Plugin for Nothing {}

fn eventually<F: Fn() -> bool>(check: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    check()
}

fn write_manifest(dir: &Path, file: &str, name: &str, classes: &[&str]) {
    let classes: Vec<String> = classes.iter().map(|c| format!("\"{}\"", c)).collect();
    let body = format!(
        "name = \"{}\"\nversion = \"1.0.0\"\ndescription = \"{} module\"\nclasses = [{}]\n",
        name,
        name,
        classes.join(", ")
    );
    std::fs::write(dir.join(file), body).unwrap();
}

fn audio_host(dir: &Path, engine: Arc<QuietEngine>) -> Host {
    write_manifest(dir, "AudioPlugin.toml", "AudioPlugin", &["AudioSubSystem"]);
    let audio = AudioConfig::default().with_poll_interval(Duration::from_millis(5));
    let config = HostConfig::new()
        .with_plugin_dir(dir)
        .with_grace_period(Duration::from_secs(2))
        .with_welcome(None)
        .with_audio(audio.clone());
    Host::with_catalog(config, PluginCatalog::builtin_with_engine(&audio, engine))
}

fn record_events(bus: &EventBus, signals: &[&str]) -> Arc<Mutex<Vec<String>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    for signal in signals {
        let log = events.clone();
        bus.subscribe_fn(signal, move |s: &Signal| {
            log.lock().push(format!("{}({})", s.name, s.status().unwrap_or_default()));
            Ok(())
        })
        .unwrap();
    }
    events
}

#[test]
fn test_play_while_listening_signal_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let engine = QuietEngine::new(Duration::from_millis(30));
    let host = audio_host(dir.path(), engine.clone());
    let events = record_events(
        host.bus(),
        &[names::HOT_WORD_DETECTION_ACTIVE, names::PLAYBACK_ACTIVE],
    );

    let report = host.start().unwrap();
    assert_eq!(report.active.len(), 1);
    assert_eq!(report.active[0].name(), "AudioPlugin.AudioSubSystem");

    host.bus().emit(names::WAIT_TO_HOT_WORD, Payload::new());
    assert!(eventually(|| events.lock().len() == 1));

    host.bus()
        .emit(names::PLAY_FILE, Payload::new().with("filename", "a.wav"));
    assert!(eventually(|| events.lock().len() >= 5));

    assert_eq!(
        events.lock()[..5],
        [
            "HotWordDetectionActive(true)",
            "HotWordDetectionActive(false)",
            "PlaybackActive(true)",
            "PlaybackActive(false)",
            "HotWordDetectionActive(true)",
        ]
    );
    assert_eq!(*engine.done.lock(), vec!["play:a.wav"]);

    host.stop();
    assert_eq!(events.lock().last().map(String::as_str), Some("HotWordDetectionActive(false)"));
    assert_eq!(host.bus().binding_count(names::PLAY_FILE), 0);
}

#[test]
fn test_concurrent_records_are_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    let engine = QuietEngine::new(Duration::from_millis(20));
    let host = audio_host(dir.path(), engine.clone());
    let events = record_events(host.bus(), &[names::RECORD_ACTIVE]);
    host.start().unwrap();

    let publishers: Vec<_> = (0..2)
        .map(|i| {
            let bus = host.bus().clone();
            std::thread::spawn(move || {
                bus.publish(
                    names::RECORD_FILE,
                    Some("Stt"),
                    Payload::new().with("filename", format!("q{}.wav", i)).with("record_time", 1i64),
                )
                .unwrap()
            })
        })
        .collect();
    for publisher in publishers {
        assert_eq!(publisher.join().unwrap().failed, 0);
    }

    assert!(eventually(|| events.lock().len() == 4));
    assert_eq!(engine.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(
        *events.lock(),
        vec!["RecordActive(true)", "RecordActive(false)", "RecordActive(true)", "RecordActive(false)"]
    );

    host.stop();
}

#[test]
fn test_one_bad_plugin_among_five() {
    let dir = tempfile::tempdir().unwrap();
    let mut catalog = PluginCatalog::new();
    for i in 0..5 {
        let module = format!("Module{}", i);
        let class = if i == 3 {
            PluginClass::new("Main", |_: &PluginContext| -> Result<Box<dyn Plugin>> {
                panic!("missing configuration file")
            })
        } else {
            PluginClass::new("Main", |ctx: &PluginContext| {
                ctx.subscribe_fn("Tick", |_| Ok(()))?;
                Ok(Box::new(Nothing) as Box<dyn Plugin>)
            })
        };
        catalog.register(PluginDescriptor::new(&module, "1.0.0").with_class(class));
        write_manifest(dir.path(), &format!("{}.toml", module), &module, &["Main"]);
    }

    let bus = EventBus::new();
    let manager = PluginManager::new(ManagerConfig::new(), catalog, bus.clone(), Shutdown::new());
    let failed = Arc::new(Mutex::new(Vec::new()));
    let log = failed.clone();
    manager.on_event(move |event| {
        if let LifecycleEvent::Failed { name, .. } = event {
            log.lock().push(name.clone());
        }
    });

    let descriptors = manager.discover(dir.path(), &[], &[]).unwrap();
    assert_eq!(descriptors.len(), 5);

    let report = manager.load_all(&descriptors);
    assert_eq!(report.active.len(), 4);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].module, "Module3");
    assert_eq!(*failed.lock(), vec!["Module3.Main".to_string()]);
    assert!(report.active.iter().all(|h| h.state() == LifecycleState::Active));
    assert_eq!(bus.binding_count("Tick"), 4);

    let handles = manager.active();
    manager.shutdown();
    assert!(handles.iter().all(|h| h.state() == LifecycleState::Unloaded));
    assert_eq!(bus.total_bindings(), 0);
}

#[test]
fn test_discovery_filters() {
    let dir = tempfile::tempdir().unwrap();
    let mut catalog = PluginCatalog::new();
    for module in ["Weather", "Joke", "Email"] {
        catalog.register(
            PluginDescriptor::new(module, "0.1.0")
                .with_class(PluginClass::new("Main", |_: &PluginContext| Ok(Box::new(Nothing) as Box<dyn Plugin>)))
                .with_class(PluginClass::new("Extra", |_: &PluginContext| Ok(Box::new(Nothing) as Box<dyn Plugin>))),
        );
    }

    write_manifest(dir.path(), "base.toml", "Base", &["Main"]);
    write_manifest(dir.path(), "Weather.toml", "Weather", &["Main", "Extra"]);
    write_manifest(dir.path(), "Joke.toml", "Joke", &["Main"]);
    write_manifest(dir.path(), "Email.toml", "Email", &["Main", "Ghost"]);
    write_manifest(dir.path(), "Unknown.toml", "Unknown", &["Main"]);
    std::fs::write(dir.path().join("Broken.toml"), "name = ").unwrap();
    std::fs::write(dir.path().join("notes.txt"), "not a manifest").unwrap();

    let manager = PluginManager::new(ManagerConfig::new(), catalog, EventBus::new(), Shutdown::new());
    let descriptors = manager
        .discover(dir.path(), &["Joke".to_string()], &["Extra".to_string()])
        .unwrap();

    let found: Vec<(String, Vec<&str>)> = descriptors
        .iter()
        .map(|d| (d.name.clone(), d.class_names()))
        .collect();
    assert_eq!(
        found,
        vec![
            ("Email".to_string(), vec!["Main"]),
            ("Weather".to_string(), vec!["Main"]),
        ]
    );
    assert_eq!(descriptors[1].version, "1.0.0");
    assert_eq!(descriptors[1].description, "Weather module");

    let missing = manager.discover(&dir.path().join("missing"), &[], &[]);
    assert!(matches!(missing, Err(Error::DirectoryNotFound(_))));
}

#[test]
fn test_emergency_shutdown_and_idempotent_stop() {
    let dir = tempfile::tempdir().unwrap();
    let engine = QuietEngine::new(Duration::from_millis(1));
    let host = audio_host(dir.path(), engine);
    host.start().unwrap();

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let shutdown = host.shutdown_token().clone();
            std::thread::spawn(move || shutdown.wait_timeout(Duration::from_secs(10)))
        })
        .collect();

    host.bus().emit(names::EMERGENCY_SHUTDOWN, Payload::new());
    host.bus().emit(names::EMERGENCY_SHUTDOWN, Payload::new());
    for waiter in waiters {
        assert!(waiter.join().unwrap());
    }

    host.run();
    host.stop();
    host.stop();
    assert!(host.manager().is_empty());
    assert_eq!(host.manager().stats().unloaded, 1);

    // Requests after shutdown are ignored, not failed.
    let report = host
        .bus()
        .publish(names::PLAY_FILE, None, Payload::new().with("filename", "late.wav"))
        .unwrap();
    assert_eq!(report.invoked, 0);
}

#[test]
fn test_bus_isolation_and_snapshot() {
    let bus = EventBus::new();
    let calls = Arc::new(AtomicUsize::new(0));

    bus.subscribe_fn("Weather", |_| Err(Error::handler("api down"))).unwrap();
    bus.subscribe_fn("Weather", |_| panic!("parser bug")).unwrap();

    let counter = calls.clone();
    bus.subscribe(
        "Weather",
        Arc::new(move |_: &Signal| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
        SenderFilter::named("WeatherPlugin"),
    )
    .unwrap();

    let own_id = Arc::new(Mutex::new(None));
    let id_slot = own_id.clone();
    let self_calls = Arc::new(AtomicUsize::new(0));
    let self_counter = self_calls.clone();
    let self_bus = bus.clone();
    let id = bus
        .subscribe_fn("Weather", move |_| {
            self_counter.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *id_slot.lock() {
                self_bus.unsubscribe(id);
            }
            Ok(())
        })
        .unwrap();
    *own_id.lock() = Some(id);

    let report = bus.publish("Weather", Some("WeatherPlugin"), Payload::new()).unwrap();
    assert_eq!(report.invoked, 4);
    assert_eq!(report.failed, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(self_calls.load(Ordering::SeqCst), 1);

    bus.publish("Weather", Some("Other"), Payload::new()).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(self_calls.load(Ordering::SeqCst), 1);

    assert!(matches!(bus.publish("", None, Payload::new()), Err(Error::InvalidSignalName(_))));
}
