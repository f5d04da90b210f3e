//! Demonstrates audio device arbitration with a simulated engine.
//!
//! A playback and two recordings preempt the wake-word listener, which resumes
//! once the device is free and then hears the wake word. Signal traffic is
//! printed as it happens.

use std::sync::Arc;
use std::time::Duration;

use aria_host::{
    names, AudioConfig, AudioEngine, DetectionPoll, DetectionProcess, EventBus, ManagerConfig, Payload,
    PluginCatalog, PluginManager, Shutdown, Signal,
};

/// Engine that sleeps instead of touching hardware.
struct SimulatedEngine;

struct SimulatedDetector {
    lines: Vec<String>,
}

impl DetectionProcess for SimulatedDetector {
    fn poll_line(&mut self, timeout: Duration) -> aria_host::Result<DetectionPoll> {
        std::thread::sleep(timeout);
        Ok(match self.lines.pop() {
            Some(line) => DetectionPoll::Line(line),
            None => DetectionPoll::Idle,
        })
    }

    fn terminate(&mut self) {}
}

impl AudioEngine for SimulatedEngine {
    fn start_detection(&self) -> aria_host::Result<Box<dyn DetectionProcess>> {
        Ok(Box::new(SimulatedDetector {
            lines: vec!["000000001: aria".to_string(), "READY....".to_string()],
        }))
    }

    fn play(&self, file: &str, _cancel: &Shutdown) -> aria_host::Result<()> {
        println!("    [engine] playing {}", file);
        std::thread::sleep(Duration::from_millis(300));
        Ok(())
    }

    fn record(&self, file: &str, seconds: u32, _cancel: &Shutdown) -> aria_host::Result<()> {
        println!("    [engine] recording {} for {}s (simulated)", file, seconds);
        std::thread::sleep(Duration::from_millis(300));
        Ok(())
    }
}

fn main() -> aria_host::Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== Audio Arbitration Example ===\n");

    let audio = AudioConfig::default().with_poll_interval(Duration::from_millis(50));
    let catalog = PluginCatalog::builtin_with_engine(&audio, Arc::new(SimulatedEngine));

    let bus = EventBus::new();
    let shutdown = Shutdown::new();
    let manager = PluginManager::new(ManagerConfig::new(), catalog, bus.clone(), shutdown.clone());

    for signal in [
        names::HOT_WORD_DETECTION_ACTIVE,
        names::HOT_WORD_DETECTED,
        names::PLAYBACK_ACTIVE,
        names::RECORD_ACTIVE,
    ] {
        bus.subscribe_fn(signal, |s: &Signal| {
            println!("  <- {} {}", s.name, s.payload.to_json());
            Ok(())
        })?;
    }

    let report = manager.load_all(&manager.discover_builtin(&[], &[]));
    println!("Loaded: {:?}\n", report.active.iter().map(|h| h.name()).collect::<Vec<_>>());

    println!("=== Listening ===");
    bus.emit(names::WAIT_TO_HOT_WORD, Payload::new());
    std::thread::sleep(Duration::from_millis(20));

    println!("\n=== Playback preempts the listener, two recordings queue behind it ===");
    bus.emit(names::PLAY_FILE, Payload::new().with("filename", "welcome.wav"));
    for name in ["first.wav", "second.wav"] {
        bus.emit(
            names::RECORD_FILE,
            Payload::new().with("filename", name).with("record_time", 3i64),
        );
    }
    std::thread::sleep(Duration::from_millis(2000));

    println!("\n=== Shutdown ===");
    shutdown.request();
    manager.shutdown();
    println!("Stats: {:?}", manager.stats());
    println!("Bus: {:?}", bus.stats());

    Ok(())
}
