//! The `AudioPlugin.AudioSubSystem` plugin.
//!
//! Consumes `WaitToHotWord`, `PlayFile` and `RecordFile`; produces
//! `HotWordDetectionActive`, `HotWordDetected`, `PlaybackActive` and
//! `RecordActive` through its [`AudioArbiter`].

use std::sync::Arc;
use std::time::Duration;

use super::arbiter::AudioArbiter;
use super::engine::{AudioEngine, CommandEngine};
use crate::config::AudioConfig;
use crate::error::{Error, Result};
use crate::plugin::{Plugin, PluginClass, PluginContext, PluginDescriptor};
use crate::signal::{names, Callback, Payload, Signal, Value};

/// Module name.
pub const MODULE: &str = "AudioPlugin";
/// Class name.
pub const CLASS: &str = "AudioSubSystem";
/// Module version.
pub const VERSION: &str = "1.0.0.0";

/// Descriptor for the audio module using external commands.
pub fn descriptor(config: &AudioConfig) -> PluginDescriptor {
    descriptor_with_engine(config, Arc::new(CommandEngine::from_config(config)))
}

/// Descriptor for the audio module driving `engine`.
pub fn descriptor_with_engine(config: &AudioConfig, engine: Arc<dyn AudioEngine>) -> PluginDescriptor {
    let config = config.clone();
    PluginDescriptor::new(MODULE, VERSION)
        .with_description("Audio sub-system")
        .with_class(PluginClass::new(CLASS, move |ctx: &PluginContext| {
            let plugin = AudioSubSystem::new(ctx, &config, engine.clone())?;
            Ok(Box::new(plugin) as Box<dyn Plugin>)
        }))
}

/// Bus front-end of the audio arbiter.
#[derive(Debug)]
pub struct AudioSubSystem {
    arbiter: AudioArbiter,
}

impl AudioSubSystem {
    /// Bind the audio signals and optionally start listening.
    pub fn new(ctx: &PluginContext, config: &AudioConfig, engine: Arc<dyn AudioEngine>) -> Result<Self> {
        let arbiter = AudioArbiter::new(engine, ctx, config);

        let audio = arbiter.clone();
        ctx.subscribe_fn(names::WAIT_TO_HOT_WORD, move |signal: &Signal| {
            audio.start_listening(delay(&signal.payload)?)?;
            Ok(())
        })?;

        let audio = arbiter.clone();
        ctx.subscribe_fn(names::PLAY_FILE, move |signal: &Signal| {
            let payload = &signal.payload;
            audio.play(payload.require_str("filename")?, delay(payload)?, callback(payload)?)?;
            Ok(())
        })?;

        let audio = arbiter.clone();
        ctx.subscribe_fn(names::RECORD_FILE, move |signal: &Signal| {
            let payload = &signal.payload;
            audio.record(
                payload.require_str("filename")?,
                record_time(payload)?,
                delay(payload)?,
                callback(payload)?,
            )?;
            Ok(())
        })?;

        if config.auto_start {
            arbiter.start_listening(Some(config.auto_start_delay()))?;
        }

        tracing::debug!(plugin = %ctx.name(), "audio sub-system ready");
        Ok(Self { arbiter })
    }

    /// The arbiter behind this plugin.
    pub fn arbiter(&self) -> &AudioArbiter {
        &self.arbiter
    }
}

impl Plugin for AudioSubSystem {
    fn on_teardown(&mut self) -> Result<()> {
        let mut problems = Vec::new();
        if self.arbiter.listener_running() {
            problems.push("recognition process still running");
        }
        if self.arbiter.is_busy() {
            problems.push("playback or record still holds the device");
        }
        if !problems.is_empty() {
            return Err(Error::engine(problems.join(", ")));
        }

        tracing::debug!("audio module released");
        Ok(())
    }
}

/// Optional `delay` in seconds.
fn delay(payload: &Payload) -> Result<Option<Duration>> {
    let Some(secs) = number(payload, "delay")? else {
        return Ok(None);
    };
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .map_err(|e| Error::invalid_payload("delay", e.to_string()))
}

/// Optional `record_time` in whole seconds.
fn record_time(payload: &Payload) -> Result<Option<u32>> {
    let Some(secs) = number(payload, "record_time")? else {
        return Ok(None);
    };
    if !secs.is_finite() || secs < 0.0 {
        return Err(Error::invalid_payload("record_time", format!("{} is not a duration", secs)));
    }
    Ok(Some(secs.min(f64::from(u32::MAX)) as u32))
}

fn number(payload: &Payload, key: &str) -> Result<Option<f64>> {
    match payload.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| Error::invalid_payload(key, format!("expected number, got {}", value.type_name()))),
    }
}

fn callback(payload: &Payload) -> Result<Option<Callback>> {
    match payload.get("callback") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Callback(cb)) => Ok(Some(cb.clone())),
        Some(other) => Err(Error::invalid_payload(
            "callback",
            format!("expected callback, got {}", other.type_name()),
        )),
    }
}
