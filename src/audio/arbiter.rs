//! Audio device arbitration.
//!
//! One physical device is shared by three activities: wake-word listening,
//! playback and recording. Playback and recording exclude each other and
//! always win over listening:
//!
//! ```text
//!            start_listening            play / record
//!   Idle ------------------> Listening ---------------> (busy) --> Playing | Recording
//!    ^                           ^                                      |
//!    |                           +---- listener resumes on release -----+
//!    +--------------------------------- release ------------------------+
//! ```
//!
//! A play or record request takes a ticket and sets `busy` once its ticket is
//! at the front of the queue and the device is not held by another play or
//! record. The listener notices `busy`, stops its detector, announces that it
//! stopped and waits; the request then proceeds. When the request finishes it
//! announces completion and clears `busy`, and the listener restarts on its own.
//! Tickets are served strictly in arrival order.
//!
//! A listen request that arrives while the listener is winding down (after a
//! wake word, or when its detector exits) is remembered and the same thread
//! starts listening again instead of exiting.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::engine::{AudioEngine, DetectionPoll, DetectionProcess};
use crate::bus::EventBus;
use crate::config::AudioConfig;
use crate::error::Result;
use crate::plugin::PluginContext;
use crate::shutdown::{Shutdown, WorkerSet};
use crate::signal::{names, Callback, Payload};

/// What currently owns the audio device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioActivity {
    /// Nothing.
    Idle,
    /// The wake-word detector.
    Listening,
    /// A playback.
    Playing,
    /// A recording.
    Recording,
}

impl std::fmt::Display for AudioActivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Playing => "playing",
            Self::Recording => "recording",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IoKind {
    Play,
    Record,
}

impl IoKind {
    fn activity(self) -> AudioActivity {
        match self {
            Self::Play => AudioActivity::Playing,
            Self::Record => AudioActivity::Recording,
        }
    }

    fn status_signal(self) -> &'static str {
        match self {
            Self::Play => names::PLAYBACK_ACTIVE,
            Self::Record => names::RECORD_ACTIVE,
        }
    }
}

#[derive(Debug)]
struct DeviceState {
    /// Held by a play or record request.
    busy: bool,
    /// Held by the detector.
    listening: bool,
    /// A listen loop thread exists, possibly paused.
    listener_running: bool,
    /// The listen loop decided to stop and is announcing it.
    listener_exiting: bool,
    /// Delay of a listen request received while the loop was exiting.
    pending_restart: Option<Duration>,
    activity: AudioActivity,
    next_ticket: u64,
    queue: VecDeque<u64>,
}

struct Shared {
    state: Mutex<DeviceState>,
    changed: Condvar,
    engine: Arc<dyn AudioEngine>,
    bus: EventBus,
    shutdown: Shutdown,
    workers: WorkerSet,
    sender: String,
    hot_words: Vec<String>,
    poll_interval: Duration,
    max_record_time: u32,
}

/// Serializes access to the audio device.
#[derive(Clone)]
pub struct AudioArbiter {
    shared: Arc<Shared>,
}

enum DetectOutcome {
    Preempted,
    Finished,
}

impl AudioArbiter {
    /// Create an arbiter publishing and spawning through `ctx`.
    pub fn new(engine: Arc<dyn AudioEngine>, ctx: &PluginContext, config: &AudioConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(DeviceState {
                    busy: false,
                    listening: false,
                    listener_running: false,
                    listener_exiting: false,
                    pending_restart: None,
                    activity: AudioActivity::Idle,
                    next_ticket: 0,
                    queue: VecDeque::new(),
                }),
                changed: Condvar::new(),
                engine,
                bus: ctx.bus().clone(),
                shutdown: ctx.shutdown().clone(),
                workers: ctx.workers().clone(),
                sender: ctx.name().to_string(),
                hot_words: config.hot_words.iter().filter(|w| !w.is_empty()).cloned().collect(),
                poll_interval: config.poll_interval(),
                max_record_time: config.max_record_time,
            }),
        }
    }

    /// Current owner of the device.
    pub fn activity(&self) -> AudioActivity {
        self.shared.state.lock().activity
    }

    /// Whether a play or record request holds the device.
    pub fn is_busy(&self) -> bool {
        self.shared.state.lock().busy
    }

    /// Whether the detector holds the device.
    pub fn is_listening(&self) -> bool {
        self.shared.state.lock().listening
    }

    /// Whether a listen loop exists, active or paused.
    pub fn listener_running(&self) -> bool {
        self.shared.state.lock().listener_running
    }

    /// Play and record requests waiting for the device.
    pub fn pending_requests(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Start the wake-word listener after an optional delay.
    ///
    /// Returns false if the request was ignored because an active listener
    /// already exists or the host is shutting down. A request made while the
    /// listener is exiting is queued and returns true.
    pub fn start_listening(&self, delay: Option<Duration>) -> Result<bool> {
        if self.shared.shutdown.is_requested() {
            tracing::warn!("shutdown requested, ignoring listen request");
            return Ok(false);
        }

        {
            let mut state = self.shared.state.lock();
            if state.listener_running {
                if state.listener_exiting {
                    tracing::debug!("hot word listener exiting, restart queued");
                    state.pending_restart = Some(delay.unwrap_or_default());
                    return Ok(true);
                }
                tracing::debug!("hot word listener already running");
                return Ok(false);
            }
            state.listener_running = true;
        }

        tracing::info!("starting hot word detection");
        let this = self.clone();
        if let Err(e) = self.shared.workers.spawn("hotword", move || this.listen(delay)) {
            self.shared.state.lock().listener_running = false;
            return Err(e);
        }
        Ok(true)
    }

    /// Play `filename` on a worker thread.
    ///
    /// `callback` is invoked once the device is released, with an empty payload
    /// on success and an `error` entry if the engine failed.
    pub fn play(&self, filename: &str, delay: Option<Duration>, callback: Option<Callback>) -> Result<bool> {
        if self.shared.shutdown.is_requested() {
            tracing::warn!(file = %filename, "shutdown requested, ignoring playback");
            return Ok(false);
        }

        tracing::info!(file = %filename, "starting playback");
        let this = self.clone();
        let filename = filename.to_string();
        self.shared
            .workers
            .spawn("playback", move || this.run_io(IoKind::Play, filename, 0, delay, callback))?;
        Ok(true)
    }

    /// Record into `filename` on a worker thread.
    ///
    /// `record_time` defaults to, and is capped at, the configured maximum.
    /// `callback` receives `filename` once the device is released, plus `error`
    /// if the engine failed. A zero record time is raised to one second.
    pub fn record(
        &self,
        filename: &str,
        record_time: Option<u32>,
        delay: Option<Duration>,
        callback: Option<Callback>,
    ) -> Result<bool> {
        if self.shared.shutdown.is_requested() {
            tracing::warn!(file = %filename, "shutdown requested, ignoring record");
            return Ok(false);
        }

        let max = self.shared.max_record_time;
        let seconds = match record_time {
            None => max,
            Some(t) if t > max => {
                tracing::warn!(requested = t, max, "record time too large, reducing");
                max
            }
            Some(t) => t,
        };
        if seconds == 0 {
            tracing::warn!(file = %filename, "record time of zero, using one second");
        }
        let seconds = seconds.max(1);

        tracing::info!(file = %filename, seconds, "starting record");
        let this = self.clone();
        let filename = filename.to_string();
        self.shared
            .workers
            .spawn("record", move || this.run_io(IoKind::Record, filename, seconds, delay, callback))?;
        Ok(true)
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.shared.state.lock()
    }

    fn publish_status(&self, signal: &str, status: bool) {
        self.publish(signal, Payload::new().with("status", status));
    }

    fn publish(&self, signal: &str, payload: Payload) {
        if let Err(e) = self.shared.bus.publish(signal, Some(&self.shared.sender), payload) {
            tracing::error!(signal, error = %e, "status publish rejected");
        }
    }

    /// Wait on the device condvar until `ready` holds.
    ///
    /// Returns false if shutdown was requested first.
    fn wait_until<F>(&self, state: &mut MutexGuard<'_, DeviceState>, mut ready: F) -> bool
    where
        F: FnMut(&DeviceState) -> bool,
    {
        loop {
            if self.shared.shutdown.is_requested() {
                return false;
            }
            if ready(&**state) {
                return true;
            }
            self.shared.changed.wait_for(state, self.shared.poll_interval);
        }
    }

    fn release_listening(&self) {
        let mut state = self.lock();
        state.listening = false;
        if state.activity == AudioActivity::Listening {
            state.activity = AudioActivity::Idle;
        }
        drop(state);
        self.shared.changed.notify_all();
    }

    fn listen(&self, mut delay: Option<Duration>) {
        let mut guard = ListenerGuard {
            arbiter: self.clone(),
            armed: true,
        };

        loop {
            if let Some(delay) = delay.take() {
                if self.shared.shutdown.wait_timeout(delay) {
                    return;
                }
            }

            self.run_detection();

            match self.restart_or_stop() {
                Some(next) => delay = Some(next),
                None => {
                    guard.armed = false;
                    return;
                }
            }
        }
    }

    /// Mark the loop as exiting so later listen requests are queued.
    fn mark_exiting(&self) {
        self.lock().listener_exiting = true;
    }

    /// Pick up a queued listen request, or retire the listener.
    ///
    /// Decided under the state lock so a request is either queued here or
    /// spawns a new listener, never lost in between.
    fn restart_or_stop(&self) -> Option<Duration> {
        let mut state = self.lock();
        state.listener_exiting = false;
        match state.pending_restart.take() {
            Some(delay) if !self.shared.shutdown.is_requested() => {
                tracing::info!("restarting hot word detection");
                Some(delay)
            }
            _ => {
                state.listener_running = false;
                drop(state);
                self.shared.changed.notify_all();
                tracing::debug!("hot word listener stopped");
                None
            }
        }
    }

    /// Listen until a wake word, detector exit or shutdown, yielding the
    /// device to play and record requests along the way.
    fn run_detection(&self) {
        loop {
            {
                let mut state = self.lock();
                if !self.wait_until(&mut state, |s| !s.busy && s.queue.is_empty()) {
                    return;
                }
                state.listening = true;
                state.activity = AudioActivity::Listening;
            }

            tracing::info!("starting recognize process");
            self.publish_status(names::HOT_WORD_DETECTION_ACTIVE, true);

            let detector = match self.shared.engine.start_detection() {
                Ok(detector) => detector,
                Err(e) => {
                    tracing::error!(error = %e, "failed to start hot word detection");
                    self.mark_exiting();
                    self.publish_status(names::HOT_WORD_DETECTION_ACTIVE, false);
                    self.release_listening();
                    return;
                }
            };

            match self.detect(detector) {
                DetectOutcome::Preempted => continue,
                DetectOutcome::Finished => return,
            }
        }
    }

    fn detect(&self, mut detector: Box<dyn DetectionProcess>) -> DetectOutcome {
        let outcome = loop {
            if self.shared.shutdown.is_requested() {
                tracing::debug!("shutdown requested, stopping recognition");
                break DetectOutcome::Finished;
            }
            if self.is_busy() {
                tracing::info!("device requested, stopping recognition process");
                break DetectOutcome::Preempted;
            }

            match detector.poll_line(self.shared.poll_interval) {
                Ok(DetectionPoll::Line(line)) => {
                    if let Some(word) = self.shared.hot_words.iter().find(|w| line.contains(w.as_str())) {
                        tracing::info!(word = %word, input = %line.trim(), "hot word detected");
                        detector.terminate();
                        self.mark_exiting();
                        let payload = Payload::new().with("text", word.as_str());
                        if let Err(e) = self.shared.bus.publish(names::HOT_WORD_DETECTED, Some(&self.shared.sender), payload) {
                            tracing::error!(error = %e, "hot word publish rejected");
                        }
                        break DetectOutcome::Finished;
                    }
                }
                Ok(DetectionPoll::Idle) => {}
                Ok(DetectionPoll::Closed) => {
                    tracing::warn!("recognition process exited");
                    break DetectOutcome::Finished;
                }
                Err(e) => {
                    tracing::error!(error = %e, "recognition process failed");
                    break DetectOutcome::Finished;
                }
            }
        };

        detector.terminate();
        if matches!(outcome, DetectOutcome::Finished) {
            self.mark_exiting();
        }
        self.publish_status(names::HOT_WORD_DETECTION_ACTIVE, false);
        self.release_listening();
        outcome
    }

    /// Take the device for `kind`, preempting the listener.
    fn acquire(&self, kind: IoKind) -> Option<DeviceLease> {
        let mut state = self.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(ticket);

        if state.busy || state.queue.front() != Some(&ticket) {
            tracing::warn!(activity = %kind.activity(), "device busy, waiting for it to be released");
        }
        let granted = self.wait_until(&mut state, |s| !s.busy && s.queue.front() == Some(&ticket));
        state.queue.retain(|t| *t != ticket);
        if !granted {
            drop(state);
            self.shared.changed.notify_all();
            return None;
        }
        state.busy = true;
        self.shared.changed.notify_all();

        if state.listening {
            tracing::info!("waiting for hot word detection to release the device");
        }
        if !self.wait_until(&mut state, |s| !s.listening) {
            state.busy = false;
            drop(state);
            self.shared.changed.notify_all();
            return None;
        }
        state.activity = kind.activity();

        Some(DeviceLease {
            arbiter: self.clone(),
            kind,
            error: None,
        })
    }

    fn run_io(&self, kind: IoKind, filename: String, seconds: u32, delay: Option<Duration>, callback: Option<Callback>) {
        if let Some(delay) = delay {
            if self.shared.shutdown.wait_timeout(delay) {
                return;
            }
        }

        let Some(mut lease) = self.acquire(kind) else {
            tracing::debug!(file = %filename, "shutdown while waiting for the device");
            return;
        };

        self.publish_status(kind.status_signal(), true);
        let result = match kind {
            IoKind::Play => self.shared.engine.play(&filename, &self.shared.shutdown),
            IoKind::Record => self.shared.engine.record(&filename, seconds, &self.shared.shutdown),
        };
        let error = result.err().map(|e| {
            tracing::error!(file = %filename, activity = %kind.activity(), error = %e, "audio operation failed");
            e.to_string()
        });
        lease.error = error.clone();
        drop(lease);

        if let Some(callback) = callback {
            if self.shared.shutdown.is_requested() {
                tracing::debug!(file = %filename, "shutdown requested, skipping callback");
                return;
            }
            let mut payload = match kind {
                IoKind::Play => Payload::new(),
                IoKind::Record => Payload::new().with("filename", filename),
            };
            if let Some(error) = error {
                payload.insert("error", error);
            }
            callback.call(&payload);
        }
    }
}

impl std::fmt::Debug for AudioArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("AudioArbiter")
            .field("activity", &state.activity)
            .field("busy", &state.busy)
            .field("listening", &state.listening)
            .field("pending", &state.queue.len())
            .finish()
    }
}

/// Exclusive use of the device by one play or record request.
///
/// Dropping it announces completion and frees the device, on every path.
/// The inactive status carries `error` when the engine failed.
struct DeviceLease {
    arbiter: AudioArbiter,
    kind: IoKind,
    error: Option<String>,
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let mut payload = Payload::new().with("status", false);
        if let Some(error) = self.error.take() {
            payload.insert("error", error);
        }
        self.arbiter.publish(self.kind.status_signal(), payload);
        let mut state = self.arbiter.lock();
        state.busy = false;
        state.activity = AudioActivity::Idle;
        drop(state);
        self.arbiter.shared.changed.notify_all();
    }
}

/// Retires the listener if its loop leaves without going through
/// `restart_or_stop` (shutdown during a delay, or a panic).
struct ListenerGuard {
    arbiter: AudioArbiter,
    armed: bool,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.arbiter.lock();
        state.listener_running = false;
        state.listener_exiting = false;
        state.pending_restart = None;
        state.listening = false;
        if state.activity == AudioActivity::Listening {
            state.activity = AudioActivity::Idle;
        }
        drop(state);
        self.arbiter.shared.changed.notify_all();
        tracing::debug!("hot word listener stopped");
    }
}
