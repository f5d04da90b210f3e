//! Audio engines: the processes that actually touch the device.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

use crate::config::AudioConfig;
use crate::error::{Error, Result};
use crate::shutdown::Shutdown;

/// Result of one poll of a running detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionPoll {
    /// The detector printed a line.
    Line(String),
    /// Nothing new within the timeout.
    Idle,
    /// The detector exited or closed its output.
    Closed,
}

/// A running wake-word detector.
pub trait DetectionProcess: Send {
    /// Wait up to `timeout` for the next recognized line.
    fn poll_line(&mut self, timeout: Duration) -> Result<DetectionPoll>;

    /// Stop the detector. Must be safe to call more than once.
    fn terminate(&mut self);
}

/// Access to the audio device.
///
/// `play` and `record` block until the operation finishes or `cancel` is
/// tripped, whichever comes first.
pub trait AudioEngine: Send + Sync {
    /// Start a wake-word detector.
    fn start_detection(&self) -> Result<Box<dyn DetectionProcess>>;

    /// Play `file`.
    fn play(&self, file: &str, cancel: &Shutdown) -> Result<()>;

    /// Record `seconds` of audio into `file`.
    fn record(&self, file: &str, seconds: u32, cancel: &Shutdown) -> Result<()>;
}

/// Engine running external commands built from argv templates.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    detection: Vec<String>,
    playback: Vec<String>,
    record: Vec<String>,
    poll_interval: Duration,
}

impl CommandEngine {
    /// Build the engine from the audio configuration.
    ///
    /// `$dict$` and `$lang$` are resolved here, `$file$` and `$time$` per call.
    pub fn from_config(config: &AudioConfig) -> Self {
        let detection = render(
            &config.detection,
            &[("$dict$", config.dictionary.as_str()), ("$lang$", config.lang_model.as_str())],
        );
        Self {
            detection,
            playback: config.playback.clone(),
            record: config.record.clone(),
            poll_interval: config.poll_interval(),
        }
    }

    /// Run `argv` to completion, killing it if `cancel` trips first.
    fn run(&self, argv: &[String], cancel: &Shutdown) -> Result<()> {
        let mut cmd = command(argv)?;
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::engine(format!("cannot run {}: {}", argv[0], e)))?;

        loop {
            let polled = child
                .try_wait()
                .map_err(|e| Error::engine(format!("cannot poll {}: {}", argv[0], e)));
            match polled {
                Ok(Some(status)) if status.success() => return Ok(()),
                Ok(Some(status)) => return Err(Error::engine(format!("{} exited with {}", argv[0], status))),
                Ok(None) => {}
                Err(e) => {
                    stop_child(&mut child);
                    return Err(e);
                }
            }

            if cancel.wait_timeout(self.poll_interval) {
                tracing::debug!(program = %argv[0], pid = child.id(), "cancelled, stopping audio process");
                stop_child(&mut child);
                return Err(Error::engine(format!("{} cancelled by shutdown", argv[0])));
            }
        }
    }
}

impl AudioEngine for CommandEngine {
    fn start_detection(&self) -> Result<Box<dyn DetectionProcess>> {
        let mut cmd = command(&self.detection)?;
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::engine(format!("cannot start {}: {}", self.detection[0], e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::engine("detector has no stdout"))?;

        let (tx, rx) = mpsc::channel();
        let reader = std::thread::Builder::new()
            .name("audio-detect-reader".to_string())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    match line {
                        Ok(line) => {
                            if tx.send(line).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
        if let Err(e) = reader {
            stop_child(&mut child);
            return Err(e.into());
        }

        tracing::debug!(pid = child.id(), "detector started");
        Ok(Box::new(CommandDetection { child, lines: rx }))
    }

    fn play(&self, file: &str, cancel: &Shutdown) -> Result<()> {
        self.run(&render(&self.playback, &[("$file$", file)]), cancel)
    }

    fn record(&self, file: &str, seconds: u32, cancel: &Shutdown) -> Result<()> {
        // `arecord -d 0` records until killed.
        if seconds == 0 {
            return Err(Error::engine("record time must be at least one second"));
        }
        let seconds = seconds.to_string();
        self.run(&render(&self.record, &[("$file$", file), ("$time$", seconds.as_str())]), cancel)
    }
}

struct CommandDetection {
    child: Child,
    lines: Receiver<String>,
}

impl DetectionProcess for CommandDetection {
    fn poll_line(&mut self, timeout: Duration) -> Result<DetectionPoll> {
        match self.lines.recv_timeout(timeout) {
            Ok(line) => Ok(DetectionPoll::Line(line.replace('\r', ""))),
            Err(RecvTimeoutError::Timeout) => Ok(DetectionPoll::Idle),
            Err(RecvTimeoutError::Disconnected) => {
                if let Some(status) = self.child.try_wait()? {
                    tracing::debug!(%status, "detector exited");
                }
                Ok(DetectionPoll::Closed)
            }
        }
    }

    fn terminate(&mut self) {
        stop_child(&mut self.child);
    }
}

impl Drop for CommandDetection {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Kill `child` if it is still running, then reap it.
fn stop_child(child: &mut Child) {
    if let Ok(None) = child.try_wait() {
        if let Err(e) = child.kill() {
            tracing::warn!(pid = child.id(), error = %e, "failed to stop audio process");
        }
    }
    let _ = child.wait();
}

fn command(argv: &[String]) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::engine("empty command template"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

fn render(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|part| {
            vars.iter()
                .fold(part.clone(), |acc, (key, value)| acc.replace(key, value))
        })
        .collect()
}
