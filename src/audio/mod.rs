//! Audio sub-system: device arbitration and the plugin exposing it on the bus.

mod arbiter;
mod engine;
mod plugin;

pub use arbiter::{AudioActivity, AudioArbiter};
pub use engine::{AudioEngine, CommandEngine, DetectionPoll, DetectionProcess};
pub use plugin::{descriptor, descriptor_with_engine, AudioSubSystem, CLASS, MODULE, VERSION};
