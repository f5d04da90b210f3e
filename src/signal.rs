//! Signals and their payloads.
//!
//! A [`Signal`] is a named event carrying a [`Payload`]: an ordered map of
//! argument names to dynamically typed [`Value`]s. Signals only live for the
//! duration of a single delivery pass on the [`EventBus`](crate::EventBus).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::{Error, Result};

/// Well-known signal names exchanged at the boundary of the host core.
pub mod names {
    /// Request to (re)start wake-word listening.
    pub const WAIT_TO_HOT_WORD: &str = "WaitToHotWord";
    /// Listening loop running/stopped (`status: bool`).
    pub const HOT_WORD_DETECTION_ACTIVE: &str = "HotWordDetectionActive";
    /// Wake word matched (`text: string`).
    pub const HOT_WORD_DETECTED: &str = "HotWordDetected";
    /// Playback request (`filename`, `delay?`, `callback?`).
    pub const PLAY_FILE: &str = "PlayFile";
    /// Record request (`filename`, `record_time?`, `delay?`, `callback?`).
    pub const RECORD_FILE: &str = "RecordFile";
    /// Playback state change (`status: bool`).
    pub const PLAYBACK_ACTIVE: &str = "PlaybackActive";
    /// Record state change (`status: bool`).
    pub const RECORD_ACTIVE: &str = "RecordActive";
    /// Triggers host shutdown.
    pub const EMERGENCY_SHUTDOWN: &str = "EmergencyShutdown";
    /// Spoken/displayed canned response (`response: string`).
    pub const SAY_RESPONSE: &str = "SayResponse";
}

/// Callable carried inside a payload, e.g. a completion callback for `PlayFile`.
#[derive(Clone)]
pub struct Callback(Arc<dyn Fn(&Payload) + Send + Sync>);

impl Callback {
    /// Wrap a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Invoke the callback.
    pub fn call(&self, payload: &Payload) {
        (self.0)(payload)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback(..)")
    }
}

impl PartialEq for Callback {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Dynamically typed payload value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// No value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// String.
    Str(String),
    /// List of values.
    List(Vec<Value>),
    /// Callable.
    Callback(Callback),
}

impl Value {
    /// Name of the variant, used in payload errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::List(_) => "list",
            Self::Callback(_) => "callback",
        }
    }

    /// Numeric view (ints widen to floats).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Callback> for Value {
    fn from(v: Callback) -> Self {
        Self::Callback(v)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(v) => serializer.serialize_bool(*v),
            Self::Int(v) => serializer.serialize_i64(*v),
            Self::Float(v) => serializer.serialize_f64(*v),
            Self::Str(v) => serializer.serialize_str(v),
            Self::List(v) => v.serialize(serializer),
            Self::Callback(_) => serializer.serialize_str("<callback>"),
        }
    }
}

/// Named arguments attached to a signal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    fields: BTreeMap<String, Value>,
}

impl Payload {
    /// Create an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field (builder style).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Insert or replace a field.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Raw field access.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// String field, if present and a string.
    pub fn str(&self, key: &str) -> Option<&str> {
        match self.fields.get(key) {
            Some(Value::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// Boolean field, if present and a bool.
    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.fields.get(key) {
            Some(Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Numeric field, if present and numeric.
    pub fn float(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(Value::as_f64)
    }

    /// Callback field, if present.
    pub fn callback(&self, key: &str) -> Option<&Callback> {
        match self.fields.get(key) {
            Some(Value::Callback(cb)) => Some(cb),
            _ => None,
        }
    }

    /// Required string field.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        match self.fields.get(key) {
            Some(Value::Str(s)) => Ok(s),
            Some(other) => Err(Error::invalid_payload(
                key,
                format!("expected string, got {}", other.type_name()),
            )),
            None => Err(Error::invalid_payload(key, "missing")),
        }
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if the payload carries no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate over fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Render as JSON for logging.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// A signal as seen by a handler.
#[derive(Debug, Clone)]
pub struct Signal {
    /// Signal name.
    pub name: String,
    /// Optional sender identity.
    pub sender: Option<String>,
    /// Signal arguments.
    pub payload: Payload,
}

impl Signal {
    /// Create a signal.
    pub fn new(name: impl Into<String>, sender: Option<String>, payload: Payload) -> Self {
        Self {
            name: name.into(),
            sender,
            payload,
        }
    }

    /// `status` field of state-change signals.
    pub fn status(&self) -> Option<bool> {
        self.payload.bool("status")
    }
}
