//! Result and status types shared by handlers and the dispatcher.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known result statuses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// Handler completed the work
    Success,
    /// Handler failed; the result carries an `error` field
    Error,
    /// No handler wanted the message
    Ignored,
    /// Generic fallback processing ran
    Processed,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Success => "success",
            ResultStatus::Error => "error",
            ResultStatus::Ignored => "ignored",
            ResultStatus::Processed => "processed",
        }
    }
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of handling a task or event.
///
/// A result is an open mapping with a `status` key. Handlers are free to use
/// statuses beyond [`ResultStatus`]; the dispatcher hands their output back
/// unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskResult(Map<String, Value>);

impl TaskResult {
    /// Create a result with the given status.
    pub fn new(status: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("status".to_string(), Value::String(status.into()));
        Self(map)
    }

    pub fn success() -> Self {
        Self::new(ResultStatus::Success.as_str())
    }

    pub fn processed() -> Self {
        Self::new(ResultStatus::Processed.as_str())
    }

    /// Error result carrying the failure text.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ResultStatus::Error.as_str()).with("error", message.into())
    }

    /// Ignored result carrying the reason.
    pub fn ignored(reason: impl Into<String>) -> Self {
        Self::new(ResultStatus::Ignored.as_str()).with("reason", reason.into())
    }

    /// Set a field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// The `status` field, if present and a string.
    pub fn status(&self) -> Option<&str> {
        self.0.get("status").and_then(Value::as_str)
    }

    pub fn is_error(&self) -> bool {
        self.status() == Some(ResultStatus::Error.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl From<Map<String, Value>> for TaskResult {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for TaskResult {
    type Error = serde_json::Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        serde_json::from_value(value)
    }
}

/// Events every agent understands without registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEvent {
    Heartbeat,
    Shutdown,
}

impl SystemEvent {
    pub const HEARTBEAT: &'static str = "heartbeat";
    pub const SHUTDOWN: &'static str = "shutdown";

    pub fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            Self::HEARTBEAT => Some(SystemEvent::Heartbeat),
            Self::SHUTDOWN => Some(SystemEvent::Shutdown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SystemEvent::Heartbeat => Self::HEARTBEAT,
            SystemEvent::Shutdown => Self::SHUTDOWN,
        }
    }
}
