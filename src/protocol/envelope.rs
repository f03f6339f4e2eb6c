//! Task, event and reply messages exchanged between agents.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::types::{ResultStatus, TaskResult};
use crate::error::Error;

/// Free-form message data.
pub type Payload = Map<String, Value>;

/// A unit of work addressed to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: String,
    pub task_type: String,
    #[serde(default)]
    pub data: Payload,
    /// Queue the receiver publishes its reply to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_agent_id: Option<String>,
    /// Echoed back in the reply so the sender can match it to a request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl TaskMessage {
    /// Create a task with a fresh id.
    pub fn new(task_type: impl Into<String>, data: Payload) -> Self {
        Self {
            task_id: generate_id(),
            task_type: task_type.into(),
            data,
            response_queue: None,
            sender_agent_id: None,
            correlation_id: None,
        }
    }

    pub fn from_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.sender_agent_id = Some(agent_id.into());
        self
    }

    pub fn with_response_queue(mut self, queue: impl Into<String>) -> Self {
        self.response_queue = Some(queue.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Decode `data` into a typed payload.
    pub fn payload<P: DeserializeOwned>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_value(Value::Object(self.data.clone()))
    }
}

/// A broadcast notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub event_id: String,
    pub event_type: String,
    #[serde(default)]
    pub data: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_agent_id: Option<String>,
    /// RFC 3339 creation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl EventMessage {
    /// Create an event with a fresh id, stamped with the current time.
    pub fn new(event_type: impl Into<String>, data: Payload) -> Self {
        Self {
            event_id: generate_id(),
            event_type: event_type.into(),
            data,
            sender_agent_id: None,
            timestamp: Some(now_rfc3339()),
        }
    }

    pub fn from_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.sender_agent_id = Some(agent_id.into());
        self
    }
}

/// What a receiving agent publishes to a task's `response_queue`.
///
/// `status` is always `success` or `error`; the handler's own result fields
/// ride along in `fields`. When the handler used some other status it is kept
/// as `result_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyMessage {
    pub task_id: String,
    pub agent_id: String,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub fields: Payload,
}

const REPLY_KEYS: [&str; 4] = ["task_id", "agent_id", "status", "correlation_id"];

impl ReplyMessage {
    /// Build the reply for `task` from a handler result.
    pub fn for_task(task: &TaskMessage, agent_id: impl Into<String>, result: TaskResult) -> Self {
        let status = if result.is_error() {
            ResultStatus::Error
        } else {
            ResultStatus::Success
        };
        let original = result.status().map(str::to_string);

        let mut fields = result.into_map();
        fields.retain(|k, _| !REPLY_KEYS.contains(&k.as_str()));
        if let Some(original) = original {
            if original != status.as_str() {
                fields.insert("result_status".to_string(), Value::String(original));
            }
        }

        Self {
            task_id: task.task_id.clone(),
            agent_id: agent_id.into(),
            status,
            correlation_id: task.correlation_id.clone(),
            fields,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

/// A message body as received from a queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Task(TaskMessage),
    Event(EventMessage),
    Reply(ReplyMessage),
}

impl Inbound {
    /// Classify a raw body by the keys it carries.
    pub fn classify(body: Value) -> Result<Self, Error> {
        let obj = body
            .as_object()
            .ok_or_else(|| Error::Protocol("message body is not an object".to_string()))?;

        // Replies may echo handler fields such as task_type, so check them first.
        if obj.contains_key("task_id") && obj.contains_key("status") {
            Ok(Inbound::Reply(serde_json::from_value(body)?))
        } else if obj.contains_key("task_type") {
            Ok(Inbound::Task(serde_json::from_value(body)?))
        } else if obj.contains_key("event_type") {
            Ok(Inbound::Event(serde_json::from_value(body)?))
        } else {
            Err(Error::Protocol(
                "message has neither task_type nor event_type".to_string(),
            ))
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::Task(_) => "task",
            Inbound::Event(_) => "event",
            Inbound::Reply(_) => "reply",
        }
    }
}

pub(crate) fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
