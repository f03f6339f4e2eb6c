//! Routes tasks and events to their handlers and normalizes the results.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use super::handler::{HandlerError, HandlerResult, TaskProcessor};
use super::registry::HandlerRegistry;
use crate::protocol::envelope::now_rfc3339;
use crate::protocol::{EventMessage, SystemEvent, TaskMessage, TaskResult};

/// Lifecycle request raised while handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Stop,
}

/// Result of dispatching an event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventOutcome {
    pub result: TaskResult,
    pub control: Option<Control>,
}

impl EventOutcome {
    fn plain(result: TaskResult) -> Self {
        Self {
            result,
            control: None,
        }
    }
}

/// Registry plus fallback processor for one agent.
pub struct Dispatcher {
    agent_id: String,
    name: String,
    registry: HandlerRegistry,
    processor: Arc<dyn TaskProcessor>,
}

impl Dispatcher {
    pub fn new(
        agent_id: impl Into<String>,
        name: impl Into<String>,
        processor: Arc<dyn TaskProcessor>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            registry: HandlerRegistry::new(),
            processor,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Handle a task. Never fails: handler errors and panics become
    /// `{status: "error", error: ...}` results.
    pub async fn handle_task(&self, task: &TaskMessage) -> TaskResult {
        let owned = task.clone();
        let outcome = match self.registry.task_handler(&task.task_type) {
            Some(handler) => {
                tracing::debug!(agent = %self.agent_id, task_id = %task.task_id, "Handling task {}", task.task_type);
                isolate(async move { handler.handle(owned).await }).await
            }
            None => {
                tracing::debug!(
                    agent = %self.agent_id,
                    task_id = %task.task_id,
                    "No handler for task type {}, using generic processing",
                    task.task_type
                );
                let processor = self.processor.clone();
                isolate(async move { processor.process_task(owned).await }).await
            }
        };

        match outcome {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(
                    agent = %self.agent_id,
                    task_id = %task.task_id,
                    "Task {} failed: {}",
                    task.task_type,
                    e
                );
                TaskResult::error(e.to_string())
            }
        }
    }

    /// Handle an event.
    ///
    /// Registered handlers come first, then the built-in system events, and
    /// anything else is ignored.
    pub async fn handle_event(&self, event: &EventMessage) -> EventOutcome {
        if let Some(handler) = self.registry.event_handler(&event.event_type) {
            tracing::debug!(agent = %self.agent_id, event_id = %event.event_id, "Handling event {}", event.event_type);
            let owned = event.clone();
            return match isolate(async move { handler.handle(owned).await }).await {
                Ok(result) => EventOutcome::plain(result),
                Err(e) => {
                    tracing::error!(agent = %self.agent_id, "Event {} failed: {}", event.event_type, e);
                    EventOutcome::plain(TaskResult::error(e.to_string()))
                }
            };
        }

        match SystemEvent::from_event_type(&event.event_type) {
            Some(SystemEvent::Heartbeat) => EventOutcome::plain(self.heartbeat(event)),
            Some(SystemEvent::Shutdown) => {
                tracing::info!(agent = %self.agent_id, "Shutdown requested by {:?}", event.sender_agent_id);
                EventOutcome {
                    result: TaskResult::new("shutdown")
                        .with("agent_id", self.agent_id.clone())
                        .with("message", format!("Agent {} shutting down", self.agent_id)),
                    control: Some(Control::Stop),
                }
            }
            None => {
                tracing::debug!(agent = %self.agent_id, "Ignoring event {}", event.event_type);
                EventOutcome::plain(TaskResult::ignored(format!(
                    "No handler for event type {}",
                    event.event_type
                )))
            }
        }
    }

    fn heartbeat(&self, event: &EventMessage) -> TaskResult {
        let now = now_rfc3339();
        TaskResult::new("alive")
            .with("agent_id", self.agent_id.clone())
            .with("name", self.name.clone())
            .with("timestamp", event.timestamp.clone().unwrap_or_else(|| now.clone()))
            .with("responded_at", now)
    }
}

/// Run a handler future on its own task so a panic is contained.
async fn isolate<F>(fut: F) -> HandlerResult
where
    F: Future<Output = HandlerResult> + Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(HandlerError::Panicked(panic_message(e.into_panic()))),
        Err(e) => Err(HandlerError::failed(format!("handler task failed: {}", e))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
