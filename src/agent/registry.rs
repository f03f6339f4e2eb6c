//! Task and event handler registry.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::handler::{EventHandler, TaskHandler};

/// Handlers keyed by task type and by event type.
///
/// The two namespaces are independent. Registering a type again replaces
/// the previous handler. Lookup is an exact key match.
#[derive(Default)]
pub struct HandlerRegistry {
    tasks: RwLock<HashMap<String, TaskHandler>>,
    events: RwLock<HashMap<String, EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task handler. Returns true if one was replaced.
    pub fn register_task(&self, task_type: impl Into<String>, handler: TaskHandler) -> bool {
        let task_type = task_type.into();
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let replaced = tasks.insert(task_type.clone(), handler).is_some();
        if replaced {
            tracing::debug!("Replaced task handler for {}", task_type);
        }
        replaced
    }

    /// Register an event handler. Returns true if one was replaced.
    pub fn register_event(&self, event_type: impl Into<String>, handler: EventHandler) -> bool {
        let event_type = event_type.into();
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        let replaced = events.insert(event_type.clone(), handler).is_some();
        if replaced {
            tracing::debug!("Replaced event handler for {}", event_type);
        }
        replaced
    }

    pub fn task_handler(&self, task_type: &str) -> Option<TaskHandler> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_type)
            .cloned()
    }

    pub fn event_handler(&self, event_type: &str) -> Option<EventHandler> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .cloned()
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    /// Registered event types, sorted.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::handler::{event_fn, task_fn};
    use crate::protocol::{EventMessage, Payload, TaskMessage, TaskResult};

    #[tokio::test]
    async fn test_last_registration_wins() {
        let registry = HandlerRegistry::new();
        assert!(!registry.register_task("ping", task_fn(|_t: TaskMessage| async { Ok(TaskResult::new("first")) })));
        assert!(registry.register_task("ping", task_fn(|_t: TaskMessage| async { Ok(TaskResult::new("second")) })));

        let handler = registry.task_handler("ping").unwrap();
        let result = handler.handle(TaskMessage::new("ping", Payload::new())).await.unwrap();
        assert_eq!(result.status(), Some("second"));
        assert_eq!(registry.task_types(), vec!["ping".to_string()]);
    }

    #[test]
    fn test_namespaces_are_separate() {
        let registry = HandlerRegistry::new();
        registry.register_event("ping", event_fn(|_e: EventMessage| async { Ok(TaskResult::success()) }));

        assert!(registry.task_handler("ping").is_none());
        assert!(registry.event_handler("ping").is_some());
        assert_eq!(registry.event_types(), vec!["ping".to_string()]);
    }

    #[test]
    fn test_exact_match_only() {
        let registry = HandlerRegistry::new();
        registry.register_task("content.create", task_fn(|_t: TaskMessage| async { Ok(TaskResult::success()) }));

        assert!(registry.task_handler("content").is_none());
        assert!(registry.task_handler("content.create.draft").is_none());
        assert!(registry.task_handler("Content.Create").is_none());
        assert!(registry.task_handler("content.create").is_some());
    }
}
