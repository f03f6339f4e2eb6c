//! Handler traits and adapters.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::protocol::{EventMessage, TaskMessage, TaskResult};

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn failed(s: impl Into<String>) -> Self {
        HandlerError::Failed(s.into())
    }
}

pub type HandlerResult = std::result::Result<TaskResult, HandlerError>;

/// Something that handles messages of type `M`.
#[async_trait]
pub trait Handler<M>: Send + Sync {
    async fn handle(&self, message: M) -> HandlerResult;
}

pub type TaskHandler = Arc<dyn Handler<TaskMessage>>;
pub type EventHandler = Arc<dyn Handler<EventMessage>>;

/// Fallback for tasks nobody registered a handler for.
///
/// Every agent supplies one; it plays the part of the agent's generic
/// processing logic.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process_task(&self, task: TaskMessage) -> HandlerResult;
}

/// Processor that acknowledges any task without doing work.
#[derive(Debug, Clone, Default)]
pub struct GenericProcessor;

#[async_trait]
impl TaskProcessor for GenericProcessor {
    async fn process_task(&self, task: TaskMessage) -> HandlerResult {
        Ok(TaskResult::processed()
            .with("task_id", task.task_id)
            .with("task_type", task.task_type))
    }
}

/// Handler backed by an async closure.
pub struct FnHandler<F>(F);

#[async_trait]
impl<M, F, Fut> Handler<M> for FnHandler<F>
where
    M: Send + 'static,
    F: Fn(M) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, message: M) -> HandlerResult {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a task handler.
pub fn task_fn<F, Fut>(f: F) -> TaskHandler
where
    F: Fn(TaskMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Wrap an async closure as an event handler.
pub fn event_fn<F, Fut>(f: F) -> EventHandler
where
    F: Fn(EventMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Task handler that decodes `data` into `P` before calling the closure.
pub struct Typed<P, F> {
    f: F,
    _payload: PhantomData<fn() -> P>,
}

#[async_trait]
impl<P, F, Fut> Handler<TaskMessage> for Typed<P, F>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(P, TaskMessage) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, task: TaskMessage) -> HandlerResult {
        let payload: P = task.payload()?;
        (self.f)(payload, task).await
    }
}

/// Wrap an async closure taking a typed payload as a task handler.
pub fn typed_task<P, F, Fut>(f: F) -> TaskHandler
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(P, TaskMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(Typed {
        f,
        _payload: PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Payload;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Schedule {
        campaign_id: u64,
    }

    fn task(task_type: &str, data: serde_json::Value) -> TaskMessage {
        let data = data.as_object().cloned().unwrap_or_default();
        TaskMessage::new(task_type, data)
    }

    #[tokio::test]
    async fn test_task_fn() {
        let h = task_fn(|t: TaskMessage| async move { Ok(TaskResult::success().with("type", t.task_type)) });
        let result = h.handle(task("ping", json!({}))).await.unwrap();
        assert_eq!(result.get("type"), Some(&json!("ping")));
    }

    #[tokio::test]
    async fn test_typed_task_decodes_payload() {
        let h = typed_task(|s: Schedule, _t| async move {
            Ok(TaskResult::success().with("campaign_id", s.campaign_id))
        });
        let result = h.handle(task("schedule", json!({"campaign_id": 42}))).await.unwrap();
        assert_eq!(result.get("campaign_id"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn test_typed_task_rejects_bad_payload() {
        let h = typed_task(|s: Schedule, _t| async move {
            Ok(TaskResult::success().with("campaign_id", s.campaign_id))
        });
        let err = h.handle(task("schedule", json!({"campaign_id": "x"}))).await.unwrap_err();
        assert!(matches!(err, HandlerError::InvalidPayload(_)));
        assert!(err.to_string().starts_with("invalid payload"));
    }

    #[tokio::test]
    async fn test_generic_processor() {
        let t = TaskMessage::new("unknown", Payload::new());
        let id = t.task_id.clone();
        let result = GenericProcessor.process_task(t).await.unwrap();
        assert_eq!(result.status(), Some("processed"));
        assert_eq!(result.get("task_id"), Some(&json!(id)));
    }
}
