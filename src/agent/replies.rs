//! Pending request table for correlated replies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::protocol::ReplyMessage;

/// Requests waiting for a reply, keyed by correlation id.
#[derive(Default)]
pub struct PendingReplies {
    waiting: Mutex<HashMap<String, oneshot::Sender<ReplyMessage>>>,
}

impl PendingReplies {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn waiting(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<ReplyMessage>>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start waiting for the reply carrying `correlation_id`.
    pub fn register(self: &Arc<Self>, correlation_id: impl Into<String>) -> PendingReply {
        let correlation_id = correlation_id.into();
        let (tx, rx) = oneshot::channel();
        self.waiting().insert(correlation_id.clone(), tx);
        PendingReply {
            correlation_id,
            rx,
            table: Arc::clone(self),
        }
    }

    /// Hand a reply to its waiter. Returns false if nobody is waiting.
    pub fn resolve(&self, reply: ReplyMessage) -> bool {
        let Some(id) = reply.correlation_id.clone() else {
            tracing::warn!("Reply for task {} has no correlation id; dropped", reply.task_id);
            return false;
        };

        match self.waiting().remove(&id) {
            Some(tx) => tx.send(reply).is_ok(),
            None => {
                tracing::warn!("No pending request for reply {} (late or unknown); dropped", id);
                false
            }
        }
    }

    /// Fail every outstanding request. Returns how many were waiting.
    pub fn cancel_all(&self) -> usize {
        let mut waiting = self.waiting();
        let n = waiting.len();
        waiting.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.waiting().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One outstanding request. Dropping it withdraws the request.
pub struct PendingReply {
    correlation_id: String,
    rx: oneshot::Receiver<ReplyMessage>,
    table: Arc<PendingReplies>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Wait for the reply, at most `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<ReplyMessage> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::Cancelled(format!(
                "request {} cancelled before a reply arrived",
                self.correlation_id
            ))),
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.table.waiting().remove(&self.correlation_id);
    }
}
