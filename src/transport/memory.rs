//! In-process broker.
//!
//! Queues are unbounded channels; exchanges hold a list of (routing key,
//! queue) bindings. Every connection handed out by [`InMemoryBroker::connect`]
//! sees the same queues and exchanges.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use super::{DeliveryHandler, Transport};
use crate::error::{Error, Result};

struct QueueSlot {
    tx: mpsc::UnboundedSender<Value>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>>,
}

impl QueueSlot {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, QueueSlot>>,
    /// exchange name -> (routing key, queue name)
    exchanges: Mutex<HashMap<String, Vec<(String, String)>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared in-memory broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection to this broker.
    pub fn connect(&self) -> InMemoryTransport {
        let (epoch, _) = watch::channel(0);
        InMemoryTransport {
            broker: self.clone(),
            epoch,
        }
    }

    /// Number of messages waiting in a queue that nobody is consuming.
    ///
    /// Returns `None` for unknown queues, and for queues with an active
    /// consumer.
    pub fn pending(&self, queue: &str) -> Option<usize> {
        let rx = lock(&self.state.queues).get(queue)?.rx.clone();
        let guard = rx.try_lock().ok()?;
        Some(guard.len())
    }

    /// Take the next message from a queue without a consumer.
    pub fn try_take(&self, queue: &str) -> Option<Value> {
        let rx = lock(&self.state.queues).get(queue)?.rx.clone();
        let mut guard = rx.try_lock().ok()?;
        guard.try_recv().ok()
    }

    fn ensure_queue(&self, name: &str) -> mpsc::UnboundedSender<Value> {
        lock(&self.state.queues)
            .entry(name.to_string())
            .or_insert_with(QueueSlot::new)
            .tx
            .clone()
    }

    fn receiver(&self, name: &str) -> Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>> {
        lock(&self.state.queues)
            .entry(name.to_string())
            .or_insert_with(QueueSlot::new)
            .rx
            .clone()
    }

    fn send(&self, queue: &str, message: Value) -> Result<()> {
        self.ensure_queue(queue)
            .send(message)
            .map_err(|_| Error::transport(format!("queue {} is gone", queue)))
    }
}

/// One connection to an [`InMemoryBroker`].
pub struct InMemoryTransport {
    broker: InMemoryBroker,
    /// Bumped on close; consumers started under an older epoch exit.
    epoch: watch::Sender<u64>,
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn declare_queue(&self, name: &str) -> Result<()> {
        self.broker.ensure_queue(name);
        tracing::debug!("Declared queue {}", name);
        Ok(())
    }

    async fn declare_exchange(&self, name: &str) -> Result<()> {
        lock(&self.broker.state.exchanges)
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.broker.ensure_queue(queue);
        let mut exchanges = lock(&self.broker.state.exchanges);
        let bindings = exchanges
            .get_mut(exchange)
            .ok_or_else(|| Error::transport(format!("exchange {} not declared", exchange)))?;

        let binding = (routing_key.to_string(), queue.to_string());
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, handler: Arc<dyn DeliveryHandler>) -> Result<()> {
        let rx = self.broker.receiver(queue);
        let mut shutdown = self.epoch.subscribe();
        let queue = queue.to_string();

        tokio::spawn(async move {
            // One active consumer per queue; a second one waits its turn.
            let mut rx = tokio::select! {
                guard = rx.lock_owned() => guard,
                _ = shutdown.changed() => return,
            };
            tracing::debug!("Consumer attached to {}", queue);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    msg = rx.recv() => match msg {
                        Some(body) => handler.deliver(&queue, body).await,
                        None => break,
                    },
                }
            }
            tracing::debug!("Consumer detached from {}", queue);
        });

        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: &Value) -> Result<()> {
        let targets: Vec<String> = {
            let exchanges = lock(&self.broker.state.exchanges);
            let bindings = exchanges
                .get(exchange)
                .ok_or_else(|| Error::transport(format!("exchange {} not declared", exchange)))?;
            bindings
                .iter()
                .filter(|(key, _)| key == routing_key)
                .map(|(_, queue)| queue.clone())
                .collect()
        };

        if targets.is_empty() {
            tracing::debug!("No queues bound to {}/{}; message dropped", exchange, routing_key);
        }
        for queue in targets {
            self.broker.send(&queue, message.clone())?;
        }
        Ok(())
    }

    async fn publish_direct(&self, queue: &str, message: &Value) -> Result<()> {
        self.broker.send(queue, message.clone())
    }

    async fn close(&self) -> Result<()> {
        self.epoch.send_modify(|e| *e += 1);
        tracing::debug!("In-memory connection closed");
        Ok(())
    }
}
