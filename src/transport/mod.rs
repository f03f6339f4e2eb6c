//! Message transport abstraction.
//!
//! A transport is one agent's connection to a broker offering named queues
//! (point-to-point) and named exchanges (fan-out by routing key). Message
//! bodies are JSON values; how they travel is up to the implementation.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::config::{TransportKind, TransportSettings};
use crate::error::Result;

pub mod file;
pub mod memory;

pub use file::FileTransport;
pub use memory::{InMemoryBroker, InMemoryTransport};

/// Callback invoked for each message delivered from a consumed queue.
///
/// Deliveries on one queue are sequential: the next message is not handed
/// over until `deliver` returns.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn deliver(&self, queue: &str, body: Value);
}

/// Broker connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Create a queue if it does not exist.
    async fn declare_queue(&self, name: &str) -> Result<()>;

    /// Create an exchange if it does not exist.
    async fn declare_exchange(&self, name: &str) -> Result<()>;

    /// Route messages published to `exchange` with `routing_key` into `queue`.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Start delivering messages from `queue` to `handler` in the background.
    async fn consume(&self, queue: &str, handler: Arc<dyn DeliveryHandler>) -> Result<()>;

    /// Publish through an exchange.
    async fn publish(&self, exchange: &str, routing_key: &str, message: &Value) -> Result<()>;

    /// Publish straight into a named queue.
    async fn publish_direct(&self, queue: &str, message: &Value) -> Result<()>;

    /// Stop all consumers started on this connection.
    ///
    /// Messages already being delivered finish; queued messages stay put.
    /// The connection may be used again afterwards.
    async fn close(&self) -> Result<()>;
}

/// Transport factory.
pub fn connect(settings: &TransportSettings) -> Result<Arc<dyn Transport>> {
    match settings.kind {
        TransportKind::Memory => {
            tracing::warn!("Using in-memory transport; messages will not leave this process");
            Ok(Arc::new(InMemoryBroker::new().connect()))
        }
        TransportKind::File => {
            let root = settings.resolve_path()?;
            Ok(Arc::new(FileTransport::new(root, settings.poll_interval())))
        }
    }
}
