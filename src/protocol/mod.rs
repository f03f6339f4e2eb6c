//! Agent message protocol.
//!
//! - Task messages addressed to a single agent's input queue
//! - Event messages broadcast through the events exchange
//! - Replies published to a task's response queue, with correlation ids
//! - Handler results

pub mod envelope;
pub mod types;

pub use envelope::{EventMessage, Inbound, Payload, ReplyMessage, TaskMessage};
pub use types::{ResultStatus, SystemEvent, TaskResult};
