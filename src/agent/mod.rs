//! Agent runtime.
//!
//! - Handler registry keyed by task type and event type
//! - Dispatcher with a generic fallback processor and built-in system events
//! - Lifecycle controller bound to a transport
//! - Correlated request/reply

pub mod dispatcher;
pub mod handler;
pub mod lifecycle;
pub mod registry;
pub mod replies;

pub use dispatcher::{Control, Dispatcher, EventOutcome};
pub use handler::{
    event_fn, task_fn, typed_task, EventHandler, GenericProcessor, Handler, HandlerError,
    HandlerResult, TaskHandler, TaskProcessor,
};
pub use lifecycle::{input_queue, reply_queue, Agent, AgentState};
pub use registry::HandlerRegistry;
pub use replies::{PendingReplies, PendingReply};
