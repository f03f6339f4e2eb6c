//! Agent task/event runtime for the Ultimate Marketing Team platform.

pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod transport;

pub use agent::{Agent, AgentState, Dispatcher, HandlerError, TaskProcessor};
pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use error::{Error, Result};
pub use protocol::{EventMessage, ReplyMessage, TaskMessage, TaskResult};
pub use transport::{InMemoryBroker, Transport};
