//! Configuration loading.
//!
//! Settings are read once at process start, validated, and then handed to
//! every component as an immutable `Arc<Settings>`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Get the runtime home directory (~/.umt).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".umt"))
}

/// Get the default settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings.
///
/// An explicitly given path must exist. When no path is given the default
/// location is used, and a missing file yields the defaults.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let (path, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (get_settings_path()?, false),
    };

    if !path.exists() {
        if explicit {
            return Err(Error::Config(format!(
                "Settings file not found at {}",
                path.display()
            )));
        }
        tracing::debug!("No settings at {}, using defaults", path.display());
        return Ok(Settings::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let settings: Settings = serde_json::from_str(&content)?;
    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Check invariants the rest of the runtime relies on.
pub fn validate_settings(settings: &Settings) -> Result<()> {
    validate_name("agent.id", &settings.agent.id)?;
    validate_name("events.exchange", &settings.events.exchange)?;

    validate_name("events.routing_key", &settings.events.routing_key)?;
    if settings.replies.timeout_seconds == 0 {
        return Err(Error::Config("replies.timeout_seconds must be positive".to_string()));
    }
    if settings.transport.poll_interval_ms == 0 {
        return Err(Error::Config("transport.poll_interval_ms must be positive".to_string()));
    }
    Ok(())
}

/// Whether `value` is usable as a queue, exchange or routing-key name.
///
/// Names become directory names for the file transport, so only
/// `[A-Za-z0-9_.-]` is allowed and all-dot names are rejected.
pub(crate) fn is_valid_name(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        && !value.chars().all(|c| c == '.')
}

fn validate_name(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Config(format!("{} must not be empty", field)));
    }
    if !is_valid_name(value) {
        return Err(Error::Config(format!(
            "{} '{}' may only contain letters, digits, '_', '-' and '.'",
            field, value
        )));
    }
    Ok(())
}

/// Identity of the agent this process runs.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AgentSettings {
    #[serde(default = "default_agent_id")]
    pub id: String,
    pub name: Option<String>,
}

fn default_agent_id() -> String {
    "agent".to_string()
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            id: default_agent_id(),
            name: None,
        }
    }
}

impl AgentSettings {
    /// Human-readable name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Which broker implementation to connect to.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// In-process broker; only useful when every agent lives in one process.
    Memory,
    /// Directory-backed broker shared between processes on one host.
    #[default]
    File,
}

/// Transport configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TransportSettings {
    #[serde(default)]
    pub kind: TransportKind,
    /// Root directory for the file transport (defaults to ~/.umt/broker).
    pub path: Option<PathBuf>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    250
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            path: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl TransportSettings {
    /// Resolve the file transport root directory.
    pub fn resolve_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(p) => Ok(p.clone()),
            None => Ok(get_home_dir()?.join("broker")),
        }
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }
}

/// Broadcast event routing.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EventSettings {
    #[serde(default = "default_events_exchange")]
    pub exchange: String,
    #[serde(default = "default_routing_key")]
    pub routing_key: String,
}

fn default_events_exchange() -> String {
    "events".to_string()
}

fn default_routing_key() -> String {
    "broadcast".to_string()
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            exchange: default_events_exchange(),
            routing_key: default_routing_key(),
        }
    }
}

/// Request/reply behaviour.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ReplySettings {
    #[serde(default = "default_reply_timeout")]
    pub timeout_seconds: u64,
}

fn default_reply_timeout() -> u64 {
    30
}

impl Default for ReplySettings {
    fn default() -> Self {
        Self {
            timeout_seconds: default_reply_timeout(),
        }
    }
}

impl ReplySettings {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_seconds)
    }
}

/// Logging configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LoggingSettings {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    pub directory: Option<PathBuf>,
}

fn default_log_filter() -> String {
    "info,umt_agents=debug".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            directory: None,
        }
    }
}

/// Runtime settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub agent: AgentSettings,

    #[serde(default)]
    pub transport: TransportSettings,

    #[serde(default)]
    pub events: EventSettings,

    #[serde(default)]
    pub replies: ReplySettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Settings {
    /// Copy of these settings acting as a different agent.
    pub fn for_agent(&self, id: impl Into<String>, name: Option<String>) -> Self {
        let mut settings = self.clone();
        settings.agent = AgentSettings {
            id: id.into(),
            name,
        };
        settings
    }
}
