//! CLI commands using clap.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::{task_fn, Agent, GenericProcessor};
use crate::config::{load_settings, validate_settings, Settings, TransportKind};
use crate::protocol::{Payload, TaskMessage, TaskResult};
use crate::transport::{self, FileTransport};

/// Marketing-team agent runtime.
#[derive(Parser)]
#[command(name = "umt-agent")]
#[command(version)]
#[command(about = "Run a marketing-team agent or send it work", long_about = None)]
pub struct Commands {
    /// Settings file (defaults to ~/.umt/settings.json)
    #[arg(long, global = true, env = "UMT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Agent id, overriding the settings file
    #[arg(long, global = true, env = "UMT_AGENT_ID")]
    pub agent_id: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the agent until Ctrl-C or a shutdown event
    Run {
        /// Display name
        #[arg(long)]
        name: Option<String>,
    },

    /// Send a task to an agent
    Send {
        /// Target agent id
        target: String,

        /// Task type
        task_type: String,

        /// Task data as a JSON object
        #[arg(long, default_value = "{}")]
        data: String,

        /// Wait for the reply
        #[arg(long)]
        wait: bool,

        /// Reply timeout in seconds (defaults to replies.timeout_seconds)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Broadcast an event to all agents
    Broadcast {
        /// Event type (e.g. heartbeat, shutdown)
        event_type: String,

        /// Event data as a JSON object
        #[arg(long, default_value = "{}")]
        data: String,
    },

    /// Inspect file transport queues
    #[command(subcommand)]
    Queue(QueueCommand),

    /// Print the effective settings
    Config,
}

#[derive(Subcommand)]
pub enum QueueCommand {
    /// Count messages waiting in an agent's input queue
    Stats {
        /// Agent id (defaults to this agent)
        agent: Option<String>,
    },

    /// Move orphaned in-flight messages back to incoming (agent must be down)
    Recover {
        /// Agent id (defaults to this agent)
        agent: Option<String>,
    },
}

impl Commands {
    /// Run the command.
    pub async fn run(&self) -> Result<()> {
        let mut settings = load_settings(self.config.as_deref())?;
        if let Some(id) = &self.agent_id {
            settings = settings.for_agent(id.clone(), settings.agent.name.clone());
        }
        if let Command::Run { name: Some(name) } = &self.command {
            settings.agent.name = Some(name.clone());
        }
        validate_settings(&settings)?;

        let (_guard, _log_dir) = crate::logging::init(&settings.logging)?;
        let settings = Arc::new(settings);

        match &self.command {
            Command::Run { .. } => cmd_run(settings).await,
            Command::Send {
                target,
                task_type,
                data,
                wait,
                timeout,
            } => cmd_send(settings, target, task_type, data, *wait, *timeout).await,
            Command::Broadcast { event_type, data } => {
                cmd_broadcast(settings, event_type, data).await
            }
            Command::Queue(action) => cmd_queue(&settings, action),
            Command::Config => {
                println!("{}", serde_json::to_string_pretty(settings.as_ref())?);
                Ok(())
            }
        }
    }
}

/// Parse `--data` into a JSON object.
fn parse_data(raw: &str) -> Result<Payload> {
    let value: Value = serde_json::from_str(raw).context("--data is not valid JSON")?;
    match value {
        Value::Object(map) => Ok(map),
        _ => bail!("--data must be a JSON object"),
    }
}

/// Settings for a short-lived CLI identity that will not collide with a
/// running agent's queues.
fn cli_settings(settings: &Settings) -> Arc<Settings> {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let id = format!("{}-cli-{}", settings.agent.id, &suffix[..8]);
    Arc::new(settings.for_agent(id, Some("cli".to_string())))
}

async fn cmd_run(settings: Arc<Settings>) -> Result<()> {
    let transport = transport::connect(&settings.transport)?;
    let agent = Agent::new(settings, transport, Arc::new(GenericProcessor));

    let agent_id = agent.id().to_string();
    agent.register_task_handler(
        "ping",
        task_fn(move |_task: TaskMessage| {
            let agent_id = agent_id.clone();
            async move { Ok(TaskResult::new("pong").with("agent_id", agent_id)) }
        }),
    );

    agent.start().await?;
    println!("Agent {} running; listening on {}", agent.id(), agent.input_queue());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            agent.stop().await?;
        }
        _ = agent.wait_stopped() => {
            tracing::info!("Agent stopped by shutdown event");
        }
    }

    Ok(())
}

async fn cmd_send(
    settings: Arc<Settings>,
    target: &str,
    task_type: &str,
    data: &str,
    wait: bool,
    timeout: Option<u64>,
) -> Result<()> {
    let data = parse_data(data)?;
    let settings = cli_settings(&settings);
    let transport = transport::connect(&settings.transport)?;
    let agent = Agent::new(settings, transport, Arc::new(GenericProcessor));

    if !wait {
        let task_id = agent.send_task(target, task_type, data, None).await?;
        println!("Sent task {} to {}", task_id, target);
        return Ok(());
    }

    agent.start_client().await?;
    let reply = agent
        .request(target, task_type, data, timeout.map(Duration::from_secs))
        .await;
    agent.stop().await?;

    let reply = reply?;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    if !reply.is_success() {
        bail!("task {} failed on {}", reply.task_id, reply.agent_id);
    }
    Ok(())
}

async fn cmd_broadcast(settings: Arc<Settings>, event_type: &str, data: &str) -> Result<()> {
    let data = parse_data(data)?;
    let settings = cli_settings(&settings);
    let transport = transport::connect(&settings.transport)?;
    let agent = Agent::new(settings, transport, Arc::new(GenericProcessor));

    let event_id = agent.broadcast_event(event_type, data).await?;
    println!("Broadcast {} ({})", event_type, event_id);
    Ok(())
}

fn cmd_queue(settings: &Settings, action: &QueueCommand) -> Result<()> {
    if settings.transport.kind != TransportKind::File {
        bail!("queue commands need the file transport");
    }
    let transport = FileTransport::new(
        settings.transport.resolve_path()?,
        settings.transport.poll_interval(),
    );
    let queue_for = |agent: &Option<String>| {
        crate::agent::input_queue(agent.as_deref().unwrap_or(&settings.agent.id))
    };

    match action {
        QueueCommand::Stats { agent } => {
            let queue = queue_for(agent);
            println!("{}: {} pending", queue, transport.pending(&queue)?);
        }
        QueueCommand::Recover { agent } => {
            let queue = queue_for(agent);
            let recovered = transport.recover_orphaned(&queue)?;
            println!("Recovered {} orphaned messages in {}", recovered, queue);
        }
    }

    Ok(())
}
