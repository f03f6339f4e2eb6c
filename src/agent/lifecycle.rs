//! Agent lifecycle: binds the dispatcher to the transport.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{watch, Mutex};

use super::dispatcher::{Control, Dispatcher};
use super::handler::{EventHandler, TaskHandler, TaskProcessor};
use super::replies::PendingReplies;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::protocol::envelope::generate_id;
use crate::protocol::{EventMessage, Inbound, Payload, ReplyMessage, TaskMessage, TaskResult};
use crate::transport::{DeliveryHandler, Transport};

/// Agent run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Stopped,
    Running,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Stopped => write!(f, "stopped"),
            AgentState::Running => write!(f, "running"),
        }
    }
}

/// Input queue name for an agent.
pub fn input_queue(agent_id: &str) -> String {
    format!("{}_queue", agent_id)
}

/// Reply queue name for an agent.
pub fn reply_queue(agent_id: &str) -> String {
    format!("{}_replies", agent_id)
}

struct AgentInner {
    settings: Arc<Settings>,
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    pending: Arc<PendingReplies>,
    state: watch::Sender<AgentState>,
    /// Serializes start/stop transitions.
    transition: Mutex<()>,
}

/// An agent: a dispatcher, a transport connection and a run state.
///
/// Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    pub fn new(
        settings: Arc<Settings>,
        transport: Arc<dyn Transport>,
        processor: Arc<dyn TaskProcessor>,
    ) -> Self {
        let dispatcher = Dispatcher::new(
            settings.agent.id.clone(),
            settings.agent.display_name(),
            processor,
        );
        let (state, _) = watch::channel(AgentState::Stopped);

        Self {
            inner: Arc::new(AgentInner {
                settings,
                transport,
                dispatcher,
                pending: PendingReplies::new(),
                state,
                transition: Mutex::new(()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        self.inner.dispatcher.agent_id()
    }

    pub fn name(&self) -> &str {
        self.inner.dispatcher.name()
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn input_queue(&self) -> String {
        input_queue(self.id())
    }

    pub fn reply_queue(&self) -> String {
        reply_queue(self.id())
    }

    pub fn state(&self) -> AgentState {
        *self.inner.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == AgentState::Running
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn register_task_handler(&self, task_type: impl Into<String>, handler: TaskHandler) {
        self.inner.dispatcher.registry().register_task(task_type, handler);
    }

    pub fn register_event_handler(&self, event_type: impl Into<String>, handler: EventHandler) {
        self.inner.dispatcher.registry().register_event(event_type, handler);
    }

    /// Start consuming. Does nothing if already running.
    pub async fn start(&self) -> Result<()> {
        self.start_with(true).await
    }

    /// Start consuming replies only.
    ///
    /// For short-lived callers that send requests but never take tasks or
    /// events: the input queue is neither declared nor bound to the events
    /// exchange, so nothing accumulates for this identity once it is gone.
    pub async fn start_client(&self) -> Result<()> {
        self.start_with(false).await
    }

    async fn start_with(&self, take_input: bool) -> Result<()> {
        let _guard = self.inner.transition.lock().await;
        if self.is_running() {
            tracing::info!("Agent {} already running; start skipped", self.id());
            return Ok(());
        }

        let transport = &self.inner.transport;
        let events = &self.inner.settings.events;
        let input = self.input_queue();
        let replies = self.reply_queue();

        if take_input {
            transport.declare_queue(&input).await?;
            transport.declare_exchange(&events.exchange).await?;
            transport
                .bind_queue(&input, &events.exchange, &events.routing_key)
                .await?;
        }
        transport.declare_queue(&replies).await?;

        let consumer: Arc<dyn DeliveryHandler> = Arc::new(AgentConsumer {
            agent: Arc::downgrade(&self.inner),
        });
        if take_input {
            transport.consume(&input, consumer.clone()).await?;
        }
        if let Err(e) = transport.consume(&replies, consumer).await {
            transport.close().await.ok();
            return Err(e);
        }

        self.inner.state.send_replace(AgentState::Running);
        tracing::info!(
            "Agent {} ({}) started; listening on {}",
            self.id(),
            self.name(),
            if take_input { input } else { replies }
        );
        Ok(())
    }

    /// Stop consuming and close the transport. Does nothing if stopped.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.inner.transition.lock().await;
        if !self.is_running() {
            tracing::debug!("Agent {} not running; stop skipped", self.id());
            return Ok(());
        }

        self.inner.transport.close().await?;
        let cancelled = self.inner.pending.cancel_all();
        if cancelled > 0 {
            tracing::warn!("Agent {} cancelled {} pending requests", self.id(), cancelled);
        }

        self.inner.state.send_replace(AgentState::Stopped);
        tracing::info!("Agent {} stopped", self.id());
        Ok(())
    }

    /// Resolve once the agent is stopped.
    pub async fn wait_stopped(&self) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives in `inner`, which we hold, so this cannot fail.
        let _ = rx.wait_for(|s| *s == AgentState::Stopped).await;
    }

    /// Handle a task and, if it names a response queue, publish the reply.
    ///
    /// Always returns a result. A failed reply publish is logged and not
    /// retried.
    pub async fn handle_task(&self, task: &TaskMessage) -> TaskResult {
        let result = self.inner.dispatcher.handle_task(task).await;

        if let Some(queue) = &task.response_queue {
            let reply = ReplyMessage::for_task(task, self.id(), result.clone());
            let published = match serde_json::to_value(&reply) {
                Ok(body) => self.inner.transport.publish_direct(queue, &body).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = published {
                tracing::error!(
                    "Failed to publish reply for task {} to {}: {}",
                    task.task_id,
                    queue,
                    e
                );
            }
        }

        result
    }

    /// Handle an event, running any lifecycle transition it asks for.
    pub async fn handle_event(&self, event: &EventMessage) -> TaskResult {
        let outcome = self.inner.dispatcher.handle_event(event).await;

        if let Some(Control::Stop) = outcome.control {
            if let Err(e) = self.stop().await {
                tracing::error!("Agent {} failed to stop: {}", self.id(), e);
                return TaskResult::error(e.to_string());
            }
        }

        outcome.result
    }

    /// Send a task to another agent's input queue. Returns the task id.
    pub async fn send_task(
        &self,
        target_agent_id: &str,
        task_type: &str,
        data: Payload,
        response_queue: Option<String>,
    ) -> Result<String> {
        let mut task = TaskMessage::new(task_type, data).from_agent(self.id());
        task.response_queue = response_queue;
        self.publish_task(target_agent_id, &task).await?;
        Ok(task.task_id)
    }

    /// Broadcast an event to every agent bound to the events exchange.
    /// Returns the event id.
    pub async fn broadcast_event(&self, event_type: &str, data: Payload) -> Result<String> {
        let events = &self.inner.settings.events;
        let event = EventMessage::new(event_type, data).from_agent(self.id());

        self.inner.transport.declare_exchange(&events.exchange).await?;
        self.inner
            .transport
            .publish(&events.exchange, &events.routing_key, &serde_json::to_value(&event)?)
            .await?;

        tracing::debug!("Broadcast event {} ({})", event.event_type, event.event_id);
        Ok(event.event_id)
    }

    /// Send a task and wait for its reply.
    ///
    /// The reply comes back on this agent's reply queue, so the agent must be
    /// running (a client start is enough). Waits at most `timeout` (default from settings); dropping the
    /// returned future withdraws the request.
    pub async fn request(
        &self,
        target_agent_id: &str,
        task_type: &str,
        data: Payload,
        timeout: Option<Duration>,
    ) -> Result<ReplyMessage> {
        if !self.is_running() {
            return Err(Error::Other(format!(
                "agent {} must be running to receive replies",
                self.id()
            )));
        }

        let correlation_id = generate_id();
        let pending = self.inner.pending.register(correlation_id.clone());

        let task = TaskMessage::new(task_type, data)
            .from_agent(self.id())
            .with_response_queue(self.reply_queue())
            .with_correlation_id(correlation_id);
        self.publish_task(target_agent_id, &task).await?;

        let timeout = timeout.unwrap_or_else(|| self.inner.settings.replies.timeout());
        tracing::debug!(
            "Waiting up to {:?} for reply {} from {}",
            timeout,
            pending.correlation_id(),
            target_agent_id
        );
        pending.wait(timeout).await
    }

    async fn publish_task(&self, target_agent_id: &str, task: &TaskMessage) -> Result<()> {
        let queue = input_queue(target_agent_id);
        self.inner
            .transport
            .publish_direct(&queue, &serde_json::to_value(task)?)
            .await?;
        tracing::debug!("Sent task {} ({}) to {}", task.task_type, task.task_id, queue);
        Ok(())
    }

    /// Route one raw message from a consumed queue.
    async fn dispatch(&self, queue: &str, body: Value) {
        match Inbound::classify(body) {
            Ok(Inbound::Task(task)) => {
                let result = self.handle_task(&task).await;
                tracing::debug!(
                    "Task {} finished with status {}",
                    task.task_id,
                    result.status().unwrap_or("<none>")
                );
            }
            Ok(Inbound::Event(event)) => {
                self.handle_event(&event).await;
            }
            Ok(Inbound::Reply(reply)) => {
                self.inner.pending.resolve(reply);
            }
            Err(e) => {
                tracing::warn!("Dropping malformed message on {}: {}", queue, e);
            }
        }
    }
}

/// Consume callback. Holds the agent weakly so the transport does not keep
/// it alive.
struct AgentConsumer {
    agent: Weak<AgentInner>,
}

#[async_trait]
impl DeliveryHandler for AgentConsumer {
    async fn deliver(&self, queue: &str, body: Value) {
        let Some(inner) = self.agent.upgrade() else {
            tracing::debug!("Agent dropped; discarding message on {}", queue);
            return;
        };
        Agent { inner }.dispatch(queue, body).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::handler::{task_fn, GenericProcessor, HandlerError};
    use crate::protocol::ResultStatus;
    use crate::transport::testing::{Call, RecordingTransport};
    use crate::transport::{FileTransport, InMemoryBroker, InMemoryTransport};
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(id: &str) -> Arc<Settings> {
        Arc::new(Settings::default().for_agent(id, None))
    }

    fn recording_agent(id: &str) -> (Agent, Arc<RecordingTransport>, InMemoryBroker) {
        crate::logging::init_test();
        let broker = InMemoryBroker::new();
        let transport = Arc::new(RecordingTransport::new(broker.connect()));
        let agent = Agent::new(settings(id), transport.clone(), Arc::new(GenericProcessor));
        (agent, transport, broker)
    }

    fn agent_on(broker: &InMemoryBroker, id: &str) -> Agent {
        crate::logging::init_test();
        let transport: Arc<InMemoryTransport> = Arc::new(broker.connect());
        Agent::new(settings(id), transport, Arc::new(GenericProcessor))
    }

    fn file_transport(root: &Path) -> FileTransport {
        FileTransport::new(root, Duration::from_millis(10))
    }

    /// An agent with its own connection to a directory broker at `root`.
    fn file_agent(root: &Path, id: &str) -> Agent {
        crate::logging::init_test();
        Agent::new(settings(id), Arc::new(file_transport(root)), Arc::new(GenericProcessor))
    }

    fn data(v: Value) -> Payload {
        v.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_ping_without_response_queue_publishes_nothing() {
        let (agent, transport, _broker) = recording_agent("b");
        agent.register_task_handler("ping", task_fn(|_t: TaskMessage| async { Ok(TaskResult::new("pong")) }));

        let task: TaskMessage =
            serde_json::from_value(json!({"task_id": "1", "task_type": "ping", "data": {}})).unwrap();
        let result = agent.handle_task(&task).await;

        assert_eq!(result.to_value(), json!({"status": "pong"}));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reply_published_to_response_queue() {
        let (agent, _transport, broker) = recording_agent("b");
        agent.register_task_handler(
            "fail",
            task_fn(|_t: TaskMessage| async { Err(HandlerError::failed("ValueError: X")) }),
        );

        let task = TaskMessage::new("fail", Payload::new()).with_response_queue("a_replies");
        let result = agent.handle_task(&task).await;
        assert!(result.is_error());

        let reply: ReplyMessage = serde_json::from_value(broker.try_take("a_replies").unwrap()).unwrap();
        assert_eq!(reply.task_id, task.task_id);
        assert_eq!(reply.agent_id, "b");
        assert_eq!(reply.status, ResultStatus::Error);
        assert!(reply.fields["error"].as_str().unwrap().contains('X'));
    }

    #[tokio::test]
    async fn test_start_twice_declares_once() {
        let (agent, transport, _broker) = recording_agent("b");
        agent.start().await.unwrap();
        agent.start().await.unwrap();

        assert!(agent.is_running());
        assert_eq!(transport.count(|c| *c == Call::DeclareQueue("b_queue".into())), 1);
        assert_eq!(transport.count(|c| *c == Call::Consume("b_queue".into())), 1);
        assert_eq!(
            transport.count(|c| *c == Call::Bind("b_queue".into(), "events".into(), "broadcast".into())),
            1
        );
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_never_started_is_noop() {
        let (agent, transport, _broker) = recording_agent("b");
        agent.stop().await.unwrap();
        assert_eq!(agent.state(), AgentState::Stopped);
        assert_eq!(transport.count(|c| *c == Call::Close), 0);
    }

    #[tokio::test]
    async fn test_stop_closes_and_restart_works() {
        let (agent, transport, _broker) = recording_agent("b");
        agent.start().await.unwrap();
        agent.stop().await.unwrap();
        agent.stop().await.unwrap();
        assert_eq!(transport.count(|c| *c == Call::Close), 1);

        agent.start().await.unwrap();
        assert!(agent.is_running());
        assert_eq!(transport.count(|c| *c == Call::DeclareQueue("b_queue".into())), 2);
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_task_targets_queue_with_unique_ids() {
        let (agent, transport, _broker) = recording_agent("a");
        let first = agent.send_task("B", "draft", data(json!({"x": 1})), None).await.unwrap();
        let second = agent.send_task("B", "draft", data(json!({"x": 1})), None).await.unwrap();
        assert_ne!(first, second);

        let published: Vec<(String, Value)> = transport
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::PublishDirect(q, body) => Some((q, body)),
                _ => None,
            })
            .collect();
        assert_eq!(published.len(), 2);
        for (queue, body) in &published {
            assert_eq!(queue, "B_queue");
            assert_eq!(body["sender_agent_id"], json!("a"));
            assert_eq!(body["task_type"], json!("draft"));
        }
        assert_eq!(published[0].1["task_id"], json!(first));
        assert_eq!(published[1].1["task_id"], json!(second));
    }

    #[tokio::test]
    async fn test_broadcast_event_uses_events_exchange() {
        let (agent, transport, _broker) = recording_agent("a");
        let event_id = agent.broadcast_event("campaign_published", Payload::new()).await.unwrap();

        let calls = transport.calls();
        assert_eq!(calls[0], Call::DeclareExchange("events".into()));
        match &calls[1] {
            Call::Publish(exchange, key, body) => {
                assert_eq!(exchange, "events");
                assert_eq!(key, "broadcast");
                assert_eq!(body["event_id"], json!(event_id));
                assert_eq!(body["event_type"], json!("campaign_published"));
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let broker = InMemoryBroker::new();
        let a = agent_on(&broker, "a");
        let b = agent_on(&broker, "b");
        b.register_task_handler(
            "score",
            task_fn(|t: TaskMessage| async move {
                let n = t.data.get("n").and_then(Value::as_i64).unwrap_or(0);
                Ok(TaskResult::success().with("score", n * 2))
            }),
        );
        a.start().await.unwrap();
        b.start().await.unwrap();

        let reply = a
            .request("b", "score", data(json!({"n": 21})), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.agent_id, "b");
        assert_eq!(reply.fields["score"], json!(42));
        assert_eq!(a.pending_requests(), 0);

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let broker = InMemoryBroker::new();
        let a = agent_on(&broker, "a");
        a.start().await.unwrap();

        let err = a
            .request("nobody", "score", Payload::new(), Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(a.pending_requests(), 0);
        a.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_requires_running_agent() {
        let broker = InMemoryBroker::new();
        let a = agent_on(&broker, "a");
        assert!(a.request("b", "x", Payload::new(), None).await.is_err());
    }

    #[tokio::test]
    async fn test_broadcast_shutdown_stops_receivers() {
        let broker = InMemoryBroker::new();
        let a = agent_on(&broker, "a");
        let b = agent_on(&broker, "b");
        a.start().await.unwrap();
        b.start().await.unwrap();

        a.broadcast_event("shutdown", Payload::new()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), b.wait_stopped())
            .await
            .expect("b should stop");
        tokio::time::timeout(Duration::from_secs(5), a.wait_stopped())
            .await
            .expect("a should stop too; it is bound to the same exchange");
    }

    #[tokio::test]
    async fn test_heartbeat_event_via_handle_event() {
        let broker = InMemoryBroker::new();
        let a = agent_on(&broker, "a");
        let result = a.handle_event(&EventMessage::new("heartbeat", Payload::new())).await;
        assert_eq!(result.status(), Some("alive"));
        assert_eq!(result.get("agent_id"), Some(&json!("a")));
        assert!(!a.is_running());
    }

    #[tokio::test]
    async fn test_malformed_message_is_dropped() {
        let broker = InMemoryBroker::new();
        let a = agent_on(&broker, "a");
        a.register_task_handler(
            "count",
            task_fn(|_t: TaskMessage| async { Ok(TaskResult::success()) }),
        );
        a.start().await.unwrap();

        let conn = broker.connect();
        conn.publish_direct("a_queue", &json!({"garbage": true})).await.unwrap();
        conn.publish_direct("a_queue", &json!("not an object")).await.unwrap();

        // The agent keeps serving after bad input.
        let reply_task = TaskMessage::new("count", Payload::new()).with_response_queue("observer");
        conn.publish_direct("a_queue", &serde_json::to_value(&reply_task).unwrap())
            .await
            .unwrap();

        let mut reply = None;
        for _ in 0..100 {
            reply = broker.try_take("observer");
            if reply.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(reply.unwrap()["status"], json!("success"));
        a.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_client_consumes_replies_only() {
        let (agent, transport, _broker) = recording_agent("a-cli-1234");
        agent.start_client().await.unwrap();

        assert!(agent.is_running());
        assert_eq!(
            transport.calls(),
            vec![
                Call::DeclareQueue("a-cli-1234_replies".into()),
                Call::Consume("a-cli-1234_replies".into()),
            ]
        );
        agent.stop().await.unwrap();
        assert_eq!(transport.count(|c| *c == Call::Close), 1);
    }

    #[tokio::test]
    async fn test_client_request_round_trip() {
        let broker = InMemoryBroker::new();
        let client = agent_on(&broker, "brand-cli-1234");
        let b = agent_on(&broker, "b");
        b.start().await.unwrap();
        client.start_client().await.unwrap();

        let reply = client
            .request("b", "draft", Payload::new(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(reply.fields["task_type"], json!("draft"));

        client.stop().await.unwrap();
        b.broadcast_event("campaign_published", Payload::new()).await.unwrap();
        assert_eq!(broker.pending("brand-cli-1234_queue"), None);
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_client_leaves_no_binding() {
        let dir = tempfile::tempdir().unwrap();
        let client = file_agent(dir.path(), "brand-cli-1234");
        let b = file_agent(dir.path(), "b");

        b.start().await.unwrap();
        client.start_client().await.unwrap();
        client.stop().await.unwrap();

        for _ in 0..3 {
            b.broadcast_event("campaign_published", Payload::new()).await.unwrap();
        }
        b.stop().await.unwrap();

        let inspect = file_transport(dir.path());
        assert_eq!(inspect.pending("brand-cli-1234_queue").unwrap(), 0);
        assert!(!dir
            .path()
            .join("exchanges/events/broadcast/brand-cli-1234_queue")
            .exists());
    }

    #[tokio::test]
    async fn test_file_request_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let a = file_agent(dir.path(), "a");
        let b = file_agent(dir.path(), "b");
        b.register_task_handler(
            "score",
            task_fn(|t: TaskMessage| async move {
                let n = t.data.get("n").and_then(Value::as_i64).unwrap_or(0);
                Ok(TaskResult::success().with("score", n * 2))
            }),
        );
        a.start().await.unwrap();
        b.start().await.unwrap();

        let reply = a
            .request("b", "score", data(json!({"n": 21})), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.agent_id, "b");
        assert_eq!(reply.fields["score"], json!(42));

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_stop_and_restart() {
        let dir = tempfile::tempdir().unwrap();
        let a = file_agent(dir.path(), "a");
        let b = file_agent(dir.path(), "b");
        a.start().await.unwrap();

        b.start().await.unwrap();
        b.stop().await.unwrap();
        assert_eq!(b.state(), AgentState::Stopped);

        // Tasks sent while b is down wait in its queue.
        let timeout = Some(Duration::from_secs(5));
        let waiting = tokio::spawn({
            let a = a.clone();
            async move { a.request("b", "draft", Payload::new(), timeout).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(file_transport(dir.path()).pending("b_queue").unwrap(), 1);

        b.start().await.unwrap();
        let reply = waiting.await.unwrap().unwrap();
        assert!(reply.is_success());

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_shutdown_event_stops_receivers() {
        let dir = tempfile::tempdir().unwrap();
        let a = file_agent(dir.path(), "a");
        let b = file_agent(dir.path(), "b");
        a.start().await.unwrap();
        b.start().await.unwrap();

        a.broadcast_event("shutdown", Payload::new()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), b.wait_stopped())
            .await
            .expect("b should stop");
        tokio::time::timeout(Duration::from_secs(5), a.wait_stopped())
            .await
            .expect("a should stop");
    }

    #[tokio::test]
    async fn test_file_restart_does_not_rerun_in_flight_task() {
        let dir = tempfile::tempdir().unwrap();
        let b = file_agent(dir.path(), "b");
        let runs = Arc::new(AtomicUsize::new(0));
        b.register_task_handler("slow", {
            let runs = runs.clone();
            task_fn(move |_t: TaskMessage| {
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(TaskResult::success())
                }
            })
        });
        b.start().await.unwrap();

        let sender = file_agent(dir.path(), "a");
        sender.send_task("b", "slow", Payload::new(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        b.stop().await.unwrap();
        b.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(file_transport(dir.path()).pending("b_queue").unwrap(), 0);
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_to_traversal_queue_stays_inside_root() {
        let base = tempfile::tempdir().unwrap();
        let root = base.path().join("broker");
        let b = file_agent(&root, "b");

        let task = TaskMessage::new("draft", Payload::new()).with_response_queue("../../escaped");
        let result = b.handle_task(&task).await;
        assert_eq!(result.status(), Some("processed"));

        assert!(!base.path().join("escaped").exists());
        let entries: Vec<_> = std::fs::read_dir(base.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert!(entries.iter().all(|name| name == "broker"));

        let err = b.send_task("../../escaped", "draft", Payload::new(), None).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
