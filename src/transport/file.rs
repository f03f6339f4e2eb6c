//! Directory-backed broker shared between processes.
//!
//! Layout under the root directory:
//! - queues/<queue>/incoming/   : messages waiting for a consumer
//! - queues/<queue>/processing/ : message currently being delivered
//! - exchanges/<exchange>/<routing key>/<queue> : binding markers
//!
//! Each message is one `<ulid>.json` file. ULIDs sort by creation time, so
//! listing a directory in name order gives FIFO delivery.
//!
//! Queue, exchange and routing-key names must pass the same rule as the
//! names in the settings file; anything else is refused with a transport
//! error before it touches the filesystem.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use super::{DeliveryHandler, Transport};
use crate::config::is_valid_name;
use crate::error::{Error, Result};

pub const QUEUE_INCOMING: &str = "incoming";
pub const QUEUE_PROCESSING: &str = "processing";

const QUEUES_DIR: &str = "queues";
const EXCHANGES_DIR: &str = "exchanges";

/// File transport connection.
pub struct FileTransport {
    root: PathBuf,
    poll_interval: Duration,
    ids: Mutex<ulid::Generator>,
    epoch: watch::Sender<u64>,
    /// Held by a queue's consumer for as long as it runs.
    consumers: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

fn check_name(kind: &str, name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(Error::transport(format!("invalid {} name '{}'", kind, name)))
    }
}

impl FileTransport {
    pub fn new(root: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            root: root.into(),
            poll_interval,
            ids: Mutex::new(ulid::Generator::new()),
            epoch,
            consumers: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn queue_dir(&self, queue: &str) -> Result<PathBuf> {
        check_name("queue", queue)?;
        Ok(self.root.join(QUEUES_DIR).join(queue))
    }

    fn exchange_dir(&self, exchange: &str) -> Result<PathBuf> {
        check_name("exchange", exchange)?;
        Ok(self.root.join(EXCHANGES_DIR).join(exchange))
    }

    fn consumer_lock(&self, queue: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(queue.to_string())
            .or_default()
            .clone()
    }

    fn next_id(&self) -> String {
        let mut generator = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        // The generator only fails when the random part overflows within one ms.
        generator
            .generate()
            .unwrap_or_else(|_| ulid::Ulid::new())
            .to_string()
    }

    fn ensure_queue_dirs(&self, queue: &str) -> Result<PathBuf> {
        let dir = self.queue_dir(queue)?;
        for subdir in [QUEUE_INCOMING, QUEUE_PROCESSING] {
            let path = dir.join(subdir);
            if !path.exists() {
                fs::create_dir_all(&path)?;
                tracing::debug!("Created queue directory: {}", path.display());
            }
        }
        Ok(dir)
    }

    /// Write a message into a queue's incoming directory.
    ///
    /// The file is written under a temporary name and renamed into place so
    /// a polling consumer never reads a partial message.
    fn enqueue(&self, queue: &str, message: &Value) -> Result<String> {
        let dir = self.ensure_queue_dirs(queue)?.join(QUEUE_INCOMING);
        let id = self.next_id();

        let tmp = dir.join(format!("{}.json.tmp", id));
        let dst = dir.join(format!("{}.json", id));
        fs::write(&tmp, serde_json::to_vec(message)?)?;
        fs::rename(&tmp, &dst)?;

        tracing::debug!("Enqueued message {} to {}", id, queue);
        Ok(id)
    }

    /// Number of messages waiting in a queue.
    pub fn pending(&self, queue: &str) -> Result<usize> {
        Ok(list_messages(&self.queue_dir(queue)?.join(QUEUE_INCOMING))?.len())
    }

    /// Move orphaned messages from processing back to incoming.
    ///
    /// A message is left in processing when a consumer dies mid-delivery.
    /// Consumers on this connection do this themselves once they own the
    /// queue; calling it while another process consumes the queue hands
    /// that consumer's in-flight message out again.
    pub fn recover_orphaned(&self, queue: &str) -> Result<usize> {
        recover_in(&self.ensure_queue_dirs(queue)?)
    }
}

fn recover_in(queue_dir: &Path) -> Result<usize> {
    let incoming_dir = queue_dir.join(QUEUE_INCOMING);

    let mut recovered = 0;
    for path in list_messages(&queue_dir.join(QUEUE_PROCESSING))? {
        let Some(name) = path.file_name() else {
            continue;
        };
        if fs::rename(&path, incoming_dir.join(name)).is_ok() {
            tracing::info!("Recovered orphaned message: {}", path.display());
            recovered += 1;
        }
    }
    Ok(recovered)
}

/// List `*.json` files in a directory, oldest first.
fn list_messages(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(false, |ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Claim the oldest incoming message by moving it to processing.
///
/// Returns `None` when the queue is empty.
fn claim_next(queue_dir: &Path) -> Result<Option<(PathBuf, Option<Value>)>> {
    let processing_dir = queue_dir.join(QUEUE_PROCESSING);

    for src in list_messages(&queue_dir.join(QUEUE_INCOMING))? {
        let Some(name) = src.file_name() else {
            continue;
        };
        let dst = processing_dir.join(name);

        // Another consumer may have won the race for this file.
        if fs::rename(&src, &dst).is_err() {
            continue;
        }

        let body = fs::read(&dst)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok());
        return Ok(Some((dst, body)));
    }
    Ok(None)
}

#[async_trait]
impl Transport for FileTransport {
    async fn declare_queue(&self, name: &str) -> Result<()> {
        self.ensure_queue_dirs(name)?;
        Ok(())
    }

    async fn declare_exchange(&self, name: &str) -> Result<()> {
        fs::create_dir_all(self.exchange_dir(name)?)?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let exchange_dir = self.exchange_dir(exchange)?;
        if !exchange_dir.exists() {
            return Err(Error::transport(format!("exchange {} not declared", exchange)));
        }
        check_name("routing key", routing_key)?;
        self.ensure_queue_dirs(queue)?;

        let key_dir = exchange_dir.join(routing_key);
        fs::create_dir_all(&key_dir)?;
        fs::write(key_dir.join(queue), b"")?;
        Ok(())
    }

    async fn consume(&self, queue: &str, handler: Arc<dyn DeliveryHandler>) -> Result<()> {
        let queue_dir = self.ensure_queue_dirs(queue)?;
        let owner = self.consumer_lock(queue);
        let mut shutdown = self.epoch.subscribe();
        let poll_interval = self.poll_interval;
        let queue = queue.to_string();

        tokio::spawn(async move {
            // A consumer from before a close() may still be delivering; its
            // message sits in processing until it finishes.
            let _owner = tokio::select! {
                guard = owner.lock_owned() => guard,
                _ = shutdown.changed() => return,
            };
            match recover_in(&queue_dir) {
                Ok(0) => {}
                Ok(n) => tracing::info!("Requeued {} orphaned messages on {}", n, queue),
                Err(e) => tracing::warn!("Recovering {} failed: {}", queue, e),
            }

            tracing::debug!("Polling {} every {:?}", queue_dir.display(), poll_interval);
            loop {
                match claim_next(&queue_dir) {
                    Ok(Some((path, body))) => {
                        match body {
                            Some(body) => handler.deliver(&queue, body).await,
                            None => tracing::warn!("Dropping unreadable message {}", path.display()),
                        }
                        if let Err(e) = fs::remove_file(&path) {
                            tracing::warn!("Failed to remove {}: {}", path.display(), e);
                        }
                        if shutdown.has_changed().unwrap_or(true) {
                            break;
                        }
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Polling {} failed: {}", queue, e),
                }

                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            tracing::debug!("Consumer detached from {}", queue);
        });

        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: &Value) -> Result<()> {
        let exchange_dir = self.exchange_dir(exchange)?;
        if !exchange_dir.exists() {
            return Err(Error::transport(format!("exchange {} not declared", exchange)));
        }
        check_name("routing key", routing_key)?;

        let key_dir = exchange_dir.join(routing_key);
        if !key_dir.exists() {
            tracing::debug!("No queues bound to {}/{}; message dropped", exchange, routing_key);
            return Ok(());
        }

        for entry in fs::read_dir(&key_dir)? {
            let entry = entry?;
            if let Some(queue) = entry.file_name().to_str() {
                self.enqueue(queue, message)?;
            }
        }
        Ok(())
    }

    async fn publish_direct(&self, queue: &str, message: &Value) -> Result<()> {
        self.enqueue(queue, message)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.epoch.send_modify(|e| *e += 1);
        tracing::debug!("File transport at {} closed", self.root.display());
        Ok(())
    }
}
