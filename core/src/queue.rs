//! Queue transport used by job launching.
//!
//! The contract is a pub/sub broker with multipart `[topic, payload]`
//! messages; payloads are serialized `(task_uid, api_call)` tuples.
//! Delivery is at-least-once, so handlers dedup by `task_uid`. The
//! in-process broker below fans every publish out to all subscribers of
//! the topic over bounded channels.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use async_channel::Receiver;
use async_channel::Sender;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::error::CodeError;
use crate::error::Result;
use crate::protocol::ApiCall;

/// Queue name every execution worker subscribes to.
pub const API_CALL_QUEUE: &str = "api_call";

const QUEUE_DEPTH: usize = 64;

/// One multipart message: `[topic, payload]`.
pub type Multipart = Vec<Vec<u8>>;

/// Payload tuple published for every queued action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub task_uid: Uuid,
    pub api_call: ApiCall,
}

pub trait QueuePublisher: Send + Sync {
    fn send(&self, queue_name: &str, payload: Vec<u8>) -> Result<()>;
}

/// In-process broker. Topics are created on first subscribe; publishing to
/// a topic without subscribers drops the message, matching pub/sub
/// semantics. A closed broker refuses every further publish.
#[derive(Default)]
pub struct InMemoryBroker {
    topics: Mutex<HashMap<String, Vec<Sender<Multipart>>>>,
    closed: std::sync::atomic::AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, queue_name: &str) -> Result<Receiver<Multipart>> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(CodeError::QueueClosed("broker is closed".to_string()));
        }
        let (tx, rx) = async_channel::bounded(QUEUE_DEPTH);
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| CodeError::QueueClosed("broker lock poisoned".to_string()))?;
        topics.entry(queue_name.to_string()).or_default().push(tx);
        Ok(rx)
    }

    pub fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        if let Ok(mut topics) = self.topics.lock() {
            topics.clear();
        }
    }
}

impl QueuePublisher for InMemoryBroker {
    fn send(&self, queue_name: &str, payload: Vec<u8>) -> Result<()> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(CodeError::QueueClosed("broker is closed".to_string()));
        }
        let message: Multipart = vec![queue_name.as_bytes().to_vec(), payload];
        let subscribers: Vec<Sender<Multipart>> = {
            let topics = self
                .topics
                .lock()
                .map_err(|_| CodeError::QueueClosed("broker lock poisoned".to_string()))?;
            topics.get(queue_name).cloned().unwrap_or_default()
        };
        for subscriber in subscribers {
            subscriber
                .try_send(message.clone())
                .map_err(|e| CodeError::QueueClosed(format!("queue '{queue_name}': {e}")))?;
        }
        Ok(())
    }
}

/// Serializes and publishes one queued task.
pub fn publish_task(
    publisher: &dyn QueuePublisher,
    queue_name: &str,
    task_uid: Uuid,
    api_call: ApiCall,
) -> Result<()> {
    let payload = serde_json::to_vec(&QueuedTask { task_uid, api_call })?;
    publisher.send(queue_name, payload)
}

/// Decodes a multipart message back into its topic and task.
pub fn decode_task(message: &Multipart) -> Result<(String, QueuedTask)> {
    let [topic, payload] = message.as_slice() else {
        return Err(CodeError::QueueClosed("malformed multipart message".to_string()));
    };
    let topic = String::from_utf8_lossy(topic).to_string();
    let task: QueuedTask = serde_json::from_slice(payload)?;
    Ok((topic, task))
}

/// Dedup set shared by the worker slots of one pool. At-least-once
/// delivery means the same `task_uid` can arrive more than once.
#[derive(Clone, Default)]
pub struct SeenTasks {
    seen: Arc<Mutex<HashSet<Uuid>>>,
}

impl SeenTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time a task uid is observed.
    pub fn first_sighting(&self, task_uid: Uuid) -> bool {
        match self.seen.lock() {
            Ok(mut seen) => seen.insert(task_uid),
            Err(_) => false,
        }
    }
}

/// A named worker pool: `workers` execution slots drawing from the pool's
/// subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPool {
    pub id: Uuid,
    pub name: String,
    pub workers: usize,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        Self { id: Uuid::new_v4(), name: name.into(), workers }
    }
}
