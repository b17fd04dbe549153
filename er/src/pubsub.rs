//! In-process pub/sub - named FIFO topics of JSON documents
//!
//! Each topic is a bounded tokio mpsc channel. Any number of producers may
//! hold a sender; the single receiver is handed to whichever consumer
//! subscribes first.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Default topic capacity (documents)
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error("Queue {0} already has a subscriber")]
    AlreadySubscribed(String),

    #[error("Queue {0} is closed")]
    Closed(String),
}

struct Topic {
    tx: mpsc::Sender<Value>,
    rx: Option<mpsc::Receiver<Value>>,
}

/// Registry of named topics
pub struct PubSubManager {
    capacity: usize,
    topics: Mutex<HashMap<String, Topic>>,
}

impl PubSubManager {
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "PubSubManager::new: called");
        Self {
            capacity,
            topics: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, Topic>> {
        // a panic while holding this lock cannot leave the map inconsistent
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a topic; no-op if it already exists
    pub fn create_queue(&self, name: &str) {
        debug!(%name, "PubSubManager::create_queue: called");
        self.topics().entry(name.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.capacity);
            Topic { tx, rx: Some(rx) }
        });
    }

    /// A producer handle for the topic
    pub fn sender(&self, name: &str) -> Result<mpsc::Sender<Value>, PubSubError> {
        self.topics()
            .get(name)
            .map(|topic| topic.tx.clone())
            .ok_or_else(|| PubSubError::UnknownQueue(name.to_string()))
    }

    /// Take the topic's receiver; only one consumer per topic
    pub fn subscribe(&self, name: &str) -> Result<mpsc::Receiver<Value>, PubSubError> {
        debug!(%name, "PubSubManager::subscribe: called");
        let mut topics = self.topics();
        let topic = topics
            .get_mut(name)
            .ok_or_else(|| PubSubError::UnknownQueue(name.to_string()))?;
        topic
            .rx
            .take()
            .ok_or_else(|| PubSubError::AlreadySubscribed(name.to_string()))
    }

    /// Append a document to the topic, waiting for room if it is full
    pub async fn put(&self, name: &str, document: Value) -> Result<(), PubSubError> {
        debug!(%name, "PubSubManager::put: called");
        let tx = self.sender(name)?;
        tx.send(document).await.map_err(|_| PubSubError::Closed(name.to_string()))
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for PubSubManager {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}
