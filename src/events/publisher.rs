use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Fan-out of lifecycle events to any number of in-process listeners.
///
/// Clones share one channel and one sequence counter. Publishing never blocks;
/// a listener that falls more than `capacity` events behind sees
/// `RecvError::Lagged` and skips ahead.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<PublishedEvent>,
    sequence: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishedEvent {
    /// Monotonic per publisher, starting at 1
    pub sequence: u64,
    pub name: String,
    pub context: Value,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("event name must not be empty")]
    EmptyName,
    #[error("event payload is not representable as JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the sequence number assigned to the event. Having no listener
    /// is not an error.
    pub async fn publish(
        &self,
        event_name: impl Into<String>,
        context: Value,
    ) -> Result<u64, PublishError> {
        let name = event_name.into();
        if name.is_empty() {
            return Err(PublishError::EmptyName);
        }
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.sender.send(PublishedEvent {
            sequence,
            name,
            context,
            published_at: Utc::now(),
        });
        Ok(sequence)
    }

    pub async fn publish_payload<T: Serialize>(
        &self,
        event_name: impl Into<String>,
        payload: &T,
    ) -> Result<u64, PublishError> {
        let context = serde_json::to_value(payload)?;
        self.publish(event_name, context).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Events published so far through this publisher or any clone
    pub fn published(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}
