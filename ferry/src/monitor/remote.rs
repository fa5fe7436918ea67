//! Remote storage event queues.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use super::events::{ChangeEvent, ChangeKind};
use crate::Result;

/// An object notification as delivered by the remote queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObjectEvent {
    pub bucket: String,
    pub key: String,
    pub kind: ChangeKind,
    /// ETag or sequencer of the object version, when the notification has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Handle used to delete the message once handled.
    pub delivery_id: String,
}

impl RemoteObjectEvent {
    pub fn created(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            kind: ChangeKind::Created,
            version: None,
            delivery_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn to_change(&self) -> ChangeEvent {
        ChangeEvent::Object {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            kind: self.kind,
            version: self.version.clone(),
            delivery_id: self.delivery_id.clone(),
        }
    }
}

/// A polled queue of object notifications.
///
/// Messages stay in the queue until deleted; a message that is polled but
/// never deleted is delivered again by the backing service.
#[async_trait]
pub trait RemoteEventQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Up to `max` messages.
    async fn poll(&self, max: usize) -> Result<Vec<RemoteObjectEvent>>;

    /// Acknowledge a handled message.
    async fn delete(&self, delivery_id: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryQueueState {
    visible: VecDeque<RemoteObjectEvent>,
    in_flight: HashMap<String, RemoteObjectEvent>,
}

/// In-process queue, for single-node setups and tests.
#[derive(Debug)]
pub struct MemoryRemoteEventQueue {
    name: String,
    state: Mutex<MemoryQueueState>,
}

impl MemoryRemoteEventQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryQueueState::default()),
        }
    }

    pub fn push(&self, event: RemoteObjectEvent) {
        self.state.lock().visible.push_back(event);
    }

    /// Make polled but undeleted messages visible again.
    pub fn redeliver_unacked(&self) -> usize {
        let mut state = self.state.lock();
        let pending: Vec<_> = state.in_flight.drain().map(|(_, event)| event).collect();
        let count = pending.len();
        state.visible.extend(pending);
        count
    }

    /// Messages not yet deleted.
    pub fn outstanding(&self) -> usize {
        let state = self.state.lock();
        state.visible.len() + state.in_flight.len()
    }
}

#[async_trait]
impl RemoteEventQueue for MemoryRemoteEventQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn poll(&self, max: usize) -> Result<Vec<RemoteObjectEvent>> {
        let mut state = self.state.lock();
        let take = max.min(state.visible.len());
        let batch: Vec<_> = state.visible.drain(..take).collect();
        for event in &batch {
            state.in_flight.insert(event.delivery_id.clone(), event.clone());
        }
        Ok(batch)
    }

    async fn delete(&self, delivery_id: &str) -> Result<()> {
        self.state.lock().in_flight.remove(delivery_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_poll_and_delete() {
        let queue = MemoryRemoteEventQueue::new("s3-events");
        queue.push(RemoteObjectEvent::created("b", "k1"));
        queue.push(RemoteObjectEvent::created("b", "k2"));

        let batch = queue.poll(1).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].key, "k1");
        assert_eq!(queue.outstanding(), 2);

        queue.delete(&batch[0].delivery_id).await.unwrap();
        assert_eq!(queue.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_undeleted_messages_come_back() {
        let queue = MemoryRemoteEventQueue::new("s3-events");
        queue.push(RemoteObjectEvent::created("b", "k1"));
        let first = queue.poll(10).await.unwrap();
        assert!(queue.poll(10).await.unwrap().is_empty());

        assert_eq!(queue.redeliver_unacked(), 1);
        let again = queue.poll(10).await.unwrap();
        assert_eq!(again[0].delivery_id, first[0].delivery_id);
    }
}
