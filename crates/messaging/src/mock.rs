//! In-memory bus for tests and the MOCK_KAFKA shim.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::producer::{BusPublisher, PublishError};

/// In-memory publisher recording every message per topic.
///
/// At-least-once is irrelevant here; the value is that tests can assert on
/// exactly which commands left the orchestrator, in order.
#[derive(Debug, Default)]
pub struct InMemoryBus {
    topics: Mutex<HashMap<String, Vec<(Uuid, Vec<u8>)>>>,
    fail_next: Mutex<u32>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// All payloads published to `topic`, in publish order.
    pub fn messages(&self, topic: &str) -> Vec<Vec<u8>> {
        self.topics
            .lock()
            .expect("bus lock poisoned")
            .get(topic)
            .map(|msgs| msgs.iter().map(|(_, payload)| payload.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of messages published to `topic`.
    pub fn count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .expect("bus lock poisoned")
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Total messages across all topics.
    pub fn total(&self) -> usize {
        self.topics
            .lock()
            .expect("bus lock poisoned")
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Make the next `n` sends fail, to exercise publish retry paths.
    pub fn fail_next(&self, n: u32) {
        *self.fail_next.lock().expect("bus lock poisoned") = n;
    }
}

#[async_trait]
impl BusPublisher for InMemoryBus {
    async fn send(&self, topic: &str, key: Uuid, payload: Vec<u8>) -> Result<(), PublishError> {
        {
            let mut fail = self.fail_next.lock().expect("bus lock poisoned");
            if *fail > 0 {
                *fail -= 1;
                return Err(PublishError::PublishFailed {
                    topic: topic.to_string(),
                    reason: "injected failure".to_string(),
                });
            }
        }

        self.topics
            .lock()
            .expect("bus lock poisoned")
            .entry(topic.to_string())
            .or_default()
            .push((key, payload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_read_back() {
        let bus = InMemoryBus::new();
        let key = Uuid::new_v4();

        bus.send("topic-a", key, b"one".to_vec()).await.unwrap();
        bus.send("topic-a", key, b"two".to_vec()).await.unwrap();
        bus.send("topic-b", key, b"three".to_vec()).await.unwrap();

        assert_eq!(bus.messages("topic-a"), vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(bus.count("topic-b"), 1);
        assert_eq!(bus.total(), 3);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let bus = InMemoryBus::new();
        bus.fail_next(1);

        let key = Uuid::new_v4();
        assert!(bus.send("topic", key, vec![]).await.is_err());
        assert!(bus.send("topic", key, vec![]).await.is_ok());
        assert_eq!(bus.count("topic"), 1);
    }
}
