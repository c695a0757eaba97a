use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Failed to create Kafka producer: {0}")]
    ProducerCreation(String),

    #[error("Failed to publish to topic '{topic}': {reason}")]
    PublishFailed { topic: String, reason: String },
}

/// Publish side of the bus gateway. `send` returns only after the broker has
/// durably accepted the message.
///
/// The key is the saga id, which doubles as the partition key: all messages
/// for one saga land on one partition, giving per-saga serialization.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn send(&self, topic: &str, key: Uuid, payload: Vec<u8>) -> Result<(), PublishError>;
}

/// Kafka-backed publisher used in production.
pub struct KafkaPublisher {
    producer: FutureProducer,
}

impl KafkaPublisher {
    pub fn new(brokers: &str) -> Result<Self, PublishError> {
        debug!("Creating Kafka producer for brokers: {}", brokers);

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("compression.type", "snappy")
            .set("acks", "all") // Wait for all replicas to acknowledge
            .set("retries", "3")
            .create()
            .map_err(|e| PublishError::ProducerCreation(e.to_string()))?;

        Ok(Self { producer })
    }
}

#[async_trait]
impl BusPublisher for KafkaPublisher {
    async fn send(&self, topic: &str, key: Uuid, payload: Vec<u8>) -> Result<(), PublishError> {
        let key_str = key.to_string();
        let record = FutureRecord::to(topic).key(&key_str).payload(&payload);

        match self
            .producer
            .send(record, Timeout::After(Duration::from_secs(5)))
            .await
        {
            Ok((partition, offset)) => {
                debug!(
                    topic = topic,
                    partition = partition,
                    offset = offset,
                    "Message published"
                );
                Ok(())
            }
            Err((err, _)) => {
                warn!(topic = topic, error = %err, "Failed to publish message");
                Err(PublishError::PublishFailed {
                    topic: topic.to_string(),
                    reason: err.to_string(),
                })
            }
        }
    }
}
