use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Kafka consumer error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Message has no payload")]
    NoPayload,
}

/// One record pulled off the bus, with enough position information to commit
/// or seek back.
#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// Consume side of the bus gateway.
///
/// Offsets are committed manually by the runtime after the saga record has
/// been durably persisted; auto-commit would break publish-before-commit.
pub struct KafkaEventSource {
    consumer: StreamConsumer,
}

impl KafkaEventSource {
    pub fn new(brokers: &str, group_id: &str, topics: &[&str]) -> Result<Self, ConsumerError> {
        info!(
            group_id = group_id,
            topics = ?topics,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", group_id)
            .set("bootstrap.servers", brokers)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "10000")
            .create()?;

        consumer.subscribe(topics)?;

        Ok(Self { consumer })
    }

    /// Wait for the next message.
    pub async fn recv(&self) -> Result<ConsumedMessage, ConsumerError> {
        let message = self.consumer.recv().await?;
        debug!(
            topic = message.topic(),
            partition = message.partition(),
            offset = message.offset(),
            "Received message"
        );

        let payload = message.payload().ok_or(ConsumerError::NoPayload)?;

        Ok(ConsumedMessage {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            payload: payload.to_vec(),
        })
    }

    /// Commit the offset *after* `msg`, marking it consumed.
    pub fn commit(&self, msg: &ConsumedMessage) -> Result<(), ConsumerError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&msg.topic, msg.partition, Offset::Offset(msg.offset + 1))?;
        self.consumer.commit(&tpl, CommitMode::Sync)?;
        Ok(())
    }

    /// Rewind the partition to `msg` so it is delivered again on the next
    /// poll. Used when a transient failure must be retried without losing
    /// the message.
    pub fn seek_back(&self, msg: &ConsumedMessage) -> Result<(), ConsumerError> {
        self.consumer.seek(
            &msg.topic,
            msg.partition,
            Offset::Offset(msg.offset),
            Duration::from_secs(5),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_consumer_creation_invalid_broker() {
        // Creation succeeds; the connection is attempted on poll.
        let result = KafkaEventSource::new("invalid:9092", "test-group", &["test-topic"]);
        assert!(result.is_ok());
    }
}
