pub mod consumer;
pub mod mock;
pub mod producer;

pub use consumer::{ConsumedMessage, ConsumerError, KafkaEventSource};
pub use mock::InMemoryBus;
pub use producer::{BusPublisher, KafkaPublisher, PublishError};
