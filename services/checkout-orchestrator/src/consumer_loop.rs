use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{error, info, warn};

use common::metrics;
use domain::codec::decode_event;
use domain::topics;
use messaging::{ConsumedMessage, ConsumerError, KafkaEventSource};
use saga::{Outcome, SagaCoordinator, SagaError};

pub const GROUP_ID: &str = "checkout-orchestrator-group";

/// The consume half of the runtime: pull a message, dispatch it to the
/// coordinator, then commit or seek back.
///
/// Offsets are committed only after the coordinator has durably persisted
/// the record; a crash in between re-runs the handler on redelivery.
pub struct ConsumerLoop {
    source: KafkaEventSource,
    coordinator: Arc<SagaCoordinator>,
    shutdown: watch::Receiver<bool>,
}

impl ConsumerLoop {
    pub fn new(
        brokers: &str,
        coordinator: Arc<SagaCoordinator>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, ConsumerError> {
        let source = KafkaEventSource::new(brokers, GROUP_ID, topics::CONSUMED)?;
        Ok(Self {
            source,
            coordinator,
            shutdown,
        })
    }

    pub async fn run(mut self) {
        info!(group_id = GROUP_ID, "Starting consumer loop");

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
                received = self.source.recv() => match received {
                    Ok(message) => self.process(message).await,
                    Err(e) => {
                        error!(error = %e, "Kafka consumer error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }

        info!("Consumer loop stopped");
    }

    async fn process(&self, message: ConsumedMessage) {
        let start = Instant::now();

        let envelope = match decode_event(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Dropping undecodable message"
                );
                metrics::record_event("undecodable", "dropped", start.elapsed().as_secs_f64());
                self.commit(&message);
                return;
            }
        };

        let event_type = envelope.event.name();
        match self.coordinator.handle_event(&envelope).await {
            Ok(Outcome::Requeue) => {
                metrics::record_event(event_type, "requeue", start.elapsed().as_secs_f64());
                self.requeue(&message);
            }
            Ok(outcome) => {
                let label = match outcome {
                    Outcome::Applied { .. } => "applied",
                    Outcome::Duplicate => "duplicate",
                    Outcome::Dropped(_) => "dropped",
                    Outcome::Requeue => unreachable!(),
                };
                metrics::record_event(event_type, label, start.elapsed().as_secs_f64());
                self.commit(&message);
            }
            Err(e) => {
                metrics::record_event(event_type, "error", start.elapsed().as_secs_f64());
                match e {
                    // Transient: the store or broker hiccuped; redelivery
                    // retries the whole message.
                    SagaError::Store(_) | SagaError::Publish(_) => {
                        warn!(
                            saga_id = %envelope.saga_id,
                            event_id = %envelope.event_id,
                            error = %e,
                            "Transient failure, message will be redelivered"
                        );
                        self.requeue(&message);
                    }
                    // Anything else is a malformed message or a bug; looping
                    // on it would wedge the partition.
                    _ => {
                        error!(
                            saga_id = %envelope.saga_id,
                            event_id = %envelope.event_id,
                            error = %e,
                            "Unrecoverable failure, dropping message"
                        );
                        self.commit(&message);
                    }
                }
            }
        }
    }

    fn commit(&self, message: &ConsumedMessage) {
        if let Err(e) = self.source.commit(message) {
            error!(
                topic = %message.topic,
                offset = message.offset,
                error = %e,
                "Failed to commit offset"
            );
        }
    }

    fn requeue(&self, message: &ConsumedMessage) {
        if let Err(e) = self.source.seek_back(message) {
            error!(
                topic = %message.topic,
                offset = message.offset,
                error = %e,
                "Failed to seek back for redelivery"
            );
        }
    }
}
