use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use common::metrics;
use domain::cart::CartDetails;
use domain::codec::{encode_command, encode_event};
use domain::envelope::{EventEnvelope, EventKind};
use domain::topics;
use messaging::{BusPublisher, PublishError};

use crate::engine::{DropReason, SagaEngine, Step};
use crate::errors::Result;
use crate::repository::{SagaStore, StoreError, StoreResult};
use crate::state::{CheckoutState, SagaRecord};

/// Exponential backoff applied to bus publishes before giving up and letting
/// redelivery retry the whole message.
#[derive(Debug, Clone)]
pub struct PublishRetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for PublishRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
        }
    }
}

/// What happened to one consumed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied {
        from: CheckoutState,
        to: CheckoutState,
    },
    /// Idempotency gate hit; the event was consumed before.
    Duplicate,
    Dropped(DropReason),
    /// Not fully processed; the message must be redelivered. The offset is
    /// not committed.
    Requeue,
}

/// Drives the consume-apply-persist cycle for one envelope at a time and
/// owns the admission operations.
///
/// Ordering per envelope: side effects are published first, then the record
/// is persisted with a conditional update, and only then may the caller
/// commit the consumer offset. Duplicates from redelivery are absorbed by
/// the idempotency gate.
pub struct SagaCoordinator {
    store: Arc<dyn SagaStore>,
    publisher: Arc<dyn BusPublisher>,
    engine: SagaEngine,
    retry: PublishRetryPolicy,
}

impl SagaCoordinator {
    pub fn new(
        store: Arc<dyn SagaStore>,
        publisher: Arc<dyn BusPublisher>,
        engine: SagaEngine,
        retry: PublishRetryPolicy,
    ) -> Self {
        Self {
            store,
            publisher,
            engine,
            retry,
        }
    }

    /// Create a saga in INITIATED and emit `CheckoutInitiated`. The caller
    /// has already validated the ids and the cart.
    pub async fn start_checkout(
        &self,
        user_id: Uuid,
        cart_id: Uuid,
        cart_details: CartDetails,
    ) -> Result<Uuid> {
        let record = SagaRecord::new(user_id, cart_id, cart_details.clone());
        let saga_id = record.saga_id;

        self.store.create(&record).await?;

        let envelope = EventEnvelope::new(
            saga_id,
            EventKind::CheckoutInitiated {
                user_id,
                cart_id,
                cart_details,
            },
        );
        let payload = encode_event(&envelope)?;
        self.publish_with_retry(topics::CHECKOUT_INITIATED, saga_id, payload)
            .await?;

        info!(saga_id = %saga_id, user_id = %user_id, cart_id = %cart_id, "Checkout saga started");
        Ok(saga_id)
    }

    pub async fn status(&self, saga_id: Uuid) -> StoreResult<SagaRecord> {
        self.store.load(saga_id).await
    }

    /// Apply one decoded envelope: load, dedup, run the engine, publish side
    /// effects, persist once.
    pub async fn handle_event(&self, envelope: &EventEnvelope) -> Result<Outcome> {
        let record = match self.store.load(envelope.saga_id).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                if matches!(envelope.event, EventKind::CheckoutInitiated { .. }) {
                    // The admission path creates the record before it
                    // publishes the trigger, so this means creation failed.
                    error!(
                        saga_id = %envelope.saga_id,
                        event_id = %envelope.event_id,
                        "CheckoutInitiated for a saga that was never created"
                    );
                } else {
                    warn!(
                        saga_id = %envelope.saga_id,
                        event_id = %envelope.event_id,
                        event_type = envelope.event.name(),
                        "Event for unknown saga, dropping"
                    );
                }
                return Ok(Outcome::Dropped(DropReason::SagaNotFound));
            }
            Err(e) => return Err(e.into()),
        };

        if record.processed_event_ids.contains(&envelope.event_id) {
            metrics::record_idempotency_check(true);
            info!(
                saga_id = %envelope.saga_id,
                event_id = %envelope.event_id,
                "Event already processed, skipping"
            );
            return Ok(Outcome::Duplicate);
        }
        metrics::record_idempotency_check(false);

        let from = record.state;
        let expected_version = record.version;

        let mut transition = match self.engine.apply(&record, envelope).await? {
            Step::Drop(reason) => return Ok(Outcome::Dropped(reason)),
            Step::Apply(transition) => transition,
        };

        if transition.mark_processed {
            transition.record.processed_event_ids.insert(envelope.event_id);
        }
        transition.record.version = expected_version + 1;

        // Side effects before persistence: a crash after publish but before
        // the store update re-runs the handler on redelivery, and the
        // duplicate commands are absorbed downstream by event_id.
        for alert in &transition.alerts {
            let payload = encode_event(alert)?;
            if let Err(e) = self
                .publish_with_retry(topics::CHECKOUT_EVENTS, alert.saga_id, payload)
                .await
            {
                warn!(saga_id = %envelope.saga_id, error = %e, "Alert publish failed, requeueing");
                return Ok(Outcome::Requeue);
            }
        }
        for command in &transition.commands {
            let payload = encode_command(command)?;
            if let Err(e) = self
                .publish_with_retry(command.command.topic(), command.saga_id, payload)
                .await
            {
                warn!(
                    saga_id = %envelope.saga_id,
                    command = command.command.name(),
                    error = %e,
                    "Command publish failed, requeueing"
                );
                return Ok(Outcome::Requeue);
            }
        }

        let to = transition.record.state;
        match self.store.update(&transition.record, expected_version).await {
            Ok(()) => {
                metrics::record_transition(&from.to_string(), &to.to_string());
                if to.is_terminal() {
                    metrics::record_terminal(&to.to_string());
                }
                if transition.requeue {
                    Ok(Outcome::Requeue)
                } else {
                    Ok(Outcome::Applied { from, to })
                }
            }
            Err(StoreError::Conflict(_)) => {
                // A concurrent updater won the fence; drop this work and let
                // redelivery re-read the fresh record.
                warn!(
                    saga_id = %envelope.saga_id,
                    event_id = %envelope.event_id,
                    "Conditional update conflict, requeueing"
                );
                Ok(Outcome::Requeue)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn publish_with_retry(
        &self,
        topic: &str,
        key: Uuid,
        payload: Vec<u8>,
    ) -> std::result::Result<(), PublishError> {
        let mut backoff = self.retry.base_backoff;
        let max_attempts = self.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.publisher.send(topic, key, payload.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < max_attempts => {
                    metrics::record_publish_retry(topic);
                    warn!(
                        topic = topic,
                        attempt = attempt,
                        error = %e,
                        "Publish failed, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("publish retry loop always returns");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use domain::cart::{CartDetails, CartItem};
    use messaging::InMemoryBus;
    use pricing::{PricingApi, PricingError};

    use crate::repository::InMemorySagaStore;

    struct FlatPricing;

    #[async_trait]
    impl PricingApi for FlatPricing {
        async fn calculate_discount(
            &self,
            _cart_id: Uuid,
            _user_id: Uuid,
            _items: &[CartItem],
        ) -> std::result::Result<i64, PricingError> {
            Ok(500)
        }

        async fn calculate_tax(
            &self,
            _cart_id: Uuid,
            _items: &[CartItem],
        ) -> std::result::Result<i64, PricingError> {
            Ok(800)
        }
    }

    fn cart() -> CartDetails {
        CartDetails {
            items: vec![CartItem {
                product_id: Uuid::new_v4().to_string(),
                quantity: 2,
                unit_price_cents: 5000,
            }],
            total_price: 10_000,
        }
    }

    fn coordinator() -> (SagaCoordinator, Arc<InMemorySagaStore>, Arc<InMemoryBus>) {
        let store = Arc::new(InMemorySagaStore::new());
        let bus = Arc::new(InMemoryBus::new());
        let engine = SagaEngine::new(Arc::new(FlatPricing), 3);
        let retry = PublishRetryPolicy {
            max_attempts: 2,
            base_backoff: Duration::from_millis(1),
        };
        let coordinator = SagaCoordinator::new(store.clone(), bus.clone(), engine, retry);
        (coordinator, store, bus)
    }

    #[tokio::test]
    async fn test_start_checkout_creates_record_and_publishes_trigger() {
        let (coordinator, store, bus) = coordinator();

        let saga_id = coordinator
            .start_checkout(Uuid::new_v4(), Uuid::new_v4(), cart())
            .await
            .unwrap();

        let record = store.load(saga_id).await.unwrap();
        assert_eq!(record.state, CheckoutState::Initiated);
        assert_eq!(bus.count(topics::CHECKOUT_INITIATED), 1);

        let decoded =
            domain::decode_event(&bus.messages(topics::CHECKOUT_INITIATED)[0]).unwrap();
        assert_eq!(decoded.saga_id, saga_id);
        assert!(matches!(decoded.event, EventKind::CheckoutInitiated { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_event_is_absorbed() {
        let (coordinator, store, bus) = coordinator();
        let saga_id = coordinator
            .start_checkout(Uuid::new_v4(), Uuid::new_v4(), cart())
            .await
            .unwrap();

        let trigger =
            domain::decode_event(&bus.messages(topics::CHECKOUT_INITIATED)[0]).unwrap();

        let first = coordinator.handle_event(&trigger).await.unwrap();
        assert!(matches!(first, Outcome::Applied { .. }));
        assert_eq!(bus.count(topics::INVENTORY_COMMAND), 1);

        let snapshot = serde_json::to_vec(&store.load(saga_id).await.unwrap()).unwrap();

        let second = coordinator.handle_event(&trigger).await.unwrap();
        assert_eq!(second, Outcome::Duplicate);
        // No new commands, record byte-identical.
        assert_eq!(bus.count(topics::INVENTORY_COMMAND), 1);
        let after = serde_json::to_vec(&store.load(saga_id).await.unwrap()).unwrap();
        assert_eq!(snapshot, after);
    }

    #[tokio::test]
    async fn test_event_for_unknown_saga_is_dropped() {
        let (coordinator, _store, _bus) = coordinator();

        let orphan = EventEnvelope::new(Uuid::new_v4(), EventKind::CartCleared);
        let outcome = coordinator.handle_event(&orphan).await.unwrap();
        assert_eq!(outcome, Outcome::Dropped(DropReason::SagaNotFound));
    }

    #[tokio::test]
    async fn test_publish_failure_requeues_without_persisting() {
        let (coordinator, store, bus) = coordinator();
        let saga_id = coordinator
            .start_checkout(Uuid::new_v4(), Uuid::new_v4(), cart())
            .await
            .unwrap();
        let trigger =
            domain::decode_event(&bus.messages(topics::CHECKOUT_INITIATED)[0]).unwrap();

        // Exhaust the retry budget for the ReserveInventory publish.
        bus.fail_next(2);
        let outcome = coordinator.handle_event(&trigger).await.unwrap();
        assert_eq!(outcome, Outcome::Requeue);

        // Nothing persisted: same version, event not marked processed.
        let record = store.load(saga_id).await.unwrap();
        assert_eq!(record.version, 1);
        assert!(record.processed_event_ids.is_empty());
        assert_eq!(record.state, CheckoutState::Initiated);

        // Redelivery succeeds end to end.
        let outcome = coordinator.handle_event(&trigger).await.unwrap();
        assert!(matches!(outcome, Outcome::Applied { .. }));
        assert_eq!(bus.count(topics::INVENTORY_COMMAND), 1);
        let record = store.load(saga_id).await.unwrap();
        assert_eq!(record.state, CheckoutState::InventoryReservationPending);
        assert!(record.processed_event_ids.contains(&trigger.event_id));
    }

    #[tokio::test]
    async fn test_publish_retries_recover_transient_broker_errors() {
        let (coordinator, _store, bus) = coordinator();

        // One failure, then success within the same handle_event call.
        bus.fail_next(1);
        let saga_id = coordinator
            .start_checkout(Uuid::new_v4(), Uuid::new_v4(), cart())
            .await
            .unwrap();
        assert_eq!(bus.count(topics::CHECKOUT_INITIATED), 1);
        assert!(!saga_id.is_nil());
    }
}
