use std::sync::Arc;

use tracing::{error, info, warn};

use domain::envelope::{CommandEnvelope, CommandKind, EventEnvelope, EventKind};
use pricing::{PricingApi, PricingError};

use crate::errors::Result;
use crate::state::{CheckoutState, CompensationStep, SagaRecord};

/// Why an event was dropped without touching the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The record is COMPLETED or FAILED; terminal records are immutable.
    Terminal,
    /// No transition row for this (state, event) pair. Usually an
    /// out-of-order retry of an already-processed stage.
    UnknownPairing,
    /// No record exists for the event's saga id.
    SagaNotFound,
}

/// The engine's verdict for one event: the mutated copy of the record plus
/// the side effects the runtime must perform before persisting it.
#[derive(Debug)]
pub struct Transition {
    pub record: SagaRecord,
    pub commands: Vec<CommandEnvelope>,
    /// Operator-facing events (alerts) for the events topic.
    pub alerts: Vec<EventEnvelope>,
    /// Whether the event id joins `processed_event_ids`. False only for the
    /// pricing retry path, where redelivery must re-run the handler.
    pub mark_processed: bool,
    /// True when the message must be redelivered (offset not committed).
    pub requeue: bool,
}

impl Transition {
    fn applied(record: SagaRecord, commands: Vec<CommandEnvelope>) -> Self {
        Self {
            record,
            commands,
            alerts: Vec::new(),
            mark_processed: true,
            requeue: false,
        }
    }
}

#[derive(Debug)]
pub enum Step {
    Apply(Transition),
    Drop(DropReason),
}

/// The saga state machine. Given a loaded record and an incoming event it
/// decides the next state and side effects; it never touches the store.
pub struct SagaEngine {
    pricing: Arc<dyn PricingApi>,
    pricing_max_attempts: u32,
}

impl SagaEngine {
    pub fn new(pricing: Arc<dyn PricingApi>, pricing_max_attempts: u32) -> Self {
        Self {
            pricing,
            pricing_max_attempts: pricing_max_attempts.max(1),
        }
    }

    /// Compute the transition for `envelope` against a copy of `record`.
    pub async fn apply(&self, record: &SagaRecord, envelope: &EventEnvelope) -> Result<Step> {
        use CheckoutState as S;
        use EventKind as E;

        if record.is_terminal() {
            return Ok(Step::Drop(DropReason::Terminal));
        }

        let next = record.clone();
        let transition = match (record.state, &envelope.event) {
            (S::Initiated, E::CheckoutInitiated { .. }) => self.on_checkout_initiated(next)?,

            (S::InventoryReservationPending, E::InventoryReserved { reservation_details }) => {
                let mut next = next;
                next.context.inventory_reservation_details = Some(reservation_details.clone());
                next.set_state(S::InventoryReserved)?;
                self.on_inventory_reserved(next).await?
            }
            // Pricing retry: the reservation already landed, the pricing
            // sub-step did not.
            (S::InventoryReserved, E::InventoryReserved { .. }) => {
                self.on_inventory_reserved(next).await?
            }

            (S::InventoryReservationPending, E::InventoryReservationFailed { reason }) => {
                self.on_inventory_reservation_failed(next, reason)?
            }

            (S::PaymentProcessingPending, E::PaymentProcessed { payment_details }) => {
                self.on_payment_processed(next, payment_details)?
            }
            (S::PaymentProcessingPending, E::PaymentFailed { reason }) => {
                self.begin_inventory_compensation(next, "payment", reason)?
            }

            (S::OrderCreationPending, E::OrderCreated { order_details }) => {
                self.on_order_created(next, order_details)?
            }
            (S::OrderCreationPending, E::OrderCreationFailed { reason }) => {
                self.on_order_creation_failed(next, reason)?
            }

            (S::CartClearancePending, E::CartCleared) => self.on_cart_cleared(next)?,
            (S::CartClearancePending, E::CartClearanceFailed { reason }) => {
                self.on_cart_clearance_failed(next, reason.as_deref())?
            }

            (S::Compensating, E::InventoryReleased { .. }) => {
                self.on_compensation_acknowledged(next, CompensationStep::Inventory)?
            }
            (S::Compensating, E::PaymentRefunded { .. }) => {
                self.on_compensation_acknowledged(next, CompensationStep::Payment)?
            }
            (S::Compensating, E::CompensationTimedOut { pending }) => {
                self.on_compensation_timed_out(next, pending)?
            }

            (S::InventoryReserved, E::PricingFailed { reason }) => {
                self.begin_inventory_compensation(next, "pricing", reason)?
            }

            (state, event) => {
                warn!(
                    saga_id = %record.saga_id,
                    event_id = %envelope.event_id,
                    event_type = event.name(),
                    state = %state,
                    "No transition for event in current state, dropping"
                );
                return Ok(Step::Drop(DropReason::UnknownPairing));
            }
        };

        Ok(Step::Apply(transition))
    }

    /// The synthetic event the reaper publishes for a saga stuck in
    /// `record.state` beyond the stage timeout.
    pub fn timeout_event_for(record: &SagaRecord) -> Option<EventKind> {
        use CheckoutState as S;

        match record.state {
            // The initiation trigger was lost; re-emitting it is the only
            // way forward since nothing downstream was asked to do anything.
            S::Initiated => Some(EventKind::CheckoutInitiated {
                user_id: record.user_id,
                cart_id: record.cart_id,
                cart_details: record.context.cart_details.clone(),
            }),
            S::InventoryReservationPending => Some(EventKind::InventoryReservationFailed {
                reason: "stage_timeout".to_string(),
            }),
            S::InventoryReserved => Some(EventKind::PricingFailed {
                reason: "stage_timeout".to_string(),
            }),
            S::PaymentProcessingPending => Some(EventKind::PaymentFailed {
                reason: "stage_timeout".to_string(),
            }),
            S::OrderCreationPending => Some(EventKind::OrderCreationFailed {
                reason: "stage_timeout".to_string(),
            }),
            S::CartClearancePending => Some(EventKind::CartClearanceFailed {
                reason: Some("stage_timeout".to_string()),
            }),
            S::Compensating => Some(EventKind::CompensationTimedOut {
                pending: record
                    .context
                    .pending_compensations
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            }),
            _ => None,
        }
    }

    fn on_checkout_initiated(&self, mut next: SagaRecord) -> Result<Transition> {
        let invalid = next
            .context
            .cart_details
            .first_invalid_product_id()
            .map(str::to_string);
        if let Some(bad) = invalid {
            error!(
                saga_id = %next.saga_id,
                product_id = %bad,
                "Invalid product id in cart, failing saga before any command"
            );
            next.set_state(CheckoutState::Failed)?;
            next.context.current_step = "CHECKOUT_INITIATED_VALIDATION_FAILED".to_string();
            next.record_error(
                "checkout_initiated_validation",
                format!("invalid product id: {}", bad),
            );
            return Ok(Transition::applied(next, Vec::new()));
        }

        next.set_state(CheckoutState::InventoryReservationPending)?;
        next.context.current_step = "INVENTORY_RESERVATION_SENT".to_string();

        let command = CommandEnvelope::new(
            next.saga_id,
            CommandKind::ReserveInventory {
                user_id: next.user_id,
                cart_id: next.cart_id,
                items: next.context.cart_details.items.clone(),
            },
        );

        info!(saga_id = %next.saga_id, "Checkout initiated, reserving inventory");
        Ok(Transition::applied(next, vec![command]))
    }

    async fn on_inventory_reserved(&self, mut next: SagaRecord) -> Result<Transition> {
        match self.price(&next).await {
            Err(err) => {
                next.context.pricing_attempts += 1;
                warn!(
                    saga_id = %next.saga_id,
                    attempt = next.context.pricing_attempts,
                    max_attempts = self.pricing_max_attempts,
                    error = %err,
                    "Pricing call failed"
                );

                if next.context.pricing_attempts >= self.pricing_max_attempts {
                    return self.begin_inventory_compensation(next, "pricing", "pricing_exhausted");
                }

                // Leave the event unprocessed: redelivery retries pricing,
                // and the persisted attempt counter bounds the loop.
                next.touch();
                Ok(Transition {
                    record: next,
                    commands: Vec::new(),
                    alerts: Vec::new(),
                    mark_processed: false,
                    requeue: true,
                })
            }
            Ok((discount_cents, tax_cents)) => {
                next.context.discount_cents = Some(discount_cents);
                next.context.tax_cents = Some(tax_cents);

                let final_amount =
                    next.context.cart_details.total_price + tax_cents - discount_cents;
                if final_amount < 0 {
                    return self.begin_inventory_compensation(next, "pricing", "pricing_underflow");
                }
                next.context.final_amount_cents = Some(final_amount);

                next.set_state(CheckoutState::PaymentProcessingPending)?;
                next.context.current_step = "PAYMENT_REQUEST_SENT".to_string();

                let command = CommandEnvelope::new(
                    next.saga_id,
                    CommandKind::ProcessPayment {
                        user_id: next.user_id,
                        amount: final_amount,
                    },
                );

                info!(
                    saga_id = %next.saga_id,
                    amount = final_amount,
                    discount_cents,
                    tax_cents,
                    "Inventory reserved, requesting payment"
                );
                Ok(Transition::applied(next, vec![command]))
            }
        }
    }

    fn on_inventory_reservation_failed(
        &self,
        mut next: SagaRecord,
        reason: &str,
    ) -> Result<Transition> {
        // Nothing was committed downstream yet, so there is nothing to
        // compensate; the inventory service cleans up its own partials.
        next.set_state(CheckoutState::Failed)?;
        next.context.current_step = "INVENTORY_RESERVATION_FAILED".to_string();
        next.record_error("inventory", reason);

        info!(saga_id = %next.saga_id, reason, "Inventory reservation failed, saga failed");
        Ok(Transition::applied(next, Vec::new()))
    }

    fn on_payment_processed(
        &self,
        mut next: SagaRecord,
        payment_details: &serde_json::Value,
    ) -> Result<Transition> {
        next.set_state(CheckoutState::PaymentProcessed)?;
        next.context.payment_details = Some(payment_details.clone());
        next.set_state(CheckoutState::OrderCreationPending)?;
        next.context.current_step = "ORDER_CREATION_SENT".to_string();

        let command = CommandEnvelope::new(
            next.saga_id,
            CommandKind::CreateOrder {
                user_id: next.user_id,
                cart_details: next.context.cart_details.clone(),
                payment_details: payment_details.clone(),
                inventory_reservation_details: next
                    .context
                    .inventory_reservation_details
                    .clone()
                    .unwrap_or(serde_json::Value::Null),
            },
        );

        info!(saga_id = %next.saga_id, "Payment processed, creating order");
        Ok(Transition::applied(next, vec![command]))
    }

    fn on_order_created(
        &self,
        mut next: SagaRecord,
        order_details: &serde_json::Value,
    ) -> Result<Transition> {
        next.set_state(CheckoutState::OrderCreated)?;
        next.context.order_details = Some(order_details.clone());
        next.set_state(CheckoutState::CartClearancePending)?;
        next.context.current_step = "CART_CLEARANCE_SENT".to_string();

        let command = CommandEnvelope::new(
            next.saga_id,
            CommandKind::ClearCart {
                user_id: next.user_id,
                cart_id: next.cart_id,
            },
        );

        info!(saga_id = %next.saga_id, "Order created, clearing cart");
        Ok(Transition::applied(next, vec![command]))
    }

    fn on_order_creation_failed(&self, mut next: SagaRecord, reason: &str) -> Result<Transition> {
        next.set_state(CheckoutState::Compensating)?;
        next.context.current_step = "ORDER_CREATION_FAILED_COMPENSATION_PENDING".to_string();
        next.record_error("order_creation", reason);
        next.context.pending_compensations =
            vec![CompensationStep::Payment, CompensationStep::Inventory];

        // Reverse of the forward dependency order: payment before inventory.
        let commands = vec![
            self.compensate_payment_command(&next),
            self.compensate_inventory_command(&next),
        ];

        warn!(saga_id = %next.saga_id, reason, "Order creation failed, compensating");
        Ok(Transition::applied(next, commands))
    }

    fn on_cart_cleared(&self, mut next: SagaRecord) -> Result<Transition> {
        next.set_state(CheckoutState::Completed)?;
        next.context.current_step = "SAGA_COMPLETED".to_string();

        info!(saga_id = %next.saga_id, "Cart cleared, saga completed");
        Ok(Transition::applied(next, Vec::new()))
    }

    fn on_cart_clearance_failed(
        &self,
        mut next: SagaRecord,
        reason: Option<&str>,
    ) -> Result<Transition> {
        // A completed order is never unwound over a stale cart. Record the
        // failure, terminate, and alert an operator.
        let reason = reason.unwrap_or("unknown").to_string();
        next.set_state(CheckoutState::Failed)?;
        next.context.current_step = "CART_CLEARANCE_FAILED".to_string();
        next.record_error("cart_clearance", reason.clone());

        let alert = EventEnvelope::new(
            next.saga_id,
            EventKind::CheckoutAlert {
                step: "cart_clearance".to_string(),
                reason,
            },
        );

        error!(saga_id = %next.saga_id, "Cart clearance failed after order creation");
        Ok(Transition {
            record: next,
            commands: Vec::new(),
            alerts: vec![alert],
            mark_processed: true,
            requeue: false,
        })
    }

    fn on_compensation_acknowledged(
        &self,
        mut next: SagaRecord,
        step: CompensationStep,
    ) -> Result<Transition> {
        next.context.pending_compensations.retain(|s| *s != step);
        if !next.context.completed_compensations.contains(&step) {
            next.context.completed_compensations.push(step);
        }

        if next.context.pending_compensations.is_empty() {
            next.set_state(CheckoutState::Failed)?;
            next.context.current_step = "COMPENSATION_COMPLETE".to_string();
            info!(saga_id = %next.saga_id, "All compensations acknowledged, saga failed cleanly");
        } else {
            next.touch();
            info!(
                saga_id = %next.saga_id,
                acknowledged = %step,
                pending = next.context.pending_compensations.len(),
                "Compensation acknowledged, others still pending"
            );
        }

        Ok(Transition::applied(next, Vec::new()))
    }

    fn on_compensation_timed_out(
        &self,
        mut next: SagaRecord,
        pending: &[String],
    ) -> Result<Transition> {
        next.set_state(CheckoutState::Failed)?;
        next.context.current_step = "COMPENSATION_TIMED_OUT".to_string();
        next.record_error("compensation", "timeout");

        let alert = EventEnvelope::new(
            next.saga_id,
            EventKind::CheckoutAlert {
                step: "compensation".to_string(),
                reason: format!("unacknowledged compensations: {}", pending.join(", ")),
            },
        );

        error!(
            saga_id = %next.saga_id,
            pending = ?pending,
            "Compensation never acknowledged, saga failed"
        );
        Ok(Transition {
            record: next,
            commands: Vec::new(),
            alerts: vec![alert],
            mark_processed: true,
            requeue: false,
        })
    }

    fn begin_inventory_compensation(
        &self,
        mut next: SagaRecord,
        step: &str,
        reason: &str,
    ) -> Result<Transition> {
        next.set_state(CheckoutState::Compensating)?;
        next.context.current_step =
            format!("{}_FAILED_COMPENSATION_PENDING", step.to_uppercase());
        next.record_error(step, reason);
        next.context.pending_compensations = vec![CompensationStep::Inventory];

        let command = self.compensate_inventory_command(&next);

        warn!(saga_id = %next.saga_id, step, reason, "Compensating inventory reservation");
        Ok(Transition::applied(next, vec![command]))
    }

    fn compensate_inventory_command(&self, record: &SagaRecord) -> CommandEnvelope {
        CommandEnvelope::new(
            record.saga_id,
            CommandKind::CompensateInventory {
                user_id: record.user_id,
                cart_id: record.cart_id,
                items: record.context.cart_details.items.clone(),
                reservation_details: record.context.inventory_reservation_details.clone(),
            },
        )
    }

    fn compensate_payment_command(&self, record: &SagaRecord) -> CommandEnvelope {
        CommandEnvelope::new(
            record.saga_id,
            CommandKind::CompensatePayment {
                user_id: record.user_id,
                amount: record.context.final_amount_cents.unwrap_or(0),
                payment_details: record.context.payment_details.clone(),
            },
        )
    }

    async fn price(&self, record: &SagaRecord) -> std::result::Result<(i64, i64), PricingError> {
        let items = &record.context.cart_details.items;
        let discount = self
            .pricing
            .calculate_discount(record.cart_id, record.user_id, items)
            .await?;
        let tax = self.pricing.calculate_tax(record.cart_id, items).await?;
        Ok((discount, tax))
    }
}
