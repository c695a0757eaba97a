use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use domain::cart::CartDetails;

use crate::errors::{Result, SagaError};

/// States of a checkout saga.
///
/// `InventoryReserved`, `PaymentProcessed` and `OrderCreated` are transient:
/// the engine normally passes through them within one handler. Only
/// `InventoryReserved` is ever persisted, when the inline pricing step is
/// awaiting a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckoutState {
    Initiated,
    InventoryReservationPending,
    InventoryReserved,
    PaymentProcessingPending,
    PaymentProcessed,
    OrderCreationPending,
    OrderCreated,
    CartClearancePending,
    Completed,
    Failed,
    Compensating,
}

impl CheckoutState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CheckoutState::Completed | CheckoutState::Failed)
    }

    /// Whether `self → to` is an edge of the saga state graph. Any move not
    /// admitted here is a bug and must be refused.
    pub fn can_transition(self, to: CheckoutState) -> bool {
        use CheckoutState::*;

        if self.is_terminal() {
            return false;
        }
        if self == to {
            // Re-entering the same state (pricing retry bookkeeping).
            return true;
        }
        match (self, to) {
            // Any non-terminal state may fail or start compensating.
            (_, Failed) | (_, Compensating) => true,
            // Forward path.
            (Initiated, InventoryReservationPending) => true,
            (InventoryReservationPending, InventoryReserved) => true,
            (InventoryReserved, PaymentProcessingPending) => true,
            (PaymentProcessingPending, PaymentProcessed) => true,
            (PaymentProcessed, OrderCreationPending) => true,
            (OrderCreationPending, OrderCreated) => true,
            (OrderCreated, CartClearancePending) => true,
            (CartClearancePending, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CheckoutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckoutState::Initiated => "INITIATED",
            CheckoutState::InventoryReservationPending => "INVENTORY_RESERVATION_PENDING",
            CheckoutState::InventoryReserved => "INVENTORY_RESERVED",
            CheckoutState::PaymentProcessingPending => "PAYMENT_PROCESSING_PENDING",
            CheckoutState::PaymentProcessed => "PAYMENT_PROCESSED",
            CheckoutState::OrderCreationPending => "ORDER_CREATION_PENDING",
            CheckoutState::OrderCreated => "ORDER_CREATED",
            CheckoutState::CartClearancePending => "CART_CLEARANCE_PENDING",
            CheckoutState::Completed => "COMPLETED",
            CheckoutState::Failed => "FAILED",
            CheckoutState::Compensating => "COMPENSATING",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for CheckoutState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "INITIATED" => Ok(CheckoutState::Initiated),
            "INVENTORY_RESERVATION_PENDING" => Ok(CheckoutState::InventoryReservationPending),
            "INVENTORY_RESERVED" => Ok(CheckoutState::InventoryReserved),
            "PAYMENT_PROCESSING_PENDING" => Ok(CheckoutState::PaymentProcessingPending),
            "PAYMENT_PROCESSED" => Ok(CheckoutState::PaymentProcessed),
            "ORDER_CREATION_PENDING" => Ok(CheckoutState::OrderCreationPending),
            "ORDER_CREATED" => Ok(CheckoutState::OrderCreated),
            "CART_CLEARANCE_PENDING" => Ok(CheckoutState::CartClearancePending),
            "COMPLETED" => Ok(CheckoutState::Completed),
            "FAILED" => Ok(CheckoutState::Failed),
            "COMPENSATING" => Ok(CheckoutState::Compensating),
            other => Err(format!("unknown saga state: {}", other)),
        }
    }
}

/// A forward step that has a compensating transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStep {
    Inventory,
    Payment,
}

impl fmt::Display for CompensationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompensationStep::Inventory => write!(f, "inventory"),
            CompensationStep::Payment => write!(f, "payment"),
        }
    }
}

/// One entry of the append-only error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub step: String,
    pub reason: String,
}

/// Derived data gathered through the saga's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaContext {
    pub cart_details: CartDetails,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory_reservation_details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount_cents: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_cents: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_amount_cents: Option<i64>,
    /// Advisory progress marker, for humans reading the record.
    pub current_step: String,
    #[serde(default)]
    pub pricing_attempts: u32,
    /// Compensating commands awaiting their acknowledgment event.
    #[serde(default)]
    pub pending_compensations: Vec<CompensationStep>,
    /// Compensations confirmed by the owning service.
    #[serde(default)]
    pub completed_compensations: Vec<CompensationStep>,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
}

impl SagaContext {
    pub fn new(cart_details: CartDetails) -> Self {
        Self {
            cart_details,
            inventory_reservation_details: None,
            payment_details: None,
            order_details: None,
            discount_cents: None,
            tax_cents: None,
            final_amount_cents: None,
            current_step: "CHECKOUT_INITIATED".to_string(),
            pricing_attempts: 0,
            pending_compensations: Vec::new(),
            completed_compensations: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// The durable saga record. Mutated only through the engine/coordinator;
/// never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    pub saga_id: Uuid,
    pub user_id: Uuid,
    pub cart_id: Uuid,
    pub state: CheckoutState,
    pub context: SagaContext,
    /// Event ids already consumed; the dedup log for at-least-once delivery.
    pub processed_event_ids: BTreeSet<Uuid>,
    /// Conditional-update fence, incremented on every write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaRecord {
    pub fn new(user_id: Uuid, cart_id: Uuid, cart_details: CartDetails) -> Self {
        let now = Utc::now();
        Self {
            saga_id: Uuid::new_v4(),
            user_id,
            cart_id,
            state: CheckoutState::Initiated,
            context: SagaContext::new(cart_details),
            processed_event_ids: BTreeSet::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to `next`, refusing any transition outside the state graph.
    pub fn set_state(&mut self, next: CheckoutState) -> Result<()> {
        if !self.state.can_transition(next) {
            return Err(SagaError::InvalidStateTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.touch();
        Ok(())
    }

    /// Append to the error log (append-only; entries are never rewritten).
    pub fn record_error(&mut self, step: &str, reason: impl Into<String>) {
        self.context.errors.push(ErrorEntry {
            step: step.to_string(),
            reason: reason.into(),
        });
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::cart::CartItem;

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

    #[test]
    fn test_new_record() {
        let user_id = Uuid::new_v4();
        let cart_id = Uuid::new_v4();
        let record = SagaRecord::new(user_id, cart_id, cart());

        assert_eq!(record.state, CheckoutState::Initiated);
        assert_eq!(record.user_id, user_id);
        assert_eq!(record.cart_id, cart_id);
        assert_eq!(record.version, 1);
        assert!(record.processed_event_ids.is_empty());
        assert!(record.context.errors.is_empty());
    }

    #[test]
    fn test_forward_transitions_admitted() {
        use CheckoutState::*;
        let forward = [
            (Initiated, InventoryReservationPending),
            (InventoryReservationPending, InventoryReserved),
            (InventoryReserved, PaymentProcessingPending),
            (PaymentProcessingPending, PaymentProcessed),
            (PaymentProcessed, OrderCreationPending),
            (OrderCreationPending, OrderCreated),
            (OrderCreated, CartClearancePending),
            (CartClearancePending, Completed),
        ];
        for (from, to) in forward {
            assert!(from.can_transition(to), "{} -> {} must be admitted", from, to);
        }
    }

    #[test]
    fn test_backward_transitions_refused() {
        use CheckoutState::*;
        assert!(!PaymentProcessingPending.can_transition(InventoryReservationPending));
        assert!(!CartClearancePending.can_transition(OrderCreationPending));
        assert!(!Initiated.can_transition(Completed));
    }

    #[test]
    fn test_terminal_states_are_frozen() {
        use CheckoutState::*;
        for terminal in [Completed, Failed] {
            assert!(terminal.is_terminal());
            for to in [
                Initiated,
                InventoryReservationPending,
                Compensating,
                Failed,
                Completed,
            ] {
                assert!(!terminal.can_transition(to));
            }
        }
    }

    #[test]
    fn test_any_nonterminal_may_fail_or_compensate() {
        use CheckoutState::*;
        for from in [
            Initiated,
            InventoryReservationPending,
            InventoryReserved,
            PaymentProcessingPending,
            OrderCreationPending,
            CartClearancePending,
        ] {
            assert!(from.can_transition(Failed));
            assert!(from.can_transition(Compensating));
        }
        assert!(Compensating.can_transition(Failed));
    }

    #[test]
    fn test_set_state_refuses_illegal_move() {
        let mut record = SagaRecord::new(Uuid::new_v4(), Uuid::new_v4(), cart());
        let err = record.set_state(CheckoutState::Completed).unwrap_err();
        assert!(matches!(err, SagaError::InvalidStateTransition { .. }));
        assert_eq!(record.state, CheckoutState::Initiated);
    }

    #[test]
    fn test_state_round_trips_through_display() {
        use CheckoutState::*;
        for state in [
            Initiated,
            InventoryReservationPending,
            InventoryReserved,
            PaymentProcessingPending,
            PaymentProcessed,
            OrderCreationPending,
            OrderCreated,
            CartClearancePending,
            Completed,
            Failed,
            Compensating,
        ] {
            let parsed: CheckoutState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn test_state_serde_matches_display() {
        let json = serde_json::to_string(&CheckoutState::PaymentProcessingPending).unwrap();
        assert_eq!(json, "\"PAYMENT_PROCESSING_PENDING\"");
    }

    #[test]
    fn test_error_log_is_appended() {
        let mut record = SagaRecord::new(Uuid::new_v4(), Uuid::new_v4(), cart());
        record.record_error("inventory", "oos");
        record.record_error("payment", "declined");

        assert_eq!(record.context.errors.len(), 2);
        assert_eq!(record.context.errors[0].step, "inventory");
        assert_eq!(record.context.errors[1].reason, "declined");
    }
}
