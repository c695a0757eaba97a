use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cart::{CartDetails, CartItem};
use crate::topics;

/// Events consumed (and, for the synthetic ones, emitted) by the
/// orchestrator. The wire shape is `{"type": "...", ...fields}`; the tag is
/// the contractual event name downstream services publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    CheckoutInitiated {
        user_id: Uuid,
        cart_id: Uuid,
        cart_details: CartDetails,
    },
    InventoryReserved {
        reservation_details: serde_json::Value,
    },
    InventoryReservationFailed {
        reason: String,
    },
    PaymentProcessed {
        payment_details: serde_json::Value,
    },
    PaymentFailed {
        reason: String,
    },
    OrderCreated {
        order_details: serde_json::Value,
    },
    OrderCreationFailed {
        reason: String,
    },
    CartCleared,
    CartClearanceFailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Compensation acknowledgment from the inventory service.
    InventoryReleased {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reservation_details: Option<serde_json::Value>,
    },
    /// Compensation acknowledgment from the payment service.
    PaymentRefunded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payment_details: Option<serde_json::Value>,
    },
    /// Reaper-synthesized: the inline pricing stage never completed.
    PricingFailed {
        reason: String,
    },
    /// Reaper-synthesized: a compensating command was never acknowledged.
    CompensationTimedOut {
        pending: Vec<String>,
    },
    /// Operator alert emitted by the orchestrator itself; it has no
    /// transition row and is dropped when consumed back.
    CheckoutAlert {
        step: String,
        reason: String,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::CheckoutInitiated { .. } => "CheckoutInitiated",
            EventKind::InventoryReserved { .. } => "InventoryReserved",
            EventKind::InventoryReservationFailed { .. } => "InventoryReservationFailed",
            EventKind::PaymentProcessed { .. } => "PaymentProcessed",
            EventKind::PaymentFailed { .. } => "PaymentFailed",
            EventKind::OrderCreated { .. } => "OrderCreated",
            EventKind::OrderCreationFailed { .. } => "OrderCreationFailed",
            EventKind::CartCleared => "CartCleared",
            EventKind::CartClearanceFailed { .. } => "CartClearanceFailed",
            EventKind::InventoryReleased { .. } => "InventoryReleased",
            EventKind::PaymentRefunded { .. } => "PaymentRefunded",
            EventKind::PricingFailed { .. } => "PricingFailed",
            EventKind::CompensationTimedOut { .. } => "CompensationTimedOut",
            EventKind::CheckoutAlert { .. } => "CheckoutAlert",
        }
    }
}

/// Commands the orchestrator publishes to the downstream services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CommandKind {
    ReserveInventory {
        user_id: Uuid,
        cart_id: Uuid,
        items: Vec<CartItem>,
    },
    CompensateInventory {
        user_id: Uuid,
        cart_id: Uuid,
        items: Vec<CartItem>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reservation_details: Option<serde_json::Value>,
    },
    ProcessPayment {
        user_id: Uuid,
        /// Final charge in cents: total_price + tax - discount.
        amount: i64,
    },
    CompensatePayment {
        user_id: Uuid,
        amount: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payment_details: Option<serde_json::Value>,
    },
    CreateOrder {
        user_id: Uuid,
        cart_details: CartDetails,
        payment_details: serde_json::Value,
        inventory_reservation_details: serde_json::Value,
    },
    ClearCart {
        user_id: Uuid,
        cart_id: Uuid,
    },
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::ReserveInventory { .. } => "ReserveInventory",
            CommandKind::CompensateInventory { .. } => "CompensateInventory",
            CommandKind::ProcessPayment { .. } => "ProcessPayment",
            CommandKind::CompensatePayment { .. } => "CompensatePayment",
            CommandKind::CreateOrder { .. } => "CreateOrder",
            CommandKind::ClearCart { .. } => "ClearCart",
        }
    }

    /// The command topic this kind is routed to.
    pub fn topic(&self) -> &'static str {
        match self {
            CommandKind::ReserveInventory { .. } | CommandKind::CompensateInventory { .. } => {
                topics::INVENTORY_COMMAND
            }
            CommandKind::ProcessPayment { .. } | CommandKind::CompensatePayment { .. } => {
                topics::PAYMENT_COMMAND
            }
            CommandKind::CreateOrder { .. } => topics::ORDER_COMMAND,
            CommandKind::ClearCart { .. } => topics::CART_COMMAND,
        }
    }
}

/// Inbound envelope: `{type, saga_id, event_id, ...payload}`.
///
/// `event_id` is assigned by whoever first emits the event and is the unit of
/// idempotency on the consumer side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub saga_id: Uuid,
    pub event_id: Uuid,
    #[serde(flatten)]
    pub event: EventKind,
}

impl EventEnvelope {
    /// Wrap a payload with a freshly generated `event_id`.
    pub fn new(saga_id: Uuid, event: EventKind) -> Self {
        Self {
            saga_id,
            event_id: Uuid::new_v4(),
            event,
        }
    }
}

/// Outbound envelope: events plus `reply_to_topic`, which names where the
/// receiving service must publish its reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub saga_id: Uuid,
    pub event_id: Uuid,
    pub reply_to_topic: String,
    #[serde(flatten)]
    pub command: CommandKind,
}

impl CommandEnvelope {
    /// Wrap a command with a fresh `event_id`, replies routed to the shared
    /// checkout events topic.
    pub fn new(saga_id: Uuid, command: CommandKind) -> Self {
        Self {
            saga_id,
            event_id: Uuid::new_v4(),
            reply_to_topic: topics::CHECKOUT_EVENTS.to_string(),
            command,
        }
    }
}
