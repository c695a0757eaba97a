//! Kafka topic names shared with the downstream services. These are
//! contractual: renaming one breaks every service on the bus.

pub const CHECKOUT_INITIATED: &str = "checkout.checkout-initiated";
pub const INVENTORY_COMMAND: &str = "checkout.inventory-command";
pub const PAYMENT_COMMAND: &str = "checkout.payment-command";
pub const ORDER_COMMAND: &str = "checkout.order-command";
pub const CART_COMMAND: &str = "checkout.cart-command";
pub const CHECKOUT_EVENTS: &str = "checkout.checkout-events";

/// Topics the orchestrator consumes from.
pub const CONSUMED: &[&str] = &[CHECKOUT_INITIATED, CHECKOUT_EVENTS];
