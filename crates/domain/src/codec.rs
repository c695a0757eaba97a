use serde::Serialize;
use thiserror::Error;
use uuid::{Uuid, Version};

use crate::envelope::{CommandEnvelope, EventEnvelope};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Payload is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Envelope is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Field '{field}' is not a version-4 UUID: {value}")]
    InvalidUuid { field: &'static str, value: String },

    #[error("Unknown event type '{0}'")]
    UnknownType(String),
}

const KNOWN_EVENT_TYPES: &[&str] = &[
    "CheckoutInitiated",
    "InventoryReserved",
    "InventoryReservationFailed",
    "PaymentProcessed",
    "PaymentFailed",
    "OrderCreated",
    "OrderCreationFailed",
    "CartCleared",
    "CartClearanceFailed",
    "InventoryReleased",
    "PaymentRefunded",
    "PricingFailed",
    "CompensationTimedOut",
    "CheckoutAlert",
];

/// Decode an opaque bus payload into a typed event envelope.
///
/// Rejects payloads whose `saga_id`/`event_id` are not version-4 UUIDs or
/// whose `type` tag is not one of the contractual event names.
pub fn decode_event(payload: &[u8]) -> Result<EventEnvelope, CodecError> {
    let value: serde_json::Value = serde_json::from_slice(payload)?;

    require_uuid_v4(&value, "saga_id")?;
    require_uuid_v4(&value, "event_id")?;

    let event_type = value
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or(CodecError::MissingField("type"))?;
    if !KNOWN_EVENT_TYPES.contains(&event_type) {
        return Err(CodecError::UnknownType(event_type.to_string()));
    }

    Ok(serde_json::from_value(value)?)
}

/// Encode an event envelope deterministically.
///
/// Serialization goes through `serde_json::Value`, whose object
/// representation is key-sorted, so equal envelopes always produce equal
/// bytes.
pub fn encode_event(envelope: &EventEnvelope) -> Result<Vec<u8>, CodecError> {
    encode(envelope)
}

/// Encode an outbound command envelope deterministically.
pub fn encode_command(envelope: &CommandEnvelope) -> Result<Vec<u8>, CodecError> {
    encode(envelope)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

fn require_uuid_v4(value: &serde_json::Value, field: &'static str) -> Result<Uuid, CodecError> {
    let raw = value
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or(CodecError::MissingField(field))?;

    match Uuid::parse_str(raw) {
        Ok(id) if id.get_version() == Some(Version::Random) => Ok(id),
        _ => Err(CodecError::InvalidUuid {
            field,
            value: raw.to_string(),
        }),
    }
}
