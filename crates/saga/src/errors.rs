use thiserror::Error;

use crate::repository::StoreError;
use crate::state::CheckoutState;

#[derive(Debug, Error)]
pub enum SagaError {
    #[error("Invalid saga state transition from {from} to {to}")]
    InvalidStateTransition {
        from: CheckoutState,
        to: CheckoutState,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Publish error: {0}")]
    Publish(#[from] messaging::PublishError),

    #[error("Codec error: {0}")]
    Codec(#[from] domain::CodecError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SagaError>;
