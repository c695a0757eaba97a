pub mod get_checkout;
pub mod health;
pub mod initiate_checkout;

use serde::Serialize;
use uuid::Uuid;

/// Error body returned by every handler. `correlation_id` ties the response
/// to the log line carrying the underlying cause.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl ErrorResponse {
    pub fn validation(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            correlation_id: None,
        }
    }

    pub fn internal(correlation_id: Uuid) -> Self {
        Self {
            error: "Internal error".to_string(),
            correlation_id: Some(correlation_id),
        }
    }
}
