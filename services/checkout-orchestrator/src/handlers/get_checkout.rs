use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use domain::cart::is_valid_uuid_v4;
use saga::{CheckoutState, StoreError};

use super::ErrorResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct CheckoutStatusResponse {
    pub checkout_id: Uuid,
    pub state: String,
    pub message: String,
}

/// Query the state of a checkout saga.
pub async fn handle(
    State(state): State<AppState>,
    Path(checkout_id): Path<String>,
) -> Result<Json<CheckoutStatusResponse>, (StatusCode, Json<ErrorResponse>)> {
    if !is_valid_uuid_v4(&checkout_id) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::validation(format!(
                "Invalid checkout_id: {}",
                checkout_id
            ))),
        ));
    }
    let checkout_id = Uuid::parse_str(&checkout_id).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::validation("Invalid checkout_id")),
        )
    })?;

    match state.coordinator.status(checkout_id).await {
        Ok(record) => {
            info!(checkout_id = %checkout_id, state = %record.state, "Checkout status read");
            Ok(Json(CheckoutStatusResponse {
                checkout_id,
                state: record.state.to_string(),
                message: status_message(record.state).to_string(),
            }))
        }
        Err(StoreError::NotFound(_)) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::validation(format!(
                "Checkout not found: {}",
                checkout_id
            ))),
        )),
        Err(e) => {
            let correlation_id = Uuid::new_v4();
            error!(
                correlation_id = %correlation_id,
                checkout_id = %checkout_id,
                error = %e,
                "Failed to read checkout status"
            );
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::internal(correlation_id)),
            ))
        }
    }
}

fn status_message(state: CheckoutState) -> &'static str {
    match state {
        CheckoutState::Completed => "Checkout completed successfully",
        CheckoutState::Failed => "Checkout failed",
        CheckoutState::Compensating => "Checkout failed, rollback in progress",
        _ => "Checkout in progress",
    }
}
