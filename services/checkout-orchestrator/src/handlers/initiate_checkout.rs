use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use domain::cart::{is_valid_uuid_v4, CartDetails, CartItem};

use super::ErrorResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct CheckoutRequest {
    #[validate(custom(function = validate_uuid_v4))]
    pub user_id: String,
    #[validate(custom(function = validate_uuid_v4))]
    pub cart_id: String,
    #[validate(nested)]
    pub cart_details: CartDetailsRequest,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CartDetailsRequest {
    #[validate(length(min = 1, message = "cart must not be empty"), nested)]
    pub items: Vec<CartItemRequest>,
    #[validate(range(min = 0))]
    pub total_price: i64,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct CartItemRequest {
    #[validate(custom(function = validate_uuid_v4))]
    pub product_id: String,
    #[validate(range(min = 1))]
    pub quantity: u32,
    #[validate(range(min = 0))]
    pub unit_price_cents: i64,
}

fn validate_uuid_v4(value: &str) -> Result<(), ValidationError> {
    if is_valid_uuid_v4(value) {
        Ok(())
    } else {
        Err(ValidationError::new("uuid_v4"))
    }
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub checkout_id: Uuid,
    pub message: String,
}

/// Initiate a checkout saga: validate, create the record, publish the
/// trigger event.
pub async fn handle(
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<CheckoutResponse>), (StatusCode, Json<ErrorResponse>)> {
    if let Err(e) = request.validate() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::validation(format!("Validation error: {}", e))),
        ));
    }

    // The derive above guarantees these parse.
    let user_id = parse_uuid(&request.user_id)?;
    let cart_id = parse_uuid(&request.cart_id)?;

    let cart_details = CartDetails {
        items: request
            .cart_details
            .items
            .into_iter()
            .map(|item| CartItem {
                product_id: item.product_id,
                quantity: item.quantity,
                unit_price_cents: item.unit_price_cents,
            })
            .collect(),
        total_price: request.cart_details.total_price,
    };

    match state
        .coordinator
        .start_checkout(user_id, cart_id, cart_details)
        .await
    {
        Ok(checkout_id) => {
            info!(checkout_id = %checkout_id, "Checkout accepted");
            Ok((
                StatusCode::CREATED,
                Json(CheckoutResponse {
                    checkout_id,
                    message: "Checkout initiated".to_string(),
                }),
            ))
        }
        Err(e) => {
            let correlation_id = Uuid::new_v4();
            error!(
                correlation_id = %correlation_id,
                user_id = %user_id,
                cart_id = %cart_id,
                error = %e,
                "Failed to initiate checkout"
            );
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::internal(correlation_id)),
            ))
        }
    }
}

fn parse_uuid(value: &str) -> Result<Uuid, (StatusCode, Json<ErrorResponse>)> {
    Uuid::parse_str(value).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::validation(format!(
                "Invalid UUID: {}",
                value
            ))),
        )
    })
}
