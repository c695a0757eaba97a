use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use common::metrics;
use domain::cart::CartItem;

#[derive(Debug, Error)]
pub enum PricingError {
    #[error("Failed to build pricing HTTP client: {0}")]
    ClientCreation(String),

    #[error("{service} request failed: {source}")]
    Request {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{service} returned status {status}")]
    Status {
        service: &'static str,
        status: u16,
    },

    #[error("{service} returned a malformed response: {reason}")]
    MalformedResponse {
        service: &'static str,
        reason: String,
    },
}

/// Synchronous pricing RPCs, called inline while handling `InventoryReserved`.
/// Every failure is transient from the saga's point of view: the caller
/// retries via redelivery.
#[async_trait]
pub trait PricingApi: Send + Sync {
    /// Total discount in cents for the cart.
    async fn calculate_discount(
        &self,
        cart_id: Uuid,
        user_id: Uuid,
        items: &[CartItem],
    ) -> Result<i64, PricingError>;

    /// Total tax in cents for the cart.
    async fn calculate_tax(&self, cart_id: Uuid, items: &[CartItem])
        -> Result<i64, PricingError>;
}

#[derive(Debug, Serialize)]
struct DiscountRequest<'a> {
    #[serde(rename = "cartId")]
    cart_id: Uuid,
    user_id: Uuid,
    items: &'a [CartItem],
}

#[derive(Debug, Deserialize)]
struct DiscountResponse {
    #[serde(rename = "totalDiscountCents")]
    total_discount_cents: i64,
}

#[derive(Debug, Serialize)]
struct TaxRequest<'a> {
    #[serde(rename = "cartId")]
    cart_id: Uuid,
    items: &'a [CartItem],
}

#[derive(Debug, Deserialize)]
struct TaxResponse {
    #[serde(rename = "taxCents")]
    tax_cents: i64,
}

/// HTTP client against the discount and tax engines.
pub struct PricingClient {
    client: reqwest::Client,
    discount_endpoint: String,
    tax_endpoint: String,
}

impl PricingClient {
    pub fn new(discount_base_url: &str, tax_base_url: &str) -> Result<Self, PricingError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PricingError::ClientCreation(e.to_string()))?;

        Ok(Self {
            client,
            discount_endpoint: format!(
                "{}/api/discounts/calculate",
                discount_base_url.trim_end_matches('/')
            ),
            tax_endpoint: format!("{}/api/tax/calculate", tax_base_url.trim_end_matches('/')),
        })
    }

    async fn post_cents<Req, Resp>(
        &self,
        service: &'static str,
        endpoint: &str,
        request: &Req,
        extract: impl FnOnce(Resp) -> i64,
    ) -> Result<i64, PricingError>
    where
        Req: Serialize + Sync,
        Resp: for<'de> Deserialize<'de>,
    {
        let start = Instant::now();
        let result = self.post_cents_inner(service, endpoint, request, extract).await;
        metrics::record_pricing(service, result.is_ok(), start.elapsed().as_secs_f64());
        result
    }

    async fn post_cents_inner<Req, Resp>(
        &self,
        service: &'static str,
        endpoint: &str,
        request: &Req,
        extract: impl FnOnce(Resp) -> i64,
    ) -> Result<i64, PricingError>
    where
        Req: Serialize + Sync,
        Resp: for<'de> Deserialize<'de>,
    {
        let response = self
            .client
            .post(endpoint)
            .json(request)
            .send()
            .await
            .map_err(|source| PricingError::Request { service, source })?;

        let status = response.status();
        if !status.is_success() {
            warn!(service = service, status = %status, "Pricing RPC returned non-2xx");
            return Err(PricingError::Status {
                service,
                status: status.as_u16(),
            });
        }

        let parsed: Resp =
            response
                .json()
                .await
                .map_err(|e| PricingError::MalformedResponse {
                    service,
                    reason: e.to_string(),
                })?;

        let cents = extract(parsed);
        if cents < 0 {
            return Err(PricingError::MalformedResponse {
                service,
                reason: format!("negative amount: {}", cents),
            });
        }

        debug!(service = service, cents = cents, "Pricing RPC succeeded");
        Ok(cents)
    }
}

#[async_trait]
impl PricingApi for PricingClient {
    async fn calculate_discount(
        &self,
        cart_id: Uuid,
        user_id: Uuid,
        items: &[CartItem],
    ) -> Result<i64, PricingError> {
        let request = DiscountRequest {
            cart_id,
            user_id,
            items,
        };
        self.post_cents(
            "discount-engine",
            &self.discount_endpoint,
            &request,
            |r: DiscountResponse| r.total_discount_cents,
        )
        .await
    }

    async fn calculate_tax(
        &self,
        cart_id: Uuid,
        items: &[CartItem],
    ) -> Result<i64, PricingError> {
        let request = TaxRequest { cart_id, items };
        self.post_cents(
            "tax-engine",
            &self.tax_endpoint,
            &request,
            |r: TaxResponse| r.tax_cents,
        )
        .await
    }
}
