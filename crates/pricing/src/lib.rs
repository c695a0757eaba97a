pub mod client;

pub use client::{PricingApi, PricingClient, PricingError};
