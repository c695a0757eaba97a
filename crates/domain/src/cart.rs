use serde::{Deserialize, Serialize};
use uuid::{Uuid, Version};

/// A single line in the cart snapshot carried through the saga.
///
/// `product_id` stays a string until validated: carts arrive from the outside
/// world and a malformed id must be representable long enough to reject it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub product_id: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

/// Cart snapshot taken at checkout initiation. Prices are integer cents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartDetails {
    pub items: Vec<CartItem>,
    pub total_price: i64,
}

impl CartDetails {
    /// Returns the first product id that is not a version-4 UUID, if any.
    pub fn first_invalid_product_id(&self) -> Option<&str> {
        self.items
            .iter()
            .map(|item| item.product_id.as_str())
            .find(|id| !is_valid_uuid_v4(id))
    }
}

/// Strict version-4 UUID check used for every externally supplied identifier.
pub fn is_valid_uuid_v4(value: &str) -> bool {
    matches!(
        Uuid::parse_str(value).map(|u| u.get_version()),
        Ok(Some(Version::Random))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_v4_uuid_accepted() {
        assert!(is_valid_uuid_v4(&Uuid::new_v4().to_string()));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(!is_valid_uuid_v4("not-a-uuid"));
        assert!(!is_valid_uuid_v4(""));
    }

    #[test]
    fn test_non_v4_uuid_rejected() {
        // Version-1 style UUID: valid syntax, wrong version.
        assert!(!is_valid_uuid_v4("c232ab00-9414-11ec-b3c8-9f6bdeced846"));
    }

    #[test]
    fn test_first_invalid_product_id() {
        let cart = CartDetails {
            items: vec![
                CartItem {
                    product_id: Uuid::new_v4().to_string(),
                    quantity: 1,
                    unit_price_cents: 500,
                },
                CartItem {
                    product_id: "bogus".to_string(),
                    quantity: 2,
                    unit_price_cents: 250,
                },
            ],
            total_price: 1000,
        };

        assert_eq!(cart.first_invalid_product_id(), Some("bogus"));
    }

    #[test]
    fn test_all_valid_product_ids() {
        let cart = CartDetails {
            items: vec![CartItem {
                product_id: Uuid::new_v4().to_string(),
                quantity: 1,
                unit_price_cents: 100,
            }],
            total_price: 100,
        };

        assert!(cart.first_invalid_product_id().is_none());
    }
}
