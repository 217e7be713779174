//! Value types shared by every storefront component.
//!
//! Identifiers, quantities and idempotency tokens are `nutype` newtypes so that
//! an invalid value cannot be constructed in the first place. Money is carried
//! as [`rust_decimal::Decimal`] throughout.

use std::fmt;
use std::str::FromStr;

use nutype::nutype;
use serde::{Deserialize, Serialize};

use crate::errors::CommerceError;

/// Identity of the customer that owns carts, orders and idempotency keys.
///
/// Supplied by the caller for every operation; the engine never reads a
/// request-scoped "current user".
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Serialize,
    Deserialize
))]
pub struct UserId(i64);

/// Catalog category identifier.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Serialize,
    Deserialize
))]
pub struct CategoryId(i64);

/// Catalog product identifier. Also the key of the inventory ledger row.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Serialize,
    Deserialize
))]
pub struct ProductId(i64);

/// Cart identifier.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Serialize,
    Deserialize
))]
pub struct CartId(i64);

/// Cart line identifier.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Serialize,
    Deserialize
))]
pub struct CartItemId(i64);

/// Order identifier.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Serialize,
    Deserialize
))]
pub struct OrderId(i64);

/// Order line identifier.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Serialize,
    Deserialize
))]
pub struct OrderItemId(i64);

/// A strictly positive line quantity.
///
/// Bounded by `i32::MAX` so every quantity fits the integer columns of the
/// relational backend without a lossy conversion.
#[nutype(
    validate(greater = 0, less_or_equal = 2_147_483_647),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct Quantity(u32);

/// Client-supplied token used to de-duplicate order submissions.
///
/// The token is opaque; only surrounding whitespace is trimmed. Keys are
/// scoped per user, so two users may use the same key independently.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Parse the optional header form of a key.
    ///
    /// An empty or whitespace-only token means "no de-duplication requested"
    /// and yields `Ok(None)`.
    pub fn from_header(raw: &str) -> Result<Option<Self>, CommerceError> {
        if raw.trim().is_empty() {
            return Ok(None);
        }

        Self::try_new(raw)
            .map(Some)
            .map_err(|_| CommerceError::InvalidIdempotencyKey)
    }
}

/// Lifecycle state of an order.
///
/// Every status is reachable directly from [`OrderStatus::Pending`]; the
/// table is flat rather than a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Created from a cart, not yet processed.
    Pending,
    /// Accepted for fulfillment.
    Confirmed,
    /// Handed to a carrier.
    Shipped,
    /// Received by the customer.
    Delivered,
    /// Withdrawn; stock has been restored.
    Cancelled,
}

impl OrderStatus {
    /// Every recognized status, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Confirmed,
        Self::Shipped,
        Self::Delivered,
        Self::Cancelled,
    ];

    /// Storage and wire name of the status.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Shipped => "shipped",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
        }
    }

    /// Only pending orders may be cancelled by their owner.
    pub const fn is_cancellable(self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a status name is not one of the five recognized names.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown order status `{0}`")]
pub struct UnknownOrderStatus(pub String);

impl FromStr for OrderStatus {
    type Err = UnknownOrderStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownOrderStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn quantity_accepts_positive_values_within_column_range(n in 1u32..=2_147_483_647) {
            let quantity = Quantity::try_new(n);
            prop_assert!(quantity.is_ok());
            prop_assert_eq!(quantity.unwrap().into_inner(), n);
        }

        #[test]
        fn quantity_rejects_values_beyond_column_range(n in 2_147_483_648u32..) {
            prop_assert!(Quantity::try_new(n).is_err());
        }

        #[test]
        fn idempotency_key_trims_surrounding_whitespace(s in " {0,5}[a-zA-Z0-9_-]{1,200} {0,5}") {
            let key = IdempotencyKey::from_header(&s).unwrap().unwrap();
            prop_assert_eq!(key.as_ref(), s.trim());
        }
    }

    #[test]
    fn quantity_rejects_zero() {
        assert!(Quantity::try_new(0).is_err());
    }

    #[test]
    fn blank_header_means_no_deduplication() {
        assert_eq!(IdempotencyKey::from_header("").unwrap(), None);
        assert_eq!(IdempotencyKey::from_header("   ").unwrap(), None);
    }

    #[test]
    fn oversized_header_is_rejected() {
        let raw = "k".repeat(256);

        let error = IdempotencyKey::from_header(&raw).unwrap_err();

        assert!(matches!(error, CommerceError::InvalidIdempotencyKey));
    }

    #[test]
    fn order_status_round_trips_through_its_storage_name() {
        for status in OrderStatus::ALL {
            assert_eq!(status.as_str().parse::<OrderStatus>(), Ok(status));
        }
    }

    #[test]
    fn order_status_rejects_unknown_names() {
        assert_eq!(
            "refunded".parse::<OrderStatus>(),
            Err(UnknownOrderStatus("refunded".to_string()))
        );
        assert!("Pending".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn only_pending_orders_are_cancellable() {
        let cancellable: Vec<_> = OrderStatus::ALL
            .into_iter()
            .filter(|status| status.is_cancellable())
            .collect();

        assert_eq!(cancellable, vec![OrderStatus::Pending]);
    }

    #[test]
    fn order_status_serializes_lowercase() {
        let json = serde_json::to_string(&OrderStatus::Delivered).unwrap();

        assert_eq!(json, "\"delivered\"");
    }
}
