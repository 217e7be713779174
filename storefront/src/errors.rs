//! Error types for the storefront core.
//!
//! Errors are split by layer:
//!
//! - **StoreError**: failures surfaced by the transactional data-access facade
//! - **CommerceError**: domain failures returned by the cart and order services
//!
//! Services convert `StoreError` into `CommerceError::Storage` with `?`, except
//! where a specific store failure carries domain meaning (a unique-constraint
//! conflict on the idempotency key becomes `DuplicateOrder`, for example).

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::types::{CartItemId, OrderId, OrderStatus, ProductId, UserId};

/// Identifies the facade operation that failed.
///
/// Used by [`StoreError`] so infrastructure failures name the operation
/// without leaking backend-specific detail to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Opening a transaction.
    BeginTransaction,
    /// Committing a transaction.
    CommitTransaction,
    /// Rolling a transaction back.
    RollbackTransaction,
    /// Inserting a catalog category.
    InsertCategory,
    /// Inserting a catalog product.
    InsertProduct,
    /// Reading products by identifier.
    ReadProducts,
    /// Batched lock-and-fetch of product rows.
    LockProducts,
    /// Writing a product's stock counter.
    UpdateProductStock,
    /// Reading categories by identifier.
    ReadCategories,
    /// Reading a user's active cart.
    ReadCart,
    /// Creating a cart.
    InsertCart,
    /// Bumping a cart's `updated_at`.
    TouchCart,
    /// Reading cart lines.
    ReadCartItems,
    /// Inserting a cart line.
    InsertCartItem,
    /// Un-deleting a soft-deleted cart line.
    RestoreCartItem,
    /// Changing a cart line's quantity.
    UpdateCartItem,
    /// Soft-deleting cart lines.
    DeleteCartItems,
    /// Inserting an order header.
    InsertOrder,
    /// Inserting an order line.
    InsertOrderItem,
    /// Reading orders.
    ReadOrders,
    /// Locking an order row for update.
    LockOrder,
    /// Writing an order's status.
    UpdateOrderStatus,
    /// Reading order lines.
    ReadOrderItems,
    /// Counting a user's orders.
    CountOrders,
    /// Reading an idempotency entry.
    ReadIdempotencyKey,
    /// Recording an idempotency entry.
    InsertIdempotencyKey,
    /// Linking an idempotency entry to its order.
    ResolveIdempotencyKey,
    /// Removing a pending idempotency entry.
    DeleteIdempotencyKey,
}

impl Operation {
    /// Every facade operation, in declaration order.
    pub const ALL: [Self; 28] = [
        Self::BeginTransaction,
        Self::CommitTransaction,
        Self::RollbackTransaction,
        Self::InsertCategory,
        Self::InsertProduct,
        Self::ReadProducts,
        Self::LockProducts,
        Self::UpdateProductStock,
        Self::ReadCategories,
        Self::ReadCart,
        Self::InsertCart,
        Self::TouchCart,
        Self::ReadCartItems,
        Self::InsertCartItem,
        Self::RestoreCartItem,
        Self::UpdateCartItem,
        Self::DeleteCartItems,
        Self::InsertOrder,
        Self::InsertOrderItem,
        Self::ReadOrders,
        Self::LockOrder,
        Self::UpdateOrderStatus,
        Self::ReadOrderItems,
        Self::CountOrders,
        Self::ReadIdempotencyKey,
        Self::InsertIdempotencyKey,
        Self::ResolveIdempotencyKey,
        Self::DeleteIdempotencyKey,
    ];

    /// Snake-case name used in logs and error messages.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BeginTransaction => "begin_transaction",
            Self::CommitTransaction => "commit_transaction",
            Self::RollbackTransaction => "rollback_transaction",
            Self::InsertCategory => "insert_category",
            Self::InsertProduct => "insert_product",
            Self::ReadProducts => "read_products",
            Self::LockProducts => "lock_products",
            Self::UpdateProductStock => "update_product_stock",
            Self::ReadCategories => "read_categories",
            Self::ReadCart => "read_cart",
            Self::InsertCart => "insert_cart",
            Self::TouchCart => "touch_cart",
            Self::ReadCartItems => "read_cart_items",
            Self::InsertCartItem => "insert_cart_item",
            Self::RestoreCartItem => "restore_cart_item",
            Self::UpdateCartItem => "update_cart_item",
            Self::DeleteCartItems => "delete_cart_items",
            Self::InsertOrder => "insert_order",
            Self::InsertOrderItem => "insert_order_item",
            Self::ReadOrders => "read_orders",
            Self::LockOrder => "lock_order",
            Self::UpdateOrderStatus => "update_order_status",
            Self::ReadOrderItems => "read_order_items",
            Self::CountOrders => "count_orders",
            Self::ReadIdempotencyKey => "read_idempotency_key",
            Self::InsertIdempotencyKey => "insert_idempotency_key",
            Self::ResolveIdempotencyKey => "resolve_idempotency_key",
            Self::DeleteIdempotencyKey => "delete_idempotency_key",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniqueness rules enforced by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Constraint {
    /// At most one non-deleted cart per user.
    ActiveCartPerUser,
    /// At most one non-deleted cart line per (cart, product).
    ActiveCartItemPerProduct,
    /// At most one idempotency entry per (user, key).
    IdempotencyKeyPerUser,
    /// Product SKUs are unique across the catalog.
    ProductSku,
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ActiveCartPerUser => "active_cart_per_user",
            Self::ActiveCartItemPerProduct => "active_cart_item_per_product",
            Self::IdempotencyKeyPerUser => "idempotency_key_per_user",
            Self::ProductSku => "product_sku",
        };
        f.write_str(name)
    }
}

/// Error type returned by the transactional data-access facade.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A write would violate one of the backend's uniqueness rules.
    #[error("unique constraint {constraint} violated")]
    UniqueViolation {
        /// The rule that rejected the write.
        constraint: Constraint,
    },

    /// A write targeted a row that does not exist (or is soft-deleted).
    #[error("{operation} found no matching row")]
    MissingRow {
        /// The operation that expected the row.
        operation: Operation,
    },

    /// A value could not be represented by the backend's column type.
    #[error("{operation} produced a value outside the storable range")]
    ValueOutOfRange {
        /// The operation that produced the value.
        operation: Operation,
    },

    /// Infrastructure failure surfaced by the backing store.
    ///
    /// `detail` keeps the driver's description of the cause for diagnostics.
    /// It is left out of the message so callers never see backend internals.
    #[error("{operation} operation failed")]
    StoreFailure {
        /// The operation that failed.
        operation: Operation,
        /// Backend description of the underlying cause.
        detail: String,
    },
}

impl StoreError {
    /// The constraint named by a `UniqueViolation`, if this is one.
    pub const fn violated_constraint(&self) -> Option<Constraint> {
        match self {
            Self::UniqueViolation { constraint } => Some(*constraint),
            _ => None,
        }
    }

    /// The operation named by a `StoreFailure`, if this is one.
    pub const fn failed_operation(&self) -> Option<Operation> {
        match self {
            Self::StoreFailure { operation, .. } => Some(*operation),
            _ => None,
        }
    }
}

/// How a transport layer should present a [`CommerceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The client can fix the request (empty cart, not enough stock).
    ClientCorrectable,
    /// The addressed entity does not exist for this caller.
    NotFound,
    /// The entity exists but belongs to someone else.
    Forbidden,
    /// A concurrent request holds the resource; retry later.
    Conflict,
    /// Unexpected persistence failure.
    Internal,
}

impl ErrorClass {
    /// HTTP-style status code for the class.
    pub const fn status_code(self) -> u16 {
        match self {
            Self::ClientCorrectable => 400,
            Self::NotFound => 404,
            Self::Forbidden => 403,
            Self::Conflict => 409,
            Self::Internal => 500,
        }
    }
}

/// Errors returned by the cart and order services.
///
/// # Error Handling Strategy
///
/// - **InsufficientStock / EmptyCart**: show to the user, they can fix it
/// - **\*NotFound**: the entity is gone or never existed for this caller
/// - **UnauthorizedOrder**: the order exists but is someone else's
/// - **DuplicateOrder**: a submission with the same key is in flight; wait, then retry with the same key
/// - **Storage**: log and investigate
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommerceError {
    /// The referenced product does not exist.
    #[error("product {0} not found")]
    ProductNotFound(ProductId),

    /// The product cannot cover the requested quantity.
    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        /// Product that ran short.
        product_id: ProductId,
        /// Quantity the operation needed.
        requested: u64,
        /// Stock observed when the check ran.
        available: u32,
    },

    /// The user has no active cart.
    #[error("no active cart for user {0}")]
    CartNotFound(UserId),

    /// The cart line does not exist in the caller's own cart.
    #[error("cart item {0} not found")]
    CartItemNotFound(CartItemId),

    /// The user's cart has no active lines.
    #[error("cart for user {0} is empty")]
    EmptyCart(UserId),

    /// The order does not exist.
    #[error("order {0} not found")]
    OrderNotFound(OrderId),

    /// The order belongs to another user.
    #[error("order {0} belongs to another user")]
    UnauthorizedOrder(OrderId),

    /// Only pending orders may be cancelled.
    #[error("order {order_id} cannot be cancelled while {status}")]
    OrderNotCancellable {
        /// The order that was addressed.
        order_id: OrderId,
        /// Its status at the time of the attempt.
        status: OrderStatus,
    },

    /// A submission with the same idempotency key is already in flight.
    #[error("an order with this idempotency key is already being processed")]
    DuplicateOrder,

    /// The requested status is not one of the recognized names.
    #[error("invalid order status `{0}`")]
    InvalidOrderStatus(String),

    /// The idempotency token is longer than 255 characters.
    #[error("invalid idempotency key")]
    InvalidIdempotencyKey,

    /// Unexpected persistence failure.
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

impl CommerceError {
    /// Presentation class for the transport layer.
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::InsufficientStock { .. }
            | Self::EmptyCart(_)
            | Self::OrderNotCancellable { .. }
            | Self::InvalidOrderStatus(_)
            | Self::InvalidIdempotencyKey => ErrorClass::ClientCorrectable,
            Self::ProductNotFound(_)
            | Self::CartNotFound(_)
            | Self::CartItemNotFound(_)
            | Self::OrderNotFound(_) => ErrorClass::NotFound,
            Self::UnauthorizedOrder(_) => ErrorClass::Forbidden,
            Self::DuplicateOrder => ErrorClass::Conflict,
            Self::Storage(_) => ErrorClass::Internal,
        }
    }

    /// Suggested back-off before the client retries, if retrying makes sense.
    pub const fn retry_after_hint(&self) -> Option<Duration> {
        match self {
            Self::DuplicateOrder => Some(Duration::from_secs(2)),
            _ => None,
        }
    }
}

/// Type alias for service results.
pub type CommerceResult<T> = Result<T, CommerceError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn operation_names_are_unique_snake_case() {
        let names: HashSet<_> = Operation::ALL.iter().map(|op| op.to_string()).collect();

        assert_eq!(names.len(), Operation::ALL.len());
        assert!(names
            .iter()
            .all(|name| name.chars().all(|c| c.is_ascii_lowercase() || c == '_')));
    }

    #[test]
    fn store_failure_keeps_its_cause_out_of_the_message() {
        let error = StoreError::StoreFailure {
            operation: Operation::LockProducts,
            detail: "connection reset by peer".to_string(),
        };

        assert_eq!(error.to_string(), "lock_products operation failed");
        assert_eq!(error.failed_operation(), Some(Operation::LockProducts));
        assert!(matches!(
            &error,
            StoreError::StoreFailure { detail, .. } if detail == "connection reset by peer"
        ));
    }

    #[test]
    fn error_classes_map_to_transport_status_codes() {
        let cases = [
            (
                CommerceError::InsufficientStock {
                    product_id: ProductId::new(1),
                    requested: 3,
                    available: 2,
                },
                400,
            ),
            (CommerceError::EmptyCart(UserId::new(1)), 400),
            (CommerceError::OrderNotFound(OrderId::new(7)), 404),
            (CommerceError::CartItemNotFound(CartItemId::new(7)), 404),
            (CommerceError::UnauthorizedOrder(OrderId::new(7)), 403),
            (CommerceError::DuplicateOrder, 409),
            (
                CommerceError::Storage(StoreError::StoreFailure {
                    operation: Operation::CommitTransaction,
                    detail: "pool timed out".to_string(),
                }),
                500,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.class().status_code(), expected, "{error}");
        }
    }

    #[test]
    fn only_duplicate_order_suggests_a_retry() {
        assert!(CommerceError::DuplicateOrder.retry_after_hint().is_some());
        assert!(CommerceError::EmptyCart(UserId::new(1))
            .retry_after_hint()
            .is_none());
    }

    #[test]
    fn store_errors_convert_into_storage_failures() {
        let store_error = StoreError::MissingRow {
            operation: Operation::UpdateCartItem,
        };

        let error: CommerceError = store_error.clone().into();

        assert_eq!(error, CommerceError::Storage(store_error));
    }
}
