//! Row shapes exchanged with the data-access facade.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{
    CartId, CartItemId, CategoryId, IdempotencyKey, OrderId, OrderItemId, OrderStatus, ProductId,
    Quantity, UserId,
};

/// Catalog category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    /// Row identifier.
    pub id: CategoryId,
    /// Display name.
    pub name: String,
    /// Optional longer description.
    pub description: Option<String>,
}

/// Catalog product, including its inventory ledger counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Row identifier.
    pub id: ProductId,
    /// Owning category.
    pub category_id: CategoryId,
    /// Display name.
    pub name: String,
    /// Optional longer description.
    pub description: Option<String>,
    /// Stock keeping unit, unique across the catalog.
    pub sku: String,
    /// Current unit price.
    pub price: Decimal,
    /// Units on hand. Never negative by construction.
    pub stock: u32,
    /// Whether the product is offered for sale.
    pub is_active: bool,
}

/// A user's active cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    /// Row identifier.
    pub id: CartId,
    /// Owner; at most one active cart each.
    pub user_id: UserId,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last change to the cart or its lines.
    pub updated_at: DateTime<Utc>,
}

/// An active cart line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    /// Row identifier, kept across removal and restore.
    pub id: CartItemId,
    /// Owning cart.
    pub cart_id: CartId,
    /// Product on the line.
    pub product_id: ProductId,
    /// Units requested.
    pub quantity: Quantity,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

/// Order header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Row identifier.
    pub id: OrderId,
    /// Customer who placed the order.
    pub user_id: UserId,
    /// Lifecycle status.
    pub status: OrderStatus,
    /// Sum of line `price * quantity`, fixed when the order was placed.
    pub total_amount: Decimal,
    /// Placement time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

/// Order line. `price` is the price at purchase and never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    /// Row identifier.
    pub id: OrderItemId,
    /// Owning order.
    pub order_id: OrderId,
    /// Product ordered.
    pub product_id: ProductId,
    /// Units ordered.
    pub quantity: Quantity,
    /// Unit price at purchase.
    pub price: Decimal,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Registry entry linking a client token to the order it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Scope of the key.
    pub user_id: UserId,
    /// Client-supplied token.
    pub key: IdempotencyKey,
    /// Order created for the key, `None` while pending.
    pub order_id: Option<OrderId>,
    /// When the key was claimed.
    pub created_at: DateTime<Utc>,
}

/// State of a recorded idempotency entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyState {
    /// Recorded, no order linked yet: a conversion is in flight.
    Pending,
    /// Linked to the order it produced.
    Resolved(OrderId),
}

impl IdempotencyRecord {
    /// Current state of the entry.
    pub const fn state(&self) -> IdempotencyState {
        match self.order_id {
            Some(order_id) => IdempotencyState::Resolved(order_id),
            None => IdempotencyState::Pending,
        }
    }
}

/// Insert shape for [`Category`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCategory {
    /// Display name.
    pub name: String,
    /// Optional longer description.
    pub description: Option<String>,
}

/// Insert shape for [`Product`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProduct {
    /// Owning category.
    pub category_id: CategoryId,
    /// Display name.
    pub name: String,
    /// Optional longer description.
    pub description: Option<String>,
    /// Stock keeping unit.
    pub sku: String,
    /// Unit price.
    pub price: Decimal,
    /// Initial units on hand.
    pub stock: u32,
    /// Whether the product is offered for sale.
    pub is_active: bool,
}

/// Insert shape for [`OrderItem`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrderItem {
    /// Owning order.
    pub order_id: OrderId,
    /// Product ordered.
    pub product_id: ProductId,
    /// Units ordered.
    pub quantity: Quantity,
    /// Unit price at purchase.
    pub price: Decimal,
}
