//! Read models handed to the transport layer.
//!
//! Assembly collects every product id it needs up front and resolves them
//! with one product read and one category read, whatever the number of lines.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::{CommerceError, StoreError};
use crate::models::{Cart, CartItem, Category, Order, OrderItem, Product};
use crate::store::Transaction;
use crate::types::{
    CartId, CartItemId, CategoryId, OrderId, OrderItemId, OrderStatus, ProductId, Quantity, UserId,
};

/// Category detail embedded in product views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryView {
    /// Category identifier.
    pub id: CategoryId,
    /// Display name.
    pub name: String,
    /// Optional longer description.
    pub description: Option<String>,
}

impl From<Category> for CategoryView {
    fn from(category: Category) -> Self {
        Self {
            id: category.id,
            name: category.name,
            description: category.description,
        }
    }
}

/// Product detail embedded in cart and order lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductView {
    /// Product identifier.
    pub id: ProductId,
    /// Display name.
    pub name: String,
    /// Optional longer description.
    pub description: Option<String>,
    /// Stock keeping unit, unique across the catalog.
    pub sku: String,
    /// Current catalog price.
    pub price: Decimal,
    /// Units on hand when the view was read.
    pub stock: u32,
    /// Whether the product is offered for sale.
    pub is_active: bool,
    /// Owning category, `None` when its row is missing.
    pub category: Option<CategoryView>,
}

/// One cart line with its product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItemView {
    /// Cart line identifier.
    pub id: CartItemId,
    /// Product on this line.
    pub product: ProductView,
    /// Units requested.
    pub quantity: Quantity,
    /// Current price times quantity.
    pub subtotal: Decimal,
}

/// A cart with its active lines and computed total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartView {
    /// Cart identifier.
    pub id: CartId,
    /// Owner of the cart.
    pub user_id: UserId,
    /// Active lines, oldest first.
    pub items: Vec<CartItemView>,
    /// Sum of line subtotals.
    pub total: Decimal,
    /// Last change to the cart or its lines.
    pub updated_at: DateTime<Utc>,
}

/// One order line with its product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItemView {
    /// Order line identifier.
    pub id: OrderItemId,
    /// Product on this line, as it is now.
    pub product: ProductView,
    /// Units ordered.
    pub quantity: Quantity,
    /// Price at purchase, not the current catalog price.
    pub price: Decimal,
}

/// An order with its lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderView {
    /// Order identifier.
    pub id: OrderId,
    /// Customer who placed the order.
    pub user_id: UserId,
    /// Current lifecycle status.
    pub status: OrderStatus,
    /// Total at purchase prices.
    pub total_amount: Decimal,
    /// Lines in insertion order.
    pub items: Vec<OrderItemView>,
    /// When the order was placed.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

/// Position of a page within a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationMeta {
    /// One-based page number.
    pub page: u32,
    /// Rows per page.
    pub limit: u32,
    /// Rows across all pages.
    pub total_count: u64,
    /// Pages needed for `total_count` rows.
    pub total_pages: u64,
}

impl PaginationMeta {
    /// Derive `total_pages` from the row count.
    pub fn new(page: u32, limit: u32, total_count: u64) -> Self {
        let total_pages = if limit == 0 {
            0
        } else {
            total_count.div_ceil(u64::from(limit))
        };
        Self {
            page,
            limit,
            total_count,
            total_pages,
        }
    }
}

/// One page of a user's orders, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPage {
    /// Orders on this page.
    pub orders: Vec<OrderView>,
    /// Where this page sits in the listing.
    pub meta: PaginationMeta,
}

/// Products resolved for one assembly pass.
#[derive(Debug, Default)]
pub(crate) struct Catalog {
    products: HashMap<ProductId, ProductView>,
}

impl Catalog {
    /// Resolve `ids` with one batched product read and one batched category read.
    pub(crate) async fn load<T: Transaction>(
        tx: &mut T,
        ids: &[ProductId],
    ) -> Result<Self, StoreError> {
        let ids: Vec<ProductId> = ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        if ids.is_empty() {
            return Ok(Self::default());
        }

        let products = tx.get_products(&ids).await?;
        let category_ids: Vec<CategoryId> = products
            .iter()
            .map(|product| product.category_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let categories: HashMap<CategoryId, CategoryView> = tx
            .get_categories(&category_ids)
            .await?
            .into_iter()
            .map(|category| (category.id, CategoryView::from(category)))
            .collect();

        let products = products
            .into_iter()
            .map(|product| {
                let category = categories.get(&product.category_id).cloned();
                (product.id, product_view(product, category))
            })
            .collect();

        Ok(Self { products })
    }

    fn product(&self, id: ProductId) -> Result<ProductView, CommerceError> {
        self.products
            .get(&id)
            .cloned()
            .ok_or(CommerceError::ProductNotFound(id))
    }
}

fn product_view(product: Product, category: Option<CategoryView>) -> ProductView {
    ProductView {
        id: product.id,
        name: product.name,
        description: product.description,
        sku: product.sku,
        price: product.price,
        stock: product.stock,
        is_active: product.is_active,
        category,
    }
}

/// `price * quantity`.
pub fn line_total(price: Decimal, quantity: Quantity) -> Decimal {
    price * Decimal::from(quantity.into_inner())
}

pub(crate) fn cart_view(
    cart: &Cart,
    items: Vec<CartItem>,
    catalog: &Catalog,
) -> Result<CartView, CommerceError> {
    let items = items
        .into_iter()
        .map(|item| {
            let product = catalog.product(item.product_id)?;
            Ok(CartItemView {
                id: item.id,
                subtotal: line_total(product.price, item.quantity),
                product,
                quantity: item.quantity,
            })
        })
        .collect::<Result<Vec<_>, CommerceError>>()?;
    let total = items.iter().map(|item| item.subtotal).sum();

    Ok(CartView {
        id: cart.id,
        user_id: cart.user_id,
        items,
        total,
        updated_at: cart.updated_at,
    })
}

pub(crate) fn order_view(
    order: Order,
    items: Vec<OrderItem>,
    catalog: &Catalog,
) -> Result<OrderView, CommerceError> {
    let items = items
        .into_iter()
        .map(|item| {
            Ok(OrderItemView {
                id: item.id,
                product: catalog.product(item.product_id)?,
                quantity: item.quantity,
                price: item.price,
            })
        })
        .collect::<Result<Vec<_>, CommerceError>>()?;

    Ok(OrderView {
        id: order.id,
        user_id: order.user_id,
        status: order.status,
        total_amount: order.total_amount,
        items,
        created_at: order.created_at,
        updated_at: order.updated_at,
    })
}

/// Read an order's lines and assemble its view.
pub(crate) async fn load_order_view<T: Transaction>(
    tx: &mut T,
    order: Order,
) -> Result<OrderView, CommerceError> {
    let items = tx.list_order_items(order.id).await?;
    let product_ids: Vec<ProductId> = items.iter().map(|item| item.product_id).collect();
    let catalog = Catalog::load(tx, &product_ids).await?;
    order_view(order, items, &catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn quantity(n: u32) -> Quantity {
        Quantity::try_new(n).expect("positive quantity")
    }

    proptest! {
        #[test]
        fn line_totals_are_exact_in_cents(cents in 0i64..10_000_000, n in 1u32..1_000) {
            let price = Decimal::new(cents, 2);

            let total = line_total(price, quantity(n));

            prop_assert_eq!(total, Decimal::new(cents * i64::from(n), 2));
        }
    }

    #[test]
    fn tenths_sum_without_drift() {
        let total: Decimal = (0..10)
            .map(|_| line_total(Decimal::new(10, 2), quantity(1)))
            .sum();

        assert_eq!(total, Decimal::new(100, 2));
    }

    #[test]
    fn total_pages_round_up() {
        assert_eq!(PaginationMeta::new(1, 10, 0).total_pages, 0);
        assert_eq!(PaginationMeta::new(1, 10, 10).total_pages, 1);
        assert_eq!(PaginationMeta::new(1, 10, 11).total_pages, 2);
    }
}
