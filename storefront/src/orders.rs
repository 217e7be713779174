//! Order fulfillment and order lifecycle.
//!
//! # Cart conversion
//!
//! `create_order_from_cart` reads the cart outside the unit of work, then in
//! one unit of work:
//!
//! 1. locks every referenced product row in one sorted batch
//! 2. validates existence and stock against the locked rows
//! 3. inserts the order with the total at current prices
//! 4. inserts each line with its price at purchase and decrements stock
//! 5. soft-deletes the cart lines
//!
//! Validation runs only after the lock is held. Two conversions sharing a
//! product serialize on its row; the second sees the first one's stock.
//!
//! # Cancellation
//!
//! `cancel_order` locks the order row, checks owner and status, flips the
//! status and restores every line's stock in the same unit of work. A
//! failure restoring any line aborts the status change too.

use std::collections::{BTreeMap, BTreeSet};

use futures::FutureExt;
use rust_decimal::Decimal;
use tracing::{info, instrument};

use crate::config::PageRequest;
use crate::errors::{CommerceError, CommerceResult, StoreError};
use crate::idempotency::{IdempotencyLookup, IdempotencyRegistry};
use crate::inventory::{ensure_available, LockedStock};
use crate::models::{CartItem, NewOrderItem, Order, OrderItem};
use crate::store::{run_in_transaction, Store, Transaction};
use crate::types::{IdempotencyKey, OrderId, OrderStatus, ProductId, UserId};
use crate::views::{
    line_total, load_order_view, order_view, Catalog, OrderPage, OrderView, PaginationMeta,
};

/// Order operations for any [`Store`].
#[derive(Debug, Clone)]
pub struct OrderService<S> {
    store: S,
    registry: IdempotencyRegistry<S>,
}

impl<S: Store> OrderService<S> {
    /// Create a service over `store`.
    pub fn new(store: S) -> Self {
        let registry = IdempotencyRegistry::new(store.clone());
        Self { store, registry }
    }

    /// The idempotency registry this service records submissions in.
    pub const fn registry(&self) -> &IdempotencyRegistry<S> {
        &self.registry
    }

    /// Convert the user's cart into an order.
    #[instrument(name = "orders.create_order_from_cart", skip(self))]
    pub async fn create_order_from_cart(&self, user_id: UserId) -> CommerceResult<OrderView> {
        self.convert_cart(user_id, None).await
    }

    /// Convert the user's cart at most once per idempotency key.
    ///
    /// A blank key disables de-duplication. A key already linked to an order
    /// returns that order, re-read. A key whose first submission is still in
    /// flight fails with `DuplicateOrder`. A conversion that fails releases
    /// its claim so the same key can be retried.
    #[instrument(name = "orders.create_order_with_idempotency", skip(self))]
    pub async fn create_order_with_idempotency(
        &self,
        user_id: UserId,
        key: &str,
    ) -> CommerceResult<OrderView> {
        let Some(key) = IdempotencyKey::from_header(key)? else {
            return self.convert_cart(user_id, None).await;
        };

        match self.registry.lookup(user_id, &key).await? {
            IdempotencyLookup::Resolved(order_id) => {
                info!(
                    order_id = %order_id,
                    "[orders.create_order_with_idempotency] replaying recorded order"
                );
                return self.load_order(order_id).await;
            }
            IdempotencyLookup::Pending => return Err(CommerceError::DuplicateOrder),
            IdempotencyLookup::Absent => {}
        }

        self.registry.claim(user_id, &key).await?;
        match self.convert_cart(user_id, Some(key.clone())).await {
            Ok(order) => Ok(order),
            Err(error) => {
                self.registry.release(user_id, &key).await;
                Err(error)
            }
        }
    }

    async fn convert_cart(
        &self,
        user_id: UserId,
        key: Option<IdempotencyKey>,
    ) -> CommerceResult<OrderView> {
        let (cart_id, items) = run_in_transaction(&self.store, move |tx| {
            async move {
                let Some(cart) = tx.get_cart_by_user(user_id).await? else {
                    return Ok(None);
                };
                let items = tx.list_cart_items(cart.id).await?;
                Ok::<_, StoreError>(Some((cart.id, items)))
            }
            .boxed()
        })
        .await?
        .filter(|(_, items)| !items.is_empty())
        .ok_or(CommerceError::EmptyCart(user_id))?;

        let view = run_in_transaction(&self.store, move |tx| {
            async move {
                let product_ids = distinct_products(&items);
                let mut stock = LockedStock::acquire(tx, &product_ids).await?;

                let mut total = Decimal::ZERO;
                for item in &items {
                    let product = stock.require(item.product_id)?;
                    ensure_available(product, u64::from(item.quantity.into_inner()))?;
                    total += line_total(product.price, item.quantity);
                }

                let order = tx.insert_order(user_id, total).await?;
                let mut lines = Vec::with_capacity(items.len());
                for item in &items {
                    let price = stock.require(item.product_id)?.price;
                    let line = tx
                        .insert_order_item(NewOrderItem {
                            order_id: order.id,
                            product_id: item.product_id,
                            quantity: item.quantity,
                            price,
                        })
                        .await?;
                    stock.withdraw(tx, item.product_id, item.quantity).await?;
                    lines.push(line);
                }

                let _ = tx.soft_delete_cart_items(cart_id).await?;
                tx.touch_cart(cart_id).await?;
                if let Some(key) = &key {
                    tx.resolve_idempotency_key(user_id, key, order.id).await?;
                }

                let catalog = Catalog::load(tx, &product_ids).await?;
                order_view(order, lines, &catalog)
            }
            .boxed()
        })
        .await?;

        info!(
            order_id = %view.id,
            total_amount = %view.total_amount,
            lines = view.items.len(),
            "[orders.create_order_from_cart] order committed"
        );
        Ok(view)
    }

    /// Read an order. Non-admin callers may only read their own orders.
    #[instrument(name = "orders.get_order_by_id", skip(self))]
    pub async fn get_order_by_id(
        &self,
        user_id: UserId,
        order_id: OrderId,
        is_admin: bool,
    ) -> CommerceResult<OrderView> {
        run_in_transaction(&self.store, move |tx| {
            async move {
                let order = tx
                    .get_order(order_id)
                    .await?
                    .ok_or(CommerceError::OrderNotFound(order_id))?;
                if !is_admin && order.user_id != user_id {
                    return Err(CommerceError::UnauthorizedOrder(order_id));
                }
                load_order_view(tx, order).await
            }
            .boxed()
        })
        .await
    }

    /// One page of the user's orders, newest first.
    #[instrument(name = "orders.get_user_orders", skip(self))]
    pub async fn get_user_orders(
        &self,
        user_id: UserId,
        page: PageRequest,
    ) -> CommerceResult<OrderPage> {
        run_in_transaction(&self.store, move |tx| {
            async move {
                let total_count = tx.count_orders_by_user(user_id).await?;
                let orders = tx
                    .list_orders_by_user(user_id, page.limit(), page.offset())
                    .await?;

                let order_ids: Vec<OrderId> = orders.iter().map(|order| order.id).collect();
                let mut items_by_order: BTreeMap<OrderId, Vec<OrderItem>> = BTreeMap::new();
                for item in tx.list_order_items_for(&order_ids).await? {
                    items_by_order.entry(item.order_id).or_default().push(item);
                }
                let with_items: Vec<(Order, Vec<OrderItem>)> = orders
                    .into_iter()
                    .map(|order| {
                        let items = items_by_order.remove(&order.id).unwrap_or_default();
                        (order, items)
                    })
                    .collect();
                let product_ids: Vec<ProductId> = with_items
                    .iter()
                    .flat_map(|(_, items)| items.iter().map(|item| item.product_id))
                    .collect();
                let catalog = Catalog::load(tx, &product_ids).await?;

                let orders = with_items
                    .into_iter()
                    .map(|(order, items)| order_view(order, items, &catalog))
                    .collect::<CommerceResult<Vec<_>>>()?;

                Ok(OrderPage {
                    orders,
                    meta: PaginationMeta::new(page.page(), page.limit(), total_count),
                })
            }
            .boxed()
        })
        .await
    }

    /// Overwrite an order's status (privileged).
    ///
    /// The name is validated before any storage access.
    #[instrument(name = "orders.update_order_status", skip(self))]
    pub async fn update_order_status(
        &self,
        order_id: OrderId,
        status: &str,
    ) -> CommerceResult<OrderView> {
        let status: OrderStatus = status
            .parse()
            .map_err(|_| CommerceError::InvalidOrderStatus(status.to_string()))?;

        let view = run_in_transaction(&self.store, move |tx| {
            async move {
                let order = tx
                    .set_order_status(order_id, status)
                    .await?
                    .ok_or(CommerceError::OrderNotFound(order_id))?;
                load_order_view(tx, order).await
            }
            .boxed()
        })
        .await?;

        info!(status = %view.status, "[orders.update_order_status] status written");
        Ok(view)
    }

    /// Cancel the user's own pending order and put its stock back.
    #[instrument(name = "orders.cancel_order", skip(self))]
    pub async fn cancel_order(&self, user_id: UserId, order_id: OrderId) -> CommerceResult<OrderView> {
        let view = run_in_transaction(&self.store, move |tx| {
            async move {
                let order = tx
                    .lock_order_for_update(order_id)
                    .await?
                    .ok_or(CommerceError::OrderNotFound(order_id))?;
                if order.user_id != user_id {
                    return Err(CommerceError::UnauthorizedOrder(order_id));
                }
                if !order.status.is_cancellable() {
                    return Err(CommerceError::OrderNotCancellable {
                        order_id,
                        status: order.status,
                    });
                }

                let order = tx
                    .set_order_status(order_id, OrderStatus::Cancelled)
                    .await?
                    .ok_or(CommerceError::OrderNotFound(order_id))?;
                let items = tx.list_order_items(order_id).await?;

                let product_ids: Vec<ProductId> = items
                    .iter()
                    .map(|item| item.product_id)
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                let mut stock = LockedStock::acquire(tx, &product_ids).await?;
                for item in &items {
                    stock.restock(tx, item.product_id, item.quantity).await?;
                }

                let catalog = Catalog::load(tx, &product_ids).await?;
                order_view(order, items, &catalog)
            }
            .boxed()
        })
        .await?;

        info!(
            restored_lines = view.items.len(),
            "[orders.cancel_order] order cancelled and stock restored"
        );
        Ok(view)
    }

    async fn load_order(&self, order_id: OrderId) -> CommerceResult<OrderView> {
        run_in_transaction(&self.store, move |tx| {
            async move {
                let order = tx
                    .get_order(order_id)
                    .await?
                    .ok_or(CommerceError::OrderNotFound(order_id))?;
                load_order_view(tx, order).await
            }
            .boxed()
        })
        .await
    }
}

fn distinct_products(items: &[CartItem]) -> Vec<ProductId> {
    items
        .iter()
        .map(|item| item.product_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
