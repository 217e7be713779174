//! Transactional data-access facade consumed by the core services.
//!
//! A [`Store`] hands out [`Transaction`]s. Every read and write the services
//! perform goes through a transaction, and every multi-row mutation goes
//! through [`run_in_transaction`], which commits on success and rolls back on
//! any error. Backends decide how isolation and locking are achieved; the
//! contract they must honor is:
//!
//! - writes are invisible to other transactions until commit
//! - a transaction reads its own uncommitted writes
//! - `lock_*_for_update` takes an exclusive row lock held until commit or
//!   rollback, and returns the row as last committed by the previous holder
//! - every write to an existing row takes that row's lock implicitly, then
//!   re-reads the row, so a row removed meanwhile is reported as missing
//! - row locks are taken in a fixed order across a unit of work: orders,
//!   products, cart lines, carts, idempotency entries
//! - uniqueness rules surface as [`StoreError::UniqueViolation`]
//! - dropping a transaction without committing rolls it back

use std::future::Future;

use futures::future::BoxFuture;
use rust_decimal::Decimal;
use tracing::warn;

use crate::errors::StoreError;
use crate::models::{
    Cart, CartItem, Category, IdempotencyRecord, NewCategory, NewOrderItem, NewProduct, Order,
    OrderItem, Product,
};
use crate::types::{
    CartId, CartItemId, CategoryId, IdempotencyKey, OrderId, OrderStatus, ProductId, Quantity,
    UserId,
};

/// A backend that can open transactions.
///
/// Stores are cheap to clone and are shared between concurrently running
/// requests; all coordination happens inside the backend.
pub trait Store: Clone + Send + Sync + 'static {
    /// Transaction handle produced by [`Store::begin`].
    type Transaction: Transaction;

    /// Open a new transaction.
    fn begin(&self) -> impl Future<Output = Result<Self::Transaction, StoreError>> + Send;
}

/// An open unit of work against a [`Store`].
///
/// Reads of soft-deleted carts and cart lines are never returned except
/// through [`Transaction::restore_cart_item`].
pub trait Transaction: Send + Sized + 'static {
    /// Make every write of this transaction visible and release its locks.
    fn commit(self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Discard every write of this transaction and release its locks.
    fn rollback(self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Insert a catalog category.
    fn insert_category(
        &mut self,
        category: NewCategory,
    ) -> impl Future<Output = Result<Category, StoreError>> + Send;

    /// Insert a catalog product. Fails with `ProductSku` on a duplicate SKU.
    fn insert_product(
        &mut self,
        product: NewProduct,
    ) -> impl Future<Output = Result<Product, StoreError>> + Send;

    /// Read products without locking. Unknown identifiers are omitted.
    fn get_products(
        &mut self,
        ids: &[ProductId],
    ) -> impl Future<Output = Result<Vec<Product>, StoreError>> + Send;

    /// Read a single product without locking.
    fn get_product(
        &mut self,
        id: ProductId,
    ) -> impl Future<Output = Result<Option<Product>, StoreError>> + Send {
        async move { Ok(self.get_products(&[id]).await?.into_iter().next()) }
    }

    /// Lock the given product rows exclusively and return their current state.
    ///
    /// Rows are locked in ascending id order in one batch. Unknown identifiers
    /// are omitted from the result; the result is sorted by id.
    fn lock_products_for_update(
        &mut self,
        ids: &[ProductId],
    ) -> impl Future<Output = Result<Vec<Product>, StoreError>> + Send;

    /// Overwrite a product's stock counter.
    fn set_product_stock(
        &mut self,
        id: ProductId,
        stock: u32,
    ) -> impl Future<Output = Result<Product, StoreError>> + Send;

    /// Read categories. Unknown identifiers are omitted.
    fn get_categories(
        &mut self,
        ids: &[CategoryId],
    ) -> impl Future<Output = Result<Vec<Category>, StoreError>> + Send;

    /// The user's active cart, if any.
    fn get_cart_by_user(
        &mut self,
        user_id: UserId,
    ) -> impl Future<Output = Result<Option<Cart>, StoreError>> + Send;

    /// Create an active cart. Fails with `ActiveCartPerUser` if one exists.
    fn insert_cart(
        &mut self,
        user_id: UserId,
    ) -> impl Future<Output = Result<Cart, StoreError>> + Send;

    /// Bump the cart's `updated_at`.
    fn touch_cart(&mut self, cart_id: CartId)
        -> impl Future<Output = Result<(), StoreError>> + Send;

    /// An active cart line by id.
    fn get_cart_item(
        &mut self,
        id: CartItemId,
    ) -> impl Future<Output = Result<Option<CartItem>, StoreError>> + Send;

    /// The active line for `(cart, product)`, if any.
    fn get_active_cart_item(
        &mut self,
        cart_id: CartId,
        product_id: ProductId,
    ) -> impl Future<Output = Result<Option<CartItem>, StoreError>> + Send;

    /// Active lines of a cart, oldest first.
    fn list_cart_items(
        &mut self,
        cart_id: CartId,
    ) -> impl Future<Output = Result<Vec<CartItem>, StoreError>> + Send;

    /// Insert a new active line. Fails with `ActiveCartItemPerProduct` if one exists.
    fn insert_cart_item(
        &mut self,
        cart_id: CartId,
        product_id: ProductId,
        quantity: Quantity,
    ) -> impl Future<Output = Result<CartItem, StoreError>> + Send;

    /// Un-delete the most recently removed line for `(cart, product)` with a
    /// new quantity. Returns `None` when no soft-deleted line exists.
    fn restore_cart_item(
        &mut self,
        cart_id: CartId,
        product_id: ProductId,
        quantity: Quantity,
    ) -> impl Future<Output = Result<Option<CartItem>, StoreError>> + Send;

    /// Set an active line's quantity. Fails with `MissingRow` if the line is
    /// gone or soft-deleted.
    fn set_cart_item_quantity(
        &mut self,
        id: CartItemId,
        quantity: Quantity,
    ) -> impl Future<Output = Result<CartItem, StoreError>> + Send;

    /// Soft-delete one active line. Returns whether a line was removed.
    fn soft_delete_cart_item(
        &mut self,
        id: CartItemId,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Soft-delete every active line of a cart. Returns the number removed.
    fn soft_delete_cart_items(
        &mut self,
        cart_id: CartId,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Insert a pending order header.
    fn insert_order(
        &mut self,
        user_id: UserId,
        total_amount: Decimal,
    ) -> impl Future<Output = Result<Order, StoreError>> + Send;

    /// Insert an order line.
    fn insert_order_item(
        &mut self,
        item: NewOrderItem,
    ) -> impl Future<Output = Result<OrderItem, StoreError>> + Send;

    /// An order by id, without locking.
    fn get_order(
        &mut self,
        id: OrderId,
    ) -> impl Future<Output = Result<Option<Order>, StoreError>> + Send;

    /// Lock an order row exclusively and return its current state.
    fn lock_order_for_update(
        &mut self,
        id: OrderId,
    ) -> impl Future<Output = Result<Option<Order>, StoreError>> + Send;

    /// Overwrite an order's status. Returns `None` if the order does not exist.
    fn set_order_status(
        &mut self,
        id: OrderId,
        status: OrderStatus,
    ) -> impl Future<Output = Result<Option<Order>, StoreError>> + Send;

    /// Lines of an order, in insertion order.
    fn list_order_items(
        &mut self,
        order_id: OrderId,
    ) -> impl Future<Output = Result<Vec<OrderItem>, StoreError>> + Send;

    /// Lines of several orders in one read, grouped by order id ascending
    /// and in insertion order within each order.
    fn list_order_items_for(
        &mut self,
        order_ids: &[OrderId],
    ) -> impl Future<Output = Result<Vec<OrderItem>, StoreError>> + Send;

    /// Number of orders owned by the user.
    fn count_orders_by_user(
        &mut self,
        user_id: UserId,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// One page of the user's orders, newest first.
    fn list_orders_by_user(
        &mut self,
        user_id: UserId,
        limit: u32,
        offset: u64,
    ) -> impl Future<Output = Result<Vec<Order>, StoreError>> + Send;

    /// The registry entry for `(user, key)`, if any.
    fn get_idempotency_key(
        &mut self,
        user_id: UserId,
        key: &IdempotencyKey,
    ) -> impl Future<Output = Result<Option<IdempotencyRecord>, StoreError>> + Send;

    /// Record an entry. Fails with `IdempotencyKeyPerUser` if one exists.
    fn insert_idempotency_key(
        &mut self,
        user_id: UserId,
        key: &IdempotencyKey,
        order_id: Option<OrderId>,
    ) -> impl Future<Output = Result<IdempotencyRecord, StoreError>> + Send;

    /// Link an existing entry to its order. Fails with `MissingRow` if absent.
    fn resolve_idempotency_key(
        &mut self,
        user_id: UserId,
        key: &IdempotencyKey,
        order_id: OrderId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Remove the entry if it is still pending. Returns whether it was removed.
    fn delete_pending_idempotency_key(
        &mut self,
        user_id: UserId,
        key: &IdempotencyKey,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

/// Run `work` as one atomic unit of work.
///
/// Opens a transaction, runs `work` against it, commits on `Ok` and rolls back
/// on `Err`. A commit failure is returned as the unit's error, so either every
/// write lands or none does.
///
/// `work` receives the transaction by mutable reference and must return a
/// boxed future borrowing it; capture owned values only:
///
/// ```rust,ignore
/// let order = run_in_transaction(&store, move |tx| {
///     Box::pin(async move {
///         let order = tx.insert_order(user_id, total).await?;
///         Ok::<_, CommerceError>(order)
///     })
/// })
/// .await?;
/// ```
pub async fn run_in_transaction<S, T, E, F>(store: &S, work: F) -> Result<T, E>
where
    S: Store,
    T: Send,
    E: From<StoreError> + Send,
    F: for<'t> FnOnce(&'t mut S::Transaction) -> BoxFuture<'t, Result<T, E>> + Send,
{
    let mut tx = store.begin().await?;

    match work(&mut tx).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(error) => {
            if let Err(rollback_error) = tx.rollback().await {
                warn!(
                    error = %rollback_error,
                    "[store.run_in_transaction] rollback failed; dropping transaction"
                );
            }
            Err(error)
        }
    }
}
