//! Fault injection for [`Store`] backends.
//!
//! [`FaultInjectingStore`] wraps any store and can make facade operations
//! fail with [`StoreError::StoreFailure`], either at random (seeded through
//! [`ChaosConfig`]) or on a chosen call ([`FaultInjectingStore::fail_nth`]).
//! It also counts how often each operation was attempted, which lets tests
//! assert that a read path issues a bounded number of queries.
//!
//! Rollback is never failed at random: a failed rollback only drops the
//! transaction, which every backend treats as a rollback anyway.

use std::collections::HashMap;
use std::sync::Arc;

use nutype::nutype;
use parking_lot::Mutex;
use rand::{random, rngs::StdRng, Rng, SeedableRng};
use rust_decimal::Decimal;
use storefront::{
    Cart, CartId, CartItem, CartItemId, Category, CategoryId, IdempotencyKey, IdempotencyRecord,
    NewCategory, NewOrderItem, NewProduct, Operation, Order, OrderId, OrderItem, OrderStatus,
    Product, ProductId, Quantity, Store, StoreError, Transaction, UserId,
};

/// Probability in `[0.0, 1.0]` that an operation fails.
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into)
)]
pub struct Probability(f32);

/// Random failure settings.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    failure_probability: Probability,
}

impl ChaosConfig {
    /// A config with a fixed seed, so a failing run can be replayed.
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    /// Fail any operation except rollback with the given probability.
    /// Out-of-range values are clamped.
    pub fn with_failure_probability(mut self, probability: f32) -> Self {
        self.failure_probability = Probability::try_new(probability.clamp(0.0, 1.0))
            .expect("clamped value is always valid");
        self
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            failure_probability: Probability::try_new(0.0).expect("0.0 is valid probability"),
        }
    }
}

/// Wrap a store in a [`FaultInjectingStore`].
pub trait FaultInjectionExt: Sized {
    /// Wrap with random failures per `config`.
    fn with_chaos(self, config: ChaosConfig) -> FaultInjectingStore<Self>;

    /// Wrap without random failures; faults are armed explicitly.
    fn with_faults(self) -> FaultInjectingStore<Self> {
        self.with_chaos(ChaosConfig::default())
    }
}

impl<S: Store> FaultInjectionExt for S {
    fn with_chaos(self, config: ChaosConfig) -> FaultInjectingStore<Self> {
        FaultInjectingStore::new(self, config)
    }
}

#[derive(Debug)]
struct ArmedFault {
    operation: Operation,
    remaining: u64,
}

#[derive(Debug)]
struct FaultState {
    failure_probability: Probability,
    rng: Mutex<StdRng>,
    calls: Mutex<HashMap<Operation, u64>>,
    armed: Mutex<Vec<ArmedFault>>,
}

impl FaultState {
    /// Count one attempt of `operation` and decide whether it fails.
    fn attempt(&self, operation: Operation) -> Result<(), StoreError> {
        *self.calls.lock().entry(operation).or_insert(0) += 1;

        let mut armed = self.armed.lock();
        let mut triggered = false;
        armed.retain_mut(|fault| {
            if triggered || fault.operation != operation {
                return true;
            }
            fault.remaining -= 1;
            if fault.remaining == 0 {
                triggered = true;
                return false;
            }
            true
        });
        drop(armed);

        let detail = if triggered {
            "armed fault fired"
        } else if self.random_failure(operation) {
            "random fault fired"
        } else {
            return Ok(());
        };
        Err(StoreError::StoreFailure {
            operation,
            detail: detail.to_string(),
        })
    }

    fn random_failure(&self, operation: Operation) -> bool {
        if operation == Operation::RollbackTransaction {
            return false;
        }
        let probability: f32 = self.failure_probability.into();
        if probability <= 0.0 {
            return false;
        }
        if probability >= 1.0 {
            return true;
        }
        self.rng.lock().random_bool(f64::from(probability))
    }
}

/// A [`Store`] whose operations can be made to fail.
///
/// Clones share counters and armed faults.
#[derive(Debug, Clone)]
pub struct FaultInjectingStore<S> {
    inner: S,
    state: Arc<FaultState>,
}

impl<S> FaultInjectingStore<S> {
    /// Wrap `inner` with random failures per `config`.
    pub fn new(inner: S, config: ChaosConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(random()),
        };
        Self {
            inner,
            state: Arc::new(FaultState {
                failure_probability: config.failure_probability,
                rng: Mutex::new(rng),
                calls: Mutex::new(HashMap::new()),
                armed: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The wrapped store.
    pub const fn inner(&self) -> &S {
        &self.inner
    }

    /// Fail the `n`th call of `operation` made from now on (1-based).
    /// `n == 0` is treated as 1.
    pub fn fail_nth(&self, operation: Operation, n: u64) {
        self.state.armed.lock().push(ArmedFault {
            operation,
            remaining: n.max(1),
        });
    }

    /// Fail the next call of `operation`.
    pub fn fail_next(&self, operation: Operation) {
        self.fail_nth(operation, 1);
    }

    /// Drop every armed fault that has not fired yet.
    pub fn disarm(&self) {
        self.state.armed.lock().clear();
    }

    /// Attempts of `operation` since creation or the last [`Self::reset_calls`].
    pub fn calls(&self, operation: Operation) -> u64 {
        self.state
            .calls
            .lock()
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    /// Zero every call counter.
    pub fn reset_calls(&self) {
        self.state.calls.lock().clear();
    }
}

impl<S: Store> Store for FaultInjectingStore<S> {
    type Transaction = FaultInjectingTransaction<S::Transaction>;

    async fn begin(&self) -> Result<Self::Transaction, StoreError> {
        self.state.attempt(Operation::BeginTransaction)?;
        let inner = self.inner.begin().await?;
        Ok(FaultInjectingTransaction {
            inner,
            state: Arc::clone(&self.state),
        })
    }
}

/// Transaction handle of a [`FaultInjectingStore`].
#[derive(Debug)]
pub struct FaultInjectingTransaction<T> {
    inner: T,
    state: Arc<FaultState>,
}

impl<T: Transaction> Transaction for FaultInjectingTransaction<T> {
    async fn commit(self) -> Result<(), StoreError> {
        // A failed commit drops the inner transaction, rolling it back.
        self.state.attempt(Operation::CommitTransaction)?;
        self.inner.commit().await
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.state.attempt(Operation::RollbackTransaction)?;
        self.inner.rollback().await
    }

    async fn insert_category(&mut self, category: NewCategory) -> Result<Category, StoreError> {
        self.state.attempt(Operation::InsertCategory)?;
        self.inner.insert_category(category).await
    }

    async fn insert_product(&mut self, product: NewProduct) -> Result<Product, StoreError> {
        self.state.attempt(Operation::InsertProduct)?;
        self.inner.insert_product(product).await
    }

    async fn get_products(&mut self, ids: &[ProductId]) -> Result<Vec<Product>, StoreError> {
        self.state.attempt(Operation::ReadProducts)?;
        self.inner.get_products(ids).await
    }

    async fn lock_products_for_update(
        &mut self,
        ids: &[ProductId],
    ) -> Result<Vec<Product>, StoreError> {
        self.state.attempt(Operation::LockProducts)?;
        self.inner.lock_products_for_update(ids).await
    }

    async fn set_product_stock(&mut self, id: ProductId, stock: u32) -> Result<Product, StoreError> {
        self.state.attempt(Operation::UpdateProductStock)?;
        self.inner.set_product_stock(id, stock).await
    }

    async fn get_categories(&mut self, ids: &[CategoryId]) -> Result<Vec<Category>, StoreError> {
        self.state.attempt(Operation::ReadCategories)?;
        self.inner.get_categories(ids).await
    }

    async fn get_cart_by_user(&mut self, user_id: UserId) -> Result<Option<Cart>, StoreError> {
        self.state.attempt(Operation::ReadCart)?;
        self.inner.get_cart_by_user(user_id).await
    }

    async fn insert_cart(&mut self, user_id: UserId) -> Result<Cart, StoreError> {
        self.state.attempt(Operation::InsertCart)?;
        self.inner.insert_cart(user_id).await
    }

    async fn touch_cart(&mut self, cart_id: CartId) -> Result<(), StoreError> {
        self.state.attempt(Operation::TouchCart)?;
        self.inner.touch_cart(cart_id).await
    }

    async fn get_cart_item(&mut self, id: CartItemId) -> Result<Option<CartItem>, StoreError> {
        self.state.attempt(Operation::ReadCartItems)?;
        self.inner.get_cart_item(id).await
    }

    async fn get_active_cart_item(
        &mut self,
        cart_id: CartId,
        product_id: ProductId,
    ) -> Result<Option<CartItem>, StoreError> {
        self.state.attempt(Operation::ReadCartItems)?;
        self.inner.get_active_cart_item(cart_id, product_id).await
    }

    async fn list_cart_items(&mut self, cart_id: CartId) -> Result<Vec<CartItem>, StoreError> {
        self.state.attempt(Operation::ReadCartItems)?;
        self.inner.list_cart_items(cart_id).await
    }

    async fn insert_cart_item(
        &mut self,
        cart_id: CartId,
        product_id: ProductId,
        quantity: Quantity,
    ) -> Result<CartItem, StoreError> {
        self.state.attempt(Operation::InsertCartItem)?;
        self.inner.insert_cart_item(cart_id, product_id, quantity).await
    }

    async fn restore_cart_item(
        &mut self,
        cart_id: CartId,
        product_id: ProductId,
        quantity: Quantity,
    ) -> Result<Option<CartItem>, StoreError> {
        self.state.attempt(Operation::RestoreCartItem)?;
        self.inner.restore_cart_item(cart_id, product_id, quantity).await
    }

    async fn set_cart_item_quantity(
        &mut self,
        id: CartItemId,
        quantity: Quantity,
    ) -> Result<CartItem, StoreError> {
        self.state.attempt(Operation::UpdateCartItem)?;
        self.inner.set_cart_item_quantity(id, quantity).await
    }

    async fn soft_delete_cart_item(&mut self, id: CartItemId) -> Result<bool, StoreError> {
        self.state.attempt(Operation::DeleteCartItems)?;
        self.inner.soft_delete_cart_item(id).await
    }

    async fn soft_delete_cart_items(&mut self, cart_id: CartId) -> Result<u64, StoreError> {
        self.state.attempt(Operation::DeleteCartItems)?;
        self.inner.soft_delete_cart_items(cart_id).await
    }

    async fn insert_order(
        &mut self,
        user_id: UserId,
        total_amount: Decimal,
    ) -> Result<Order, StoreError> {
        self.state.attempt(Operation::InsertOrder)?;
        self.inner.insert_order(user_id, total_amount).await
    }

    async fn insert_order_item(&mut self, item: NewOrderItem) -> Result<OrderItem, StoreError> {
        self.state.attempt(Operation::InsertOrderItem)?;
        self.inner.insert_order_item(item).await
    }

    async fn get_order(&mut self, id: OrderId) -> Result<Option<Order>, StoreError> {
        self.state.attempt(Operation::ReadOrders)?;
        self.inner.get_order(id).await
    }

    async fn lock_order_for_update(&mut self, id: OrderId) -> Result<Option<Order>, StoreError> {
        self.state.attempt(Operation::LockOrder)?;
        self.inner.lock_order_for_update(id).await
    }

    async fn set_order_status(
        &mut self,
        id: OrderId,
        status: OrderStatus,
    ) -> Result<Option<Order>, StoreError> {
        self.state.attempt(Operation::UpdateOrderStatus)?;
        self.inner.set_order_status(id, status).await
    }

    async fn list_order_items(&mut self, order_id: OrderId) -> Result<Vec<OrderItem>, StoreError> {
        self.state.attempt(Operation::ReadOrderItems)?;
        self.inner.list_order_items(order_id).await
    }

    async fn list_order_items_for(
        &mut self,
        order_ids: &[OrderId],
    ) -> Result<Vec<OrderItem>, StoreError> {
        self.state.attempt(Operation::ReadOrderItems)?;
        self.inner.list_order_items_for(order_ids).await
    }

    async fn count_orders_by_user(&mut self, user_id: UserId) -> Result<u64, StoreError> {
        self.state.attempt(Operation::CountOrders)?;
        self.inner.count_orders_by_user(user_id).await
    }

    async fn list_orders_by_user(
        &mut self,
        user_id: UserId,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<Order>, StoreError> {
        self.state.attempt(Operation::ReadOrders)?;
        self.inner.list_orders_by_user(user_id, limit, offset).await
    }

    async fn get_idempotency_key(
        &mut self,
        user_id: UserId,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        self.state.attempt(Operation::ReadIdempotencyKey)?;
        self.inner.get_idempotency_key(user_id, key).await
    }

    async fn insert_idempotency_key(
        &mut self,
        user_id: UserId,
        key: &IdempotencyKey,
        order_id: Option<OrderId>,
    ) -> Result<IdempotencyRecord, StoreError> {
        self.state.attempt(Operation::InsertIdempotencyKey)?;
        self.inner.insert_idempotency_key(user_id, key, order_id).await
    }

    async fn resolve_idempotency_key(
        &mut self,
        user_id: UserId,
        key: &IdempotencyKey,
        order_id: OrderId,
    ) -> Result<(), StoreError> {
        self.state.attempt(Operation::ResolveIdempotencyKey)?;
        self.inner.resolve_idempotency_key(user_id, key, order_id).await
    }

    async fn delete_pending_idempotency_key(
        &mut self,
        user_id: UserId,
        key: &IdempotencyKey,
    ) -> Result<bool, StoreError> {
        self.state.attempt(Operation::DeleteIdempotencyKey)?;
        self.inner.delete_pending_idempotency_key(user_id, key).await
    }
}

#[cfg(test)]
mod tests {
    use storefront::InMemoryStore;

    use super::*;

    #[tokio::test]
    async fn armed_fault_fires_once_on_the_chosen_call() {
        let store = InMemoryStore::new().with_faults();
        store.fail_nth(Operation::InsertCart, 2);

        let mut tx = store.begin().await.expect("begin");
        tx.insert_cart(UserId::new(1)).await.expect("first call passes");
        let error = tx
            .insert_cart(UserId::new(2))
            .await
            .expect_err("second call fails");
        tx.insert_cart(UserId::new(3)).await.expect("fault is spent");

        assert_eq!(
            error,
            StoreError::StoreFailure {
                operation: Operation::InsertCart,
                detail: "armed fault fired".to_string(),
            }
        );
        assert_eq!(store.calls(Operation::InsertCart), 3);
    }

    #[tokio::test]
    async fn certain_failure_spares_rollback() {
        let store = InMemoryStore::new()
            .with_chaos(ChaosConfig::deterministic().with_failure_probability(1.0));
        assert!(store.begin().await.is_err());

        let wrapped = FaultInjectingTransaction {
            inner: store.inner().begin().await.expect("begin"),
            state: Arc::clone(&store.state),
        };
        assert!(wrapped.rollback().await.is_ok());
    }

    #[tokio::test]
    async fn counters_reset() {
        let store = InMemoryStore::new().with_faults();
        let tx = store.begin().await.expect("begin");
        tx.rollback().await.expect("rollback");

        assert_eq!(store.calls(Operation::BeginTransaction), 1);
        store.reset_calls();
        assert_eq!(store.calls(Operation::BeginTransaction), 0);
    }

    #[test]
    fn probability_is_clamped() {
        let config = ChaosConfig::deterministic().with_failure_probability(3.0);
        assert!((f32::from(config.failure_probability) - 1.0).abs() < f32::EPSILON);
    }
}
