//! Behavioral contract every [`Store`] backend must honor.
//!
//! Each `test_*` function runs one scenario against a store produced by
//! `make_store` and reports the first deviation as a [`ContractTestFailure`].
//! Scenarios create their own users and products, so they can share a
//! database with other tests. Instantiate the whole suite for a backend with
//! [`store_contract_tests!`](crate::store_contract_tests).

use std::fmt;
use std::time::Duration;

use rust_decimal::Decimal;
use storefront::{
    CartItem, Constraint, IdempotencyKey, IdempotencyState, OrderId, OrderStatus, Product,
    ProductId, Store, StoreError, Transaction,
};
use tokio::task::JoinHandle;

use crate::fixtures::{quantity, seed_catalog_product, stock_of, unique_user_id};

/// A scenario that did not behave as the contract requires.
#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn store_error(scenario: &'static str, operation: &'static str, error: &StoreError) -> Self {
        Self::new(
            scenario,
            format!("{operation} returned unexpected error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::new(scenario, detail)
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

/// Outcome of one contract scenario.
pub type ContractTestResult = Result<(), ContractTestFailure>;

fn step<T>(
    scenario: &'static str,
    operation: &'static str,
    result: Result<T, StoreError>,
) -> Result<T, ContractTestFailure> {
    result.map_err(|error| ContractTestFailure::store_error(scenario, operation, &error))
}

async fn seeded_product<S: Store>(
    scenario: &'static str,
    store: &S,
    stock: u32,
) -> Result<Product, ContractTestFailure> {
    step(
        scenario,
        "seed_product",
        seed_catalog_product(store, Decimal::new(1999, 2), stock).await,
    )
}

async fn committed_stock<S: Store>(
    scenario: &'static str,
    store: &S,
    product_id: ProductId,
) -> Result<u32, ContractTestFailure> {
    step(scenario, "get_product", stock_of(store, product_id).await)?.ok_or_else(|| {
        ContractTestFailure::assertion(scenario, format!("product {product_id} disappeared"))
    })
}

fn expect_unique_violation<T: fmt::Debug>(
    scenario: &'static str,
    operation: &'static str,
    expected: Constraint,
    result: Result<T, StoreError>,
) -> ContractTestResult {
    match result {
        Err(StoreError::UniqueViolation { constraint }) if constraint == expected => Ok(()),
        Err(error) => Err(ContractTestFailure::store_error(scenario, operation, &error)),
        Ok(value) => Err(ContractTestFailure::assertion(
            scenario,
            format!("expected {expected} violation from {operation}, got {value:?}"),
        )),
    }
}

/// Rolled-back and dropped transactions leave committed state untouched.
pub async fn test_rollback_discards_writes<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: Store,
{
    const SCENARIO: &str = "rollback_discards_writes";

    let store = make_store();
    let product = seeded_product(SCENARIO, &store, 5).await?;

    let mut tx = step(SCENARIO, "begin", store.begin().await)?;
    let _ = step(
        SCENARIO,
        "set_product_stock",
        tx.set_product_stock(product.id, 0).await,
    )?;
    step(SCENARIO, "rollback", tx.rollback().await)?;

    let mut tx = step(SCENARIO, "begin", store.begin().await)?;
    let _ = step(
        SCENARIO,
        "set_product_stock",
        tx.set_product_stock(product.id, 1).await,
    )?;
    drop(tx);

    let stock = committed_stock(SCENARIO, &store, product.id).await?;
    if stock != 5 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected stock 5 after rollback and drop, observed {stock}"),
        ));
    }
    Ok(())
}

/// A transaction sees its own writes; others see them only after commit.
pub async fn test_uncommitted_writes_are_isolated<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: Store,
{
    const SCENARIO: &str = "uncommitted_writes_are_isolated";

    let store = make_store();
    let product = seeded_product(SCENARIO, &store, 9).await?;

    let mut writer = step(SCENARIO, "begin", store.begin().await)?;
    let _ = step(
        SCENARIO,
        "set_product_stock",
        writer.set_product_stock(product.id, 4).await,
    )?;

    let own = step(SCENARIO, "get_product", writer.get_product(product.id).await)?
        .map(|product| product.stock);
    if own != Some(4) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("writer should read its own stock 4, observed {own:?}"),
        ));
    }

    let outside = committed_stock(SCENARIO, &store, product.id).await?;
    if outside != 9 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("uncommitted stock leaked: expected 9, observed {outside}"),
        ));
    }

    step(SCENARIO, "commit", writer.commit().await)?;
    let after = committed_stock(SCENARIO, &store, product.id).await?;
    if after != 4 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("committed stock should be 4, observed {after}"),
        ));
    }
    Ok(())
}

/// Concurrent read-modify-write cycles under `lock_products_for_update`
/// never lose an update.
pub async fn test_product_lock_serializes_updates<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: Store,
{
    const SCENARIO: &str = "product_lock_serializes_updates";
    const CONTENDERS: u32 = 8;

    let store = make_store();
    let product = seeded_product(SCENARIO, &store, CONTENDERS).await?;
    let product_id = product.id;

    let mut handles = Vec::with_capacity(CONTENDERS as usize);
    for _ in 0..CONTENDERS {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut tx = store.begin().await?;
            let locked = tx.lock_products_for_update(&[product_id]).await?;
            let current = locked.first().map_or(0, |product| product.stock);
            tokio::task::yield_now().await;
            let _ = tx
                .set_product_stock(product_id, current.saturating_sub(1))
                .await?;
            tx.commit().await
        }));
    }
    for handle in handles {
        let outcome = handle.await.map_err(|error| {
            ContractTestFailure::assertion(SCENARIO, format!("contender panicked: {error}"))
        })?;
        step(SCENARIO, "locked_decrement", outcome)?;
    }

    let stock = committed_stock(SCENARIO, &store, product_id).await?;
    if stock != 0 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("{CONTENDERS} serialized decrements should leave 0, observed {stock}"),
        ));
    }
    Ok(())
}

/// How long a contender gets to show that it is waiting on a row lock.
const CONTENTION_WINDOW: Duration = Duration::from_millis(100);

async fn join_contender<T>(
    scenario: &'static str,
    operation: &'static str,
    handle: JoinHandle<Result<T, StoreError>>,
) -> Result<Result<T, StoreError>, ContractTestFailure> {
    handle.await.map_err(|error| {
        ContractTestFailure::assertion(scenario, format!("{operation} task panicked: {error}"))
    })
}

/// Writers of the same cart line serialize on its row lock, and a write that
/// waited re-reads the line instead of overwriting what committed first.
pub async fn test_cart_item_writes_serialize<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: Store,
{
    const SCENARIO: &str = "cart_item_writes_serialize";

    let store = make_store();
    let product = seeded_product(SCENARIO, &store, 10).await?;
    let user_id = unique_user_id();

    let mut tx = step(SCENARIO, "begin", store.begin().await)?;
    let cart = step(SCENARIO, "insert_cart", tx.insert_cart(user_id).await)?;
    let line = step(
        SCENARIO,
        "insert_cart_item",
        tx.insert_cart_item(cart.id, product.id, quantity(1)).await,
    )?;
    step(SCENARIO, "commit", tx.commit().await)?;

    // A quantity change holds the line while a bulk removal arrives.
    let mut updater = step(SCENARIO, "begin", store.begin().await)?;
    let _ = step(
        SCENARIO,
        "set_cart_item_quantity",
        updater.set_cart_item_quantity(line.id, quantity(2)).await,
    )?;

    let remover_store = store.clone();
    let cart_id = cart.id;
    let remover = tokio::spawn(async move {
        let mut tx = remover_store.begin().await?;
        let removed = tx.soft_delete_cart_items(cart_id).await?;
        tx.commit().await?;
        Ok::<_, StoreError>(removed)
    });
    tokio::time::sleep(CONTENTION_WINDOW).await;
    if remover.is_finished() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "bulk removal did not wait for the line held by the quantity change",
        ));
    }

    step(SCENARIO, "commit", updater.commit().await)?;
    let removed = step(
        SCENARIO,
        "soft_delete_cart_items",
        join_contender(SCENARIO, "soft_delete_cart_items", remover).await?,
    )?;

    let mut tx = step(SCENARIO, "begin", store.begin().await)?;
    let active = step(SCENARIO, "list_cart_items", tx.list_cart_items(cart.id).await)?;
    step(SCENARIO, "rollback", tx.rollback().await)?;
    if removed != 1 || !active.is_empty() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("the removal must win over the earlier update, removed={removed} active={active:?}"),
        ));
    }

    // A removal holds a fresh line while a quantity change arrives.
    let mut tx = step(SCENARIO, "begin", store.begin().await)?;
    let line = step(
        SCENARIO,
        "insert_cart_item",
        tx.insert_cart_item(cart.id, product.id, quantity(3)).await,
    )?;
    step(SCENARIO, "commit", tx.commit().await)?;

    let mut remover = step(SCENARIO, "begin", store.begin().await)?;
    let removed = step(
        SCENARIO,
        "soft_delete_cart_item",
        remover.soft_delete_cart_item(line.id).await,
    )?;

    let updater_store = store.clone();
    let line_id = line.id;
    let updater = tokio::spawn(async move {
        let mut tx = updater_store.begin().await?;
        let updated = tx.set_cart_item_quantity(line_id, quantity(5)).await;
        tx.rollback().await?;
        updated
    });
    tokio::time::sleep(CONTENTION_WINDOW).await;
    if updater.is_finished() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "quantity change did not wait for the line held by the removal",
        ));
    }

    step(SCENARIO, "commit", remover.commit().await)?;
    match join_contender(SCENARIO, "set_cart_item_quantity", updater).await? {
        Err(StoreError::MissingRow { .. }) if removed => Ok(()),
        Err(error) => Err(ContractTestFailure::store_error(
            SCENARIO,
            "set_cart_item_quantity",
            &error,
        )),
        Ok(item) => Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("quantity change revived a removed line: {item:?}"),
        )),
    }
}

/// A pending entry being resolved cannot be released underneath the resolver.
pub async fn test_idempotency_writes_serialize<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: Store,
{
    const SCENARIO: &str = "idempotency_writes_serialize";

    let store = make_store();
    let user_id = unique_user_id();
    let key = IdempotencyKey::try_new("contract-contended").map_err(|error| {
        ContractTestFailure::assertion(SCENARIO, format!("invalid key: {error}"))
    })?;

    let mut tx = step(SCENARIO, "begin", store.begin().await)?;
    let _ = step(
        SCENARIO,
        "insert_idempotency_key",
        tx.insert_idempotency_key(user_id, &key, None).await,
    )?;
    step(SCENARIO, "commit", tx.commit().await)?;

    let mut resolver = step(SCENARIO, "begin", store.begin().await)?;
    let order = step(
        SCENARIO,
        "insert_order",
        resolver.insert_order(user_id, Decimal::ZERO).await,
    )?;
    step(
        SCENARIO,
        "resolve_idempotency_key",
        resolver.resolve_idempotency_key(user_id, &key, order.id).await,
    )?;

    let releaser_store = store.clone();
    let releaser_key = key.clone();
    let releaser = tokio::spawn(async move {
        let mut tx = releaser_store.begin().await?;
        let released = tx
            .delete_pending_idempotency_key(user_id, &releaser_key)
            .await?;
        tx.commit().await?;
        Ok::<_, StoreError>(released)
    });
    tokio::time::sleep(CONTENTION_WINDOW).await;
    if releaser.is_finished() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "release did not wait for the entry held by the resolver",
        ));
    }

    step(SCENARIO, "commit", resolver.commit().await)?;
    let released = step(
        SCENARIO,
        "delete_pending_idempotency_key",
        join_contender(SCENARIO, "delete_pending_idempotency_key", releaser).await?,
    )?;

    let mut tx = step(SCENARIO, "begin", store.begin().await)?;
    let state = step(
        SCENARIO,
        "get_idempotency_key",
        tx.get_idempotency_key(user_id, &key).await,
    )?
    .map(|record| record.state());
    step(SCENARIO, "rollback", tx.rollback().await)?;

    if released || state != Some(IdempotencyState::Resolved(order.id)) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("resolved entry must survive the release, released={released} state={state:?}"),
        ));
    }
    Ok(())
}

/// A user has at most one active cart.
pub async fn test_single_active_cart_per_user<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: Store,
{
    const SCENARIO: &str = "single_active_cart_per_user";

    let store = make_store();
    let user_id = unique_user_id();

    let mut tx = step(SCENARIO, "begin", store.begin().await)?;
    let cart = step(SCENARIO, "insert_cart", tx.insert_cart(user_id).await)?;
    step(SCENARIO, "commit", tx.commit().await)?;

    let mut tx = step(SCENARIO, "begin", store.begin().await)?;
    let second = match tx.insert_cart(user_id).await {
        Ok(_) => tx.commit().await.map(|()| "second cart committed"),
        Err(error) => Err(error),
    };
    expect_unique_violation(
        SCENARIO,
        "insert_cart",
        Constraint::ActiveCartPerUser,
        second,
    )?;

    let mut tx = step(SCENARIO, "begin", store.begin().await)?;
    let found = step(SCENARIO, "get_cart_by_user", tx.get_cart_by_user(user_id).await)?;
    if found.map(|found| found.id) != Some(cart.id) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "the first cart should remain the active one",
        ));
    }
    Ok(())
}

/// A removed cart line comes back under its original id.
pub async fn test_cart_item_resurrection<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: Store,
{
    const SCENARIO: &str = "cart_item_resurrection";

    let store = make_store();
    let product = seeded_product(SCENARIO, &store, 10).await?;
    let user_id = unique_user_id();

    let mut tx = step(SCENARIO, "begin", store.begin().await)?;
    let cart = step(SCENARIO, "insert_cart", tx.insert_cart(user_id).await)?;
    let original = step(
        SCENARIO,
        "insert_cart_item",
        tx.insert_cart_item(cart.id, product.id, quantity(2)).await,
    )?;
    step(SCENARIO, "commit", tx.commit().await)?;

    let mut tx = step(SCENARIO, "begin", store.begin().await)?;
    let removed = step(
        SCENARIO,
        "soft_delete_cart_item",
        tx.soft_delete_cart_item(original.id).await,
    )?;
    let listed = step(SCENARIO, "list_cart_items", tx.list_cart_items(cart.id).await)?;
    step(SCENARIO, "commit", tx.commit().await)?;
    if !removed || !listed.is_empty() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("soft delete should hide the line, removed={removed} listed={listed:?}"),
        ));
    }

    let mut tx = step(SCENARIO, "begin", store.begin().await)?;
    let restored = step(
        SCENARIO,
        "restore_cart_item",
        tx.restore_cart_item(cart.id, product.id, quantity(3)).await,
    )?;
    let listed: Vec<CartItem> =
        step(SCENARIO, "list_cart_items", tx.list_cart_items(cart.id).await)?;
    step(SCENARIO, "commit", tx.commit().await)?;

    let Some(restored) = restored else {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "restore found no soft-deleted line",
        ));
    };
    if restored.id != original.id || restored.quantity != quantity(3) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "expected line {} with quantity 3, observed line {} with quantity {}",
                original.id, restored.id, restored.quantity
            ),
        ));
    }
    if listed.len() != 1 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected exactly one active line, observed {}", listed.len()),
        ));
    }

    let mut tx = step(SCENARIO, "begin", store.begin().await)?;
    let duplicate = tx.insert_cart_item(cart.id, product.id, quantity(1)).await;
    expect_unique_violation(
        SCENARIO,
        "insert_cart_item",
        Constraint::ActiveCartItemPerProduct,
        duplicate,
    )
}

/// Registry entries are unique per user, resolvable, and removable only
/// while pending.
pub async fn test_idempotency_key_lifecycle<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: Store,
{
    const SCENARIO: &str = "idempotency_key_lifecycle";

    let store = make_store();
    let user_id = unique_user_id();
    let other_user = unique_user_id();
    let key = IdempotencyKey::try_new("contract-checkout").map_err(|error| {
        ContractTestFailure::assertion(SCENARIO, format!("invalid key: {error}"))
    })?;

    let mut tx = step(SCENARIO, "begin", store.begin().await)?;
    let pending = step(
        SCENARIO,
        "insert_idempotency_key",
        tx.insert_idempotency_key(user_id, &key, None).await,
    )?;
    let _ = step(
        SCENARIO,
        "insert_idempotency_key",
        tx.insert_idempotency_key(other_user, &key, None).await,
    )?;
    step(SCENARIO, "commit", tx.commit().await)?;
    if pending.state() != IdempotencyState::Pending {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "a key recorded without an order should be pending",
        ));
    }

    let mut tx = step(SCENARIO, "begin", store.begin().await)?;
    let duplicate = tx.insert_idempotency_key(user_id, &key, None).await;
    drop(tx);
    expect_unique_violation(
        SCENARIO,
        "insert_idempotency_key",
        Constraint::IdempotencyKeyPerUser,
        duplicate,
    )?;

    let mut tx = step(SCENARIO, "begin", store.begin().await)?;
    let order = step(
        SCENARIO,
        "insert_order",
        tx.insert_order(user_id, Decimal::ZERO).await,
    )?;
    step(
        SCENARIO,
        "resolve_idempotency_key",
        tx.resolve_idempotency_key(user_id, &key, order.id).await,
    )?;
    step(SCENARIO, "commit", tx.commit().await)?;

    let mut tx = step(SCENARIO, "begin", store.begin().await)?;
    let resolved = step(
        SCENARIO,
        "get_idempotency_key",
        tx.get_idempotency_key(user_id, &key).await,
    )?
    .map(|record| record.state());
    if resolved != Some(IdempotencyState::Resolved(order.id)) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected key resolved to {}, observed {resolved:?}", order.id),
        ));
    }

    let removed_resolved = step(
        SCENARIO,
        "delete_pending_idempotency_key",
        tx.delete_pending_idempotency_key(user_id, &key).await,
    )?;
    let removed_pending = step(
        SCENARIO,
        "delete_pending_idempotency_key",
        tx.delete_pending_idempotency_key(other_user, &key).await,
    )?;
    let left = step(
        SCENARIO,
        "get_idempotency_key",
        tx.get_idempotency_key(other_user, &key).await,
    )?;
    step(SCENARIO, "commit", tx.commit().await)?;

    if removed_resolved {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "a resolved key must not be deleted",
        ));
    }
    if !removed_pending || left.is_some() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "a pending key should be deleted",
        ));
    }
    Ok(())
}

/// Order listing is newest first and pages by limit and offset.
pub async fn test_orders_listed_newest_first<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: Store,
{
    const SCENARIO: &str = "orders_listed_newest_first";

    let store = make_store();
    let user_id = unique_user_id();

    let mut placed: Vec<OrderId> = Vec::new();
    for cents in [100, 200, 300] {
        let mut tx = step(SCENARIO, "begin", store.begin().await)?;
        let order = step(
            SCENARIO,
            "insert_order",
            tx.insert_order(user_id, Decimal::new(cents, 2)).await,
        )?;
        step(SCENARIO, "commit", tx.commit().await)?;
        if order.status != OrderStatus::Pending {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("new orders start pending, observed {}", order.status),
            ));
        }
        placed.push(order.id);
    }

    let mut tx = step(SCENARIO, "begin", store.begin().await)?;
    let count = step(
        SCENARIO,
        "count_orders_by_user",
        tx.count_orders_by_user(user_id).await,
    )?;
    let first_page: Vec<OrderId> = step(
        SCENARIO,
        "list_orders_by_user",
        tx.list_orders_by_user(user_id, 2, 0).await,
    )?
    .into_iter()
    .map(|order| order.id)
    .collect();
    let second_page: Vec<OrderId> = step(
        SCENARIO,
        "list_orders_by_user",
        tx.list_orders_by_user(user_id, 2, 2).await,
    )?
    .into_iter()
    .map(|order| order.id)
    .collect();
    step(SCENARIO, "rollback", tx.rollback().await)?;

    if count != 3 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected 3 orders, counted {count}"),
        ));
    }
    if first_page != vec![placed[2], placed[1]] || second_page != vec![placed[0]] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("unexpected pages {first_page:?} / {second_page:?} for {placed:?}"),
        ));
    }
    Ok(())
}

/// Writes against rows that do not exist are reported, not invented.
pub async fn test_missing_rows_are_reported<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: Store,
{
    const SCENARIO: &str = "missing_rows_are_reported";

    let store = make_store();
    let missing_order = OrderId::new(i64::MAX);

    let mut tx = step(SCENARIO, "begin", store.begin().await)?;
    let status = step(
        SCENARIO,
        "set_order_status",
        tx.set_order_status(missing_order, OrderStatus::Shipped).await,
    )?;
    let locked = step(
        SCENARIO,
        "lock_order_for_update",
        tx.lock_order_for_update(missing_order).await,
    )?;
    let products = step(
        SCENARIO,
        "lock_products_for_update",
        tx.lock_products_for_update(&[ProductId::new(i64::MAX)]).await,
    )?;
    step(SCENARIO, "rollback", tx.rollback().await)?;

    if status.is_some() || locked.is_some() || !products.is_empty() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "operations on unknown ids should find nothing",
        ));
    }

    let mut tx = step(SCENARIO, "begin", store.begin().await)?;
    match tx.set_product_stock(ProductId::new(i64::MAX), 1).await {
        Err(StoreError::MissingRow { .. }) => Ok(()),
        Err(error) => Err(ContractTestFailure::store_error(
            SCENARIO,
            "set_product_stock",
            &error,
        )),
        Ok(product) => Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("stock write invented product {product:?}"),
        )),
    }
}

/// Instantiate the store contract suite for one backend.
///
/// ```rust,ignore
/// storefront_testing::store_contract_tests!(
///     suite = in_memory,
///     make_store = storefront::InMemoryStore::new,
/// );
/// ```
#[macro_export]
macro_rules! store_contract_tests {
    (suite = $suite:ident, make_store = $make_store:expr $(,)?) => {
        mod $suite {
            use $crate::contract::{
                test_cart_item_resurrection, test_cart_item_writes_serialize,
                test_idempotency_key_lifecycle, test_idempotency_writes_serialize,
                test_missing_rows_are_reported, test_orders_listed_newest_first,
                test_product_lock_serializes_updates, test_rollback_discards_writes,
                test_single_active_cart_per_user, test_uncommitted_writes_are_isolated,
            };

            #[tokio::test(flavor = "multi_thread")]
            async fn rollback_discards_writes_contract() {
                test_rollback_discards_writes($make_store)
                    .await
                    .expect("store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn uncommitted_writes_are_isolated_contract() {
                test_uncommitted_writes_are_isolated($make_store)
                    .await
                    .expect("store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn product_lock_serializes_updates_contract() {
                test_product_lock_serializes_updates($make_store)
                    .await
                    .expect("store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn cart_item_writes_serialize_contract() {
                test_cart_item_writes_serialize($make_store)
                    .await
                    .expect("store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn idempotency_writes_serialize_contract() {
                test_idempotency_writes_serialize($make_store)
                    .await
                    .expect("store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn single_active_cart_per_user_contract() {
                test_single_active_cart_per_user($make_store)
                    .await
                    .expect("store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn cart_item_resurrection_contract() {
                test_cart_item_resurrection($make_store)
                    .await
                    .expect("store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn idempotency_key_lifecycle_contract() {
                test_idempotency_key_lifecycle($make_store)
                    .await
                    .expect("store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn orders_listed_newest_first_contract() {
                test_orders_listed_newest_first($make_store)
                    .await
                    .expect("store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn missing_rows_are_reported_contract() {
                test_missing_rows_are_reported($make_store)
                    .await
                    .expect("store contract failed");
            }
        }
    };
}

pub use store_contract_tests;
