//! In-memory [`Store`] backend.
//!
//! Committed rows live in one set of tables behind a short-held mutex. Each
//! transaction stages its writes in a private write set (so it reads its own
//! writes and nobody else does) and applies them atomically at commit, after
//! re-checking the uniqueness rules against whatever committed in the
//! meantime.
//!
//! Every existing row additionally carries an async row lock. A transaction
//! takes it through `lock_*_for_update` or implicitly on write, holds it until
//! commit or rollback, and re-reads the row once it holds the lock. Writers of
//! the same row therefore serialize the way `UPDATE` and `SELECT ... FOR
//! UPDATE` do, and a write never resurrects a row another transaction removed.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::{Mutex as RowMutex, OwnedMutexGuard};
use tracing::{debug, instrument};

use crate::errors::{Constraint, Operation, StoreError};
use crate::models::{
    Cart, CartItem, Category, IdempotencyRecord, IdempotencyState, NewCategory, NewOrderItem,
    NewProduct, Order, OrderItem, Product,
};
use crate::store::{Store, Transaction};
use crate::types::{
    CartId, CartItemId, CategoryId, IdempotencyKey, OrderId, OrderItemId, OrderStatus, ProductId,
    Quantity, UserId,
};

/// In-memory backend for development and tests.
///
/// Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Default)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<RowKey, Arc<RowMutex<()>>>>,
    sequence: AtomicI64,
}

impl Shared {
    fn next_id(&self) -> i64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Row lock identity.
///
/// Locks are taken in variant order, each kind ascending. Services touch rows
/// in the same order across a unit of work, so waits never form a cycle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum RowKey {
    Order(OrderId),
    Product(ProductId),
    CartItem(CartItemId),
    Cart(CartId),
    IdempotencyKey(UserId, IdempotencyKey),
}

type KeyId = (UserId, IdempotencyKey);

#[derive(Debug, Clone)]
struct CartRow {
    cart: Cart,
    deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct CartItemRow {
    item: CartItem,
    deleted_at: Option<DateTime<Utc>>,
}

impl CartItemRow {
    const fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

#[derive(Debug, Default)]
struct Tables {
    categories: BTreeMap<CategoryId, Category>,
    products: BTreeMap<ProductId, Product>,
    carts: BTreeMap<CartId, CartRow>,
    cart_items: BTreeMap<CartItemId, CartItemRow>,
    orders: BTreeMap<OrderId, Order>,
    order_items: BTreeMap<OrderItemId, OrderItem>,
    idempotency_keys: HashMap<KeyId, IdempotencyRecord>,
}

/// Uncommitted writes of one transaction. Rows are staged whole.
#[derive(Debug, Default)]
struct WriteSet {
    categories: BTreeMap<CategoryId, Category>,
    products: BTreeMap<ProductId, Product>,
    carts: BTreeMap<CartId, CartRow>,
    cart_items: BTreeMap<CartItemId, CartItemRow>,
    orders: BTreeMap<OrderId, Order>,
    order_items: BTreeMap<OrderItemId, OrderItem>,
    /// `None` stages a delete.
    idempotency_keys: HashMap<KeyId, Option<IdempotencyRecord>>,
    inserted_keys: HashSet<KeyId>,
}

fn merged<'a, K: Ord, V>(
    committed: &'a BTreeMap<K, V>,
    staged: &'a BTreeMap<K, V>,
) -> impl Iterator<Item = &'a V> + 'a {
    committed
        .iter()
        .filter(move |(key, _)| !staged.contains_key(key))
        .map(|(_, row)| row)
        .chain(staged.values())
}

/// Committed tables seen through one transaction's write set.
#[derive(Clone, Copy)]
struct View<'a> {
    tables: &'a Tables,
    writes: &'a WriteSet,
}

impl<'a> View<'a> {
    fn product(self, id: ProductId) -> Option<&'a Product> {
        self.writes
            .products
            .get(&id)
            .or_else(|| self.tables.products.get(&id))
    }

    fn products(self) -> impl Iterator<Item = &'a Product> + 'a {
        merged(&self.tables.products, &self.writes.products)
    }

    fn category(self, id: CategoryId) -> Option<&'a Category> {
        self.writes
            .categories
            .get(&id)
            .or_else(|| self.tables.categories.get(&id))
    }

    fn active_cart_of(self, user_id: UserId) -> Option<&'a CartRow> {
        merged(&self.tables.carts, &self.writes.carts)
            .find(|row| row.cart.user_id == user_id && row.deleted_at.is_none())
    }

    fn active_cart(self, id: CartId) -> Option<&'a CartRow> {
        self.writes
            .carts
            .get(&id)
            .or_else(|| self.tables.carts.get(&id))
            .filter(|row| row.deleted_at.is_none())
    }

    fn cart_items(self) -> impl Iterator<Item = &'a CartItemRow> + 'a {
        merged(&self.tables.cart_items, &self.writes.cart_items)
    }

    fn cart_item(self, id: CartItemId) -> Option<&'a CartItemRow> {
        self.writes
            .cart_items
            .get(&id)
            .or_else(|| self.tables.cart_items.get(&id))
    }

    fn active_cart_item(self, id: CartItemId) -> Option<&'a CartItemRow> {
        self.cart_item(id).filter(|row| row.is_active())
    }

    fn active_cart_item_for(
        self,
        cart_id: CartId,
        product_id: ProductId,
    ) -> Option<&'a CartItemRow> {
        self.cart_items().find(|row| {
            row.is_active() && row.item.cart_id == cart_id && row.item.product_id == product_id
        })
    }

    fn order(self, id: OrderId) -> Option<&'a Order> {
        self.writes
            .orders
            .get(&id)
            .or_else(|| self.tables.orders.get(&id))
    }

    fn orders(self) -> impl Iterator<Item = &'a Order> + 'a {
        merged(&self.tables.orders, &self.writes.orders)
    }

    fn order_items(self) -> impl Iterator<Item = &'a OrderItem> + 'a {
        merged(&self.tables.order_items, &self.writes.order_items)
    }

    fn idempotency_key(self, key: &KeyId) -> Option<&'a IdempotencyRecord> {
        match self.writes.idempotency_keys.get(key) {
            Some(staged) => staged.as_ref(),
            None => self.tables.idempotency_keys.get(key),
        }
    }
}

/// Transaction handle of [`InMemoryStore`].
#[derive(Debug)]
pub struct InMemoryTransaction {
    shared: Arc<Shared>,
    writes: WriteSet,
    held: Vec<OwnedMutexGuard<()>>,
    locked: HashSet<RowKey>,
}

impl InMemoryTransaction {
    fn view<R>(&self, read: impl FnOnce(View<'_>) -> R) -> R {
        let tables = self.shared.tables.lock();
        read(View {
            tables: &tables,
            writes: &self.writes,
        })
    }

    async fn lock_rows(&mut self, keys: Vec<RowKey>) {
        let ordered: BTreeSet<RowKey> = keys.into_iter().collect();

        for key in ordered {
            if self.locked.contains(&key) {
                continue;
            }
            let row_lock = {
                let mut locks = self.shared.row_locks.lock();
                Arc::clone(locks.entry(key.clone()).or_default())
            };
            let guard = row_lock.lock_owned().await;
            self.held.push(guard);
            let _ = self.locked.insert(key);
        }
    }

    fn read_products(&self, ids: &[ProductId]) -> Vec<Product> {
        let wanted: BTreeSet<ProductId> = ids.iter().copied().collect();
        self.view(|view| {
            wanted
                .into_iter()
                .filter_map(|id| view.product(id).cloned())
                .collect()
        })
    }

    fn active_cart_item_exists(&self, cart_id: CartId, product_id: ProductId) -> bool {
        self.view(|view| view.active_cart_item_for(cart_id, product_id).is_some())
    }
}

fn check_unique_at_commit(tables: &Tables, writes: &WriteSet) -> Result<(), StoreError> {
    let view = View { tables, writes };

    for row in writes.carts.values().filter(|row| row.deleted_at.is_none()) {
        let clash = merged(&tables.carts, &writes.carts).any(|other| {
            other.cart.id != row.cart.id
                && other.cart.user_id == row.cart.user_id
                && other.deleted_at.is_none()
        });
        if clash {
            return Err(StoreError::UniqueViolation {
                constraint: Constraint::ActiveCartPerUser,
            });
        }
    }

    for row in writes.cart_items.values().filter(|row| row.is_active()) {
        let clash = view.cart_items().any(|other| {
            other.is_active()
                && other.item.id != row.item.id
                && other.item.cart_id == row.item.cart_id
                && other.item.product_id == row.item.product_id
        });
        if clash {
            return Err(StoreError::UniqueViolation {
                constraint: Constraint::ActiveCartItemPerProduct,
            });
        }
    }

    if writes
        .inserted_keys
        .iter()
        .any(|key| tables.idempotency_keys.contains_key(key))
    {
        return Err(StoreError::UniqueViolation {
            constraint: Constraint::IdempotencyKeyPerUser,
        });
    }

    for product in writes
        .products
        .values()
        .filter(|product| !tables.products.contains_key(&product.id))
    {
        if view
            .products()
            .any(|other| other.id != product.id && other.sku == product.sku)
        {
            return Err(StoreError::UniqueViolation {
                constraint: Constraint::ProductSku,
            });
        }
    }

    Ok(())
}

fn apply(tables: &mut Tables, writes: WriteSet) {
    tables.categories.extend(writes.categories);
    tables.products.extend(writes.products);
    tables.carts.extend(writes.carts);
    tables.cart_items.extend(writes.cart_items);
    tables.orders.extend(writes.orders);
    tables.order_items.extend(writes.order_items);
    for (key, staged) in writes.idempotency_keys {
        match staged {
            Some(record) => {
                let _ = tables.idempotency_keys.insert(key, record);
            }
            None => {
                let _ = tables.idempotency_keys.remove(&key);
            }
        }
    }
}

impl Store for InMemoryStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction, StoreError> {
        Ok(InMemoryTransaction {
            shared: Arc::clone(&self.shared),
            writes: WriteSet::default(),
            held: Vec::new(),
            locked: HashSet::new(),
        })
    }
}

impl Transaction for InMemoryTransaction {
    #[instrument(name = "memory.commit", skip(self))]
    async fn commit(self) -> Result<(), StoreError> {
        let Self {
            shared,
            writes,
            held,
            ..
        } = self;

        {
            let mut tables = shared.tables.lock();
            check_unique_at_commit(&tables, &writes)?;
            apply(&mut tables, writes);
        }

        debug!(released_locks = held.len(), "[memory.commit] write set applied");
        drop(held);
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        debug!(
            released_locks = self.held.len(),
            "[memory.rollback] write set discarded"
        );
        Ok(())
    }

    async fn insert_category(&mut self, category: NewCategory) -> Result<Category, StoreError> {
        let row = Category {
            id: CategoryId::new(self.shared.next_id()),
            name: category.name,
            description: category.description,
        };
        let _ = self.writes.categories.insert(row.id, row.clone());
        Ok(row)
    }

    async fn insert_product(&mut self, product: NewProduct) -> Result<Product, StoreError> {
        if self.view(|view| view.products().any(|other| other.sku == product.sku)) {
            return Err(StoreError::UniqueViolation {
                constraint: Constraint::ProductSku,
            });
        }

        let row = Product {
            id: ProductId::new(self.shared.next_id()),
            category_id: product.category_id,
            name: product.name,
            description: product.description,
            sku: product.sku,
            price: product.price,
            stock: product.stock,
            is_active: product.is_active,
        };
        let _ = self.writes.products.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_products(&mut self, ids: &[ProductId]) -> Result<Vec<Product>, StoreError> {
        Ok(self.read_products(ids))
    }

    async fn lock_products_for_update(
        &mut self,
        ids: &[ProductId],
    ) -> Result<Vec<Product>, StoreError> {
        self.lock_rows(ids.iter().copied().map(RowKey::Product).collect())
            .await;
        Ok(self.read_products(ids))
    }

    async fn set_product_stock(&mut self, id: ProductId, stock: u32) -> Result<Product, StoreError> {
        self.lock_rows(vec![RowKey::Product(id)]).await;

        let mut product = self
            .view(|view| view.product(id).cloned())
            .ok_or(StoreError::MissingRow {
                operation: Operation::UpdateProductStock,
            })?;
        product.stock = stock;
        let _ = self.writes.products.insert(id, product.clone());
        Ok(product)
    }

    async fn get_categories(&mut self, ids: &[CategoryId]) -> Result<Vec<Category>, StoreError> {
        let wanted: BTreeSet<CategoryId> = ids.iter().copied().collect();
        Ok(self.view(|view| {
            wanted
                .into_iter()
                .filter_map(|id| view.category(id).cloned())
                .collect()
        }))
    }

    async fn get_cart_by_user(&mut self, user_id: UserId) -> Result<Option<Cart>, StoreError> {
        Ok(self.view(|view| view.active_cart_of(user_id).map(|row| row.cart.clone())))
    }

    async fn insert_cart(&mut self, user_id: UserId) -> Result<Cart, StoreError> {
        if self.view(|view| view.active_cart_of(user_id).is_some()) {
            return Err(StoreError::UniqueViolation {
                constraint: Constraint::ActiveCartPerUser,
            });
        }

        let now = Utc::now();
        let cart = Cart {
            id: CartId::new(self.shared.next_id()),
            user_id,
            created_at: now,
            updated_at: now,
        };
        let _ = self.writes.carts.insert(
            cart.id,
            CartRow {
                cart: cart.clone(),
                deleted_at: None,
            },
        );
        Ok(cart)
    }

    async fn touch_cart(&mut self, cart_id: CartId) -> Result<(), StoreError> {
        self.lock_rows(vec![RowKey::Cart(cart_id)]).await;

        let mut row = self
            .view(|view| view.active_cart(cart_id).cloned())
            .ok_or(StoreError::MissingRow {
                operation: Operation::TouchCart,
            })?;
        row.cart.updated_at = Utc::now();
        let _ = self.writes.carts.insert(cart_id, row);
        Ok(())
    }

    async fn get_cart_item(&mut self, id: CartItemId) -> Result<Option<CartItem>, StoreError> {
        Ok(self.view(|view| view.active_cart_item(id).map(|row| row.item.clone())))
    }

    async fn get_active_cart_item(
        &mut self,
        cart_id: CartId,
        product_id: ProductId,
    ) -> Result<Option<CartItem>, StoreError> {
        Ok(self.view(|view| {
            view.active_cart_item_for(cart_id, product_id)
                .map(|row| row.item.clone())
        }))
    }

    async fn list_cart_items(&mut self, cart_id: CartId) -> Result<Vec<CartItem>, StoreError> {
        let mut items: Vec<CartItem> = self.view(|view| {
            view.cart_items()
                .filter(|row| row.is_active() && row.item.cart_id == cart_id)
                .map(|row| row.item.clone())
                .collect()
        });
        items.sort_by_key(|item| item.id);
        Ok(items)
    }

    async fn insert_cart_item(
        &mut self,
        cart_id: CartId,
        product_id: ProductId,
        quantity: Quantity,
    ) -> Result<CartItem, StoreError> {
        if self.active_cart_item_exists(cart_id, product_id) {
            return Err(StoreError::UniqueViolation {
                constraint: Constraint::ActiveCartItemPerProduct,
            });
        }

        let now = Utc::now();
        let item = CartItem {
            id: CartItemId::new(self.shared.next_id()),
            cart_id,
            product_id,
            quantity,
            created_at: now,
            updated_at: now,
        };
        let _ = self.writes.cart_items.insert(
            item.id,
            CartItemRow {
                item: item.clone(),
                deleted_at: None,
            },
        );
        Ok(item)
    }

    async fn restore_cart_item(
        &mut self,
        cart_id: CartId,
        product_id: ProductId,
        quantity: Quantity,
    ) -> Result<Option<CartItem>, StoreError> {
        if self.active_cart_item_exists(cart_id, product_id) {
            return Err(StoreError::UniqueViolation {
                constraint: Constraint::ActiveCartItemPerProduct,
            });
        }

        let removed = self.view(|view| {
            view.cart_items()
                .filter(|row| {
                    !row.is_active()
                        && row.item.cart_id == cart_id
                        && row.item.product_id == product_id
                })
                .max_by_key(|row| (row.item.updated_at, row.item.id))
                .map(|row| row.item.id)
        });
        let Some(id) = removed else {
            return Ok(None);
        };

        self.lock_rows(vec![RowKey::CartItem(id)]).await;
        let Some(mut row) = self.view(|view| view.cart_item(id).cloned()) else {
            return Ok(None);
        };
        // Restored by the previous lock holder.
        if row.is_active() {
            return Err(StoreError::UniqueViolation {
                constraint: Constraint::ActiveCartItemPerProduct,
            });
        }

        row.deleted_at = None;
        row.item.quantity = quantity;
        row.item.updated_at = Utc::now();
        let item = row.item.clone();
        let _ = self.writes.cart_items.insert(item.id, row);
        Ok(Some(item))
    }

    async fn set_cart_item_quantity(
        &mut self,
        id: CartItemId,
        quantity: Quantity,
    ) -> Result<CartItem, StoreError> {
        self.lock_rows(vec![RowKey::CartItem(id)]).await;

        let mut row = self
            .view(|view| view.active_cart_item(id).cloned())
            .ok_or(StoreError::MissingRow {
                operation: Operation::UpdateCartItem,
            })?;
        row.item.quantity = quantity;
        row.item.updated_at = Utc::now();
        let item = row.item.clone();
        let _ = self.writes.cart_items.insert(id, row);
        Ok(item)
    }

    async fn soft_delete_cart_item(&mut self, id: CartItemId) -> Result<bool, StoreError> {
        self.lock_rows(vec![RowKey::CartItem(id)]).await;

        let Some(mut row) = self.view(|view| view.active_cart_item(id).cloned()) else {
            return Ok(false);
        };
        let now = Utc::now();
        row.deleted_at = Some(now);
        row.item.updated_at = now;
        let _ = self.writes.cart_items.insert(id, row);
        Ok(true)
    }

    async fn soft_delete_cart_items(&mut self, cart_id: CartId) -> Result<u64, StoreError> {
        let candidates: Vec<CartItemId> = self.view(|view| {
            view.cart_items()
                .filter(|row| row.is_active() && row.item.cart_id == cart_id)
                .map(|row| row.item.id)
                .collect()
        });
        self.lock_rows(candidates.iter().copied().map(RowKey::CartItem).collect())
            .await;

        let active: Vec<CartItemRow> = self.view(|view| {
            candidates
                .iter()
                .filter_map(|&id| view.active_cart_item(id).cloned())
                .collect()
        });

        let now = Utc::now();
        let mut removed = 0;
        for mut row in active {
            row.deleted_at = Some(now);
            row.item.updated_at = now;
            let _ = self.writes.cart_items.insert(row.item.id, row);
            removed += 1;
        }
        Ok(removed)
    }

    async fn insert_order(
        &mut self,
        user_id: UserId,
        total_amount: Decimal,
    ) -> Result<Order, StoreError> {
        let now = Utc::now();
        let order = Order {
            id: OrderId::new(self.shared.next_id()),
            user_id,
            status: OrderStatus::Pending,
            total_amount,
            created_at: now,
            updated_at: now,
        };
        let _ = self.writes.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn insert_order_item(&mut self, item: NewOrderItem) -> Result<OrderItem, StoreError> {
        if self.view(|view| view.order(item.order_id).is_none()) {
            return Err(StoreError::MissingRow {
                operation: Operation::InsertOrderItem,
            });
        }

        let row = OrderItem {
            id: OrderItemId::new(self.shared.next_id()),
            order_id: item.order_id,
            product_id: item.product_id,
            quantity: item.quantity,
            price: item.price,
            created_at: Utc::now(),
        };
        let _ = self.writes.order_items.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_order(&mut self, id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.view(|view| view.order(id).cloned()))
    }

    async fn lock_order_for_update(&mut self, id: OrderId) -> Result<Option<Order>, StoreError> {
        self.lock_rows(vec![RowKey::Order(id)]).await;
        Ok(self.view(|view| view.order(id).cloned()))
    }

    async fn set_order_status(
        &mut self,
        id: OrderId,
        status: OrderStatus,
    ) -> Result<Option<Order>, StoreError> {
        self.lock_rows(vec![RowKey::Order(id)]).await;

        let Some(mut order) = self.view(|view| view.order(id).cloned()) else {
            return Ok(None);
        };
        order.status = status;
        order.updated_at = Utc::now();
        let _ = self.writes.orders.insert(id, order.clone());
        Ok(Some(order))
    }

    async fn list_order_items(&mut self, order_id: OrderId) -> Result<Vec<OrderItem>, StoreError> {
        let mut items: Vec<OrderItem> = self.view(|view| {
            view.order_items()
                .filter(|item| item.order_id == order_id)
                .cloned()
                .collect()
        });
        items.sort_by_key(|item| item.id);
        Ok(items)
    }

    async fn list_order_items_for(
        &mut self,
        order_ids: &[OrderId],
    ) -> Result<Vec<OrderItem>, StoreError> {
        let wanted: BTreeSet<OrderId> = order_ids.iter().copied().collect();
        let mut items: Vec<OrderItem> = self.view(|view| {
            view.order_items()
                .filter(|item| wanted.contains(&item.order_id))
                .cloned()
                .collect()
        });
        items.sort_by_key(|item| (item.order_id, item.id));
        Ok(items)
    }

    async fn count_orders_by_user(&mut self, user_id: UserId) -> Result<u64, StoreError> {
        let count = self.view(|view| view.orders().filter(|o| o.user_id == user_id).count());
        u64::try_from(count).map_err(|_| StoreError::ValueOutOfRange {
            operation: Operation::CountOrders,
        })
    }

    async fn list_orders_by_user(
        &mut self,
        user_id: UserId,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<Order>, StoreError> {
        let mut orders: Vec<Order> = self.view(|view| {
            view.orders()
                .filter(|order| order.user_id == user_id)
                .cloned()
                .collect()
        });
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        let take = usize::try_from(limit).unwrap_or(usize::MAX);
        Ok(orders.into_iter().skip(skip).take(take).collect())
    }

    async fn get_idempotency_key(
        &mut self,
        user_id: UserId,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let id = (user_id, key.clone());
        Ok(self.view(|view| view.idempotency_key(&id).cloned()))
    }

    async fn insert_idempotency_key(
        &mut self,
        user_id: UserId,
        key: &IdempotencyKey,
        order_id: Option<OrderId>,
    ) -> Result<IdempotencyRecord, StoreError> {
        self.lock_rows(vec![RowKey::IdempotencyKey(user_id, key.clone())])
            .await;

        let id = (user_id, key.clone());
        if self.view(|view| view.idempotency_key(&id).is_some()) {
            return Err(StoreError::UniqueViolation {
                constraint: Constraint::IdempotencyKeyPerUser,
            });
        }

        let record = IdempotencyRecord {
            user_id,
            key: key.clone(),
            order_id,
            created_at: Utc::now(),
        };
        let _ = self
            .writes
            .idempotency_keys
            .insert(id.clone(), Some(record.clone()));
        let _ = self.writes.inserted_keys.insert(id);
        Ok(record)
    }

    async fn resolve_idempotency_key(
        &mut self,
        user_id: UserId,
        key: &IdempotencyKey,
        order_id: OrderId,
    ) -> Result<(), StoreError> {
        self.lock_rows(vec![RowKey::IdempotencyKey(user_id, key.clone())])
            .await;

        let id = (user_id, key.clone());
        let mut record = self
            .view(|view| view.idempotency_key(&id).cloned())
            .ok_or(StoreError::MissingRow {
                operation: Operation::ResolveIdempotencyKey,
            })?;
        record.order_id = Some(order_id);
        let _ = self.writes.idempotency_keys.insert(id, Some(record));
        Ok(())
    }

    async fn delete_pending_idempotency_key(
        &mut self,
        user_id: UserId,
        key: &IdempotencyKey,
    ) -> Result<bool, StoreError> {
        self.lock_rows(vec![RowKey::IdempotencyKey(user_id, key.clone())])
            .await;

        let id = (user_id, key.clone());
        let pending = self.view(|view| {
            view.idempotency_key(&id)
                .is_some_and(|record| record.state() == IdempotencyState::Pending)
        });
        if !pending {
            return Ok(false);
        }

        if self.writes.inserted_keys.remove(&id) {
            let _ = self.writes.idempotency_keys.remove(&id);
        } else {
            let _ = self.writes.idempotency_keys.insert(id, None);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn seed_product(store: &InMemoryStore, sku: &str, stock: u32) -> Product {
        let mut tx = store.begin().await.expect("begin");
        let category = tx
            .insert_category(NewCategory {
                name: "Tools".to_string(),
                description: None,
            })
            .await
            .expect("insert category");
        let product = tx
            .insert_product(NewProduct {
                category_id: category.id,
                name: "Hammer".to_string(),
                description: None,
                sku: sku.to_string(),
                price: Decimal::new(1999, 2),
                stock,
                is_active: true,
            })
            .await
            .expect("insert product");
        tx.commit().await.expect("commit");
        product
    }

    #[tokio::test]
    async fn uncommitted_writes_are_private_to_their_transaction() {
        // Given: a product with stock 5
        let store = InMemoryStore::new();
        let product = seed_product(&store, "HAM-1", 5).await;

        // When: one transaction writes stock but has not committed
        let mut writer = store.begin().await.expect("begin writer");
        let _ = writer
            .set_product_stock(product.id, 1)
            .await
            .expect("stage stock");

        // Then: the writer sees its own write and a reader does not
        let own = writer.get_product(product.id).await.expect("own read");
        let mut reader = store.begin().await.expect("begin reader");
        let other = reader.get_product(product.id).await.expect("other read");
        assert_eq!(own.map(|p| p.stock), Some(1));
        assert_eq!(other.map(|p| p.stock), Some(5));
    }

    #[tokio::test]
    async fn dropping_a_transaction_discards_writes_and_releases_locks() {
        let store = InMemoryStore::new();
        let product = seed_product(&store, "HAM-2", 5).await;

        {
            let mut tx = store.begin().await.expect("begin");
            let _ = tx
                .set_product_stock(product.id, 0)
                .await
                .expect("stage stock");
        }

        let mut tx = store.begin().await.expect("begin after drop");
        let locked = tokio::time::timeout(
            Duration::from_secs(1),
            tx.lock_products_for_update(&[product.id]),
        )
        .await
        .expect("lock must be free after drop")
        .expect("lock products");
        assert_eq!(locked[0].stock, 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_locker_waits_and_then_reads_committed_stock() {
        // Given: one transaction holds the product lock
        let store = InMemoryStore::new();
        let product_id = seed_product(&store, "HAM-3", 5).await.id;
        let mut first = store.begin().await.expect("begin first");
        let _ = first
            .lock_products_for_update(&[product_id])
            .await
            .expect("first lock");

        // When: a second transaction asks for the same row
        let contender_store = store.clone();
        let contender = tokio::spawn(async move {
            let mut second = contender_store.begin().await.expect("begin second");
            let rows = second
                .lock_products_for_update(&[product_id])
                .await
                .expect("second lock");
            rows[0].stock
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished(), "second locker must block");

        let _ = first
            .set_product_stock(product_id, 2)
            .await
            .expect("stage stock");
        first.commit().await.expect("commit first");

        // Then: the waiter observes the first transaction's committed value
        let observed = contender.await.expect("contender task");
        assert_eq!(observed, 2);
    }

    #[tokio::test]
    async fn concurrent_cart_creation_is_rejected_at_commit() {
        let store = InMemoryStore::new();
        let user = UserId::new(42);
        let mut first = store.begin().await.expect("begin first");
        let mut second = store.begin().await.expect("begin second");

        let _ = first.insert_cart(user).await.expect("first insert");
        let _ = second.insert_cart(user).await.expect("second insert staged");
        first.commit().await.expect("first commit");

        let error = second.commit().await.expect_err("second commit must fail");
        assert_eq!(
            error,
            StoreError::UniqueViolation {
                constraint: Constraint::ActiveCartPerUser
            }
        );
    }

    #[tokio::test]
    async fn claim_then_release_in_one_transaction_leaves_nothing_behind() {
        let store = InMemoryStore::new();
        let user = UserId::new(7);
        let key = IdempotencyKey::try_new("retry-me").expect("valid key");

        let mut tx = store.begin().await.expect("begin");
        let _ = tx
            .insert_idempotency_key(user, &key, None)
            .await
            .expect("insert");
        assert!(tx
            .delete_pending_idempotency_key(user, &key)
            .await
            .expect("delete"));
        tx.commit().await.expect("commit");

        let mut tx = store.begin().await.expect("begin reader");
        assert!(tx
            .get_idempotency_key(user, &key)
            .await
            .expect("read")
            .is_none());
    }
}
