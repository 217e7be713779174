use rust_decimal::Decimal;
use sqlx::{postgres::PgRow, query, Postgres, Row};
use storefront::{
    Cart, CartId, CartItem, CartItemId, Category, CategoryId, IdempotencyKey, IdempotencyRecord,
    NewCategory, NewOrderItem, NewProduct, Operation, Order, OrderId, OrderItem, OrderItemId,
    OrderStatus, Product, ProductId, Quantity, StoreError, Transaction, UserId,
};
use tracing::{debug, instrument};

use crate::map_sqlx_error;

const PRODUCT_COLUMNS: &str =
    "id, category_id, name, description, sku, price, stock, is_active";
const CART_COLUMNS: &str = "id, user_id, created_at, updated_at";
const CART_ITEM_COLUMNS: &str = "id, cart_id, product_id, quantity, created_at, updated_at";
const ORDER_COLUMNS: &str = "id, user_id, status, total_amount, created_at, updated_at";
const ORDER_ITEM_COLUMNS: &str = "id, order_id, product_id, quantity, price, created_at";
const IDEMPOTENCY_COLUMNS: &str = "user_id, idempotency_key, order_id, created_at";

/// One facade transaction: a database transaction held on a pooled
/// connection until commit or rollback.
///
/// Dropping it without committing returns the connection with the
/// transaction rolled back.
#[derive(Debug)]
pub struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl PostgresTransaction {
    pub(crate) const fn new(tx: sqlx::Transaction<'static, Postgres>) -> Self {
        Self { tx }
    }
}

fn failed(operation: Operation) -> impl Fn(sqlx::Error) -> StoreError {
    move |error| map_sqlx_error(error, operation)
}

const fn out_of_range(operation: Operation) -> StoreError {
    StoreError::ValueOutOfRange { operation }
}

fn stock_column(stock: u32, operation: Operation) -> Result<i32, StoreError> {
    i32::try_from(stock).map_err(|_| out_of_range(operation))
}

fn quantity_column(quantity: Quantity, operation: Operation) -> Result<i32, StoreError> {
    i32::try_from(quantity.into_inner()).map_err(|_| out_of_range(operation))
}

fn product_keys(ids: &[ProductId]) -> Vec<i64> {
    ids.iter().map(|id| id.into_inner()).collect()
}

fn category_keys(ids: &[CategoryId]) -> Vec<i64> {
    ids.iter().map(|id| id.into_inner()).collect()
}

fn decode_quantity(row: &PgRow, operation: Operation) -> Result<Quantity, StoreError> {
    let raw: i32 = row.try_get("quantity").map_err(failed(operation))?;
    u32::try_from(raw)
        .ok()
        .and_then(|raw| Quantity::try_new(raw).ok())
        .ok_or_else(|| out_of_range(operation))
}

fn category_from_row(row: &PgRow, operation: Operation) -> Result<Category, StoreError> {
    let decode = failed(operation);
    Ok(Category {
        id: CategoryId::new(row.try_get("id").map_err(&decode)?),
        name: row.try_get("name").map_err(&decode)?,
        description: row.try_get("description").map_err(&decode)?,
    })
}

fn product_from_row(row: &PgRow, operation: Operation) -> Result<Product, StoreError> {
    let decode = failed(operation);
    let stock: i32 = row.try_get("stock").map_err(&decode)?;
    Ok(Product {
        id: ProductId::new(row.try_get("id").map_err(&decode)?),
        category_id: CategoryId::new(row.try_get("category_id").map_err(&decode)?),
        name: row.try_get("name").map_err(&decode)?,
        description: row.try_get("description").map_err(&decode)?,
        sku: row.try_get("sku").map_err(&decode)?,
        price: row.try_get("price").map_err(&decode)?,
        stock: u32::try_from(stock).map_err(|_| out_of_range(operation))?,
        is_active: row.try_get("is_active").map_err(&decode)?,
    })
}

fn cart_from_row(row: &PgRow, operation: Operation) -> Result<Cart, StoreError> {
    let decode = failed(operation);
    Ok(Cart {
        id: CartId::new(row.try_get("id").map_err(&decode)?),
        user_id: UserId::new(row.try_get("user_id").map_err(&decode)?),
        created_at: row.try_get("created_at").map_err(&decode)?,
        updated_at: row.try_get("updated_at").map_err(&decode)?,
    })
}

fn cart_item_from_row(row: &PgRow, operation: Operation) -> Result<CartItem, StoreError> {
    let decode = failed(operation);
    Ok(CartItem {
        id: CartItemId::new(row.try_get("id").map_err(&decode)?),
        cart_id: CartId::new(row.try_get("cart_id").map_err(&decode)?),
        product_id: ProductId::new(row.try_get("product_id").map_err(&decode)?),
        quantity: decode_quantity(row, operation)?,
        created_at: row.try_get("created_at").map_err(&decode)?,
        updated_at: row.try_get("updated_at").map_err(&decode)?,
    })
}

fn order_from_row(row: &PgRow, operation: Operation) -> Result<Order, StoreError> {
    let decode = failed(operation);
    let status: String = row.try_get("status").map_err(&decode)?;
    Ok(Order {
        id: OrderId::new(row.try_get("id").map_err(&decode)?),
        user_id: UserId::new(row.try_get("user_id").map_err(&decode)?),
        status: status
            .parse::<OrderStatus>()
            .map_err(|_| out_of_range(operation))?,
        total_amount: row.try_get("total_amount").map_err(&decode)?,
        created_at: row.try_get("created_at").map_err(&decode)?,
        updated_at: row.try_get("updated_at").map_err(&decode)?,
    })
}

fn order_item_from_row(row: &PgRow, operation: Operation) -> Result<OrderItem, StoreError> {
    let decode = failed(operation);
    Ok(OrderItem {
        id: OrderItemId::new(row.try_get("id").map_err(&decode)?),
        order_id: OrderId::new(row.try_get("order_id").map_err(&decode)?),
        product_id: ProductId::new(row.try_get("product_id").map_err(&decode)?),
        quantity: decode_quantity(row, operation)?,
        price: row.try_get("price").map_err(&decode)?,
        created_at: row.try_get("created_at").map_err(&decode)?,
    })
}

fn idempotency_from_row(
    row: &PgRow,
    operation: Operation,
) -> Result<IdempotencyRecord, StoreError> {
    let decode = failed(operation);
    let key: String = row.try_get("idempotency_key").map_err(&decode)?;
    let order_id: Option<i64> = row.try_get("order_id").map_err(&decode)?;
    Ok(IdempotencyRecord {
        user_id: UserId::new(row.try_get("user_id").map_err(&decode)?),
        key: IdempotencyKey::try_new(key).map_err(|_| out_of_range(operation))?,
        order_id: order_id.map(OrderId::new),
        created_at: row.try_get("created_at").map_err(&decode)?,
    })
}

fn rows_into<T>(
    rows: &[PgRow],
    operation: Operation,
    decode: fn(&PgRow, Operation) -> Result<T, StoreError>,
) -> Result<Vec<T>, StoreError> {
    rows.iter().map(|row| decode(row, operation)).collect()
}

impl Transaction for PostgresTransaction {
    #[instrument(name = "postgres.commit", skip(self))]
    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(failed(Operation::CommitTransaction))
    }

    #[instrument(name = "postgres.rollback", skip(self))]
    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(failed(Operation::RollbackTransaction))
    }

    async fn insert_category(&mut self, category: NewCategory) -> Result<Category, StoreError> {
        const OP: Operation = Operation::InsertCategory;
        let row = query(
            "INSERT INTO categories (name, description) VALUES ($1, $2) \
             RETURNING id, name, description",
        )
        .bind(category.name)
        .bind(category.description)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(failed(OP))?;
        category_from_row(&row, OP)
    }

    async fn insert_product(&mut self, product: NewProduct) -> Result<Product, StoreError> {
        const OP: Operation = Operation::InsertProduct;
        let sql = format!(
            "INSERT INTO products (category_id, name, description, sku, price, stock, is_active) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {PRODUCT_COLUMNS}"
        );
        let row = query(&sql)
            .bind(product.category_id.into_inner())
            .bind(product.name)
            .bind(product.description)
            .bind(product.sku)
            .bind(product.price)
            .bind(stock_column(product.stock, OP)?)
            .bind(product.is_active)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(failed(OP))?;
        product_from_row(&row, OP)
    }

    async fn get_products(&mut self, ids: &[ProductId]) -> Result<Vec<Product>, StoreError> {
        const OP: Operation = Operation::ReadProducts;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ANY($1) ORDER BY id");
        let rows = query(&sql)
            .bind(product_keys(ids))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(failed(OP))?;
        rows_into(&rows, OP, product_from_row)
    }

    #[instrument(name = "postgres.lock_products_for_update", skip(self))]
    async fn lock_products_for_update(
        &mut self,
        ids: &[ProductId],
    ) -> Result<Vec<Product>, StoreError> {
        const OP: Operation = Operation::LockProducts;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        // Ascending id order: overlapping batches cannot deadlock.
        let sql = format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ANY($1) ORDER BY id FOR UPDATE"
        );
        let rows = query(&sql)
            .bind(product_keys(ids))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(failed(OP))?;
        debug!(locked = rows.len(), "[postgres.lock_products_for_update] rows locked");
        rows_into(&rows, OP, product_from_row)
    }

    async fn set_product_stock(&mut self, id: ProductId, stock: u32) -> Result<Product, StoreError> {
        const OP: Operation = Operation::UpdateProductStock;
        let sql = format!(
            "UPDATE products SET stock = $2, updated_at = now() WHERE id = $1 \
             RETURNING {PRODUCT_COLUMNS}"
        );
        let row = query(&sql)
            .bind(id.into_inner())
            .bind(stock_column(stock, OP)?)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(failed(OP))?
            .ok_or(StoreError::MissingRow { operation: OP })?;
        product_from_row(&row, OP)
    }

    async fn get_categories(&mut self, ids: &[CategoryId]) -> Result<Vec<Category>, StoreError> {
        const OP: Operation = Operation::ReadCategories;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = query(
            "SELECT id, name, description FROM categories WHERE id = ANY($1) ORDER BY id",
        )
        .bind(category_keys(ids))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(failed(OP))?;
        rows_into(&rows, OP, category_from_row)
    }

    async fn get_cart_by_user(&mut self, user_id: UserId) -> Result<Option<Cart>, StoreError> {
        const OP: Operation = Operation::ReadCart;
        let sql =
            format!("SELECT {CART_COLUMNS} FROM carts WHERE user_id = $1 AND deleted_at IS NULL");
        query(&sql)
            .bind(user_id.into_inner())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(failed(OP))?
            .map(|row| cart_from_row(&row, OP))
            .transpose()
    }

    async fn insert_cart(&mut self, user_id: UserId) -> Result<Cart, StoreError> {
        const OP: Operation = Operation::InsertCart;
        let sql = format!("INSERT INTO carts (user_id) VALUES ($1) RETURNING {CART_COLUMNS}");
        let row = query(&sql)
            .bind(user_id.into_inner())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(failed(OP))?;
        cart_from_row(&row, OP)
    }

    async fn touch_cart(&mut self, cart_id: CartId) -> Result<(), StoreError> {
        const OP: Operation = Operation::TouchCart;
        let result = query(
            "UPDATE carts SET updated_at = clock_timestamp() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(cart_id.into_inner())
        .execute(&mut *self.tx)
        .await
        .map_err(failed(OP))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MissingRow { operation: OP });
        }
        Ok(())
    }

    async fn get_cart_item(&mut self, id: CartItemId) -> Result<Option<CartItem>, StoreError> {
        const OP: Operation = Operation::ReadCartItems;
        let sql = format!(
            "SELECT {CART_ITEM_COLUMNS} FROM cart_items WHERE id = $1 AND deleted_at IS NULL"
        );
        query(&sql)
            .bind(id.into_inner())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(failed(OP))?
            .map(|row| cart_item_from_row(&row, OP))
            .transpose()
    }

    async fn get_active_cart_item(
        &mut self,
        cart_id: CartId,
        product_id: ProductId,
    ) -> Result<Option<CartItem>, StoreError> {
        const OP: Operation = Operation::ReadCartItems;
        let sql = format!(
            "SELECT {CART_ITEM_COLUMNS} FROM cart_items \
             WHERE cart_id = $1 AND product_id = $2 AND deleted_at IS NULL"
        );
        query(&sql)
            .bind(cart_id.into_inner())
            .bind(product_id.into_inner())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(failed(OP))?
            .map(|row| cart_item_from_row(&row, OP))
            .transpose()
    }

    async fn list_cart_items(&mut self, cart_id: CartId) -> Result<Vec<CartItem>, StoreError> {
        const OP: Operation = Operation::ReadCartItems;
        let sql = format!(
            "SELECT {CART_ITEM_COLUMNS} FROM cart_items \
             WHERE cart_id = $1 AND deleted_at IS NULL ORDER BY created_at, id"
        );
        let rows = query(&sql)
            .bind(cart_id.into_inner())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(failed(OP))?;
        rows_into(&rows, OP, cart_item_from_row)
    }

    async fn insert_cart_item(
        &mut self,
        cart_id: CartId,
        product_id: ProductId,
        quantity: Quantity,
    ) -> Result<CartItem, StoreError> {
        const OP: Operation = Operation::InsertCartItem;
        let sql = format!(
            "INSERT INTO cart_items (cart_id, product_id, quantity) VALUES ($1, $2, $3) \
             RETURNING {CART_ITEM_COLUMNS}"
        );
        let row = query(&sql)
            .bind(cart_id.into_inner())
            .bind(product_id.into_inner())
            .bind(quantity_column(quantity, OP)?)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(failed(OP))?;
        cart_item_from_row(&row, OP)
    }

    async fn restore_cart_item(
        &mut self,
        cart_id: CartId,
        product_id: ProductId,
        quantity: Quantity,
    ) -> Result<Option<CartItem>, StoreError> {
        const OP: Operation = Operation::RestoreCartItem;
        let sql = format!(
            "UPDATE cart_items SET deleted_at = NULL, quantity = $3, updated_at = now() \
             WHERE id = ( \
                 SELECT id FROM cart_items \
                 WHERE cart_id = $1 AND product_id = $2 AND deleted_at IS NOT NULL \
                 ORDER BY deleted_at DESC, id DESC LIMIT 1 \
             ) RETURNING {CART_ITEM_COLUMNS}"
        );
        query(&sql)
            .bind(cart_id.into_inner())
            .bind(product_id.into_inner())
            .bind(quantity_column(quantity, OP)?)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(failed(OP))?
            .map(|row| cart_item_from_row(&row, OP))
            .transpose()
    }

    async fn set_cart_item_quantity(
        &mut self,
        id: CartItemId,
        quantity: Quantity,
    ) -> Result<CartItem, StoreError> {
        const OP: Operation = Operation::UpdateCartItem;
        let sql = format!(
            "UPDATE cart_items SET quantity = $2, updated_at = now() \
             WHERE id = $1 AND deleted_at IS NULL RETURNING {CART_ITEM_COLUMNS}"
        );
        let row = query(&sql)
            .bind(id.into_inner())
            .bind(quantity_column(quantity, OP)?)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(failed(OP))?
            .ok_or(StoreError::MissingRow { operation: OP })?;
        cart_item_from_row(&row, OP)
    }

    async fn soft_delete_cart_item(&mut self, id: CartItemId) -> Result<bool, StoreError> {
        let result = query(
            "UPDATE cart_items SET deleted_at = clock_timestamp(), updated_at = now() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id.into_inner())
        .execute(&mut *self.tx)
        .await
        .map_err(failed(Operation::DeleteCartItems))?;
        Ok(result.rows_affected() > 0)
    }

    async fn soft_delete_cart_items(&mut self, cart_id: CartId) -> Result<u64, StoreError> {
        let result = query(
            "UPDATE cart_items SET deleted_at = clock_timestamp(), updated_at = now() \
             WHERE cart_id = $1 AND deleted_at IS NULL",
        )
        .bind(cart_id.into_inner())
        .execute(&mut *self.tx)
        .await
        .map_err(failed(Operation::DeleteCartItems))?;
        Ok(result.rows_affected())
    }

    async fn insert_order(
        &mut self,
        user_id: UserId,
        total_amount: Decimal,
    ) -> Result<Order, StoreError> {
        const OP: Operation = Operation::InsertOrder;
        let sql = format!(
            "INSERT INTO orders (user_id, total_amount, status) VALUES ($1, $2, $3) \
             RETURNING {ORDER_COLUMNS}"
        );
        let row = query(&sql)
            .bind(user_id.into_inner())
            .bind(total_amount)
            .bind(OrderStatus::Pending.as_str())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(failed(OP))?;
        order_from_row(&row, OP)
    }

    async fn insert_order_item(&mut self, item: NewOrderItem) -> Result<OrderItem, StoreError> {
        const OP: Operation = Operation::InsertOrderItem;
        let sql = format!(
            "INSERT INTO order_items (order_id, product_id, quantity, price) \
             VALUES ($1, $2, $3, $4) RETURNING {ORDER_ITEM_COLUMNS}"
        );
        let row = query(&sql)
            .bind(item.order_id.into_inner())
            .bind(item.product_id.into_inner())
            .bind(quantity_column(item.quantity, OP)?)
            .bind(item.price)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(failed(OP))?;
        order_item_from_row(&row, OP)
    }

    async fn get_order(&mut self, id: OrderId) -> Result<Option<Order>, StoreError> {
        const OP: Operation = Operation::ReadOrders;
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");
        query(&sql)
            .bind(id.into_inner())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(failed(OP))?
            .map(|row| order_from_row(&row, OP))
            .transpose()
    }

    #[instrument(name = "postgres.lock_order_for_update", skip(self))]
    async fn lock_order_for_update(&mut self, id: OrderId) -> Result<Option<Order>, StoreError> {
        const OP: Operation = Operation::LockOrder;
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE");
        query(&sql)
            .bind(id.into_inner())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(failed(OP))?
            .map(|row| order_from_row(&row, OP))
            .transpose()
    }

    async fn set_order_status(
        &mut self,
        id: OrderId,
        status: OrderStatus,
    ) -> Result<Option<Order>, StoreError> {
        const OP: Operation = Operation::UpdateOrderStatus;
        let sql = format!(
            "UPDATE orders SET status = $2, updated_at = clock_timestamp() WHERE id = $1 \
             RETURNING {ORDER_COLUMNS}"
        );
        query(&sql)
            .bind(id.into_inner())
            .bind(status.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(failed(OP))?
            .map(|row| order_from_row(&row, OP))
            .transpose()
    }

    async fn list_order_items(&mut self, order_id: OrderId) -> Result<Vec<OrderItem>, StoreError> {
        const OP: Operation = Operation::ReadOrderItems;
        let sql =
            format!("SELECT {ORDER_ITEM_COLUMNS} FROM order_items WHERE order_id = $1 ORDER BY id");
        let rows = query(&sql)
            .bind(order_id.into_inner())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(failed(OP))?;
        rows_into(&rows, OP, order_item_from_row)
    }

    async fn list_order_items_for(
        &mut self,
        order_ids: &[OrderId],
    ) -> Result<Vec<OrderItem>, StoreError> {
        const OP: Operation = Operation::ReadOrderItems;
        if order_ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<i64> = order_ids.iter().map(|id| id.into_inner()).collect();
        let sql = format!(
            "SELECT {ORDER_ITEM_COLUMNS} FROM order_items WHERE order_id = ANY($1) \
             ORDER BY order_id, id"
        );
        let rows = query(&sql)
            .bind(keys)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(failed(OP))?;
        rows_into(&rows, OP, order_item_from_row)
    }

    async fn count_orders_by_user(&mut self, user_id: UserId) -> Result<u64, StoreError> {
        const OP: Operation = Operation::CountOrders;
        let row = query("SELECT COUNT(*) AS total FROM orders WHERE user_id = $1")
            .bind(user_id.into_inner())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(failed(OP))?;
        let total: i64 = row.try_get("total").map_err(failed(OP))?;
        u64::try_from(total).map_err(|_| out_of_range(OP))
    }

    async fn list_orders_by_user(
        &mut self,
        user_id: UserId,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<Order>, StoreError> {
        const OP: Operation = Operation::ReadOrders;
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        );
        let rows = query(&sql)
            .bind(user_id.into_inner())
            .bind(i64::from(limit))
            .bind(i64::try_from(offset).map_err(|_| out_of_range(OP))?)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(failed(OP))?;
        rows_into(&rows, OP, order_from_row)
    }

    async fn get_idempotency_key(
        &mut self,
        user_id: UserId,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        const OP: Operation = Operation::ReadIdempotencyKey;
        let sql = format!(
            "SELECT {IDEMPOTENCY_COLUMNS} FROM order_idempotency_keys \
             WHERE user_id = $1 AND idempotency_key = $2"
        );
        query(&sql)
            .bind(user_id.into_inner())
            .bind(key.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(failed(OP))?
            .map(|row| idempotency_from_row(&row, OP))
            .transpose()
    }

    async fn insert_idempotency_key(
        &mut self,
        user_id: UserId,
        key: &IdempotencyKey,
        order_id: Option<OrderId>,
    ) -> Result<IdempotencyRecord, StoreError> {
        const OP: Operation = Operation::InsertIdempotencyKey;
        let sql = format!(
            "INSERT INTO order_idempotency_keys (user_id, idempotency_key, order_id) \
             VALUES ($1, $2, $3) RETURNING {IDEMPOTENCY_COLUMNS}"
        );
        let row = query(&sql)
            .bind(user_id.into_inner())
            .bind(key.as_str())
            .bind(order_id.map(OrderId::into_inner))
            .fetch_one(&mut *self.tx)
            .await
            .map_err(failed(OP))?;
        idempotency_from_row(&row, OP)
    }

    async fn resolve_idempotency_key(
        &mut self,
        user_id: UserId,
        key: &IdempotencyKey,
        order_id: OrderId,
    ) -> Result<(), StoreError> {
        const OP: Operation = Operation::ResolveIdempotencyKey;
        let result = query(
            "UPDATE order_idempotency_keys SET order_id = $3 \
             WHERE user_id = $1 AND idempotency_key = $2",
        )
        .bind(user_id.into_inner())
        .bind(key.as_str())
        .bind(order_id.into_inner())
        .execute(&mut *self.tx)
        .await
        .map_err(failed(OP))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MissingRow { operation: OP });
        }
        Ok(())
    }

    async fn delete_pending_idempotency_key(
        &mut self,
        user_id: UserId,
        key: &IdempotencyKey,
    ) -> Result<bool, StoreError> {
        let result = query(
            "DELETE FROM order_idempotency_keys \
             WHERE user_id = $1 AND idempotency_key = $2 AND order_id IS NULL",
        )
        .bind(user_id.into_inner())
        .bind(key.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(failed(Operation::DeleteIdempotencyKey))?;
        Ok(result.rows_affected() > 0)
    }
}
