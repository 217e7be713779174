//! Catalog seeding and value helpers shared by integration tests.
//!
//! Everything here is safe to run against a shared database: SKUs and user
//! ids are unique per call.

use rand::Rng;
use rust_decimal::Decimal;
use storefront::{
    Category, CategoryId, NewCategory, NewProduct, Product, ProductId, Quantity, Store,
    StoreError, Transaction, UserId,
};
use uuid::Uuid;

/// A user id no other test run will use.
pub fn unique_user_id() -> UserId {
    UserId::new(rand::rng().random_range(1..i64::from(i32::MAX)))
}

/// A positive quantity. Panics on zero: test input only.
pub fn quantity(n: u32) -> Quantity {
    Quantity::try_new(n).expect("test quantities are positive")
}

/// A price given in cents.
pub fn price_cents(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

/// Insert a category.
pub async fn seed_category<S: Store>(store: &S, name: &str) -> Result<Category, StoreError> {
    let mut tx = store.begin().await?;
    let category = tx
        .insert_category(NewCategory {
            name: name.to_string(),
            description: Some(format!("{name} seeded for tests")),
        })
        .await?;
    tx.commit().await?;
    Ok(category)
}

/// Insert an active product with a unique SKU.
pub async fn seed_product<S: Store>(
    store: &S,
    category_id: CategoryId,
    price: Decimal,
    stock: u32,
) -> Result<Product, StoreError> {
    let sku = format!("SKU-{}", Uuid::now_v7().simple());
    let mut tx = store.begin().await?;
    let product = tx
        .insert_product(NewProduct {
            category_id,
            name: format!("Product {sku}"),
            description: None,
            sku,
            price,
            stock,
            is_active: true,
        })
        .await?;
    tx.commit().await?;
    Ok(product)
}

/// Insert a fresh category and one product in it.
pub async fn seed_catalog_product<S: Store>(
    store: &S,
    price: Decimal,
    stock: u32,
) -> Result<Product, StoreError> {
    let category = seed_category(store, "Fixtures").await?;
    seed_product(store, category.id, price, stock).await
}

/// Committed stock of a product, read in its own transaction.
pub async fn stock_of<S: Store>(store: &S, product_id: ProductId) -> Result<Option<u32>, StoreError> {
    let mut tx = store.begin().await?;
    let product = tx.get_product(product_id).await?;
    tx.rollback().await?;
    Ok(product.map(|product| product.stock))
}

/// Overwrite a product's stock, bypassing the services.
pub async fn set_stock<S: Store>(
    store: &S,
    product_id: ProductId,
    stock: u32,
) -> Result<Product, StoreError> {
    let mut tx = store.begin().await?;
    let product = tx.set_product_stock(product_id, stock).await?;
    tx.commit().await?;
    Ok(product)
}
