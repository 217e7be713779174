mod common;

use std::sync::Arc;

use common::PostgresTestFixture;
use futures::future::join_all;
use storefront::{CartService, CommerceError, OrderService, OrderStatus};
use storefront_testing::{price_cents, quantity, seed_catalog_product, stock_of, unique_user_id};
use tokio::sync::Barrier;

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires docker"]
async fn last_unit_is_sold_exactly_once() {
    const BUYERS: usize = 6;

    let fixture = PostgresTestFixture::new().await;
    let store = fixture.store.clone();
    let product = seed_catalog_product(&store, price_cents(4_500), 1)
        .await
        .expect("seed product");

    let carts = CartService::new(store.clone());
    let mut buyers = Vec::with_capacity(BUYERS);
    for _ in 0..BUYERS {
        let user = unique_user_id();
        let _ = carts
            .add_item(user, product.id, quantity(1))
            .await
            .expect("each buyer can add the last unit");
        buyers.push(user);
    }

    let orders = OrderService::new(store.clone());
    let barrier = Arc::new(Barrier::new(BUYERS));
    let attempts = buyers.into_iter().map(|user| {
        let orders = orders.clone();
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move {
            let _ = barrier.wait().await;
            orders.create_order_from_cart(user).await
        })
    });
    let outcomes: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.expect("buyer task panicked"))
        .collect();

    let placed = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
    let rejected = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, Err(CommerceError::InsufficientStock { .. })))
        .count();
    assert_eq!(placed, 1);
    assert_eq!(rejected, BUYERS - 1);
    assert_eq!(
        stock_of(&store, product.id).await.expect("read stock"),
        Some(0)
    );
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires docker"]
async fn cancellation_restores_stock_in_postgres() {
    let fixture = PostgresTestFixture::new().await;
    let store = fixture.store.clone();
    let product = seed_catalog_product(&store, price_cents(1_250), 10)
        .await
        .expect("seed product");
    let user = unique_user_id();

    let _ = CartService::new(store.clone())
        .add_item(user, product.id, quantity(4))
        .await
        .expect("add item");
    let orders = OrderService::new(store.clone());
    let order = orders
        .create_order_with_idempotency(user, "pg-checkout-1")
        .await
        .expect("order placed");
    assert_eq!(stock_of(&store, product.id).await.expect("stock"), Some(6));

    let replay = orders
        .create_order_with_idempotency(user, "pg-checkout-1")
        .await
        .expect("replayed");
    assert_eq!(replay.id, order.id);

    let cancelled = orders.cancel_order(user, order.id).await.expect("cancelled");
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.items[0].price, price_cents(1_250));
    assert_eq!(stock_of(&store, product.id).await.expect("stock"), Some(10));
}
