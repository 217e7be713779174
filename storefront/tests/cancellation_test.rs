//! Order lifecycle: cancellation with stock restoration, status overrides.

use futures::future::join_all;
use storefront::{
    CartService, CommerceError, ErrorClass, InMemoryStore, Operation, OrderId, OrderService,
    OrderStatus, OrderView, ProductId, Store, UserId,
};
use storefront_testing::{
    price_cents, quantity, seed_catalog_product, stock_of, unique_user_id, FaultInjectionExt,
};

async fn placed_order<S: Store>(store: &S, lines: &[(ProductId, u32)]) -> (UserId, OrderView) {
    let user = unique_user_id();
    let carts = CartService::new(store.clone());
    for &(product_id, n) in lines {
        let _ = carts
            .add_item(user, product_id, quantity(n))
            .await
            .expect("add item");
    }
    let order = OrderService::new(store.clone())
        .create_order_from_cart(user)
        .await
        .expect("order placed");
    (user, order)
}

async fn stock<S: Store>(store: &S, product_id: ProductId) -> u32 {
    stock_of(store, product_id)
        .await
        .expect("read stock")
        .expect("product exists")
}

#[tokio::test]
async fn cancelling_restores_every_line_and_only_once() {
    let store = InMemoryStore::new();
    let drill = seed_catalog_product(&store, price_cents(8_900), 5).await.expect("drill");
    let bits = seed_catalog_product(&store, price_cents(1_200), 30).await.expect("bits");
    let (user, order) = placed_order(&store, &[(drill.id, 2), (bits.id, 10)]).await;
    assert_eq!(stock(&store, drill.id).await, 3);
    assert_eq!(stock(&store, bits.id).await, 20);
    let orders = OrderService::new(store.clone());

    let cancelled = orders.cancel_order(user, order.id).await.expect("cancel");

    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.total_amount, order.total_amount);
    assert_eq!(stock(&store, drill.id).await, 5);
    assert_eq!(stock(&store, bits.id).await, 30);

    let again = orders
        .cancel_order(user, order.id)
        .await
        .expect_err("already cancelled");
    assert_eq!(
        again,
        CommerceError::OrderNotCancellable {
            order_id: order.id,
            status: OrderStatus::Cancelled
        }
    );
    assert_eq!(again.class(), ErrorClass::ClientCorrectable);
    assert_eq!(stock(&store, drill.id).await, 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn racing_cancellations_restore_stock_once() {
    let store = InMemoryStore::new();
    let saw = seed_catalog_product(&store, price_cents(4_000), 4).await.expect("saw");
    let (user, order) = placed_order(&store, &[(saw.id, 3)]).await;
    let orders = OrderService::new(store.clone());
    let order_id = order.id;

    let outcomes = join_all((0..6).map(|_| {
        let orders = orders.clone();
        tokio::spawn(async move { orders.cancel_order(user, order_id).await })
    }))
    .await;

    let succeeded = outcomes
        .into_iter()
        .map(|joined| joined.expect("task panicked"))
        .filter(Result::is_ok)
        .count();
    assert_eq!(succeeded, 1);
    assert_eq!(stock(&store, saw.id).await, 4);
}

#[tokio::test]
async fn failed_restock_aborts_the_cancellation() {
    let inner = InMemoryStore::new();
    let clamp = seed_catalog_product(&inner, price_cents(700), 10).await.expect("clamp");
    let vice = seed_catalog_product(&inner, price_cents(5_500), 10).await.expect("vice");
    let store = inner.with_faults();
    let (user, order) = placed_order(&store, &[(clamp.id, 1), (vice.id, 2)]).await;
    let orders = OrderService::new(store.clone());
    store.fail_nth(Operation::UpdateProductStock, 2);

    let error = orders
        .cancel_order(user, order.id)
        .await
        .expect_err("second restock fails");

    assert!(matches!(
        &error,
        CommerceError::Storage(cause)
            if cause.failed_operation() == Some(Operation::UpdateProductStock)
    ));
    assert_eq!(error.class(), ErrorClass::Internal);
    let unchanged = orders
        .get_order_by_id(user, order.id, false)
        .await
        .expect("order still readable");
    assert_eq!(unchanged.status, OrderStatus::Pending);
    assert_eq!(stock(&store, clamp.id).await, 9);
    assert_eq!(stock(&store, vice.id).await, 8);

    let cancelled = orders.cancel_order(user, order.id).await.expect("retry");
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(stock(&store, clamp.id).await, 10);
    assert_eq!(stock(&store, vice.id).await, 10);
}

#[tokio::test]
async fn only_the_owner_may_cancel() {
    let store = InMemoryStore::new();
    let level = seed_catalog_product(&store, price_cents(2_100), 3).await.expect("level");
    let (_, order) = placed_order(&store, &[(level.id, 1)]).await;
    let orders = OrderService::new(store.clone());
    let stranger = unique_user_id();

    let error = orders
        .cancel_order(stranger, order.id)
        .await
        .expect_err("not the owner");

    assert_eq!(error, CommerceError::UnauthorizedOrder(order.id));
    assert_eq!(error.class().status_code(), 403);
    assert_eq!(stock(&store, level.id).await, 2);
    assert_eq!(
        orders.cancel_order(stranger, OrderId::new(i64::MAX)).await,
        Err(CommerceError::OrderNotFound(OrderId::new(i64::MAX)))
    );
}

#[tokio::test]
async fn shipped_orders_cannot_be_cancelled() {
    let store = InMemoryStore::new();
    let tape = seed_catalog_product(&store, price_cents(300), 8).await.expect("tape");
    let (user, order) = placed_order(&store, &[(tape.id, 2)]).await;
    let orders = OrderService::new(store.clone());

    let shipped = orders
        .update_order_status(order.id, "shipped")
        .await
        .expect("status override");
    assert_eq!(shipped.status, OrderStatus::Shipped);
    assert!(shipped.updated_at >= order.updated_at);

    assert_eq!(
        orders.cancel_order(user, order.id).await,
        Err(CommerceError::OrderNotCancellable {
            order_id: order.id,
            status: OrderStatus::Shipped
        })
    );
    assert_eq!(stock(&store, tape.id).await, 6);

    let error = orders
        .update_order_status(order.id, "lost")
        .await
        .expect_err("unknown status");
    assert_eq!(error, CommerceError::InvalidOrderStatus("lost".to_string()));
    assert_eq!(error.class().status_code(), 400);
}

#[tokio::test]
async fn status_override_is_unconstrained() {
    let store = InMemoryStore::new();
    let rope = seed_catalog_product(&store, price_cents(1_800), 4).await.expect("rope");
    let (_, order) = placed_order(&store, &[(rope.id, 1)]).await;
    let orders = OrderService::new(store.clone());

    let _ = orders
        .update_order_status(order.id, "delivered")
        .await
        .expect("forward");
    let back = orders
        .update_order_status(order.id, "pending")
        .await
        .expect("backward moves are allowed");

    assert_eq!(back.status, OrderStatus::Pending);
    assert_eq!(back.items[0].price, price_cents(1_800));
}
