//! Cart-to-order conversion: oversell protection, atomicity, pricing.

use std::sync::Arc;

use futures::future::join_all;
use storefront::{
    CartService, CommerceError, InMemoryStore, Operation, OrderService, OrderStatus,
    PageRequest, PaginationConfig, Product, UserId,
};
use storefront_testing::{
    price_cents, quantity, seed_category, seed_product, set_stock, stock_of, unique_user_id,
    FaultInjectingStore, FaultInjectionExt,
};
use tokio::sync::Barrier;

async fn product(store: &InMemoryStore, cents: i64, stock: u32) -> Product {
    let category = seed_category(store, "Outdoor").await.expect("seed category");
    seed_product(store, category.id, price_cents(cents), stock)
        .await
        .expect("seed product")
}

async fn stock(store: &InMemoryStore, product: &Product) -> u32 {
    stock_of(store, product.id)
        .await
        .expect("read stock")
        .expect("product exists")
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_orders_never_oversell_the_last_unit() {
    const BUYERS: usize = 10;

    let store = InMemoryStore::new();
    let tent = product(&store, 19_900, 1).await;
    let carts = CartService::new(store.clone());
    let orders = OrderService::new(store.clone());

    let mut buyers = Vec::with_capacity(BUYERS);
    for _ in 0..BUYERS {
        let user = unique_user_id();
        let _ = carts
            .add_item(user, tent.id, quantity(1))
            .await
            .expect("the last unit fits every cart");
        buyers.push(user);
    }

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
    let sold_out = outcomes
        .iter()
        .filter(|outcome| {
            matches!(
                outcome,
                Err(CommerceError::InsufficientStock {
                    requested: 1,
                    available: 0,
                    ..
                })
            )
        })
        .count();
    assert_eq!(placed, 1);
    assert_eq!(sold_out, BUYERS - 1);
    assert_eq!(stock(&store, &tent).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_orders_drain_stock_exactly() {
    const BUYERS: usize = 8;

    let store = InMemoryStore::new();
    let lantern = product(&store, 2_500, 5).await;
    let carts = CartService::new(store.clone());
    let orders = OrderService::new(store.clone());

    let mut buyers = Vec::with_capacity(BUYERS);
    for _ in 0..BUYERS {
        let user = unique_user_id();
        let _ = carts
            .add_item(user, lantern.id, quantity(1))
            .await
            .expect("add lantern");
        buyers.push(user);
    }

    let outcomes = join_all(buyers.into_iter().map(|user| {
        let orders = orders.clone();
        tokio::spawn(async move { orders.create_order_from_cart(user).await })
    }))
    .await;

    let placed = outcomes
        .into_iter()
        .map(|joined| joined.expect("buyer task panicked"))
        .filter(Result::is_ok)
        .count();
    assert_eq!(placed, 5);
    assert_eq!(stock(&store, &lantern).await, 0);
}

#[tokio::test]
async fn short_line_aborts_the_whole_order() {
    let store = InMemoryStore::new();
    let stove = product(&store, 8_000, 5).await;
    let fuel = product(&store, 900, 1).await;
    let pot = product(&store, 3_000, 5).await;
    let user = unique_user_id();
    let carts = CartService::new(store.clone());
    for (item, n) in [(&stove, 2), (&fuel, 1), (&pot, 2)] {
        let _ = carts
            .add_item(user, item.id, quantity(n))
            .await
            .expect("add item");
    }
    let _ = set_stock(&store, fuel.id, 0).await.expect("sell out fuel");

    let error = OrderService::new(store.clone())
        .create_order_from_cart(user)
        .await
        .expect_err("fuel is sold out");

    assert_eq!(
        error,
        CommerceError::InsufficientStock {
            product_id: fuel.id,
            requested: 1,
            available: 0
        }
    );
    assert_eq!(stock(&store, &stove).await, 5);
    assert_eq!(stock(&store, &pot).await, 5);
    assert_eq!(carts.get_cart(user).await.expect("cart").items.len(), 3);
    let history = OrderService::new(store)
        .get_user_orders(user, PageRequest::default())
        .await
        .expect("history");
    assert_eq!(history.meta.total_count, 0);
}

async fn faulty_checkout() -> (FaultInjectingStore<InMemoryStore>, UserId, Vec<Product>) {
    let inner = InMemoryStore::new();
    let mut products = Vec::new();
    for cents in [1_000, 2_000, 3_000] {
        products.push(product(&inner, cents, 10).await);
    }
    let store = inner.with_faults();
    let user = unique_user_id();
    let carts = CartService::new(store.clone());
    for item in &products {
        let _ = carts
            .add_item(user, item.id, quantity(2))
            .await
            .expect("add item");
    }
    (store, user, products)
}

#[tokio::test]
async fn failed_stock_write_leaves_no_trace() {
    let (store, user, products) = faulty_checkout().await;
    store.fail_nth(Operation::UpdateProductStock, 2);

    let error = OrderService::new(store.clone())
        .create_order_from_cart(user)
        .await
        .expect_err("second stock write fails");

    assert!(matches!(
        &error,
        CommerceError::Storage(cause)
            if cause.failed_operation() == Some(Operation::UpdateProductStock)
    ));
    for item in &products {
        assert_eq!(stock(store.inner(), item).await, 10);
    }
    let cart = CartService::new(store.clone())
        .get_cart(user)
        .await
        .expect("cart");
    assert_eq!(cart.items.len(), 3);
    let history = OrderService::new(store)
        .get_user_orders(user, PageRequest::default())
        .await
        .expect("history");
    assert_eq!(history.meta.total_count, 0);
}

#[tokio::test]
async fn failed_commit_leaves_no_trace() {
    let (store, user, products) = faulty_checkout().await;
    // The first commit closes the cart read; the second is the conversion.
    store.fail_nth(Operation::CommitTransaction, 2);

    let error = OrderService::new(store.clone())
        .create_order_from_cart(user)
        .await
        .expect_err("commit fails");

    assert!(matches!(
        &error,
        CommerceError::Storage(cause)
            if cause.failed_operation() == Some(Operation::CommitTransaction)
    ));
    for item in &products {
        assert_eq!(stock(store.inner(), item).await, 10);
    }
    let retry = OrderService::new(store)
        .create_order_from_cart(user)
        .await
        .expect("a later attempt succeeds");
    assert_eq!(retry.items.len(), 3);
}

#[tokio::test]
async fn order_captures_prices_and_empties_the_cart() {
    let store = InMemoryStore::new();
    let boots = product(&store, 12_999, 7).await;
    let socks = product(&store, 450, 20).await;
    let user = unique_user_id();
    let carts = CartService::new(store.clone());
    let _ = carts.add_item(user, boots.id, quantity(1)).await.expect("boots");
    let _ = carts.add_item(user, socks.id, quantity(3)).await.expect("socks");

    let order = OrderService::new(store.clone())
        .create_order_from_cart(user)
        .await
        .expect("order placed");

    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.user_id, user);
    assert_eq!(order.total_amount, price_cents(12_999 + 3 * 450));
    assert_eq!(order.items.len(), 2);
    let boots_line = order
        .items
        .iter()
        .find(|line| line.product.id == boots.id)
        .expect("boots line");
    assert_eq!(boots_line.price, price_cents(12_999));
    assert_eq!(boots_line.product.stock, 6);
    assert!(boots_line.product.category.is_some());

    assert_eq!(stock(&store, &boots).await, 6);
    assert_eq!(stock(&store, &socks).await, 17);
    let cart = carts.get_cart(user).await.expect("cart");
    assert!(cart.items.is_empty());
    assert_eq!(cart.total, price_cents(0));
}

#[tokio::test]
async fn empty_or_missing_cart_cannot_be_ordered() {
    let store = InMemoryStore::new();
    let orders = OrderService::new(store.clone());
    let carts = CartService::new(store.clone());
    let user = unique_user_id();

    assert_eq!(
        orders.create_order_from_cart(user).await,
        Err(CommerceError::EmptyCart(user))
    );

    let hat = product(&store, 1_500, 3).await;
    let _ = carts.add_item(user, hat.id, quantity(1)).await.expect("add");
    carts.clear_cart(user).await.expect("clear");

    assert_eq!(
        orders.create_order_from_cart(user).await,
        Err(CommerceError::EmptyCart(user))
    );
    assert_eq!(stock(&store, &hat).await, 3);
}

#[tokio::test]
async fn order_reads_respect_ownership_and_paging() {
    let store = InMemoryStore::new();
    let map = product(&store, 700, 50).await;
    let carts = CartService::new(store.clone());
    let orders = OrderService::new(store.clone());
    let user = unique_user_id();
    let stranger = unique_user_id();

    let mut placed = Vec::new();
    for _ in 0..3 {
        let _ = carts.add_item(user, map.id, quantity(1)).await.expect("add");
        placed.push(orders.create_order_from_cart(user).await.expect("order").id);
    }

    let config = PaginationConfig::default();
    let first = orders
        .get_user_orders(user, PageRequest::clamped(1, 2, &config))
        .await
        .expect("page 1");
    let second = orders
        .get_user_orders(user, PageRequest::clamped(2, 2, &config))
        .await
        .expect("page 2");
    let first_ids: Vec<_> = first.orders.iter().map(|order| order.id).collect();
    assert_eq!(first_ids, vec![placed[2], placed[1]]);
    assert_eq!(second.orders.len(), 1);
    assert_eq!(second.orders[0].id, placed[0]);
    assert_eq!(first.meta.total_count, 3);
    assert_eq!(first.meta.total_pages, 2);
    assert_eq!(first.orders[0].items[0].product.id, map.id);

    assert_eq!(
        orders.get_order_by_id(stranger, placed[0], false).await,
        Err(CommerceError::UnauthorizedOrder(placed[0]))
    );
    let as_admin = orders
        .get_order_by_id(stranger, placed[0], true)
        .await
        .expect("admins read any order");
    assert_eq!(as_admin.user_id, user);
}

#[tokio::test]
async fn order_history_reads_lines_in_one_batch() {
    let inner = InMemoryStore::new();
    let compass = product(&inner, 2_500, 20).await;
    let flask = product(&inner, 1_100, 20).await;
    let store = inner.with_faults();
    let carts = CartService::new(store.clone());
    let orders = OrderService::new(store.clone());
    let user = unique_user_id();
    for lines in [1, 2, 3, 4] {
        let _ = carts.add_item(user, compass.id, quantity(lines)).await.expect("compass");
        let _ = carts.add_item(user, flask.id, quantity(1)).await.expect("flask");
        let _ = orders.create_order_from_cart(user).await.expect("order");
    }

    store.reset_calls();
    let page = orders
        .get_user_orders(user, PageRequest::default())
        .await
        .expect("history");

    assert_eq!(page.orders.len(), 4);
    assert!(page.orders.iter().all(|order| order.items.len() == 2));
    let compass_quantities: Vec<_> = page
        .orders
        .iter()
        .map(|order| order.items[0].quantity)
        .collect();
    assert_eq!(
        compass_quantities,
        vec![quantity(4), quantity(3), quantity(2), quantity(1)]
    );
    assert_eq!(store.calls(Operation::ReadOrderItems), 1);
    assert_eq!(store.calls(Operation::ReadProducts), 1);
}
