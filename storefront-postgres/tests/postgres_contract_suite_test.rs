mod common;

use common::PostgresTestFixture;
use storefront_testing::contract::{
    test_cart_item_resurrection, test_cart_item_writes_serialize, test_idempotency_key_lifecycle,
    test_idempotency_writes_serialize, test_missing_rows_are_reported,
    test_orders_listed_newest_first, test_product_lock_serializes_updates,
    test_rollback_discards_writes, test_single_active_cart_per_user,
    test_uncommitted_writes_are_isolated,
};

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires docker"]
async fn postgres_store_honors_the_store_contract() {
    let fixture = PostgresTestFixture::new().await;

    test_rollback_discards_writes(fixture.make_store())
        .await
        .expect("rollback contract failed");
    test_uncommitted_writes_are_isolated(fixture.make_store())
        .await
        .expect("isolation contract failed");
    test_product_lock_serializes_updates(fixture.make_store())
        .await
        .expect("locking contract failed");
    test_cart_item_writes_serialize(fixture.make_store())
        .await
        .expect("cart line write contract failed");
    test_idempotency_writes_serialize(fixture.make_store())
        .await
        .expect("idempotency write contract failed");
    test_single_active_cart_per_user(fixture.make_store())
        .await
        .expect("active cart contract failed");
    test_cart_item_resurrection(fixture.make_store())
        .await
        .expect("resurrection contract failed");
    test_idempotency_key_lifecycle(fixture.make_store())
        .await
        .expect("idempotency contract failed");
    test_orders_listed_newest_first(fixture.make_store())
        .await
        .expect("listing contract failed");
    test_missing_rows_are_reported(fixture.make_store())
        .await
        .expect("missing rows contract failed");
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires docker"]
async fn migrations_are_idempotent() {
    let fixture = PostgresTestFixture::new().await;

    fixture
        .store
        .migrate()
        .await
        .expect("re-running migrations is a no-op");
    fixture.store.ping().await.expect("store still reachable");
}
