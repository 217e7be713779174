//! Cart aggregate: one active cart per user and its lines.
//!
//! Lines are soft-deleted on removal and brought back on re-add, so a
//! product's cart history stays in one row. Adding a product follows a fixed
//! placement order:
//!
//! 1. merge into the active line for the product, if there is one
//! 2. otherwise resurrect the most recently removed line
//! 3. otherwise insert a new line
//!
//! Every mutation runs as one unit of work; the returned view is read
//! afterwards.

use std::fmt;

use futures::FutureExt;
use tracing::{debug, info, instrument};

use crate::errors::{CommerceError, CommerceResult, Constraint, Operation, StoreError};
use crate::inventory::ensure_available;
use crate::models::Cart;
use crate::store::{run_in_transaction, Store, Transaction};
use crate::types::{CartId, CartItemId, ProductId, Quantity, UserId};
use crate::views::{cart_view, CartView, Catalog};

/// Which path `add_item` took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CartItemPlacement {
    /// The quantity was added to the active line.
    Merged,
    /// A soft-deleted line was restored with the new quantity.
    Resurrected,
    /// A new line was inserted.
    Inserted,
}

impl fmt::Display for CartItemPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Merged => "merged",
            Self::Resurrected => "resurrected",
            Self::Inserted => "inserted",
        })
    }
}

/// Cart operations for any [`Store`].
#[derive(Debug, Clone)]
pub struct CartService<S> {
    store: S,
}

impl<S: Store> CartService<S> {
    /// Create a service over `store`.
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    /// The user's active cart, created on first access.
    ///
    /// Two concurrent first accesses race on the one-active-cart rule; the
    /// loser re-reads the winner's cart.
    #[instrument(name = "cart.get_or_create_cart", skip(self))]
    pub async fn get_or_create_cart(&self, user_id: UserId) -> CommerceResult<Cart> {
        let created = run_in_transaction(&self.store, move |tx| {
            async move {
                if let Some(cart) = tx.get_cart_by_user(user_id).await? {
                    return Ok(cart);
                }
                let cart = tx.insert_cart(user_id).await?;
                debug!(cart_id = %cart.id, "[cart.get_or_create_cart] cart created");
                Ok::<_, StoreError>(cart)
            }
            .boxed()
        })
        .await;

        match created {
            Ok(cart) => Ok(cart),
            Err(StoreError::UniqueViolation {
                constraint: Constraint::ActiveCartPerUser,
            }) => {
                debug!("[cart.get_or_create_cart] lost creation race; re-reading cart");
                self.find_cart(user_id)
                    .await?
                    .ok_or(CommerceError::CartNotFound(user_id))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// The user's cart with product detail and total.
    #[instrument(name = "cart.get_cart", skip(self))]
    pub async fn get_cart(&self, user_id: UserId) -> CommerceResult<CartView> {
        let cart = self.get_or_create_cart(user_id).await?;
        self.view_of(cart).await
    }

    /// Add `quantity` units of a product to the user's cart.
    #[instrument(name = "cart.add_item", skip(self))]
    pub async fn add_item(
        &self,
        user_id: UserId,
        product_id: ProductId,
        quantity: Quantity,
    ) -> CommerceResult<CartView> {
        let cart = self.get_or_create_cart(user_id).await?;

        let placement = match self.place_item(cart.id, product_id, quantity).await {
            Err(CommerceError::Storage(StoreError::UniqueViolation {
                constraint: Constraint::ActiveCartItemPerProduct,
            })) => {
                debug!("[cart.add_item] concurrent insert for the same product; retrying");
                self.place_item(cart.id, product_id, quantity).await?
            }
            placed => placed?,
        };
        info!(
            cart_id = %cart.id,
            placement = %placement,
            "[cart.add_item] item placed"
        );

        self.view_of(cart).await
    }

    /// Run the placement policy in one unit of work and report the path taken.
    async fn place_item(
        &self,
        cart_id: CartId,
        product_id: ProductId,
        quantity: Quantity,
    ) -> CommerceResult<CartItemPlacement> {
        run_in_transaction(&self.store, move |tx| {
            async move {
                // The product row lock serializes placements of the same
                // product, so concurrent merges cannot drop an increment.
                let product = tx
                    .lock_products_for_update(&[product_id])
                    .await?
                    .into_iter()
                    .next()
                    .ok_or(CommerceError::ProductNotFound(product_id))?;
                ensure_available(&product, u64::from(quantity.into_inner()))?;

                let placement =
                    if let Some(existing) = tx.get_active_cart_item(cart_id, product_id).await? {
                        let combined = u64::from(existing.quantity.into_inner())
                            + u64::from(quantity.into_inner());
                        ensure_available(&product, combined)?;
                        let combined = u32::try_from(combined)
                            .ok()
                            .and_then(|n| Quantity::try_new(n).ok())
                            .ok_or(StoreError::ValueOutOfRange {
                                operation: Operation::UpdateCartItem,
                            })?;
                        let _ = tx.set_cart_item_quantity(existing.id, combined).await?;
                        CartItemPlacement::Merged
                    } else if tx
                        .restore_cart_item(cart_id, product_id, quantity)
                        .await?
                        .is_some()
                    {
                        CartItemPlacement::Resurrected
                    } else {
                        let _ = tx.insert_cart_item(cart_id, product_id, quantity).await?;
                        CartItemPlacement::Inserted
                    };

                tx.touch_cart(cart_id).await?;
                Ok(placement)
            }
            .boxed()
        })
        .await
    }

    /// Set the quantity of a line in the user's own cart.
    #[instrument(name = "cart.update_item", skip(self))]
    pub async fn update_item(
        &self,
        user_id: UserId,
        item_id: CartItemId,
        quantity: Quantity,
    ) -> CommerceResult<CartView> {
        let cart = run_in_transaction(&self.store, move |tx| {
            async move {
                let cart = owning_cart(tx, user_id).await?;
                let item = tx
                    .get_cart_item(item_id)
                    .await?
                    .filter(|item| item.cart_id == cart.id)
                    .ok_or(CommerceError::CartItemNotFound(item_id))?;
                let product = tx
                    .get_product(item.product_id)
                    .await?
                    .ok_or(CommerceError::ProductNotFound(item.product_id))?;
                ensure_available(&product, u64::from(quantity.into_inner()))?;

                match tx.set_cart_item_quantity(item_id, quantity).await {
                    Ok(_) => {}
                    Err(StoreError::MissingRow { .. }) => {
                        return Err(CommerceError::CartItemNotFound(item_id));
                    }
                    Err(error) => return Err(error.into()),
                }
                tx.touch_cart(cart.id).await?;
                Ok(cart)
            }
            .boxed()
        })
        .await?;

        self.view_of(cart).await
    }

    /// Soft-delete a line from the user's own cart.
    #[instrument(name = "cart.remove_item", skip(self))]
    pub async fn remove_item(&self, user_id: UserId, item_id: CartItemId) -> CommerceResult<CartView> {
        let cart = run_in_transaction(&self.store, move |tx| {
            async move {
                let cart = owning_cart(tx, user_id).await?;
                let owned = tx
                    .get_cart_item(item_id)
                    .await?
                    .is_some_and(|item| item.cart_id == cart.id);
                if !owned || !tx.soft_delete_cart_item(item_id).await? {
                    return Err(CommerceError::CartItemNotFound(item_id));
                }
                tx.touch_cart(cart.id).await?;
                Ok(cart)
            }
            .boxed()
        })
        .await?;

        self.view_of(cart).await
    }

    /// Soft-delete every line of the user's cart. A missing cart is a no-op.
    #[instrument(name = "cart.clear_cart", skip(self))]
    pub async fn clear_cart(&self, user_id: UserId) -> CommerceResult<()> {
        let removed = run_in_transaction(&self.store, move |tx| {
            async move {
                let Some(cart) = tx.get_cart_by_user(user_id).await? else {
                    return Ok(0);
                };
                let removed = tx.soft_delete_cart_items(cart.id).await?;
                tx.touch_cart(cart.id).await?;
                Ok::<_, StoreError>(removed)
            }
            .boxed()
        })
        .await?;

        info!(removed, "[cart.clear_cart] cart cleared");
        Ok(())
    }

    async fn find_cart(&self, user_id: UserId) -> Result<Option<Cart>, StoreError> {
        run_in_transaction(&self.store, move |tx| tx.get_cart_by_user(user_id).boxed()).await
    }

    async fn view_of(&self, cart: Cart) -> CommerceResult<CartView> {
        run_in_transaction(&self.store, move |tx| {
            async move {
                let items = tx.list_cart_items(cart.id).await?;
                let product_ids: Vec<ProductId> = items.iter().map(|item| item.product_id).collect();
                let catalog = Catalog::load(tx, &product_ids).await?;
                cart_view(&cart, items, &catalog)
            }
            .boxed()
        })
        .await
    }
}

async fn owning_cart<T: Transaction>(tx: &mut T, user_id: UserId) -> CommerceResult<Cart> {
    tx.get_cart_by_user(user_id)
        .await?
        .ok_or(CommerceError::CartNotFound(user_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::models::{NewCategory, NewProduct, Product};
    use rust_decimal::Decimal;

    async fn seed(store: &InMemoryStore, sku: &str, stock: u32) -> Product {
        let sku = sku.to_string();
        run_in_transaction(store, move |tx| {
            async move {
                let category = tx
                    .insert_category(NewCategory {
                        name: "Kitchen".to_string(),
                        description: None,
                    })
                    .await?;
                tx.insert_product(NewProduct {
                    category_id: category.id,
                    name: "Kettle".to_string(),
                    description: None,
                    sku,
                    price: Decimal::new(3450, 2),
                    stock,
                    is_active: true,
                })
                .await
            }
            .boxed()
        })
        .await
        .expect("seed product")
    }

    fn qty(n: u32) -> Quantity {
        Quantity::try_new(n).expect("positive quantity")
    }

    #[tokio::test]
    async fn repeat_add_merges_into_the_active_line() {
        let store = InMemoryStore::new();
        let product = seed(&store, "KET-1", 10).await;
        let carts = CartService::new(store);
        let user = UserId::new(1);

        let _ = carts.add_item(user, product.id, qty(2)).await.expect("first add");
        let view = carts.add_item(user, product.id, qty(3)).await.expect("second add");

        assert_eq!(view.items.len(), 1);
        assert_eq!(view.items[0].quantity, qty(5));
        assert_eq!(view.total, Decimal::new(3450 * 5, 2));
    }

    #[tokio::test]
    async fn merged_quantity_is_checked_against_stock() {
        let store = InMemoryStore::new();
        let product = seed(&store, "KET-2", 4).await;
        let carts = CartService::new(store);
        let user = UserId::new(1);
        let _ = carts.add_item(user, product.id, qty(3)).await.expect("first add");

        let error = carts
            .add_item(user, product.id, qty(2))
            .await
            .expect_err("combined quantity exceeds stock");

        assert_eq!(
            error,
            CommerceError::InsufficientStock {
                product_id: product.id,
                requested: 5,
                available: 4
            }
        );
    }

    #[tokio::test]
    async fn unknown_product_is_rejected() {
        let carts = CartService::new(InMemoryStore::new());

        let error = carts
            .add_item(UserId::new(1), ProductId::new(999), qty(1))
            .await
            .expect_err("no such product");

        assert_eq!(error, CommerceError::ProductNotFound(ProductId::new(999)));
    }

    #[tokio::test]
    async fn clearing_a_missing_cart_is_a_no_op() {
        let carts = CartService::new(InMemoryStore::new());

        carts
            .clear_cart(UserId::new(5))
            .await
            .expect("clearing nothing succeeds");
    }

    #[tokio::test]
    async fn updating_without_a_cart_reports_missing_cart() {
        let carts = CartService::new(InMemoryStore::new());

        let error = carts
            .update_item(UserId::new(5), CartItemId::new(1), qty(1))
            .await
            .expect_err("user has no cart");

        assert_eq!(error, CommerceError::CartNotFound(UserId::new(5)));
    }

    #[tokio::test]
    async fn first_access_creates_exactly_one_cart() {
        let carts = CartService::new(InMemoryStore::new());
        let user = UserId::new(9);

        let first = carts.get_or_create_cart(user).await.expect("create");
        let second = carts.get_or_create_cart(user).await.expect("fetch");

        assert_eq!(first.id, second.id);
    }
}
