//! Inventory ledger: the per-product stock counter.
//!
//! Stock only changes through [`withdraw`] and [`restock`], and both expect
//! the caller to hold the product's row lock (taken by
//! `lock_products_for_update`), so the value they start from is the value
//! last committed.

use std::collections::HashMap;

use tracing::debug;

use crate::errors::{CommerceError, CommerceResult, Operation, StoreError};
use crate::models::Product;
use crate::store::Transaction;
use crate::types::{ProductId, Quantity};

/// Fail with `InsufficientStock` unless `product` can cover `requested` units.
pub fn ensure_available(product: &Product, requested: u64) -> CommerceResult<()> {
    if requested > u64::from(product.stock) {
        return Err(CommerceError::InsufficientStock {
            product_id: product.id,
            requested,
            available: product.stock,
        });
    }
    Ok(())
}

/// Stock left after taking `quantity` units.
pub fn stock_after_withdrawal(product: &Product, quantity: Quantity) -> CommerceResult<u32> {
    product
        .stock
        .checked_sub(quantity.into_inner())
        .ok_or(CommerceError::InsufficientStock {
            product_id: product.id,
            requested: u64::from(quantity.into_inner()),
            available: product.stock,
        })
}

/// Stock after putting `quantity` units back.
pub fn stock_after_restock(product: &Product, quantity: Quantity) -> Result<u32, StoreError> {
    product
        .stock
        .checked_add(quantity.into_inner())
        .ok_or(StoreError::ValueOutOfRange {
            operation: Operation::UpdateProductStock,
        })
}

/// Locked product rows of one unit of work, kept current as stock changes.
#[derive(Debug)]
pub struct LockedStock {
    products: HashMap<ProductId, Product>,
}

impl LockedStock {
    /// Lock `ids` in one batch and remember their current rows.
    pub async fn acquire<T: Transaction>(tx: &mut T, ids: &[ProductId]) -> Result<Self, StoreError> {
        let products = tx
            .lock_products_for_update(ids)
            .await?
            .into_iter()
            .map(|product| (product.id, product))
            .collect();
        Ok(Self { products })
    }

    /// The locked row for `id`, if it exists.
    pub fn get(&self, id: ProductId) -> Option<&Product> {
        self.products.get(&id)
    }

    /// The locked row for `id`, or `ProductNotFound`.
    pub fn require(&self, id: ProductId) -> CommerceResult<&Product> {
        self.get(id).ok_or(CommerceError::ProductNotFound(id))
    }

    /// Decrement stock for `id` and write it back.
    pub async fn withdraw<T: Transaction>(
        &mut self,
        tx: &mut T,
        id: ProductId,
        quantity: Quantity,
    ) -> CommerceResult<()> {
        let remaining = stock_after_withdrawal(self.require(id)?, quantity)?;
        let updated = tx.set_product_stock(id, remaining).await?;
        debug!(product_id = %id, stock = updated.stock, "[inventory.withdraw] stock decremented");
        let _ = self.products.insert(id, updated);
        Ok(())
    }

    /// Increment stock for `id` and write it back.
    pub async fn restock<T: Transaction>(
        &mut self,
        tx: &mut T,
        id: ProductId,
        quantity: Quantity,
    ) -> CommerceResult<()> {
        let restored = stock_after_restock(self.require(id)?, quantity)?;
        let updated = tx.set_product_stock(id, restored).await?;
        debug!(product_id = %id, stock = updated.stock, "[inventory.restock] stock restored");
        let _ = self.products.insert(id, updated);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CategoryId;
    use proptest::prelude::*;
    use rust_decimal::Decimal;

    fn product_with_stock(stock: u32) -> Product {
        Product {
            id: ProductId::new(1),
            category_id: CategoryId::new(1),
            name: "Lamp".to_string(),
            description: None,
            sku: "LAMP-1".to_string(),
            price: Decimal::new(2500, 2),
            stock,
            is_active: true,
        }
    }

    proptest! {
        #[test]
        fn withdrawal_never_goes_negative(stock in 0u32..10_000, n in 1u32..20_000) {
            let product = product_with_stock(stock);
            let quantity = Quantity::try_new(n).unwrap();

            match stock_after_withdrawal(&product, quantity) {
                Ok(remaining) => prop_assert_eq!(remaining, stock - n),
                Err(CommerceError::InsufficientStock { available, .. }) => {
                    prop_assert!(n > stock);
                    prop_assert_eq!(available, stock);
                }
                Err(other) => prop_assert!(false, "unexpected error {other}"),
            }
        }

        #[test]
        fn withdraw_then_restock_returns_to_start(stock in 1u32..10_000, n in 1u32..10_000) {
            prop_assume!(n <= stock);
            let quantity = Quantity::try_new(n).unwrap();

            let taken = stock_after_withdrawal(&product_with_stock(stock), quantity).unwrap();
            let restored = stock_after_restock(&product_with_stock(taken), quantity).unwrap();

            prop_assert_eq!(restored, stock);
        }
    }

    #[test]
    fn exact_stock_is_available() {
        assert!(ensure_available(&product_with_stock(3), 3).is_ok());
        assert!(ensure_available(&product_with_stock(3), 4).is_err());
    }

    #[test]
    fn restock_overflow_is_reported_not_wrapped() {
        let product = product_with_stock(u32::MAX);
        let quantity = Quantity::try_new(1).unwrap();

        let error = stock_after_restock(&product, quantity).unwrap_err();

        assert_eq!(
            error,
            StoreError::ValueOutOfRange {
                operation: Operation::UpdateProductStock
            }
        );
    }
}
