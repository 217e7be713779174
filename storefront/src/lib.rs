#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(
    bad_style,
    clippy::allow_attributes,
    deprecated,
    non_ascii_idents,
    rust_2018_idioms,
    unused_must_use
)]

//! Transactional order fulfillment for a storefront.
//!
//! This crate turns shopping carts into durable orders without overselling
//! stock, lets clients retry order submission safely, and keeps cart,
//! inventory and order state consistent across multi-row mutations.
//!
//! # Overview
//!
//! - Facade: [`Store`] / [`Transaction`] plus [`run_in_transaction`], the
//!   atomic unit of work every multi-row mutation goes through
//! - Backends: [`InMemoryStore`] here, PostgreSQL in `storefront-postgres`
//! - Components: [`CartService`] (cart aggregate), [`IdempotencyRegistry`],
//!   [`OrderService`] (fulfillment engine and lifecycle manager), and the
//!   [`inventory`] ledger helpers they share
//! - Read models: [`CartView`], [`OrderView`], [`OrderPage`]
//! - Errors: [`CommerceError`] for services, [`StoreError`] for the facade
//!
//! Correctness never relies on in-process state: all coordination is pushed
//! into the store's transactions and row locks, so any number of service
//! instances can share one database.
//!
//! # Example
//!
//! ```rust,ignore
//! use storefront::{CartService, InMemoryStore, OrderService, Quantity, UserId};
//!
//! let store = InMemoryStore::new();
//! let carts = CartService::new(store.clone());
//! let orders = OrderService::new(store);
//!
//! carts.add_item(user, product, Quantity::try_new(2)?).await?;
//! let order = orders.create_order_with_idempotency(user, "checkout-42").await?;
//! ```

pub mod cart;
pub mod config;
pub mod errors;
pub mod idempotency;
pub mod inventory;
pub mod memory;
pub mod models;
pub mod orders;
pub mod store;
pub mod types;
pub mod views;

pub use cart::{CartItemPlacement, CartService};
pub use config::{ConfigError, PageLimit, PageRequest, PaginationConfig};
pub use errors::{
    CommerceError, CommerceResult, Constraint, ErrorClass, Operation, StoreError,
};
pub use idempotency::{IdempotencyLookup, IdempotencyRegistry};
pub use memory::{InMemoryStore, InMemoryTransaction};
pub use models::{
    Cart, CartItem, Category, IdempotencyRecord, IdempotencyState, NewCategory, NewOrderItem,
    NewProduct, Order, OrderItem, Product,
};
pub use orders::OrderService;
pub use store::{run_in_transaction, Store, Transaction};
pub use types::{
    CartId, CartItemId, CategoryId, IdempotencyKey, OrderId, OrderItemId, OrderStatus, ProductId,
    Quantity, UnknownOrderStatus, UserId,
};
pub use views::{
    CartItemView, CartView, CategoryView, OrderItemView, OrderPage, OrderView, PaginationMeta,
    ProductView,
};
