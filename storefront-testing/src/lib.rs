#![forbid(unsafe_code)]
#![deny(
    bad_style,
    clippy::allow_attributes,
    deprecated,
    meta_variable_misuse,
    non_ascii_idents,
    rust_2018_idioms,
    unused_imports,
    unused_must_use,
    unused_mut
)]

//! Test kit for storefront stores and services.
//!
//! - [`contract`]: backend scenarios every [`storefront::Store`] must pass, and
//!   the `store_contract_tests!` macro that instantiates them for one backend
//! - [`chaos`]: a store wrapper that fails chosen operations and counts calls
//! - [`fixtures`]: catalog seeding and small value helpers

pub mod chaos;
pub mod contract;
pub mod fixtures;

pub use chaos::*;
pub use fixtures::*;
