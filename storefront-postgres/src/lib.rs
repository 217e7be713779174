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

//! PostgreSQL backend for the storefront data-access facade.
//!
//! [`PostgresStore`] implements [`storefront::Store`] on a `sqlx` connection
//! pool. Every facade transaction is one database transaction; row locks are
//! `SELECT ... FOR UPDATE` (products in one batch, ascending id) and the
//! implicit locks `UPDATE` takes. The schema ships as embedded migrations:
//! call [`PostgresStore::migrate`] once before use.

mod transaction;

use std::env;
use std::num::NonZeroU32;
use std::time::Duration;

use nutype::nutype;
use sqlx::{postgres::PgPoolOptions, query, Pool, Postgres};
use storefront::{Constraint, Operation, Store, StoreError};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

pub use transaction::PostgresTransaction;

/// Environment variable holding the connection string.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
/// Environment variable overriding [`PostgresConfig::max_connections`].
pub const MAX_CONNECTIONS_ENV: &str = "STOREFRONT_DB_MAX_CONNECTIONS";
/// Environment variable overriding [`PostgresConfig::acquire_timeout`], in seconds.
pub const ACQUIRE_TIMEOUT_ENV: &str = "STOREFRONT_DB_ACQUIRE_TIMEOUT_SECS";
/// Environment variable overriding [`PostgresConfig::idle_timeout`], in seconds.
pub const IDLE_TIMEOUT_ENV: &str = "STOREFRONT_DB_IDLE_TIMEOUT_SECS";

/// Failures setting up a [`PostgresStore`].
#[derive(Debug, Error)]
pub enum PostgresStoreError {
    /// The pool could not connect.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),
    /// The connectivity check failed.
    #[error("postgres ping failed")]
    PingFailed(#[source] sqlx::Error),
    /// Applying the embedded migrations failed.
    #[error("postgres migration failed")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),
    /// `DATABASE_URL` is not set.
    #[error("{DATABASE_URL_ENV} is not set")]
    MissingDatabaseUrl,
    /// A pool setting in the environment is malformed.
    #[error("{variable} must be a positive integer, got {value:?}")]
    InvalidSetting {
        /// Environment variable name.
        variable: &'static str,
        /// Raw value found.
        value: String,
    },
}

/// Maximum number of pooled connections. Zero is unrepresentable.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(NonZeroU32);

/// Connection pool settings.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10).
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds).
    pub acquire_timeout: Duration,
    /// Idle timeout for pooled connections (default: 10 minutes).
    pub idle_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: NonZeroU32 = match NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl PostgresConfig {
    /// Defaults overridden by the `STOREFRONT_DB_*` environment variables.
    pub fn from_env() -> Result<Self, PostgresStoreError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the
    /// `STOREFRONT_DB_*` names.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, PostgresStoreError> {
        let mut config = Self::default();
        if let Some(max) = positive_setting(&lookup, MAX_CONNECTIONS_ENV)? {
            config.max_connections = MaxConnections::new(max);
        }
        if let Some(secs) = positive_setting(&lookup, ACQUIRE_TIMEOUT_ENV)? {
            config.acquire_timeout = Duration::from_secs(u64::from(secs.get()));
        }
        if let Some(secs) = positive_setting(&lookup, IDLE_TIMEOUT_ENV)? {
            config.idle_timeout = Duration::from_secs(u64::from(secs.get()));
        }
        Ok(config)
    }
}

fn positive_setting(
    lookup: &impl Fn(&str) -> Option<String>,
    variable: &'static str,
) -> Result<Option<NonZeroU32>, PostgresStoreError> {
    let Some(raw) = lookup(variable) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<NonZeroU32>()
        .map(Some)
        .map_err(|_| PostgresStoreError::InvalidSetting {
            variable,
            value: raw,
        })
}

/// A [`Store`] backed by a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Connect with the default pool settings.
    pub async fn new<S: Into<String>>(connection_string: S) -> Result<Self, PostgresStoreError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Connect with custom pool settings.
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresStoreError> {
        let connection_string = connection_string.into();
        let max_connections: NonZeroU32 = config.max_connections.into();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&connection_string)
            .await
            .map_err(PostgresStoreError::ConnectionFailed)?;
        info!(
            max_connections = %config.max_connections,
            "[postgres.connect] connection pool ready"
        );
        Ok(Self { pool })
    }

    /// Connect using `DATABASE_URL` and the `STOREFRONT_DB_*` pool settings.
    pub async fn from_env() -> Result<Self, PostgresStoreError> {
        let url = env::var(DATABASE_URL_ENV).map_err(|_| PostgresStoreError::MissingDatabaseUrl)?;
        Self::with_config(url, PostgresConfig::from_env()?).await
    }

    /// Wrap an existing pool.
    ///
    /// Use this to share one pool across components.
    pub const fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// The underlying pool, for verification queries.
    pub const fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Round-trip a trivial query.
    pub async fn ping(&self) -> Result<(), PostgresStoreError> {
        let _ = query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(PostgresStoreError::PingFailed)?;
        Ok(())
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), PostgresStoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(PostgresStoreError::MigrationFailed)
    }
}

impl Store for PostgresStore {
    type Transaction = PostgresTransaction;

    #[instrument(name = "postgres.begin", skip(self))]
    async fn begin(&self) -> Result<PostgresTransaction, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;
        Ok(PostgresTransaction::new(tx))
    }
}

/// Constraint names the migrations create, by facade constraint.
fn constraint_named(name: &str) -> Option<Constraint> {
    match name {
        "carts_one_active_per_user" => Some(Constraint::ActiveCartPerUser),
        "cart_items_one_active_per_product" => Some(Constraint::ActiveCartItemPerProduct),
        "order_idempotency_keys_pkey" => Some(Constraint::IdempotencyKeyPerUser),
        "products_sku_key" => Some(Constraint::ProductSku),
        _ => None,
    }
}

pub(crate) fn map_sqlx_error(error: sqlx::Error, operation: Operation) -> StoreError {
    if let sqlx::Error::Database(db_error) = &error {
        let code = db_error.code();
        match code.as_deref() {
            // unique_violation
            Some("23505") => {
                if let Some(constraint) = db_error.constraint().and_then(constraint_named) {
                    warn!(
                        constraint = %constraint,
                        operation = %operation,
                        "[postgres.unique_violation] unique constraint rejected write"
                    );
                    return StoreError::UniqueViolation { constraint };
                }
            }
            // check_violation, numeric_value_out_of_range
            Some("23514" | "22003") => {
                warn!(
                    error = %db_error,
                    operation = %operation,
                    "[postgres.out_of_range] value rejected by the schema"
                );
                return StoreError::ValueOutOfRange { operation };
            }
            _ => {}
        }
    }

    error!(
        error = %error,
        operation = %operation,
        "[postgres.database_error] database operation failed"
    );
    StoreError::StoreFailure {
        operation,
        detail: error.to_string(),
    }
}
