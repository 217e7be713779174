//! Idempotency registry: maps `(user, key)` to the order a submission produced.
//!
//! An entry is absent, pending (claimed, conversion in flight) or resolved
//! (linked to its order). The one-entry-per-`(user, key)` rule in the store is
//! what makes the claim safe against two identical submissions racing each
//! other: exactly one insert wins, the other sees a conflict.

use futures::FutureExt;
use tracing::{debug, instrument, warn};

use crate::errors::{CommerceError, CommerceResult, Constraint, StoreError};
use crate::models::IdempotencyState;
use crate::store::{run_in_transaction, Store, Transaction};
use crate::types::{IdempotencyKey, OrderId, UserId};

/// Result of looking a key up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyLookup {
    /// Never seen.
    Absent,
    /// Claimed; the submission that claimed it has not finished.
    Pending,
    /// Linked to the order the first submission created.
    Resolved(OrderId),
}

/// Registry operations for any [`Store`].
#[derive(Debug, Clone)]
pub struct IdempotencyRegistry<S> {
    store: S,
}

impl<S: Store> IdempotencyRegistry<S> {
    /// Create a registry over `store`.
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    /// Current state of `(user, key)`.
    #[instrument(name = "idempotency.lookup", skip(self))]
    pub async fn lookup(
        &self,
        user_id: UserId,
        key: &IdempotencyKey,
    ) -> CommerceResult<IdempotencyLookup> {
        let key = key.clone();
        let record = run_in_transaction(&self.store, move |tx| {
            async move { tx.get_idempotency_key(user_id, &key).await }.boxed()
        })
        .await?;

        Ok(match record.map(|record| record.state()) {
            None => IdempotencyLookup::Absent,
            Some(IdempotencyState::Pending) => IdempotencyLookup::Pending,
            Some(IdempotencyState::Resolved(order_id)) => IdempotencyLookup::Resolved(order_id),
        })
    }

    /// Record a pending entry in its own unit of work.
    ///
    /// Losing the race to a concurrent identical submission is reported as
    /// `DuplicateOrder`, exactly like finding the entry already pending.
    #[instrument(name = "idempotency.claim", skip(self))]
    pub async fn claim(&self, user_id: UserId, key: &IdempotencyKey) -> CommerceResult<()> {
        let key = key.clone();
        let claimed = run_in_transaction(&self.store, move |tx| {
            async move { tx.insert_idempotency_key(user_id, &key, None).await }.boxed()
        })
        .await;

        match claimed {
            Ok(_) => {
                debug!("[idempotency.claim] key claimed");
                Ok(())
            }
            Err(StoreError::UniqueViolation {
                constraint: Constraint::IdempotencyKeyPerUser,
            }) => {
                debug!("[idempotency.claim] key already claimed");
                Err(CommerceError::DuplicateOrder)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Drop a still-pending claim so the client can retry with the same key.
    ///
    /// Failures are logged and swallowed: the caller is already returning the
    /// error that made the release necessary.
    #[instrument(name = "idempotency.release", skip(self))]
    pub async fn release(&self, user_id: UserId, key: &IdempotencyKey) {
        let key = key.clone();
        let released = run_in_transaction(&self.store, move |tx| {
            async move { tx.delete_pending_idempotency_key(user_id, &key).await }.boxed()
        })
        .await;

        match released {
            Ok(true) => debug!("[idempotency.release] pending claim released"),
            Ok(false) => debug!("[idempotency.release] nothing pending to release"),
            Err(error) => warn!(
                error = %error,
                "[idempotency.release] failed to release pending claim; key stays pending"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;

    fn key(raw: &str) -> IdempotencyKey {
        IdempotencyKey::try_new(raw).expect("valid key")
    }

    #[tokio::test]
    async fn unseen_key_is_absent() {
        let registry = IdempotencyRegistry::new(InMemoryStore::new());

        let state = registry
            .lookup(UserId::new(1), &key("fresh"))
            .await
            .expect("lookup");

        assert_eq!(state, IdempotencyLookup::Absent);
    }

    #[tokio::test]
    async fn claimed_key_is_pending_and_cannot_be_claimed_twice() {
        let registry = IdempotencyRegistry::new(InMemoryStore::new());
        let user = UserId::new(1);

        registry.claim(user, &key("once")).await.expect("first claim");
        let second = registry.claim(user, &key("once")).await;

        assert_eq!(second, Err(CommerceError::DuplicateOrder));
        assert_eq!(
            registry.lookup(user, &key("once")).await.expect("lookup"),
            IdempotencyLookup::Pending
        );
    }

    #[tokio::test]
    async fn keys_are_scoped_per_user() {
        let registry = IdempotencyRegistry::new(InMemoryStore::new());

        registry
            .claim(UserId::new(1), &key("shared"))
            .await
            .expect("user 1 claim");
        registry
            .claim(UserId::new(2), &key("shared"))
            .await
            .expect("user 2 claim");
    }

    #[tokio::test]
    async fn release_only_removes_pending_entries() {
        let store = InMemoryStore::new();
        let registry = IdempotencyRegistry::new(store.clone());
        let user = UserId::new(3);
        let resolved_key = key("done");

        let mut tx = store.begin().await.expect("begin");
        let order = tx
            .insert_order(user, rust_decimal::Decimal::ONE)
            .await
            .expect("insert order");
        let _ = tx
            .insert_idempotency_key(user, &resolved_key, Some(order.id))
            .await
            .expect("insert resolved key");
        tx.commit().await.expect("commit");

        registry.release(user, &resolved_key).await;

        assert_eq!(
            registry.lookup(user, &resolved_key).await.expect("lookup"),
            IdempotencyLookup::Resolved(order.id)
        );
    }
}
