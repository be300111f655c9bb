//! Concurrency limit.
//!
//! Unlike the window methods this does not limit requests over time but
//! the number of simultaneously in-flight requests. Permits live in the
//! counter store so the bound holds across nodes sharing a backend; they
//! are taken at admission and returned by the cleanup routine when the
//! request completes.

use std::time::Duration;

use crate::error::Result;
use crate::method::LimitScope;
use crate::outcome::{CounterId, LimitExceededResult, RetryAfter};
use crate::store::{CounterStore, SemaphoreToken};

pub(super) async fn is_exceeded<S: CounterStore>(
    store: &S,
    scope: &LimitScope<'_>,
    cost: u64,
    permit_limit: u64,
    timeout: Duration,
) -> Result<LimitExceededResult> {
    let key = scope.base_key();

    // Single attempt; waiting for capacity is the engine's admission
    // delay loop, not the store's.
    let attempt = store
        .acquire_semaphore(&key, permit_limit, cost, Duration::ZERO)
        .await?;

    let counter_id = CounterId::new(key, scope.namespace());
    if attempt.is_acquired() {
        Ok(LimitExceededResult::admitted(counter_id, scope.rule_key()))
    } else {
        Ok(LimitExceededResult::exceeded(
            counter_id,
            RetryAfter::Delay(timeout),
            scope.rule_key(),
        ))
    }
}

pub(super) async fn is_still_exceeded<S: CounterStore>(
    store: &S,
    counter_id: &CounterId,
    permit_limit: u64,
    cost: u64,
) -> Result<bool> {
    // Exceeded while the held permits leave no room for this request's
    // cost. The answer is advisory; admission happens through the
    // atomic acquire.
    let held = store
        .get(counter_id.key())
        .await?
        .map(|cell| cell.count)
        .unwrap_or(0);

    Ok(held + cost > permit_limit)
}

pub(super) async fn release<S: CounterStore>(
    store: &S,
    counter_id: &CounterId,
    cost: u64,
) -> Result<()> {
    store
        .release_semaphore(SemaphoreToken::new(counter_id.key(), cost))
        .await
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::store::MemoryCounterStore;

    fn scope() -> LimitScope<'static> {
        LimitScope::at("svc", "r1", Some("tenant-a"), 0)
    }

    #[tokio::test]
    async fn test_admits_until_saturated() {
        let store = MemoryCounterStore::new();

        let first = is_exceeded(&store, &scope(), 1, 2, Duration::from_secs(5))
            .await
            .unwrap();
        let second = is_exceeded(&store, &scope(), 1, 2, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!first.is_exceeded());
        assert!(!second.is_exceeded());

        let third = is_exceeded(&store, &scope(), 1, 2, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(third.is_exceeded());
        assert_eq!(
            third.retry_after().and_then(RetryAfter::as_secs),
            Some(5),
            "rejection reports the configured timeout"
        );
    }

    #[tokio::test]
    async fn test_release_restores_capacity() {
        let store = MemoryCounterStore::new();

        let first = is_exceeded(&store, &scope(), 1, 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!first.is_exceeded());

        let blocked = is_exceeded(&store, &scope(), 1, 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(blocked.is_exceeded());

        release(&store, first.counter_id().unwrap(), 1)
            .await
            .unwrap();

        let after = is_exceeded(&store, &scope(), 1, 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!after.is_exceeded());
    }

    #[tokio::test]
    async fn test_multi_permit_cost() {
        let store = MemoryCounterStore::new();

        let bulk = is_exceeded(&store, &scope(), 3, 4, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!bulk.is_exceeded());

        // Two more permits would overshoot; the acquire must not take a
        // partial grant.
        let over = is_exceeded(&store, &scope(), 2, 4, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(over.is_exceeded());

        let fitting = is_exceeded(&store, &scope(), 1, 4, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!fitting.is_exceeded());
    }

    #[tokio::test]
    async fn test_still_exceeded_accounts_for_cost() {
        let store = MemoryCounterStore::new();

        let first = is_exceeded(&store, &scope(), 1, 2, Duration::from_secs(5))
            .await
            .unwrap();
        let id = first.counter_id().unwrap().clone();

        // One permit held out of two: a single permit fits, two do not.
        assert!(!is_still_exceeded(&store, &id, 2, 1).await.unwrap());
        assert!(is_still_exceeded(&store, &id, 2, 2).await.unwrap());

        is_exceeded(&store, &scope(), 1, 2, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(is_still_exceeded(&store, &id, 2, 1).await.unwrap());
    }
}
