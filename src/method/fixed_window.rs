//! Fixed window limit.
//!
//! One counter cell per window; the window start is baked into the key
//! so rolled windows expire on their own.

use std::time::Duration;

use crate::error::Result;
use crate::method::{LimitScope, TTL_GRACE};
use crate::outcome::{CounterId, LimitExceededResult, RetryAfter};
use crate::store::{current_timestamp_ms, CounterStore};

pub(super) async fn is_exceeded<S: CounterStore>(
    store: &S,
    scope: &LimitScope<'_>,
    cost: u64,
    permit_limit: u64,
    interval: Duration,
) -> Result<LimitExceededResult> {
    let interval_ms = interval.as_millis() as u64;
    let now = scope.now_ms();
    let window_start = now - now % interval_ms;

    let key = format!("{}:{}", scope.base_key(), window_start);
    let (count, active_window) = store
        .increment(&key, cost, window_start, interval + TTL_GRACE)
        .await?;

    let counter_id = CounterId::new(key, scope.namespace()).with_window(active_window);
    if count > permit_limit {
        let retry = Duration::from_millis((active_window + interval_ms).saturating_sub(now));
        Ok(LimitExceededResult::exceeded(
            counter_id,
            RetryAfter::Delay(retry),
            scope.rule_key(),
        ))
    } else {
        Ok(LimitExceededResult::admitted(counter_id, scope.rule_key()))
    }
}

pub(super) async fn is_still_exceeded<S: CounterStore>(
    store: &S,
    counter_id: &CounterId,
    permit_limit: u64,
    interval: Duration,
) -> Result<bool> {
    let Some(window_start) = counter_id.window_start() else {
        return Ok(false);
    };

    // The window the exceeded result was computed in has ended; capacity
    // is available in the new one.
    let now = current_timestamp_ms();
    if now >= window_start + interval.as_millis() as u64 {
        return Ok(false);
    }

    match store.get(counter_id.key()).await? {
        Some(cell) => Ok(cell.window_start == window_start && cell.count > permit_limit),
        None => Ok(false),
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::store::MemoryCounterStore;

    fn scope(now_ms: u64) -> LimitScope<'static> {
        LimitScope::at("svc", "r1", Some("user-1"), now_ms)
    }

    #[tokio::test]
    async fn test_admits_up_to_limit() {
        let store = MemoryCounterStore::new();
        let now = current_timestamp_ms();

        for i in 1..=3 {
            let result = is_exceeded(&store, &scope(now), 1, 3, Duration::from_secs(10))
                .await
                .unwrap();
            assert!(!result.is_exceeded(), "request {} should be admitted", i);
        }

        let result = is_exceeded(&store, &scope(now), 1, 3, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(result.is_exceeded());
    }

    #[tokio::test]
    async fn test_retry_after_points_at_window_end() {
        let store = MemoryCounterStore::new();
        let interval = Duration::from_secs(10);
        // Quarter of the way into a window.
        let now = 1_000_000_000_000 + 2_500;

        is_exceeded(&store, &scope(now), 1, 1, interval)
            .await
            .unwrap();
        let result = is_exceeded(&store, &scope(now), 1, 1, interval)
            .await
            .unwrap();

        assert!(result.is_exceeded());
        let retry = result
            .retry_after()
            .and_then(RetryAfter::as_duration)
            .unwrap();
        assert_eq!(retry, Duration::from_millis(7_500));
    }

    #[tokio::test]
    async fn test_cost_weighs_against_limit() {
        let store = MemoryCounterStore::new();
        let now = current_timestamp_ms();

        let result = is_exceeded(&store, &scope(now), 4, 5, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(!result.is_exceeded());

        let result = is_exceeded(&store, &scope(now), 4, 5, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(result.is_exceeded());
    }

    #[tokio::test]
    async fn test_still_exceeded_tracks_counter() {
        let store = MemoryCounterStore::new();
        // Aligned to the real clock's current window so the re-check below
        // sees the same window.
        let now = current_timestamp_ms();
        let now = now - now % 10_000;
        let interval = Duration::from_secs(10);

        is_exceeded(&store, &scope(now), 1, 1, interval)
            .await
            .unwrap();
        let result = is_exceeded(&store, &scope(now), 1, 1, interval)
            .await
            .unwrap();
        let id = result.counter_id().unwrap();

        assert!(is_still_exceeded(&store, id, 1, interval).await.unwrap());

        // Under the limit again once the overshoot is removed.
        store.decrement(id.key(), 1).await.unwrap();
        assert!(!is_still_exceeded(&store, id, 1, interval).await.unwrap());
    }
}
