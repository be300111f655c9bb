//! Sliding window limit.
//!
//! The window is subdivided into buckets, one counter cell per bucket;
//! the admitted volume is the sum over the last N buckets. Old buckets
//! fall out of the rolling view one bucket length at a time, which
//! avoids the boundary burst of a fixed window.

use std::time::Duration;

use crate::error::Result;
use crate::method::{LimitScope, TTL_GRACE};
use crate::outcome::{CounterId, LimitExceededResult, RetryAfter};
use crate::store::{current_timestamp_ms, CounterStore};

fn bucket_len_ms(interval: Duration, buckets: u32) -> u64 {
    (interval.as_millis() as u64 / u64::from(buckets)).max(1)
}

/// Sum the last `buckets` bucket cells ending at the bucket containing
/// `now_ms`. With `skip_current` the newest bucket is left out (its
/// count is already known to the caller).
async fn view_sum<S: CounterStore>(
    store: &S,
    base: &str,
    now_ms: u64,
    bucket_ms: u64,
    buckets: u32,
    skip_current: bool,
) -> Result<u64> {
    let current_start = now_ms - now_ms % bucket_ms;
    let mut sum = 0;

    let start_index = if skip_current { 1 } else { 0 };
    for i in start_index..u64::from(buckets) {
        let bucket_start = current_start.saturating_sub(i * bucket_ms);
        let key = format!("{}:{}", base, bucket_start);
        if let Some(cell) = store.get(&key).await? {
            if cell.window_start == bucket_start {
                sum += cell.count;
            }
        }
        if bucket_start == 0 {
            break;
        }
    }

    Ok(sum)
}

pub(super) async fn is_exceeded<S: CounterStore>(
    store: &S,
    scope: &LimitScope<'_>,
    cost: u64,
    permit_limit: u64,
    interval: Duration,
    buckets: u32,
) -> Result<LimitExceededResult> {
    let bucket_ms = bucket_len_ms(interval, buckets);
    let now = scope.now_ms();
    let bucket_start = now - now % bucket_ms;
    let base = scope.base_key();

    let key = format!("{}:{}", base, bucket_start);
    let (current_count, _) = store
        .increment(&key, cost, bucket_start, interval + TTL_GRACE)
        .await?;

    let older_sum = view_sum(store, &base, now, bucket_ms, buckets, true).await?;
    let total = current_count + older_sum;

    let counter_id = CounterId::new(key, scope.namespace()).with_window(bucket_start);
    if total > permit_limit {
        // The view slides forward when the current bucket closes and the
        // oldest one drops off.
        let retry = Duration::from_millis((bucket_start + bucket_ms).saturating_sub(now));
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
    buckets: u32,
) -> Result<bool> {
    // Bucket keys are `base:bucket_start`; recover the base to rebuild
    // the current view.
    let Some((base, _)) = counter_id.key().rsplit_once(':') else {
        return Ok(false);
    };

    let bucket_ms = bucket_len_ms(interval, buckets);
    let now = current_timestamp_ms();
    let sum = view_sum(store, base, now, bucket_ms, buckets, false).await?;

    Ok(sum > permit_limit)
}
