//! Circuit breaker limit.
//!
//! Counts request failures in a fixed window; at the failure threshold
//! the breaker opens and rejects everything except one trial request per
//! trial interval. A successful trial closes the breaker. All state
//! lives in counter cells so breakers are shared across nodes: a
//! failure-window cell, a state cell (count > 0 means open) and one
//! trial cell per trial window.

use std::time::Duration;

use crate::error::Result;
use crate::method::{LimitScope, TTL_GRACE};
use crate::outcome::{CounterId, LimitExceededResult, RequestOutcome, RetryAfter};
use crate::store::{current_timestamp_ms, CounterStore};

/// Lifetime of the open-state cell, refreshed whenever the breaker
/// opens. An idle breaker eventually ages back to closed.
const STATE_TTL: Duration = Duration::from_secs(3600);

fn state_key(base: &str) -> String {
    format!("{}:state", base)
}

fn failure_key(base: &str, window_start: u64) -> String {
    format!("{}:failures:{}", base, window_start)
}

fn trial_key(base: &str, window_start: u64) -> String {
    format!("{}:trial:{}", base, window_start)
}

async fn is_open<S: CounterStore>(store: &S, base: &str) -> Result<bool> {
    Ok(store
        .get(&state_key(base))
        .await?
        .map(|cell| cell.count > 0)
        .unwrap_or(false))
}

pub(super) async fn is_exceeded<S: CounterStore>(
    store: &S,
    scope: &LimitScope<'_>,
    _interval: Duration,
    trial_interval: Duration,
) -> Result<LimitExceededResult> {
    let base = scope.base_key();
    let now = scope.now_ms();
    let counter_id = CounterId::new(base.clone(), scope.namespace());

    if !is_open(store, &base).await? {
        // Failures are recorded at completion, not admission.
        return Ok(LimitExceededResult::admitted(counter_id, scope.rule_key()));
    }

    let trial_ms = trial_interval.as_millis() as u64;
    let trial_start = now - now % trial_ms;
    let (taken, active_window) = store
        .increment(
            &trial_key(&base, trial_start),
            1,
            trial_start,
            trial_interval + TTL_GRACE,
        )
        .await?;

    if taken == 1 {
        tracing::debug!(key = %base, "breaker open, admitting trial request");
        Ok(LimitExceededResult::admitted(counter_id, scope.rule_key()))
    } else {
        let retry = Duration::from_millis((active_window + trial_ms).saturating_sub(now));
        Ok(LimitExceededResult::exceeded(
            counter_id,
            RetryAfter::Delay(retry),
            scope.rule_key(),
        ))
    }
}

pub(super) async fn is_still_exceeded<S: CounterStore>(
    store: &S,
    counter_id: &CounterId,
    trial_interval: Duration,
) -> Result<bool> {
    let base = counter_id.key();
    if !is_open(store, base).await? {
        return Ok(false);
    }

    // Open, but a trial slot may have become available.
    let trial_ms = trial_interval.as_millis() as u64;
    let now = current_timestamp_ms();
    let trial_start = now - now % trial_ms;
    let taken = store
        .get(&trial_key(base, trial_start))
        .await?
        .map(|cell| cell.count)
        .unwrap_or(0);

    Ok(taken > 0)
}

pub(super) async fn record_outcome<S: CounterStore>(
    store: &S,
    counter_id: &CounterId,
    outcome: RequestOutcome,
    permit_limit: u64,
    interval: Duration,
) -> Result<()> {
    let base = counter_id.key();
    let interval_ms = interval.as_millis() as u64;
    let now = current_timestamp_ms();
    let window_start = now - now % interval_ms;

    match outcome {
        RequestOutcome::Success => {
            if is_open(store, base).await? {
                store.decrement(&state_key(base), u64::MAX).await?;
                store
                    .decrement(&failure_key(base, window_start), u64::MAX)
                    .await?;
                tracing::info!(key = %base, "circuit breaker closed after successful trial");
            }
        }
        RequestOutcome::Failure => {
            let (failures, _) = store
                .increment(
                    &failure_key(base, window_start),
                    1,
                    window_start,
                    interval + TTL_GRACE,
                )
                .await?;
            if failures >= permit_limit && !is_open(store, base).await? {
                store
                    .increment(&state_key(base), 1, 0, STATE_TTL)
                    .await?;
                tracing::warn!(key = %base, failures, "circuit breaker opened");
            }
        }
    }

    Ok(())
}
