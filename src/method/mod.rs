//! Limit method strategies.
//!
//! [`LimitMethod`] is a closed sum type: the engine enumerates variants
//! for serialization and for outcome-specific hooks (the circuit breaker
//! observes request outcomes), so strategies are not open for external
//! extension. Each variant's mechanics live in its own module.

mod circuit_breaker;
mod fixed_window;
mod semaphore;
mod sliding_window;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::outcome::{CounterId, LimitExceededResult, RequestOutcome};
use crate::store::{current_timestamp_ms, CounterStore};

/// Extra lifetime granted to window cells beyond the window itself, so a
/// cell is still readable right at the window boundary.
pub(crate) const TTL_GRACE: Duration = Duration::from_secs(1);

/// Evaluation scope for one rule against one request.
///
/// Bundles the pieces every strategy needs to name its counter cells:
/// the service namespace, the rule's key fragment, the extracted
/// identity and the evaluation timestamp.
#[derive(Debug, Clone)]
pub struct LimitScope<'a> {
    namespace: &'a str,
    rule_key: &'a str,
    identity: Option<&'a str>,
    now_ms: u64,
}

impl<'a> LimitScope<'a> {
    /// Create a scope stamped with the current time.
    pub fn new(namespace: &'a str, rule_key: &'a str, identity: Option<&'a str>) -> Self {
        Self::at(namespace, rule_key, identity, current_timestamp_ms())
    }

    /// Create a scope at an explicit timestamp (Unix milliseconds).
    pub fn at(
        namespace: &'a str,
        rule_key: &'a str,
        identity: Option<&'a str>,
        now_ms: u64,
    ) -> Self {
        Self {
            namespace,
            rule_key,
            identity,
            now_ms,
        }
    }

    /// The service-unique namespace.
    pub fn namespace(&self) -> &str {
        self.namespace
    }

    /// The rule's key fragment.
    pub fn rule_key(&self) -> &str {
        self.rule_key
    }

    /// The extracted identity, if any.
    pub fn identity(&self) -> Option<&str> {
        self.identity
    }

    /// Evaluation timestamp (Unix milliseconds).
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Counter key prefix: `namespace:rule` or `namespace:rule:identity`.
    ///
    /// A missing identity omits the segment entirely so identity-less
    /// rules share one cell per window.
    pub fn base_key(&self) -> String {
        match self.identity {
            Some(identity) => format!("{}:{}:{}", self.namespace, self.rule_key, identity),
            None => format!("{}:{}", self.namespace, self.rule_key),
        }
    }
}

/// Rate limiting strategy for one rule.
///
/// | Variant | Limits | Counter shape |
/// |---------|--------|---------------|
/// | `FixedWindow` | requests per window | one cell per window |
/// | `SlidingWindow` | requests per rolling window | one cell per bucket |
/// | `Semaphore` | concurrent requests | one permit cell |
/// | `CircuitBreaker` | failures per window | failure/state/trial cells |
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum LimitMethod {
    /// Counter resets at fixed window boundaries.
    #[serde(rename_all = "PascalCase")]
    FixedWindow {
        /// Admitted cost per window.
        permit_limit: u64,
        /// Window length in seconds.
        interval_seconds: u64,
        /// Whether store failures fail the request.
        #[serde(default)]
        should_throw_on_failures: bool,
    },

    /// Window subdivided into buckets summed over a rolling view.
    #[serde(rename_all = "PascalCase")]
    SlidingWindow {
        /// Admitted cost per rolling window.
        permit_limit: u64,
        /// Window length in seconds.
        interval_seconds: u64,
        /// Sub-buckets per window; more buckets, smoother rolling.
        number_of_buckets: u32,
        /// Whether store failures fail the request.
        #[serde(default)]
        should_throw_on_failures: bool,
    },

    /// Bounded concurrency; permits held for the request's lifetime.
    #[serde(rename_all = "PascalCase")]
    Semaphore {
        /// Maximum concurrently held permits.
        permit_limit: u64,
        /// Suggested wait reported to rejected callers, in seconds.
        timeout_seconds: u64,
        /// Whether store failures fail the request.
        #[serde(default)]
        should_throw_on_failures: bool,
    },

    /// Opens after too many failures, re-admits trial requests.
    #[serde(rename_all = "PascalCase")]
    CircuitBreaker {
        /// Failures per interval that open the breaker.
        permit_limit: u64,
        /// Failure-counting window in seconds.
        interval_seconds: u64,
        /// One trial request is admitted per this many seconds while
        /// open.
        trial_interval_seconds: u64,
        /// Whether store failures fail the request.
        #[serde(default)]
        should_throw_on_failures: bool,
    },
}

impl LimitMethod {
    /// Fixed window with the given per-window limit.
    pub fn fixed_window(permit_limit: u64, interval_seconds: u64) -> Self {
        Self::FixedWindow {
            permit_limit,
            interval_seconds,
            should_throw_on_failures: false,
        }
    }

    /// Sliding window with the given rolling limit.
    pub fn sliding_window(permit_limit: u64, interval_seconds: u64, number_of_buckets: u32) -> Self {
        Self::SlidingWindow {
            permit_limit,
            interval_seconds,
            number_of_buckets,
            should_throw_on_failures: false,
        }
    }

    /// Concurrency limit with the given permit count.
    pub fn semaphore(permit_limit: u64, timeout_seconds: u64) -> Self {
        Self::Semaphore {
            permit_limit,
            timeout_seconds,
            should_throw_on_failures: false,
        }
    }

    /// Circuit breaker opening after `permit_limit` failures per
    /// interval.
    pub fn circuit_breaker(
        permit_limit: u64,
        interval_seconds: u64,
        trial_interval_seconds: u64,
    ) -> Self {
        Self::CircuitBreaker {
            permit_limit,
            interval_seconds,
            trial_interval_seconds,
            should_throw_on_failures: false,
        }
    }

    /// Make store failures fail the request instead of being swallowed.
    pub fn throw_on_failures(mut self) -> Self {
        match &mut self {
            Self::FixedWindow {
                should_throw_on_failures,
                ..
            }
            | Self::SlidingWindow {
                should_throw_on_failures,
                ..
            }
            | Self::Semaphore {
                should_throw_on_failures,
                ..
            }
            | Self::CircuitBreaker {
                should_throw_on_failures,
                ..
            } => *should_throw_on_failures = true,
        }
        self
    }

    /// Strategy name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::FixedWindow { .. } => "fixed_window",
            Self::SlidingWindow { .. } => "sliding_window",
            Self::Semaphore { .. } => "semaphore",
            Self::CircuitBreaker { .. } => "circuit_breaker",
        }
    }

    /// Whether a store failure during evaluation fails the request.
    pub fn should_throw_on_failures(&self) -> bool {
        match self {
            Self::FixedWindow {
                should_throw_on_failures,
                ..
            }
            | Self::SlidingWindow {
                should_throw_on_failures,
                ..
            }
            | Self::Semaphore {
                should_throw_on_failures,
                ..
            }
            | Self::CircuitBreaker {
                should_throw_on_failures,
                ..
            } => *should_throw_on_failures,
        }
    }

    /// Validate the variant's parameters.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        match self {
            Self::FixedWindow {
                permit_limit,
                interval_seconds,
                ..
            } => {
                if *permit_limit == 0 {
                    return Err(ConfigError::InvalidLimit("PermitLimit must be > 0".into()));
                }
                if *interval_seconds == 0 {
                    return Err(ConfigError::InvalidLimit(
                        "IntervalSeconds must be > 0".into(),
                    ));
                }
            }
            Self::SlidingWindow {
                permit_limit,
                interval_seconds,
                number_of_buckets,
                ..
            } => {
                if *permit_limit == 0 {
                    return Err(ConfigError::InvalidLimit("PermitLimit must be > 0".into()));
                }
                if *interval_seconds == 0 {
                    return Err(ConfigError::InvalidLimit(
                        "IntervalSeconds must be > 0".into(),
                    ));
                }
                if *number_of_buckets == 0 {
                    return Err(ConfigError::InvalidLimit(
                        "NumberOfBuckets must be >= 1".into(),
                    ));
                }
            }
            Self::Semaphore { permit_limit, .. } => {
                if *permit_limit == 0 {
                    return Err(ConfigError::InvalidLimit("PermitLimit must be > 0".into()));
                }
            }
            Self::CircuitBreaker {
                permit_limit,
                interval_seconds,
                trial_interval_seconds,
                ..
            } => {
                if *permit_limit == 0 {
                    return Err(ConfigError::InvalidLimit("PermitLimit must be > 0".into()));
                }
                if *interval_seconds == 0 || *trial_interval_seconds == 0 {
                    return Err(ConfigError::InvalidLimit(
                        "IntervalSeconds and TrialIntervalSeconds must be > 0".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Evaluate the limit for one request, recording its cost.
    ///
    /// Always records against the counter, even when the limit comes
    /// back exceeded, so counters reflect the true request volume.
    pub async fn is_exceeded<S: CounterStore>(
        &self,
        store: &S,
        scope: &LimitScope<'_>,
        cost: u64,
    ) -> Result<LimitExceededResult> {
        match self {
            Self::FixedWindow {
                permit_limit,
                interval_seconds,
                ..
            } => {
                fixed_window::is_exceeded(
                    store,
                    scope,
                    cost,
                    *permit_limit,
                    Duration::from_secs(*interval_seconds),
                )
                .await
            }
            Self::SlidingWindow {
                permit_limit,
                interval_seconds,
                number_of_buckets,
                ..
            } => {
                sliding_window::is_exceeded(
                    store,
                    scope,
                    cost,
                    *permit_limit,
                    Duration::from_secs(*interval_seconds),
                    *number_of_buckets,
                )
                .await
            }
            Self::Semaphore {
                permit_limit,
                timeout_seconds,
                ..
            } => {
                semaphore::is_exceeded(
                    store,
                    scope,
                    cost,
                    *permit_limit,
                    Duration::from_secs(*timeout_seconds),
                )
                .await
            }
            Self::CircuitBreaker {
                interval_seconds,
                trial_interval_seconds,
                ..
            } => {
                circuit_breaker::is_exceeded(
                    store,
                    scope,
                    Duration::from_secs(*interval_seconds),
                    Duration::from_secs(*trial_interval_seconds),
                )
                .await
            }
        }
    }

    /// Cheap re-check used by the admission-delay loop.
    ///
    /// Never increments; a `false` answer only means capacity *may* be
    /// available, and the caller re-evaluates through [`Self::is_exceeded`].
    /// `cost` matters to the semaphore, which has room only when the
    /// held permits leave space for the whole request; the window
    /// methods ignore it.
    pub async fn is_still_exceeded<S: CounterStore>(
        &self,
        store: &S,
        counter_id: &CounterId,
        cost: u64,
    ) -> Result<bool> {
        match self {
            Self::FixedWindow {
                permit_limit,
                interval_seconds,
                ..
            } => {
                fixed_window::is_still_exceeded(
                    store,
                    counter_id,
                    *permit_limit,
                    Duration::from_secs(*interval_seconds),
                )
                .await
            }
            Self::SlidingWindow {
                permit_limit,
                interval_seconds,
                number_of_buckets,
                ..
            } => {
                sliding_window::is_still_exceeded(
                    store,
                    counter_id,
                    *permit_limit,
                    Duration::from_secs(*interval_seconds),
                    *number_of_buckets,
                )
                .await
            }
            Self::Semaphore { permit_limit, .. } => {
                semaphore::is_still_exceeded(store, counter_id, *permit_limit, cost).await
            }
            Self::CircuitBreaker {
                trial_interval_seconds,
                ..
            } => {
                circuit_breaker::is_still_exceeded(
                    store,
                    counter_id,
                    Duration::from_secs(*trial_interval_seconds),
                )
                .await
            }
        }
    }

    /// Settle the counter at request completion.
    ///
    /// Window methods are no-ops, the semaphore releases its permits and
    /// the circuit breaker records the request outcome.
    pub async fn on_request_finished<S: CounterStore>(
        &self,
        store: &S,
        counter_id: &CounterId,
        cost: u64,
        outcome: RequestOutcome,
    ) -> Result<()> {
        match self {
            Self::FixedWindow { .. } | Self::SlidingWindow { .. } => Ok(()),
            Self::Semaphore { .. } => semaphore::release(store, counter_id, cost).await,
            Self::CircuitBreaker {
                permit_limit,
                interval_seconds,
                ..
            } => {
                circuit_breaker::record_outcome(
                    store,
                    counter_id,
                    outcome,
                    *permit_limit,
                    Duration::from_secs(*interval_seconds),
                )
                .await
            }
        }
    }
}
