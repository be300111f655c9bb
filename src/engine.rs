//! The rate limiting engine.
//!
//! Per request the engine captures the current config snapshot, walks
//! the rules in declared order against the counter store, optionally
//! waits for capacity, registers cleanup routines for admitted rules and
//! fuses downstream throttle signals back into the ingress result list.
//!
//! Every matching rule is always evaluated, even after an earlier rule
//! reported exceeded, so counters reflect the true request volume.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::config::{spawn_reload, ConfigHandle, ConfigSource, RateLimitConfig};
use crate::error::{EgressThrottled, RateLimitError, Result};
use crate::extract::{CostFn, IdentityFn};
use crate::method::LimitMethod;
use crate::outcome::{CounterId, LimitExceededResult, RequestOutcome};
use crate::request::RequestView;
use crate::rule::Rule;
use crate::store::CounterStore;

/// Default admission-delay poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Failure surface of the `next` continuation.
///
/// Opaque to the engine except for [`EgressThrottled`] signals found on
/// it.
pub type NextActionError = Box<dyn std::error::Error + Send + Sync>;

/// Deferred counter settlement for one admitted rule.
///
/// Owned by the request's scope and invoked exactly once at request
/// completion. Failures are logged and swallowed; a broken cleanup never
/// poisons the request.
pub struct CleanupRoutine<S> {
    store: Arc<S>,
    limit: LimitMethod,
    counter_id: CounterId,
    cost: u64,
}

impl<S> std::fmt::Debug for CleanupRoutine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRoutine")
            .field("counter_id", &self.counter_id)
            .field("method", &self.limit.name())
            .field("cost", &self.cost)
            .finish()
    }
}

impl<S: CounterStore> CleanupRoutine<S> {
    fn new(store: Arc<S>, limit: LimitMethod, counter_id: CounterId, cost: u64) -> Self {
        Self {
            store,
            limit,
            counter_id,
            cost,
        }
    }

    /// The counter cell this routine settles.
    pub fn counter_id(&self) -> &CounterId {
        &self.counter_id
    }

    /// Run the routine, consuming it.
    pub async fn run(self, outcome: RequestOutcome) {
        if let Err(err) = self
            .limit
            .on_request_finished(&*self.store, &self.counter_id, self.cost, outcome)
            .await
        {
            tracing::warn!(
                key = self.counter_id.key(),
                method = self.limit.name(),
                error = %err,
                "cleanup routine failed"
            );
        }
    }
}

/// Run a request's cleanup routines in reverse registration order.
pub async fn run_cleanup<S: CounterStore>(
    routines: Vec<CleanupRoutine<S>>,
    outcome: RequestOutcome,
) {
    for routine in routines.into_iter().rev() {
        routine.run(outcome).await;
    }
}

/// The per-request evaluator.
///
/// Cheap to share behind an `Arc`; all request-scoped state lives in the
/// caller's cleanup list and the store.
pub struct RateLimitEngine<S> {
    store: Arc<S>,
    config: ConfigHandle,
    global_identity: Option<IdentityFn>,
    global_cost: Option<CostFn>,
    poll_interval: Duration,
    disposed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl<S> std::fmt::Debug for RateLimitEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitEngine")
            .field("config", &self.config)
            .field("poll_interval", &self.poll_interval)
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish()
    }
}

impl<S> RateLimitEngine<S> {
    /// Start building an engine.
    pub fn builder() -> RateLimitEngineBuilder {
        RateLimitEngineBuilder::new()
    }

    /// Stop scheduling config reloads.
    ///
    /// In-flight evaluations complete normally; a reload finishing after
    /// this call is discarded.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.shutdown.notify_waiters();
            tracing::debug!("rate limit engine disposed");
        }
    }

    /// Whether [`Self::dispose`] has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl<S> Drop for RateLimitEngine<S> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<S: CounterStore> RateLimitEngine<S> {
    /// Evaluate all rules against the request.
    ///
    /// Returns one result per matching rule. Cleanup routines are pushed
    /// onto `cleanup` for every *admitted* rule only; exceeded results
    /// never get one. A whitelisted request returns an empty list and
    /// leaves the store untouched.
    pub async fn is_exceeded(
        &self,
        request: &dyn RequestView,
        cleanup: &mut Vec<CleanupRoutine<S>>,
    ) -> Result<Vec<LimitExceededResult>> {
        let config = self.config.current();

        if config.whitelist_matches(request) {
            tracing::info!(path = request.path(), "request whitelisted, skipping rate limits");
            return Ok(Vec::new());
        }

        let t_start = Instant::now();
        let mut results = Vec::new();
        let mut pending_error: Option<RateLimitError> = None;

        for rule in config.rules() {
            match self.evaluate_rule(&config, rule, request, t_start).await {
                Ok(None) => continue,
                Ok(Some((result, cost))) => {
                    if !result.is_exceeded() {
                        if let Some(counter_id) = result.counter_id() {
                            cleanup.push(CleanupRoutine::new(
                                self.store.clone(),
                                rule.limit().clone(),
                                counter_id.clone(),
                                cost,
                            ));
                        }
                    }
                    results.push(result);
                }
                Err(err) => {
                    if err.is_store_corruption() {
                        tracing::error!(
                            rule = rule.key_fragment(),
                            error = %err,
                            "corrupt state read back from counter store"
                        );
                    }
                    tracing::error!(
                        rule = rule.key_fragment(),
                        method = rule.limit().name(),
                        error = %err,
                        "rule evaluation failed"
                    );
                    // Later rules still run; the first error owned by a
                    // throwing method surfaces after the walk.
                    if pending_error.is_none() && rule.limit().should_throw_on_failures() {
                        pending_error = Some(err);
                    }
                }
            }
        }

        match pending_error {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }

    /// Evaluate the rules and, when nothing is exceeded, run the `next`
    /// continuation.
    ///
    /// A `next` failure carrying an [`EgressThrottled`] signal (directly,
    /// in its `source()` chain, or inside a composite failure) is folded
    /// into the result list with its retry-after taken verbatim. Any
    /// other failure propagates unchanged.
    pub async fn is_ingress_or_egress_exceeded<F, Fut>(
        &self,
        request: &dyn RequestView,
        cleanup: &mut Vec<CleanupRoutine<S>>,
        next: F,
    ) -> std::result::Result<Vec<LimitExceededResult>, NextActionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<(), NextActionError>>,
    {
        let mut results = self.is_exceeded(request, cleanup).await?;
        if results.iter().any(LimitExceededResult::is_exceeded) {
            return Ok(results);
        }

        match next().await {
            Ok(()) => Ok(results),
            Err(err) => {
                let inner: &(dyn std::error::Error + 'static) = &*err;
                if let Some(throttled) = EgressThrottled::find_in(inner) {
                    tracing::debug!(
                        retry_after = %throttled.retry_after(),
                        "downstream throttle signal folded into ingress results"
                    );
                    results.push(LimitExceededResult::from_egress(
                        throttled.retry_after().clone(),
                    ));
                    Ok(results)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Evaluate one rule, waiting for admission when the rule allows it.
    async fn evaluate_rule(
        &self,
        config: &RateLimitConfig,
        rule: &Rule,
        request: &dyn RequestView,
        t_start: Instant,
    ) -> Result<Option<(LimitExceededResult, u64)>> {
        let namespace = config.unique_name();
        let global_identity = self.global_identity.as_ref();
        let global_cost = self.global_cost.as_ref();

        let Some(mut result) = rule
            .evaluate(&*self.store, request, namespace, global_identity, global_cost)
            .await?
        else {
            return Ok(None);
        };
        let cost = rule.resolve_cost(request, global_cost);

        if result.is_exceeded() && rule.max_delay() > Duration::ZERO {
            tracing::debug!(
                rule = rule.key_fragment(),
                max_delay = ?rule.max_delay(),
                "limit exceeded, entering admission delay"
            );

            while t_start.elapsed() <= rule.max_delay() {
                let freed = match result.counter_id() {
                    Some(counter_id) => {
                        !rule
                            .limit()
                            .is_still_exceeded(&*self.store, counter_id, cost)
                            .await?
                    }
                    None => false,
                };

                if freed {
                    // Full re-evaluation: other requests may have taken
                    // the freed capacity in the meantime.
                    let Some(fresh) = rule
                        .evaluate(&*self.store, request, namespace, global_identity, global_cost)
                        .await?
                    else {
                        break;
                    };
                    result = fresh;
                    if !result.is_exceeded() {
                        tracing::debug!(
                            rule = rule.key_fragment(),
                            waited = ?t_start.elapsed(),
                            "request admitted after delay"
                        );
                        break;
                    }
                }

                tokio::time::sleep(self.poll_interval).await;
            }
        }

        Ok(Some((result, cost)))
    }
}

/// Builder for [`RateLimitEngine`].
pub struct RateLimitEngineBuilder {
    config: Option<RateLimitConfig>,
    global_identity: Option<IdentityFn>,
    global_cost: Option<CostFn>,
    poll_interval: Duration,
}

impl Default for RateLimitEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitEngineBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: None,
            global_identity: None,
            global_cost: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Use a static configuration snapshot.
    pub fn config(mut self, config: RateLimitConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Identity extractor for rules without their own.
    pub fn global_identity<F>(mut self, extract: F) -> Self
    where
        F: Fn(&dyn RequestView) -> Option<String> + Send + Sync + 'static,
    {
        self.global_identity = Some(Arc::new(extract));
        self
    }

    /// Cost extractor for rules without their own.
    pub fn global_cost<F>(mut self, extract: F) -> Self
    where
        F: Fn(&dyn RequestView) -> u64 + Send + Sync + 'static,
    {
        self.global_cost = Some(Arc::new(extract));
        self
    }

    /// Admission-delay poll interval (default 50 ms).
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Build an engine with a static snapshot.
    pub fn build<S: CounterStore>(self, store: S) -> RateLimitEngine<S> {
        let config = self.config.unwrap_or_else(RateLimitConfig::empty);
        RateLimitEngine {
            store: Arc::new(store),
            config: ConfigHandle::new(config),
            global_identity: self.global_identity,
            global_cost: self.global_cost,
            poll_interval: self.poll_interval,
            disposed: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Build an engine that loads its configuration from `source`.
    ///
    /// The initial load happens inline; if it fails the engine starts
    /// with an empty rule set and keeps running. With a non-zero
    /// `reload_interval` a background task reloads on that interval
    /// until the engine is disposed.
    pub async fn build_reloading<S, C>(
        self,
        store: S,
        source: C,
        reload_interval: Duration,
    ) -> RateLimitEngine<S>
    where
        S: CounterStore,
        C: ConfigSource,
    {
        let initial = match source.load().await {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(
                    error = %err,
                    "initial configuration load failed, starting with empty rule set"
                );
                RateLimitConfig::empty()
            }
        };

        let engine = RateLimitEngine {
            store: Arc::new(store),
            config: ConfigHandle::new(initial),
            global_identity: self.global_identity,
            global_cost: self.global_cost,
            poll_interval: self.poll_interval,
            disposed: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        };

        if reload_interval > Duration::ZERO {
            spawn_reload(
                engine.config.clone(),
                source,
                reload_interval,
                engine.shutdown.clone(),
                engine.disposed.clone(),
            );
        }

        engine
    }
}
