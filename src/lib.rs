//! Rule-driven request rate limiting engine for Rust.
//!
//! `rategate` sits in front of (ingress) and behind (egress) an
//! HTTP-style request pipeline. Per request it evaluates declarative
//! rules against a shared counter store, decides whether any limit is
//! exceeded, optionally delays the request until capacity frees up, and
//! schedules the cleanup that keeps counters honest. A downstream
//! throttle signal surfacing from the `next` continuation is folded back
//! into the ingress decision.
//!
//! - **Limit methods**: fixed window, sliding window, semaphore
//!   (concurrency), circuit breaker
//! - **Pluggable counters**: one [`CounterStore`] trait; TTL-bounded
//!   in-memory backend included, distributed backends implement the
//!   same five operations
//! - **Live reconfiguration**: snapshots behind an atomic pointer,
//!   reloaded on an interval without tearing in-flight requests
//! - **Egress fusion**: downstream `Retry-After` signals become ingress
//!   results instead of errors
//!
//! # Quick Start
//!
//! ```ignore
//! use rategate::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RateLimitConfig::new("orders-api").with_rule(
//!         Rule::new(
//!             RuleMatcher::uri("/api/**"),
//!             LimitMethod::fixed_window(100, 60),
//!         )
//!         .with_max_delay(Duration::from_secs(5)),
//!     );
//!
//!     let engine = RateLimitEngineBuilder::new()
//!         .config(config)
//!         .build(MemoryCounterStore::new());
//!
//!     let mut cleanup = Vec::new();
//!     let results = engine
//!         .is_ingress_or_egress_exceeded(&request, &mut cleanup, || handle(request))
//!         .await
//!         .unwrap();
//!
//!     if results.iter().any(|r| r.is_exceeded()) {
//!         // shape a 429 from the results
//!     }
//!     run_cleanup(cleanup, RequestOutcome::Success).await;
//! }
//! ```
//!
//! # Feature Flags
//!
//! - `memory` (default): in-memory counter store

pub mod config;
pub mod engine;
pub mod error;
pub mod extract;
pub mod method;
pub mod outcome;
pub mod request;
pub mod rule;
pub mod store;

// Re-export main types
pub use config::{ConfigHandle, ConfigSource, RateLimitConfig, RateLimitSettings, RuleSpec};
pub use engine::{
    run_cleanup, CleanupRoutine, NextActionError, RateLimitEngine, RateLimitEngineBuilder,
    DEFAULT_POLL_INTERVAL,
};
pub use error::{
    CompositeError, ConfigError, EgressThrottled, RateLimitError, Result, StoreError,
};
pub use extract::{CostFn, CostSpec, IdentityFn, IdentitySpec};
pub use method::{LimitMethod, LimitScope};
pub use outcome::{CounterId, LimitExceededResult, RequestOutcome, RetryAfter};
pub use request::RequestView;
pub use rule::{Rule, RuleMatcher};
pub use store::{CounterCell, CounterStore, SemaphoreAcquire, SemaphoreToken};

#[cfg(feature = "memory")]
pub use store::MemoryCounterStore;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{ConfigSource, RateLimitConfig};
    pub use crate::engine::{
        run_cleanup, CleanupRoutine, RateLimitEngine, RateLimitEngineBuilder,
    };
    pub use crate::error::{RateLimitError, Result};
    pub use crate::method::LimitMethod;
    pub use crate::outcome::{LimitExceededResult, RequestOutcome, RetryAfter};
    pub use crate::request::RequestView;
    pub use crate::rule::{Rule, RuleMatcher};
    pub use crate::store::CounterStore;

    #[cfg(feature = "memory")]
    pub use crate::store::MemoryCounterStore;
}
