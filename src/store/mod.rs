//! Counter store contract and built-in backends.
//!
//! The store is the only cross-request shared mutable state in the
//! engine. Everything else (config snapshots, results, cleanup routines)
//! is request-local; all synchronization happens through the store's
//! atomic primitives.

mod cell;
#[cfg(feature = "memory")]
mod memory;

pub use cell::CounterCell;

#[cfg(feature = "memory")]
pub use memory::MemoryCounterStore;

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Receipt for acquired semaphore permits.
///
/// Plain data so it can cross any backend: releasing hands the same key
/// and permit count back to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemaphoreToken {
    key: String,
    permits: u64,
}

impl SemaphoreToken {
    /// Create a token for `permits` permits held under `key`.
    pub fn new(key: impl Into<String>, permits: u64) -> Self {
        Self {
            key: key.into(),
            permits,
        }
    }

    /// The semaphore's store key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// How many permits this token holds.
    pub fn permits(&self) -> u64 {
        self.permits
    }
}

/// Outcome of a semaphore acquisition attempt.
#[derive(Debug)]
pub enum SemaphoreAcquire {
    /// All requested permits were acquired.
    Acquired(SemaphoreToken),
    /// Not enough permits were available within the timeout.
    Exhausted,
}

impl SemaphoreAcquire {
    /// Whether permits were acquired.
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }

    /// Consume the outcome, returning the token if acquired.
    pub fn into_token(self) -> Option<SemaphoreToken> {
        match self {
            Self::Acquired(token) => Some(token),
            Self::Exhausted => None,
        }
    }
}

/// Shared counter state behind the engine.
///
/// All operations are async to support distributed backends, and all
/// mutation is atomic per key. Implementations must be thread-safe
/// (`Send + Sync`). Keys are opaque to the store; the engine embeds the
/// service's unique name in every key so services sharing a backend
/// cannot corrupt each other's counters.
///
/// # Required Atomicity
///
/// - `increment` is linearizable per key
/// - `acquire_semaphore` is a multi-permit test-and-set: all requested
///   permits or none
/// - `decrement` saturates at zero
pub trait CounterStore: Send + Sync + 'static {
    /// Atomically add `cost` to the counter under `key`.
    ///
    /// The caller passes the window start it computed for "now". If the
    /// cell is absent, expired, or stamped with a different window start,
    /// it resets to `cost` with the given window start.
    ///
    /// Returns the post-increment value and the active window start.
    fn increment(
        &self,
        key: &str,
        cost: u64,
        window_start: u64,
        ttl: Duration,
    ) -> impl Future<Output = Result<(u64, u64)>> + Send;

    /// Best-effort subtract; never drives the count below zero.
    fn decrement(&self, key: &str, cost: u64) -> impl Future<Output = Result<()>> + Send;

    /// Read a cell without mutating it.
    ///
    /// Returns `None` for absent or expired cells.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<CounterCell>>> + Send;

    /// Acquire `cost` permits from the semaphore under `key`, waiting up
    /// to `timeout` for capacity.
    ///
    /// A zero timeout means a single attempt. The acquisition is atomic:
    /// either all `cost` permits are taken or none are.
    fn acquire_semaphore(
        &self,
        key: &str,
        permit_limit: u64,
        cost: u64,
        timeout: Duration,
    ) -> impl Future<Output = Result<SemaphoreAcquire>> + Send;

    /// Return previously acquired permits.
    fn release_semaphore(&self, token: SemaphoreToken)
        -> impl Future<Output = Result<()>> + Send;
}

impl<S: CounterStore> CounterStore for std::sync::Arc<S> {
    async fn increment(
        &self,
        key: &str,
        cost: u64,
        window_start: u64,
        ttl: Duration,
    ) -> Result<(u64, u64)> {
        (**self).increment(key, cost, window_start, ttl).await
    }

    async fn decrement(&self, key: &str, cost: u64) -> Result<()> {
        (**self).decrement(key, cost).await
    }

    async fn get(&self, key: &str) -> Result<Option<CounterCell>> {
        (**self).get(key).await
    }

    async fn acquire_semaphore(
        &self,
        key: &str,
        permit_limit: u64,
        cost: u64,
        timeout: Duration,
    ) -> Result<SemaphoreAcquire> {
        (**self)
            .acquire_semaphore(key, permit_limit, cost, timeout)
            .await
    }

    async fn release_semaphore(&self, token: SemaphoreToken) -> Result<()> {
        (**self).release_semaphore(token).await
    }
}

impl<S: CounterStore> CounterStore for Box<S> {
    async fn increment(
        &self,
        key: &str,
        cost: u64,
        window_start: u64,
        ttl: Duration,
    ) -> Result<(u64, u64)> {
        (**self).increment(key, cost, window_start, ttl).await
    }

    async fn decrement(&self, key: &str, cost: u64) -> Result<()> {
        (**self).decrement(key, cost).await
    }

    async fn get(&self, key: &str) -> Result<Option<CounterCell>> {
        (**self).get(key).await
    }

    async fn acquire_semaphore(
        &self,
        key: &str,
        permit_limit: u64,
        cost: u64,
        timeout: Duration,
    ) -> Result<SemaphoreAcquire> {
        (**self)
            .acquire_semaphore(key, permit_limit, cost, timeout)
            .await
    }

    async fn release_semaphore(&self, token: SemaphoreToken) -> Result<()> {
        (**self).release_semaphore(token).await
    }
}

/// Get the current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}
