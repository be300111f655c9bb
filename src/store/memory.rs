//! In-memory counter store.
//!
//! Backed by `DashMap`; the shard entry lock makes every counter
//! mutation atomic per key. Cell lifetime is exactly the TTL the limit
//! methods stamp (window length plus grace for window cells, a long
//! refresh-on-touch lease for permit cells), so expiry needs no
//! schedule of its own: reads drop lapsed cells they encounter, and the
//! store remembers the earliest TTL it has handed out so the first
//! write past that deadline walks the map once. There is no background
//! task; an idle store keeps its last cells until the next write.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::Result;
use crate::store::{current_timestamp_ms, CounterCell, CounterStore, SemaphoreAcquire, SemaphoreToken};

/// How often a blocked semaphore acquisition re-checks for capacity.
const ACQUIRE_POLL: Duration = Duration::from_millis(10);

/// Lifetime of a semaphore cell, refreshed on every acquire/release.
/// A leaked cell (permits never released) ages out of the map instead
/// of blocking its key forever.
const SEMAPHORE_TTL: Duration = Duration::from_secs(3600);

/// Sweep deadline meaning "no expiry pending".
const NO_SWEEP: u64 = u64::MAX;

#[derive(Debug, Clone)]
struct StoredCell {
    cell: CounterCell,
    expires_at: u64,
}

/// In-memory [`CounterStore`] implementation.
///
/// # Example
///
/// ```ignore
/// use rategate::store::MemoryCounterStore;
///
/// let store = MemoryCounterStore::new();
///
/// // Expired cells go away on their own; force a walk if needed.
/// store.sweep();
/// ```
pub struct MemoryCounterStore {
    cells: DashMap<String, StoredCell>,
    /// Earliest expiry among cells written so far; the next write at or
    /// past this instant performs a sweep.
    next_sweep: AtomicU64,
}

impl std::fmt::Debug for MemoryCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCounterStore")
            .field("cells", &self.cells.len())
            .field("next_sweep", &self.next_sweep.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            cells: DashMap::new(),
            next_sweep: AtomicU64::new(NO_SWEEP),
        }
    }

    /// Number of cells currently stored.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the store holds no cells.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Drop all cells.
    pub fn clear(&self) {
        self.cells.clear();
        self.next_sweep.store(NO_SWEEP, Ordering::Relaxed);
    }

    /// Drop every cell whose TTL has lapsed.
    pub fn sweep(&self) {
        self.next_sweep.store(NO_SWEEP, Ordering::Relaxed);
        self.sweep_at(current_timestamp_ms());
    }

    /// Record a TTL handed out to a cell.
    fn note_expiry(&self, expires_at: u64) {
        self.next_sweep.fetch_min(expires_at, Ordering::Relaxed);
    }

    /// Sweep once the earliest handed-out TTL has lapsed. The deadline
    /// swap lets exactly one writer do the walk; everyone else moves on.
    fn sweep_if_due(&self, now: u64) {
        let due = self.next_sweep.load(Ordering::Relaxed);
        if now < due {
            return;
        }
        if self
            .next_sweep
            .compare_exchange(due, NO_SWEEP, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        self.sweep_at(now);
    }

    fn sweep_at(&self, now: u64) {
        let mut soonest = NO_SWEEP;
        self.cells.retain(|_, stored| {
            if stored.expires_at <= now {
                return false;
            }
            soonest = soonest.min(stored.expires_at);
            true
        });
        self.note_expiry(soonest);
    }
}

impl CounterStore for MemoryCounterStore {
    async fn increment(
        &self,
        key: &str,
        cost: u64,
        window_start: u64,
        ttl: Duration,
    ) -> Result<(u64, u64)> {
        let now = current_timestamp_ms();
        self.sweep_if_due(now);

        let expires_at = now + ttl.as_millis() as u64;
        let mut entry = self
            .cells
            .entry(key.to_string())
            .or_insert_with(|| StoredCell {
                cell: CounterCell::new(0, window_start).touched(now),
                expires_at,
            });
        let stored = entry.value_mut();

        if stored.cell.window_start != window_start || stored.expires_at <= now {
            stored.cell = CounterCell::new(cost, window_start).touched(now);
        } else {
            stored.cell.count += cost;
            stored.cell.last_update = now;
        }
        stored.expires_at = expires_at;
        let result = (stored.cell.count, stored.cell.window_start);
        drop(entry);

        self.note_expiry(expires_at);
        Ok(result)
    }

    async fn decrement(&self, key: &str, cost: u64) -> Result<()> {
        if let Some(mut stored) = self.cells.get_mut(key) {
            stored.cell.count = stored.cell.count.saturating_sub(cost);
            stored.cell.last_update = current_timestamp_ms();
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CounterCell>> {
        let now = current_timestamp_ms();
        if let Some(stored) = self.cells.get(key) {
            if stored.expires_at > now {
                return Ok(Some(stored.cell.clone()));
            }
            drop(stored);
            self.cells.remove(key);
        }
        Ok(None)
    }

    async fn acquire_semaphore(
        &self,
        key: &str,
        permit_limit: u64,
        cost: u64,
        timeout: Duration,
    ) -> Result<SemaphoreAcquire> {
        if cost > permit_limit {
            // Can never fit, regardless of how long we wait.
            return Ok(SemaphoreAcquire::Exhausted);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let now = current_timestamp_ms();
            self.sweep_if_due(now);
            let expires_at = now + SEMAPHORE_TTL.as_millis() as u64;

            let acquired = {
                let mut entry = self
                    .cells
                    .entry(key.to_string())
                    .or_insert_with(|| StoredCell {
                        cell: CounterCell::new(0, 0).touched(now),
                        expires_at,
                    });
                let stored = entry.value_mut();

                if stored.expires_at <= now {
                    stored.cell.count = 0;
                }
                if stored.cell.count + cost <= permit_limit {
                    stored.cell.count += cost;
                    stored.cell.last_update = now;
                    stored.expires_at = expires_at;
                    true
                } else {
                    false
                }
            };

            if acquired {
                self.note_expiry(expires_at);
                return Ok(SemaphoreAcquire::Acquired(SemaphoreToken::new(key, cost)));
            }
            if Instant::now() >= deadline {
                return Ok(SemaphoreAcquire::Exhausted);
            }
            tokio::time::sleep(ACQUIRE_POLL).await;
        }
    }

    async fn release_semaphore(&self, token: SemaphoreToken) -> Result<()> {
        if let Some(mut stored) = self.cells.get_mut(token.key()) {
            let now = current_timestamp_ms();
            stored.cell.count = stored.cell.count.saturating_sub(token.permits());
            stored.cell.last_update = now;
            stored.expires_at = now + SEMAPHORE_TTL.as_millis() as u64;
        }
        Ok(())
    }
}
