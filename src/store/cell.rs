//! Counter cell persisted by store backends.

use serde::{Deserialize, Serialize};

/// One counter cell.
///
/// Serde-derived so distributed backends can serialize it as-is. The
/// window start doubles as the reset marker: an increment arriving with
/// a different window start resets the cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterCell {
    /// Accumulated cost in the active window (or held permits for
    /// semaphore cells).
    pub count: u64,

    /// Active window start (Unix milliseconds); zero for windowless
    /// cells.
    pub window_start: u64,

    /// Last mutation timestamp (Unix milliseconds).
    pub last_update: u64,
}

impl CounterCell {
    /// Create a cell with the given count and window start.
    pub fn new(count: u64, window_start: u64) -> Self {
        Self {
            count,
            window_start,
            last_update: window_start,
        }
    }

    /// Set the last mutation timestamp.
    pub fn touched(mut self, at: u64) -> Self {
        self.last_update = at;
        self
    }
}
