//! Connection ID allocation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Strictly increasing connection ID source. The first issued ID is 1.
///
/// IDs are unique per generator instance and not persisted across restarts.
/// Share one generator (behind an `Arc`) between everything that must not
/// hand out duplicate IDs.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: AtomicU64,
}

impl IdGenerator {
    /// Create a generator whose first ID is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start so that the first issued ID is `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            last: AtomicU64::new(first.saturating_sub(1)),
        }
    }

    /// Issue the next ID.
    pub fn next_id(&self) -> u64 {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The most recently issued ID, or 0 if none has been issued.
    pub fn last_issued(&self) -> u64 {
        self.last.load(Ordering::Relaxed)
    }
}
