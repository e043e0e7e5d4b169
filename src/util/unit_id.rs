//! Short identifiers for forward units, used to correlate log lines.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for unit IDs.
static UNIT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique forward unit identifier: `unit-{counter}` in 16 hex digits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UnitId(u64);

impl UnitId {
    /// Allocate the next identifier.
    pub fn next() -> Self {
        Self(UNIT_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{:016x}", self.0)
    }
}
