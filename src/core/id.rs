// ============================================================================
// spark-state - Identity
// Opaque identifiers handed out to every watchable a runtime creates
// ============================================================================

use std::cell::Cell;
use std::fmt;

// =============================================================================
// WATCHABLE ID
// =============================================================================

/// Opaque identifier of a watchable, unique within the runtime that issued it.
///
/// Two runtimes may hand out the same raw number, so ids are only meaningful
/// next to the runtime they came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchableId(u64);

impl WatchableId {
    /// The raw counter value behind this id.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// The event-engine key this watchable broadcasts under.
    pub fn event_key(self) -> String {
        format!("w{}", self.0)
    }
}

impl fmt::Display for WatchableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// =============================================================================
// ID GENERATOR
// =============================================================================

/// Monotonic id source owned by a single runtime.
#[derive(Debug)]
pub struct IdGenerator {
    next: Cell<u64>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self { next: Cell::new(1) }
    }

    /// Hand out the next unused id.
    pub fn next_id(&self) -> WatchableId {
        let id = self.next.get();
        self.next.set(id + 1);
        WatchableId(id)
    }

    /// Number of ids issued so far.
    pub fn issued(&self) -> u64 {
        self.next.get() - 1
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================
