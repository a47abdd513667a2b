// ============================================================================
// spark-state - Type Definitions
// The Watchable trait and the shared value representation
// ============================================================================
//
// Every reactive cell in the runtime stores a `serde_json::Value`. Cloning a
// Value is a deep copy, so writing a clone into a cell is enough to guarantee
// no subscriber ever aliases the cell's internal state. Equality on Value is
// structural.
//
// The cell types (State, Computed, Group, Selector, DataInstance and
// Collection) all implement `Watchable`, so dependency lists can hold
// `&dyn Watchable` without probing concrete types at runtime.
// =============================================================================

use std::fmt;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::error::StateError;
use super::id::WatchableId;
use crate::reactivity::engine::Subscription;

/// Callback invoked with a watchable's value after it changes.
pub type WatchFn = Rc<dyn Fn(&Value)>;

// =============================================================================
// WATCHABLE KIND
// =============================================================================

/// Which cell type sits behind a `dyn Watchable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchableKind {
    State,
    Computed,
    Data,
    Group,
    Selector,
    Collection,
}

impl fmt::Display for WatchableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::State => "state",
            Self::Computed => "computed",
            Self::Data => "data",
            Self::Group => "group",
            Self::Selector => "selector",
            Self::Collection => "collection",
        };
        f.write_str(name)
    }
}

// =============================================================================
// WATCHABLE TRAIT
// =============================================================================

/// A reactive cell: something with a current value that can be watched.
pub trait Watchable {
    /// Identity of this cell inside its runtime.
    fn id(&self) -> WatchableId;

    /// Which concrete cell this is.
    fn kind(&self) -> WatchableKind;

    /// Current value. Reading never mutates the cell.
    fn value(&self) -> Value;

    /// Subscribe to changes. The callback receives the cell's value at the
    /// moment the change is delivered.
    fn watch_boxed(&self, callback: WatchFn) -> Subscription;

    /// Subscribe to changes with a plain closure.
    fn watch(&self, callback: impl Fn(&Value) + 'static) -> Subscription
    where
        Self: Sized,
    {
        self.watch_boxed(Rc::new(callback))
    }

    /// Deserialize the current value into `T`.
    fn get_as<T: DeserializeOwned>(&self) -> Result<T, StateError>
    where
        Self: Sized,
    {
        Ok(serde_json::from_value(self.value())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_display_lowercase() {
        assert_eq!(WatchableKind::State.to_string(), "state");
        assert_eq!(WatchableKind::Selector.to_string(), "selector");
        assert_eq!(WatchableKind::Collection.to_string(), "collection");
    }
}
