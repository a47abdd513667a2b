// ============================================================================
// spark-state - Watchable Cell
// Storage shared by every reactive cell type
// ============================================================================
//
// `CellCore` holds the value slots of a cell and knows how to broadcast it.
// It has no write policy of its own: State, Computed, Group, Selector and
// Collection decide when to store and when to broadcast.
// ============================================================================

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::Value;

use crate::core::id::WatchableId;
use crate::core::runtime::{Runtime, RuntimeRef};
use crate::core::types::WatchFn;
use crate::reactivity::engine::Subscription;

/// Lazy value source consulted by `read()` before the memoized value.
pub type Fetcher = Rc<dyn Fn() -> Value>;

// =============================================================================
// CELL CORE
// =============================================================================

pub(crate) struct CellCore {
    pub(crate) id: WatchableId,
    pub(crate) runtime: RuntimeRef,
    value: RefCell<Value>,
    last_value: RefCell<Option<Value>>,
    initial_value: Value,
    public_value: RefCell<Value>,
    fetcher: RefCell<Option<Fetcher>>,
}

impl CellCore {
    pub(crate) fn new(runtime: &Runtime, initial: Value) -> Self {
        Self {
            id: runtime.next_id(),
            runtime: runtime.downgrade(),
            value: RefCell::new(initial.clone()),
            last_value: RefCell::new(None),
            public_value: RefCell::new(initial.clone()),
            initial_value: initial,
            fetcher: RefCell::new(None),
        }
    }

    pub(crate) fn with_fetcher(runtime: &Runtime, fetcher: Fetcher) -> Self {
        let core = Self::new(runtime, Value::Null);
        core.set_fetcher(Some(fetcher));
        core
    }

    /// The value readers see: the fetcher's result if one is set, otherwise
    /// the memoized public value.
    pub(crate) fn read(&self) -> Value {
        let fetcher = self.fetcher.borrow().clone();
        match fetcher {
            Some(fetch) => fetch(),
            None => self.public_value.borrow().clone(),
        }
    }

    /// The stored value, ignoring any fetcher.
    pub(crate) fn raw(&self) -> Value {
        self.value.borrow().clone()
    }

    pub(crate) fn last(&self) -> Option<Value> {
        self.last_value.borrow().clone()
    }

    pub(crate) fn initial(&self) -> &Value {
        &self.initial_value
    }

    /// Replace the stored value and return the old one.
    pub(crate) fn store(&self, next: Value) -> Value {
        let old = self.value.replace(next.clone());
        *self.last_value.borrow_mut() = Some(old.clone());
        *self.public_value.borrow_mut() = next;
        old
    }

    pub(crate) fn set_fetcher(&self, fetcher: Option<Fetcher>) {
        *self.fetcher.borrow_mut() = fetcher;
    }

    pub(crate) fn has_fetcher(&self) -> bool {
        self.fetcher.borrow().is_some()
    }

    /// Emit the current read value under this cell's event key.
    pub(crate) fn broadcast(&self, runtime: &Runtime) {
        runtime.engine().emit(&self.id.event_key(), self.read());
    }

    /// Subscribe `callback` to this cell's event key.
    pub(crate) fn subscribe(
        &self,
        reader: impl Fn() -> Value + 'static,
        callback: WatchFn,
        origin: &str,
    ) -> Subscription {
        match self.runtime.upgrade() {
            Some(runtime) => subscribe_reader(&runtime, self.id, origin, reader, callback),
            None => Subscription::inert(),
        }
    }
}

/// Subscribe to `id`'s events, handing `callback` the value returned by
/// `reader` at delivery time rather than the raw event payload.
///
/// Payloads may be coalesced merges of several writes; the reader always
/// reflects the cell's settled value.
pub(crate) fn subscribe_reader(
    runtime: &Runtime,
    id: WatchableId,
    origin: &str,
    reader: impl Fn() -> Value + 'static,
    callback: WatchFn,
) -> Subscription {
    runtime
        .engine()
        .subscribe(&id.event_key(), move |_| callback(&reader()), origin)
}

// =============================================================================
// TESTS
// =============================================================================
