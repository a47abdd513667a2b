// ============================================================================
// spark-state - State
// Mutable watchable with set / patch / undo / redo and bounded history
// ============================================================================

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::watchable::{CellCore, Fetcher};
use crate::core::error::StateError;
use crate::core::id::WatchableId;
use crate::core::runtime::Runtime;
use crate::core::types::{WatchFn, Watchable, WatchableKind};
use crate::reactivity::batching::BatchOp;
use crate::reactivity::engine::Subscription;
use crate::reactivity::merge::{array_to_record, deep_merge, is_equal, record_to_array};

/// Predicate run before a value is stored. Returning false rejects the write.
pub(crate) type WriteGuard = Box<dyn Fn(&Value) -> bool>;

// =============================================================================
// HISTORY
// =============================================================================

struct History {
    max_length: usize,
    /// Value at the moment history was (re-)enabled.
    start: Value,
    undo: VecDeque<Value>,
    redo: Vec<Value>,
}

impl History {
    fn new(max_length: usize, start: Value) -> Self {
        Self {
            max_length,
            start,
            undo: VecDeque::new(),
            redo: Vec::new(),
        }
    }

    fn record(&mut self, old: Value) {
        self.undo.push_back(old);
        self.redo.clear();
        self.trim();
    }

    fn trim(&mut self) {
        while self.undo.len() > self.max_length {
            self.undo.pop_front();
        }
    }
}

// =============================================================================
// STATE INNER
// =============================================================================

pub(crate) struct StateInner {
    pub(crate) core: CellCore,
    next_value: RefCell<Value>,
    history: RefCell<Option<History>>,
    guard: RefCell<Option<WriteGuard>>,
    kind: Cell<WatchableKind>,
}

// =============================================================================
// STATE
// =============================================================================

/// A mutable watchable.
///
/// Writes made while the runtime is batching are queued and applied when the
/// batch closes. Every applied write broadcasts, even when the new value
/// equals the old one.
///
/// # Example
///
/// ```
/// use spark_state::{json, Runtime, Watchable};
///
/// let rt = Runtime::new();
/// let todo = rt.state(json!({"title": "write docs", "done": false}));
/// todo.history(5);
///
/// todo.patch(json!({"done": true}));
/// assert_eq!(todo.value(), json!({"title": "write docs", "done": true}));
///
/// todo.undo();
/// assert_eq!(todo.value()["done"], json!(false));
///
/// todo.redo();
/// assert_eq!(todo.value()["done"], json!(true));
/// ```
#[derive(Clone)]
pub struct State {
    pub(crate) inner: Rc<StateInner>,
}

impl Runtime {
    /// Create a mutable watchable holding `value`.
    pub fn state(&self, value: impl Into<Value>) -> State {
        State::new(self, value.into(), WatchableKind::State)
    }

    /// Create a mutable watchable from any serializable value.
    pub fn state_from<T: Serialize>(&self, value: &T) -> Result<State, StateError> {
        Ok(self.state(serde_json::to_value(value)?))
    }
}

impl State {
    pub(crate) fn new(runtime: &Runtime, value: Value, kind: WatchableKind) -> Self {
        let inner = Rc::new(StateInner {
            core: CellCore::new(runtime, value.clone()),
            next_value: RefCell::new(value),
            history: RefCell::new(None),
            guard: RefCell::new(None),
            kind: Cell::new(kind),
        });
        runtime.register_state(inner.core.id, Rc::downgrade(&inner));
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<StateInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn set_guard(&self, guard: WriteGuard) {
        *self.inner.guard.borrow_mut() = Some(guard);
    }

    /// Whether two handles point at the same cell.
    pub fn ptr_eq(&self, other: &State) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Store `value` and broadcast it.
    pub fn set(&self, value: impl Into<Value>) -> &Self {
        self.write(Some(value.into()))
    }

    /// Serialize `value` and set it.
    pub fn set_from<T: Serialize>(&self, value: &T) -> Result<&Self, StateError> {
        let value = serde_json::to_value(value)?;
        Ok(self.set(value))
    }

    /// Stage a value for a later [`State::commit`]. Nothing is broadcast.
    pub fn stage(&self, value: impl Into<Value>) -> &Self {
        *self.inner.next_value.borrow_mut() = value.into();
        self
    }

    /// Apply the staged next value (`set` with no argument).
    pub fn commit(&self) -> &Self {
        self.write(None)
    }

    fn write(&self, value: Option<Value>) -> &Self {
        let Some(rt) = self.inner.core.runtime.for_write("set", self.id()) else {
            return self;
        };
        if rt.is_batching() {
            rt.defer(BatchOp::Set {
                target: self.id(),
                value,
            });
            return self;
        }
        let value = value.unwrap_or_else(|| self.inner.next_value.borrow().clone());
        self.apply(&rt, value, true);
        self
    }

    /// Deep-merge `partial` into the current value and set the result.
    ///
    /// Objects merge key-wise. Arrays merge element-wise by index. Any other
    /// current value is simply replaced.
    pub fn patch(&self, partial: impl Into<Value>) -> &Self {
        let partial = partial.into();
        let Some(rt) = self.inner.core.runtime.for_write("patch", self.id()) else {
            return self;
        };
        if rt.is_batching() {
            rt.defer(BatchOp::Patch {
                target: self.id(),
                partial,
            });
            return self;
        }

        let mut current = self.inner.core.raw();
        let merged = if current.is_object() && partial.is_object() {
            deep_merge(&mut current, &partial);
            current
        } else if current.is_array() && (partial.is_array() || partial.is_object()) {
            let mut record = array_to_record(&current);
            deep_merge(&mut record, &array_to_record(&partial));
            record_to_array(record)
        } else {
            partial
        };
        self.apply(&rt, merged, true);
        self
    }

    /// Step back one write.
    ///
    /// With history enabled this pops the undo stack. Without it, the last
    /// value (or the initial value) is restored and the current value is
    /// staged so that [`State::redo`] brings it back.
    pub fn undo(&self) -> &Self {
        let Some(rt) = self.inner.core.runtime.for_write("undo", self.id()) else {
            return self;
        };
        if rt.is_batching() {
            rt.defer(BatchOp::Undo { target: self.id() });
            return self;
        }

        let current = self.inner.core.raw();
        let popped = self.inner.history.borrow_mut().as_mut().map(|h| {
            let previous = h.undo.pop_back();
            if previous.is_some() {
                h.redo.push(current.clone());
            }
            previous
        });
        match popped {
            Some(Some(previous)) => {
                self.apply(&rt, previous, false);
            }
            Some(None) => debug!(id = %self.id(), "nothing to undo"),
            None => {
                let target = self
                    .inner
                    .core
                    .last()
                    .unwrap_or_else(|| self.inner.core.initial().clone());
                if self.apply(&rt, target, false) {
                    *self.inner.next_value.borrow_mut() = current;
                }
            }
        }
        self
    }

    /// Step forward one write. Mirrors [`State::undo`].
    pub fn redo(&self) -> &Self {
        let Some(rt) = self.inner.core.runtime.for_write("redo", self.id()) else {
            return self;
        };
        if rt.is_batching() {
            rt.defer(BatchOp::Redo { target: self.id() });
            return self;
        }

        let current = self.inner.core.raw();
        let popped = self.inner.history.borrow_mut().as_mut().map(|h| {
            let next = h.redo.pop();
            if next.is_some() {
                h.undo.push_back(current);
                h.trim();
            }
            next
        });
        match popped {
            Some(Some(next)) => {
                self.apply(&rt, next, false);
            }
            Some(None) => debug!(id = %self.id(), "nothing to redo"),
            None => {
                let next = self.inner.next_value.borrow().clone();
                self.apply(&rt, next, true);
            }
        }
        self
    }

    /// Restore the initial value.
    pub fn reset(&self) -> &Self {
        let initial = self.inner.core.initial().clone();
        self.set(initial)
    }

    // Store, record and broadcast. Returns false if the write guard refused.
    pub(crate) fn apply(&self, rt: &Runtime, value: Value, record: bool) -> bool {
        if let Some(guard) = self.inner.guard.borrow().as_ref() {
            if !guard(&value) {
                return false;
            }
        }

        let old = self.inner.core.store(value.clone());
        *self.inner.next_value.borrow_mut() = value;
        if record {
            if let Some(h) = self.inner.history.borrow_mut().as_mut() {
                h.record(old);
            }
        }
        self.inner.core.broadcast(rt);
        true
    }

    // =========================================================================
    // HISTORY
    // =========================================================================

    /// Enable history capped at `max_length` entries, or disable it with 0.
    ///
    /// Disabling drops both stacks. Re-enabling keeps the existing undo
    /// stack, trimmed to the new cap, and reseeds the start snapshot.
    pub fn history(&self, max_length: usize) -> &Self {
        let mut history = self.inner.history.borrow_mut();
        if max_length == 0 {
            *history = None;
            return self;
        }
        let current = self.inner.core.raw();
        match history.as_mut() {
            Some(h) => {
                h.max_length = max_length;
                h.start = current;
                h.trim();
            }
            None => *history = Some(History::new(max_length, current)),
        }
        self
    }

    /// Enable history with the runtime's default cap.
    pub fn enable_history(&self) -> &Self {
        let cap = self
            .inner
            .core
            .runtime
            .upgrade()
            .map_or(10, |rt| rt.config().default_history);
        self.history(cap)
    }

    /// Current history cap; `None` when history is off.
    pub fn history_len(&self) -> Option<usize> {
        self.inner.history.borrow().as_ref().map(|h| h.max_length)
    }

    /// Value captured when history was last enabled.
    pub fn history_start(&self) -> Option<Value> {
        self.inner.history.borrow().as_ref().map(|h| h.start.clone())
    }

    pub fn undo_depth(&self) -> usize {
        self.inner.history.borrow().as_ref().map_or(0, |h| h.undo.len())
    }

    pub fn redo_depth(&self) -> usize {
        self.inner.history.borrow().as_ref().map_or(0, |h| h.redo.len())
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Value before the most recent write.
    pub fn previous(&self) -> Option<Value> {
        self.inner.core.last()
    }

    pub fn initial(&self) -> Value {
        self.inner.core.initial().clone()
    }

    /// The value a bare [`State::commit`] would apply.
    pub fn staged(&self) -> Value {
        self.inner.next_value.borrow().clone()
    }

    /// Whether the stored value differs from the initial one.
    pub fn is_dirty(&self) -> bool {
        !is_equal(&self.inner.core.raw(), self.inner.core.initial())
    }

    /// Route reads through `fetcher` instead of the stored value.
    pub fn with_fetcher(self, fetcher: impl Fn() -> Value + 'static) -> Self {
        let fetcher: Fetcher = Rc::new(fetcher);
        self.inner.core.set_fetcher(Some(fetcher));
        self
    }

    /// Remove a fetcher installed with [`State::with_fetcher`].
    pub fn clear_fetcher(&self) {
        self.inner.core.set_fetcher(None);
    }
}

impl Watchable for State {
    fn id(&self) -> WatchableId {
        self.inner.core.id
    }

    fn kind(&self) -> WatchableKind {
        self.inner.kind.get()
    }

    fn value(&self) -> Value {
        self.inner.core.read()
    }

    fn watch_boxed(&self, callback: WatchFn) -> Subscription {
        let weak = self.downgrade();
        self.inner.core.subscribe(
            move || weak.upgrade().map_or(Value::Null, |s| s.core.read()),
            callback,
            "watch",
        )
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("id", &self.id())
            .field("value", &self.inner.core.raw())
            .field("history", &self.history_len())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
