// ============================================================================
// spark-state - Computed
// Read-only watchable derived from an explicit dependency list
// ============================================================================
//
// A Computed subscribes once per dependency. Every dependency event runs the
// compute function synchronously, stores the result and broadcasts, so the
// recompute finishes before the computed's own watchers hear about it.
//
// Dependencies are listed explicitly rather than tracked on read. Adding or
// removing one tears down every subscription and wires them up again.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{error, trace};

use super::watchable::CellCore;
use crate::core::error::StateError;
use crate::core::id::WatchableId;
use crate::core::runtime::Runtime;
use crate::core::types::{WatchFn, Watchable, WatchableKind};
use crate::reactivity::engine::Subscription;

type ComputeFn = Box<dyn Fn() -> anyhow::Result<Value>>;

// =============================================================================
// COMPUTED INNER
// =============================================================================

pub(crate) struct ComputedInner {
    pub(crate) core: CellCore,
    compute: ComputeFn,
    deps: RefCell<IndexMap<WatchableId, Subscription>>,
    runs: Cell<u64>,
    self_ref: Weak<ComputedInner>,
}

impl ComputedInner {
    /// Drop every dependency subscription and subscribe again.
    fn wire(&self, runtime: &Runtime) {
        let origin = format!("computed {}", self.core.id);
        let mut deps = self.deps.borrow_mut();
        for (id, sub) in deps.iter_mut() {
            sub.unsubscribe();
            let weak = self.self_ref.clone();
            *sub = runtime.engine().subscribe(
                &id.event_key(),
                move |_| {
                    if let Some(computed) = weak.upgrade() {
                        computed.recompute();
                    }
                },
                &origin,
            );
        }
    }

    fn evaluate(&self) -> anyhow::Result<Value> {
        self.runs.set(self.runs.get() + 1);
        (self.compute)()
    }

    pub(crate) fn recompute(&self) {
        let Some(runtime) = self.core.runtime.upgrade() else {
            return;
        };
        trace!(id = %self.core.id, "recompute");
        match self.evaluate() {
            Ok(value) => {
                self.core.store(value);
                self.core.broadcast(&runtime);
            }
            Err(source) => {
                let cause = format!("{source:#}");
                let err = StateError::Compute {
                    id: self.core.id,
                    source,
                };
                if !runtime.report_error(&err) {
                    error!(id = %self.core.id, %cause, "compute failed; keeping previous value");
                }
            }
        }
    }
}

impl Drop for ComputedInner {
    fn drop(&mut self) {
        for sub in self.deps.get_mut().values() {
            sub.unsubscribe();
        }
    }
}

// =============================================================================
// COMPUTED
// =============================================================================

/// A watchable whose value is derived from other watchables.
///
/// # Example
///
/// ```
/// use spark_state::{json, Runtime, Watchable};
///
/// let rt = Runtime::new();
/// let price = rt.state(10);
/// let qty = rt.state(3);
///
/// let (p, q) = (price.clone(), qty.clone());
/// let total = rt.computed(
///     move || p.get_as::<i64>().unwrap_or(0) * q.get_as::<i64>().unwrap_or(0),
///     &[&price, &qty],
/// );
/// assert_eq!(total.value(), json!(30));
///
/// qty.set(4);
/// assert_eq!(total.value(), json!(40));
/// ```
#[derive(Clone)]
pub struct Computed {
    inner: Rc<ComputedInner>,
}

impl Runtime {
    /// Create a computed watchable over `deps`.
    pub fn computed<V: Into<Value>>(
        &self,
        compute: impl Fn() -> V + 'static,
        deps: &[&dyn Watchable],
    ) -> Computed {
        Computed::new(self, Box::new(move || Ok(compute().into())), deps)
    }

    /// Create a computed watchable whose compute function can fail.
    ///
    /// A failed run keeps the previous value and is reported to the handler
    /// installed with [`Runtime::on_error`], or logged when there is none.
    pub fn try_computed<V: Into<Value>>(
        &self,
        compute: impl Fn() -> anyhow::Result<V> + 'static,
        deps: &[&dyn Watchable],
    ) -> Computed {
        Computed::new(self, Box::new(move || compute().map(Into::into)), deps)
    }
}

impl Computed {
    fn new(runtime: &Runtime, compute: ComputeFn, deps: &[&dyn Watchable]) -> Self {
        let inner = Rc::new_cyclic(|self_ref| ComputedInner {
            core: CellCore::new(runtime, Value::Null),
            compute,
            deps: RefCell::new(
                deps.iter()
                    .map(|dep| (dep.id(), Subscription::inert()))
                    .collect(),
            ),
            runs: Cell::new(0),
            self_ref: self_ref.clone(),
        });
        runtime.register_computed(inner.core.id, Rc::downgrade(&inner));
        inner.wire(runtime);
        inner.recompute();
        Self { inner }
    }

    /// Start depending on `dep`. Rewires and recomputes.
    pub fn add_dependency(&self, dep: &dyn Watchable) -> &Self {
        let added = {
            let mut deps = self.inner.deps.borrow_mut();
            if deps.contains_key(&dep.id()) {
                false
            } else {
                deps.insert(dep.id(), Subscription::inert());
                true
            }
        };
        if added {
            self.rebuild();
        }
        self
    }

    /// Stop depending on `dep`. Rewires and recomputes.
    pub fn remove_dependency(&self, dep: &dyn Watchable) -> &Self {
        let removed = self.inner.deps.borrow_mut().shift_remove(&dep.id());
        if let Some(sub) = removed {
            sub.unsubscribe();
            self.rebuild();
        }
        self
    }

    fn rebuild(&self) {
        if let Some(runtime) = self.inner.core.runtime.upgrade() {
            self.inner.wire(&runtime);
            self.inner.recompute();
        }
    }

    /// Ids of the current dependencies, in the order they were added.
    pub fn dependencies(&self) -> Vec<WatchableId> {
        self.inner.deps.borrow().keys().copied().collect()
    }

    /// Re-run the compute function and broadcast.
    pub fn recompute(&self) -> &Self {
        self.inner.recompute();
        self
    }

    /// How many times the compute function has run.
    pub fn run_count(&self) -> u64 {
        self.inner.runs.get()
    }
}

impl Watchable for Computed {
    fn id(&self) -> WatchableId {
        self.inner.core.id
    }

    fn kind(&self) -> WatchableKind {
        WatchableKind::Computed
    }

    fn value(&self) -> Value {
        self.inner.core.read()
    }

    fn watch_boxed(&self, callback: WatchFn) -> Subscription {
        let weak = Rc::downgrade(&self.inner);
        self.inner.core.subscribe(
            move || weak.upgrade().map_or(Value::Null, |c| c.core.read()),
            callback,
            "watch",
        )
    }
}

impl fmt::Debug for Computed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.id())
            .field("value", &self.value())
            .field("deps", &self.dependencies())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
