// ============================================================================
// spark-state - Runtime
// The owned scope every watchable lives in
// ============================================================================
//
// A Runtime owns the id generator, the event engine, the task scheduler, the
// registries of live cells, the collection arena and the batch state. There
// is no global or thread-local instance: callers create a Runtime and build
// cells from it.
//
// Cells keep a `RuntimeRef` (a weak handle), so dropping every `Runtime`
// handle ends the scope even while cells are still around. Writes against a
// dead or killed runtime are ignored with a warning.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use serde_json::Value;
use slotmap::SlotMap;
use tracing::{debug, info, trace, warn};

use super::error::StateError;
use super::id::{IdGenerator, WatchableId};
use crate::collections::collection::{CollectionInner, CollectionKey};
use crate::primitives::computed::ComputedInner;
use crate::primitives::state::{State, StateInner};
use crate::reactivity::batching::BatchOp;
use crate::reactivity::engine::{Event, EventEngine, Subscription};
use crate::reactivity::scheduler::Scheduler;

/// Registries are swept of dead entries once they reach this size, then
/// again whenever they double past the live count.
const PRUNE_FLOOR: usize = 64;

/// Global catch handler for action and compute failures.
pub type ErrorHandler = Rc<dyn Fn(&StateError)>;

// =============================================================================
// CONFIG
// =============================================================================

/// Options for [`Runtime::with_config`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Label used in log output.
    pub label: String,
    /// History cap applied by `State::enable_history`.
    pub default_history: usize,
    /// Log every engine fan-out at `trace` level.
    pub trace_emits: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            label: "runtime".to_string(),
            default_history: 10,
            trace_emits: false,
        }
    }
}

/// Counts returned by [`Runtime::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeStats {
    pub states: usize,
    pub computeds: usize,
    pub collections: usize,
    pub listeners: usize,
    pub pending_tasks: usize,
    pub batch_depth: u32,
    pub ids_issued: u64,
}

// =============================================================================
// RUNTIME INNER
// =============================================================================

pub(crate) struct RuntimeInner {
    pub(crate) config: RuntimeConfig,
    ids: IdGenerator,
    pub(crate) engine: EventEngine,
    pub(crate) scheduler: Scheduler,

    // Registries. Weak so that dropping a handle frees the cell.
    states: RefCell<IndexMap<WatchableId, Weak<StateInner>>>,
    computeds: RefCell<IndexMap<WatchableId, Weak<ComputedInner>>>,
    states_prune_at: Cell<usize>,
    computeds_prune_at: Cell<usize>,
    pub(crate) collections: RefCell<SlotMap<CollectionKey, Rc<CollectionInner>>>,

    // Batching
    pub(crate) batch_depth: Cell<u32>,
    pub(crate) pending_ops: RefCell<VecDeque<BatchOp>>,

    catch_handler: RefCell<Option<ErrorHandler>>,
    killed: Cell<bool>,
}

// =============================================================================
// RUNTIME
// =============================================================================

/// Owned handle to a reactive scope. Clones share the same scope.
///
/// # Example
///
/// ```
/// use spark_state::{json, Runtime, Watchable};
///
/// let rt = Runtime::new();
/// let count = rt.state(1);
/// count.set(2);
/// assert_eq!(count.value(), json!(2));
/// assert_eq!(rt.stats().states, 1);
/// ```
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Rc<RuntimeInner>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        debug!(label = %config.label, "runtime created");
        let engine = EventEngine::with_tracing(config.trace_emits);
        Self {
            inner: Rc::new(RuntimeInner {
                config,
                ids: IdGenerator::new(),
                engine,
                scheduler: Scheduler::new(),
                states: RefCell::new(IndexMap::new()),
                computeds: RefCell::new(IndexMap::new()),
                states_prune_at: Cell::new(PRUNE_FLOOR),
                computeds_prune_at: Cell::new(PRUNE_FLOOR),
                collections: RefCell::new(SlotMap::with_key()),
                batch_depth: Cell::new(0),
                pending_ops: RefCell::new(VecDeque::new()),
                catch_handler: RefCell::new(None),
                killed: Cell::new(false),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn engine(&self) -> &EventEngine {
        &self.inner.engine
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn downgrade(&self) -> RuntimeRef {
        RuntimeRef {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Whether `other` is a handle to the same scope.
    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // =========================================================================
    // BATCH STATE
    // =========================================================================

    pub fn is_batching(&self) -> bool {
        self.inner.batch_depth.get() > 0
    }

    pub fn batch_depth(&self) -> u32 {
        self.inner.batch_depth.get()
    }

    /// Queue a command for replay when the outermost batch closes.
    pub(crate) fn defer(&self, op: BatchOp) {
        trace!(op = op.label(), "deferring write");
        self.inner.pending_ops.borrow_mut().push_back(op);
    }

    // =========================================================================
    // SUBSCRIPTIONS / ERRORS
    // =========================================================================

    /// Receive every event the engine emits.
    pub fn subscribe_all(&self, callback: impl Fn(&Event) + 'static) -> Subscription {
        self.inner.engine.subscribe_all(callback, "runtime")
    }

    /// Install the global catch handler for action and compute failures.
    /// Replaces any previous handler.
    pub fn on_error(&self, handler: impl Fn(&StateError) + 'static) {
        *self.inner.catch_handler.borrow_mut() = Some(Rc::new(handler));
    }

    /// Hand `err` to the global catch handler. Returns false when none is
    /// installed.
    pub(crate) fn report_error(&self, err: &StateError) -> bool {
        let handler = self.inner.catch_handler.borrow().clone();
        match handler {
            Some(handler) => {
                handler(err);
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // REGISTRIES
    // =========================================================================

    pub(crate) fn next_id(&self) -> WatchableId {
        self.inner.ids.next_id()
    }

    pub(crate) fn register_state(&self, id: WatchableId, state: Weak<StateInner>) {
        let mut states = self.inner.states.borrow_mut();
        insert_pruned(&mut states, &self.inner.states_prune_at, id, state);
    }

    pub(crate) fn register_computed(&self, id: WatchableId, computed: Weak<ComputedInner>) {
        let mut computeds = self.inner.computeds.borrow_mut();
        insert_pruned(&mut computeds, &self.inner.computeds_prune_at, id, computed);
    }

    /// Find a live state by id.
    pub fn lookup_state(&self, id: WatchableId) -> Option<State> {
        let inner = self.inner.states.borrow().get(&id)?.upgrade()?;
        Some(State { inner })
    }

    pub(crate) fn collection_inner(&self, key: CollectionKey) -> Option<Rc<CollectionInner>> {
        self.inner.collections.borrow().get(key).cloned()
    }

    // =========================================================================
    // INTROSPECTION
    // =========================================================================

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            states: self
                .inner
                .states
                .borrow()
                .values()
                .filter(|w| w.strong_count() > 0)
                .count(),
            computeds: self
                .inner
                .computeds
                .borrow()
                .values()
                .filter(|w| w.strong_count() > 0)
                .count(),
            collections: self.inner.collections.borrow().len(),
            listeners: self.inner.engine.total_listeners(),
            pending_tasks: self.inner.scheduler.pending_count(),
            batch_depth: self.inner.batch_depth.get(),
            ids_issued: self.inner.ids.issued(),
        }
    }

    /// Current value of every live state and computed cell, in creation
    /// order. Intended for debugging.
    pub fn snapshot(&self) -> IndexMap<WatchableId, Value> {
        let mut out: IndexMap<WatchableId, Value> = IndexMap::new();
        let states: Vec<_> = self
            .inner
            .states
            .borrow()
            .iter()
            .filter_map(|(id, weak)| weak.upgrade().map(|s| (*id, s)))
            .collect();
        for (id, state) in states {
            out.insert(id, state.core.read());
        }
        let computeds: Vec<_> = self
            .inner
            .computeds
            .borrow()
            .iter()
            .filter_map(|(id, weak)| weak.upgrade().map(|c| (*id, c)))
            .collect();
        for (id, computed) in computeds {
            out.insert(id, computed.core.read());
        }
        out.sort_keys();
        out
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Tear the scope down. Listeners, queued tasks, pending batch commands,
    /// registries and collections are all dropped. Later writes through
    /// surviving handles are ignored.
    pub fn kill(&self) {
        if self.inner.killed.replace(true) {
            return;
        }
        info!(label = %self.inner.config.label, "killing runtime");

        self.inner.engine.clear();
        self.inner.scheduler.abort_all();

        // Take everything out before dropping so no Drop impl runs while a
        // registry is borrowed.
        let ops = std::mem::take(&mut *self.inner.pending_ops.borrow_mut());
        let arena = std::mem::take(&mut *self.inner.collections.borrow_mut());
        let states = std::mem::take(&mut *self.inner.states.borrow_mut());
        let computeds = std::mem::take(&mut *self.inner.computeds.borrow_mut());
        let handler = self.inner.catch_handler.borrow_mut().take();
        drop((ops, arena, states, computeds, handler));
    }

    pub fn is_killed(&self) -> bool {
        self.inner.killed.get()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("label", &self.inner.config.label)
            .field("stats", &self.stats())
            .field("killed", &self.is_killed())
            .finish()
    }
}

// =============================================================================
// RUNTIME REF
// =============================================================================

/// Weak handle held by cells so they do not keep their runtime alive.
#[derive(Clone)]
pub struct RuntimeRef {
    inner: Weak<RuntimeInner>,
}

impl RuntimeRef {
    pub fn upgrade(&self) -> Option<Runtime> {
        self.inner.upgrade().map(|inner| Runtime { inner })
    }

    /// Upgrade for a write. Returns `None`, with a warning naming `op`, when
    /// the runtime is gone or killed.
    pub(crate) fn for_write(&self, op: &str, id: WatchableId) -> Option<Runtime> {
        match self.upgrade() {
            Some(rt) if rt.is_killed() => {
                warn!(%id, op, "write ignored: runtime has been killed");
                None
            }
            Some(rt) => Some(rt),
            None => {
                warn!(%id, op, "write ignored: runtime has been dropped");
                None
            }
        }
    }
}

impl fmt::Debug for RuntimeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeRef")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

/// Insert into a weak registry, sweeping dead entries once the map reaches
/// `prune_at`. The next sweep waits until the map doubles past what survived.
fn insert_pruned<T>(
    map: &mut IndexMap<WatchableId, Weak<T>>,
    prune_at: &Cell<usize>,
    id: WatchableId,
    weak: Weak<T>,
) {
    if map.len() >= prune_at.get() {
        map.retain(|_, w| w.strong_count() > 0);
        prune_at.set((map.len() * 2).max(PRUNE_FLOOR));
        trace!(live = map.len(), next = prune_at.get(), "registry swept");
    }
    map.insert(id, weak);
}

// =============================================================================
// TESTS
// =============================================================================
