// ============================================================================
// spark-state - Selector
// Named pointer at one key of a collection
// ============================================================================
//
// A selector's value is the selected item's value, or its default when
// nothing collected is selected. It holds one subscription, on the selected
// item, and re-broadcasts whenever that item changes.
//
// Selecting a different key flushes history on the old item, moves the
// subscription, carries the selector's history length over to the new item
// and always broadcasts. Selecting the current key again does nothing.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use serde_json::Value;
use tracing::{debug, warn};

use super::collection::{CollectionInner, CollectionKey};
use super::data::DataInstance;
use crate::core::id::WatchableId;
use crate::core::runtime::Runtime;
use crate::core::types::{WatchFn, Watchable, WatchableKind};
use crate::primitives::watchable::{CellCore, Fetcher};
use crate::reactivity::engine::Subscription;

/// Options for [`Collection::create_selector_with`](super::Collection::create_selector_with).
#[derive(Debug, Clone, Default)]
pub struct SelectorOptions {
    /// Value reported while nothing collected is selected.
    pub default_value: Value,
}

struct SelectorInner {
    core: CellCore,
    name: String,
    collection: CollectionKey,
    selected: RefCell<Option<String>>,
    item_watch: RefCell<Subscription>,
    history_len: Cell<usize>,
    default_value: Value,
    self_ref: Weak<SelectorInner>,
}

impl SelectorInner {
    fn collection(&self, runtime: &Runtime) -> Option<Rc<CollectionInner>> {
        runtime.collection_inner(self.collection)
    }

    fn current_value(&self) -> Value {
        let selected = self.selected.borrow().clone();
        let found = match (selected, self.core.runtime.upgrade()) {
            (Some(key), Some(runtime)) => self
                .collection(&runtime)
                .and_then(|collection| collection.collected(&key))
                .map(|item| item.value()),
            _ => None,
        };
        found.unwrap_or_else(|| self.default_value.clone())
    }

    fn selected_item(&self, runtime: &Runtime) -> Option<DataInstance> {
        let key = self.selected.borrow().clone()?;
        Some(self.collection(runtime)?.item(runtime, &key))
    }

    fn flush_item_history(&self, runtime: &Runtime) {
        if self.history_len.get() > 0 {
            if let Some(item) = self.selected_item(runtime) {
                item.history(0);
            }
        }
    }

    /// Point the item subscription at the currently selected key.
    fn bind(&self, runtime: &Runtime) {
        self.item_watch.replace(Subscription::inert()).unsubscribe();
        let Some(item) = self.selected_item(runtime) else {
            return;
        };

        let weak = self.self_ref.clone();
        let sub = runtime.engine().subscribe(
            &item.id().event_key(),
            move |_| {
                if let Some(selector) = weak.upgrade() {
                    if let Some(runtime) = selector.core.runtime.upgrade() {
                        selector.core.broadcast(&runtime);
                    }
                }
            },
            &format!("selector {}", self.name),
        );
        *self.item_watch.borrow_mut() = sub;

        let history = self.history_len.get();
        if history > 0 {
            item.history(history);
        }
    }

    /// Rebind after the selected item was deleted or replaced, then
    /// broadcast.
    pub(super) fn rebind(&self, runtime: &Runtime) {
        self.bind(runtime);
        self.core.broadcast(runtime);
    }

    pub(super) fn is_selecting(&self, key: &str) -> bool {
        self.selected.borrow().as_deref() == Some(key)
    }
}

impl Drop for SelectorInner {
    fn drop(&mut self) {
        self.item_watch.get_mut().unsubscribe();
    }
}

// =============================================================================
// SELECTOR
// =============================================================================

/// A mutable pointer at one item of a collection.
#[derive(Clone)]
pub struct Selector {
    inner: Rc<SelectorInner>,
}

impl Selector {
    pub(crate) fn new(
        runtime: &Runtime,
        collection: CollectionKey,
        name: &str,
        options: SelectorOptions,
    ) -> Self {
        let inner = Rc::new_cyclic(|self_ref: &Weak<SelectorInner>| {
            let weak = self_ref.clone();
            let fetcher: Fetcher = Rc::new(move || {
                weak.upgrade()
                    .map_or(Value::Null, |selector| selector.current_value())
            });
            SelectorInner {
                core: CellCore::with_fetcher(runtime, fetcher),
                name: name.to_string(),
                collection,
                selected: RefCell::new(None),
                item_watch: RefCell::new(Subscription::inert()),
                history_len: Cell::new(0),
                default_value: options.default_value,
                self_ref: self_ref.clone(),
            }
        });
        Self { inner }
    }

    pub(super) fn rebind(&self, runtime: &Runtime) {
        self.inner.rebind(runtime);
    }

    pub(super) fn is_selecting(&self, key: &str) -> bool {
        self.inner.is_selecting(key)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Point at `key`. Re-selecting the current key is a no-op.
    pub fn select(&self, key: &str) -> &Self {
        if self.inner.is_selecting(key) {
            debug!(selector = %self.inner.name, key, "already selected");
            return self;
        }
        let Some(runtime) = self.inner.core.runtime.for_write("select", self.id()) else {
            return self;
        };

        self.inner.flush_item_history(&runtime);
        *self.inner.selected.borrow_mut() = Some(key.to_string());
        self.inner.rebind(&runtime);
        self
    }

    /// Point at nothing; the value falls back to the default.
    pub fn unselect(&self) -> &Self {
        if self.inner.selected.borrow().is_none() {
            return self;
        }
        let Some(runtime) = self.inner.core.runtime.for_write("unselect", self.id()) else {
            return self;
        };
        self.inner.flush_item_history(&runtime);
        *self.inner.selected.borrow_mut() = None;
        self.inner.rebind(&runtime);
        self
    }

    pub fn selected_key(&self) -> Option<String> {
        self.inner.selected.borrow().clone()
    }

    /// The selected item, provisional or not.
    pub fn item(&self) -> Option<DataInstance> {
        let runtime = self.inner.core.runtime.upgrade()?;
        self.inner.selected_item(&runtime)
    }

    fn with_item(&self, op: &str, f: impl FnOnce(&DataInstance)) -> &Self {
        match self.item() {
            Some(item) => f(&item),
            None => warn!(selector = %self.inner.name, op, "no item selected"),
        }
        self
    }

    /// Set the selected item's value.
    pub fn set(&self, value: impl Into<Value>) -> &Self {
        let value = value.into();
        self.with_item("set", move |item| {
            item.set(value);
        })
    }

    pub fn patch(&self, partial: impl Into<Value>) -> &Self {
        let partial = partial.into();
        self.with_item("patch", move |item| {
            item.patch(partial);
        })
    }

    pub fn undo(&self) -> &Self {
        self.with_item("undo", |item| {
            item.undo();
        })
    }

    pub fn redo(&self) -> &Self {
        self.with_item("redo", |item| {
            item.redo();
        })
    }

    /// Keep `max_length` history entries on whichever item is selected.
    /// 0 disables.
    pub fn history(&self, max_length: usize) -> &Self {
        self.inner.history_len.set(max_length);
        if let Some(item) = self.item() {
            item.history(max_length);
        }
        self
    }

    pub fn history_len(&self) -> usize {
        self.inner.history_len.get()
    }
}

impl Watchable for Selector {
    fn id(&self) -> WatchableId {
        self.inner.core.id
    }

    fn kind(&self) -> WatchableKind {
        WatchableKind::Selector
    }

    fn value(&self) -> Value {
        self.inner.core.read()
    }

    fn watch_boxed(&self, callback: WatchFn) -> Subscription {
        let weak = Rc::downgrade(&self.inner);
        self.inner.core.subscribe(
            move || weak.upgrade().map_or(Value::Null, |s| s.core.read()),
            callback,
            &format!("watch selector {}", self.inner.name),
        )
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("name", &self.inner.name)
            .field("selected", &self.selected_key())
            .field("value", &self.value())
            .finish()
    }
}
