// ============================================================================
// spark-state - Group
// Ordered key set over a collection, valued as the array of its items
// ============================================================================
//
// A group keeps one subscription per member item. Membership changes tear
// down and rebuild the whole subscription set, then recompute and broadcast.
// Any member item change triggers a recompute as well.
//
// Members may be keys the collection has not collected yet. They are
// subscribed through a provisional instance so the group reacts as soon as
// the key arrives, but they contribute nothing to the group's value.
// ============================================================================

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexSet;
use serde_json::Value;
use tracing::trace;

use super::collection::{CollectionInner, CollectionKey};
use crate::core::id::WatchableId;
use crate::core::runtime::Runtime;
use crate::core::types::{WatchFn, Watchable, WatchableKind};
use crate::primitives::watchable::CellCore;
use crate::reactivity::engine::Subscription;

struct GroupInner {
    core: CellCore,
    name: String,
    collection: CollectionKey,
    keys: RefCell<IndexSet<String>>,
    watchers: RefCell<Vec<Subscription>>,
    self_ref: Weak<GroupInner>,
}

impl GroupInner {
    fn collection(&self, runtime: &Runtime) -> Option<Rc<CollectionInner>> {
        runtime.collection_inner(self.collection)
    }

    fn unwatch_all(&self) {
        let watchers = std::mem::take(&mut *self.watchers.borrow_mut());
        for sub in &watchers {
            sub.unsubscribe();
        }
    }

    /// Resubscribe to every member, then recompute.
    fn rebuild(&self, runtime: &Runtime) {
        self.unwatch_all();
        let Some(collection) = self.collection(runtime) else {
            return;
        };

        let keys: Vec<String> = self.keys.borrow().iter().cloned().collect();
        let origin = format!("group {}/{}", collection.config.name, self.name);
        let mut watchers = Vec::with_capacity(keys.len());
        for key in &keys {
            let item = collection.item(runtime, key);
            let weak = self.self_ref.clone();
            watchers.push(runtime.engine().subscribe(
                &item.id().event_key(),
                move |_| {
                    if let Some(group) = weak.upgrade() {
                        group.refresh();
                    }
                },
                &origin,
            ));
        }
        *self.watchers.borrow_mut() = watchers;
        self.recompute(runtime);
    }

    fn refresh(&self) {
        if let Some(runtime) = self.core.runtime.upgrade() {
            self.recompute(&runtime);
        }
    }

    /// Store the values of collected members, in membership order, and
    /// broadcast.
    fn recompute(&self, runtime: &Runtime) {
        let values = match self.collection(runtime) {
            Some(collection) => {
                let keys: Vec<String> = self.keys.borrow().iter().cloned().collect();
                collection.collected_values(&keys)
            }
            None => Vec::new(),
        };
        trace!(group = %self.name, items = values.len(), "group recompute");
        self.core.store(Value::Array(values));
        self.core.broadcast(runtime);
    }
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        for sub in self.watchers.get_mut().iter() {
            sub.unsubscribe();
        }
    }
}

// =============================================================================
// GROUP
// =============================================================================

/// A named, ordered subset of a collection's keys.
#[derive(Clone)]
pub struct Group {
    inner: Rc<GroupInner>,
}

impl Group {
    pub(crate) fn new(runtime: &Runtime, collection: CollectionKey, name: &str) -> Self {
        let inner = Rc::new_cyclic(|self_ref| GroupInner {
            core: CellCore::new(runtime, Value::Array(Vec::new())),
            name: name.to_string(),
            collection,
            keys: RefCell::new(IndexSet::new()),
            watchers: RefCell::new(Vec::new()),
            self_ref: self_ref.clone(),
        });
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Add keys to the end of the group. Keys already present keep their
    /// position.
    pub fn add<I, K>(&self, keys: I) -> &Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let changed = {
            let mut members = self.inner.keys.borrow_mut();
            let mut changed = false;
            for key in keys {
                changed |= members.insert(key.into());
            }
            changed
        };
        if changed {
            self.membership_changed();
        }
        self
    }

    /// Remove keys from the group. Unknown keys are ignored.
    pub fn remove<I, K>(&self, keys: I) -> &Self
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let changed = {
            let mut members = self.inner.keys.borrow_mut();
            let mut changed = false;
            for key in keys {
                changed |= members.shift_remove(key.as_ref());
            }
            changed
        };
        if changed {
            self.membership_changed();
        }
        self
    }

    /// Drop every member.
    pub fn clear(&self) -> &Self {
        let had_members = {
            let mut members = self.inner.keys.borrow_mut();
            let had = !members.is_empty();
            members.clear();
            had
        };
        if had_members {
            self.membership_changed();
        }
        self
    }

    fn membership_changed(&self) {
        if let Some(runtime) = self.inner.core.runtime.upgrade() {
            self.inner.rebuild(&runtime);
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.keys.borrow().contains(key)
    }

    /// Member keys in order, collected or not.
    pub fn keys(&self) -> Vec<String> {
        self.inner.keys.borrow().iter().cloned().collect()
    }

    /// Number of members, collected or not.
    pub fn size(&self) -> usize {
        self.inner.keys.borrow().len()
    }

    /// Re-derive the value from the collection and broadcast.
    pub fn recompute(&self) -> &Self {
        if let Some(runtime) = self.inner.core.runtime.upgrade() {
            self.inner.recompute(&runtime);
        }
        self
    }

    /// Whether two handles point at the same group.
    pub fn ptr_eq(&self, other: &Group) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Watchable for Group {
    fn id(&self) -> WatchableId {
        self.inner.core.id
    }

    fn kind(&self) -> WatchableKind {
        WatchableKind::Group
    }

    fn value(&self) -> Value {
        self.inner.core.read()
    }

    fn watch_boxed(&self, callback: WatchFn) -> Subscription {
        let weak = Rc::downgrade(&self.inner);
        self.inner.core.subscribe(
            move || weak.upgrade().map_or(Value::Null, |g| g.core.read()),
            callback,
            &format!("watch group {}", self.inner.name),
        )
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.inner.name)
            .field("keys", &self.keys())
            .finish()
    }
}
