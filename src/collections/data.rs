// ============================================================================
// spark-state - Data Instance
// One keyed record inside a collection
// ============================================================================
//
// A DataInstance wraps a State whose value is a record carrying the
// collection's primary-key field. A write guard keeps that field in step with
// the instance key: any write whose normalized primary key disagrees is
// dropped with a warning.
// ============================================================================

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use serde_json::Value;
use tracing::warn;

use super::collection::CollectionKey;
use crate::core::id::WatchableId;
use crate::core::runtime::Runtime;
use crate::core::types::{WatchFn, Watchable, WatchableKind};
use crate::primitives::state::State;
use crate::reactivity::engine::Subscription;
use crate::reactivity::merge::normalize_key;

/// A record held by a collection, addressed by its primary key.
#[derive(Clone)]
pub struct DataInstance {
    pub(crate) state: State,
    key: Rc<str>,
    collection: CollectionKey,
    provisional: Rc<Cell<bool>>,
}

impl DataInstance {
    pub(crate) fn new(
        runtime: &Runtime,
        collection: CollectionKey,
        key: &str,
        value: Value,
        primary_key: &str,
        provisional: bool,
    ) -> Self {
        let state = State::new(runtime, value, WatchableKind::Data);
        let expected = key.to_string();
        let field = primary_key.to_string();
        let id = state.id();
        state.set_guard(Box::new(move |value| {
            match value.get(&field).and_then(normalize_key) {
                Some(found) if found == expected => true,
                found => {
                    warn!(
                        %id,
                        key = %expected,
                        found = ?found,
                        primary_key = %field,
                        "write rejected: primary key does not match instance key"
                    );
                    false
                }
            }
        }));

        Self {
            state,
            key: Rc::from(key),
            collection,
            provisional: Rc::new(Cell::new(provisional)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The underlying state cell.
    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn collection_key(&self) -> CollectionKey {
        self.collection
    }

    /// True until the key is collected. Provisional instances are not part
    /// of the collection's value, keys or size.
    pub fn is_provisional(&self) -> bool {
        self.provisional.get()
    }

    pub(crate) fn promote(&self) {
        self.provisional.set(false);
    }

    /// Whether two handles point at the same instance.
    pub fn ptr_eq(&self, other: &DataInstance) -> bool {
        self.state.ptr_eq(&other.state)
    }

    pub fn set(&self, value: impl Into<Value>) -> &Self {
        self.state.set(value);
        self
    }

    pub fn patch(&self, partial: impl Into<Value>) -> &Self {
        self.state.patch(partial);
        self
    }

    pub fn undo(&self) -> &Self {
        self.state.undo();
        self
    }

    pub fn redo(&self) -> &Self {
        self.state.redo();
        self
    }

    pub fn history(&self, max_length: usize) -> &Self {
        self.state.history(max_length);
        self
    }
}

impl Watchable for DataInstance {
    fn id(&self) -> WatchableId {
        self.state.id()
    }

    fn kind(&self) -> WatchableKind {
        WatchableKind::Data
    }

    fn value(&self) -> Value {
        self.state.value()
    }

    fn watch_boxed(&self, callback: WatchFn) -> Subscription {
        self.state.watch_boxed(callback)
    }
}

impl fmt::Debug for DataInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataInstance")
            .field("key", &self.key)
            .field("provisional", &self.is_provisional())
            .field("value", &self.value())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracing_test::traced_test;

    fn instance(rt: &Runtime, key: &str, value: Value) -> DataInstance {
        DataInstance::new(rt, CollectionKey::default(), key, value, "id", false)
    }

    #[test]
    #[traced_test]
    fn mismatched_primary_key_is_rejected() {
        let rt = Runtime::new();
        let item = instance(&rt, "1", json!({"id": 1, "title": "a"}));

        item.set(json!({"id": 2, "title": "b"}));
        assert_eq!(item.value(), json!({"id": 1, "title": "a"}));
        assert!(logs_contain("primary key does not match"));

        item.set(json!({"id": "1", "title": "c"}));
        assert_eq!(item.value()["title"], json!("c"));
    }

    #[test]
    fn compatible_patch_is_accepted() {
        let rt = Runtime::new();
        let item = instance(&rt, "a", json!({"id": "a", "done": false}));
        item.patch(json!({"done": true}));
        assert_eq!(item.value(), json!({"id": "a", "done": true}));
        assert_eq!(item.kind(), WatchableKind::Data);
    }

    #[test]
    fn clones_share_provisional_flag() {
        let rt = Runtime::new();
        let item = DataInstance::new(&rt, CollectionKey::default(), "k", Value::Null, "id", true);
        let other = item.clone();
        assert!(other.is_provisional());
        item.promote();
        assert!(!other.is_provisional());
        assert!(item.ptr_eq(&other));
    }
}
