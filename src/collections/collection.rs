// ============================================================================
// spark-state - Collection
// Named keyed store of records, with groups and selectors over it
// ============================================================================
//
// Records live in the runtime's collection arena. Groups, selectors and data
// instances refer back to their collection by `CollectionKey`, never by an
// owning pointer, so dropping the arena entry is enough to tear it all down.
//
// No RefCell borrow on the collection is held while a write or broadcast is
// in progress: maps are cloned out first, then acted on.
// ============================================================================

use std::fmt;
use std::rc::{Rc, Weak};
use std::cell::RefCell;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value};
use slotmap::new_key_type;
use tracing::{debug, warn};

use super::data::DataInstance;
use super::group::Group;
use super::selector::{Selector, SelectorOptions};
use crate::core::error::StateError;
use crate::core::id::WatchableId;
use crate::core::runtime::Runtime;
use crate::core::types::{WatchFn, Watchable, WatchableKind};
use crate::primitives::watchable::{CellCore, Fetcher};
use crate::reactivity::batching::BatchOp;
use crate::reactivity::engine::Subscription;
use crate::reactivity::merge::normalize_key;

new_key_type! {
    /// Arena key of a collection inside its runtime.
    pub struct CollectionKey;
}

// =============================================================================
// CONFIG
// =============================================================================

/// What a lookup of an uncollected key returns as the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionalValue {
    /// `null`
    #[default]
    Null,
    /// `{ <primary_key>: <key> }`
    Key,
}

/// Collection settings. Deserializable, so it can be loaded from JSON.
///
/// # Example
///
/// ```
/// use spark_state::CollectionConfig;
///
/// let config: CollectionConfig =
///     serde_json::from_str(r#"{"name": "todos", "default_group": true}"#).unwrap();
/// assert_eq!(config.primary_key, "id");
/// assert_eq!(config.default_group_name, "default");
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub name: String,
    /// Record field whose string form is the item key.
    pub primary_key: String,
    /// Add every collected key to a default group.
    pub default_group: bool,
    pub default_group_name: String,
    /// Defer whole `collect` calls made inside a batch.
    pub batch: bool,
    pub provisional: ProvisionalValue,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            primary_key: "id".to_string(),
            default_group: false,
            default_group_name: "default".to_string(),
            batch: false,
            provisional: ProvisionalValue::Null,
        }
    }
}

impl CollectionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn primary_key(mut self, field: impl Into<String>) -> Self {
        self.primary_key = field.into();
        self
    }

    pub fn default_group(mut self, enabled: bool) -> Self {
        self.default_group = enabled;
        self
    }

    pub fn default_group_name(mut self, name: impl Into<String>) -> Self {
        self.default_group_name = name.into();
        self
    }

    pub fn batch(mut self, enabled: bool) -> Self {
        self.batch = enabled;
        self
    }

    pub fn provisional(mut self, value: ProvisionalValue) -> Self {
        self.provisional = value;
        self
    }

    fn validate(&self) -> Result<(), StateError> {
        if self.name.trim().is_empty() {
            return Err(StateError::MissingCollectionName);
        }
        if self.primary_key.trim().is_empty() {
            return Err(StateError::MissingPrimaryKey(self.name.clone()));
        }
        Ok(())
    }
}

// =============================================================================
// COLLECTION INNER
// =============================================================================

pub(crate) struct CollectionInner {
    key: CollectionKey,
    core: CellCore,
    pub(crate) config: CollectionConfig,
    data: RefCell<IndexMap<String, DataInstance>>,
    provisional: RefCell<IndexMap<String, DataInstance>>,
    groups: RefCell<IndexMap<String, Group>>,
    selectors: RefCell<IndexMap<String, Selector>>,
}

impl CollectionInner {
    /// Collected instance for `key`, if any.
    pub(crate) fn collected(&self, key: &str) -> Option<DataInstance> {
        self.data.borrow().get(key).cloned()
    }

    /// Collected instance for `key`, or a cached provisional one.
    pub(crate) fn item(&self, runtime: &Runtime, key: &str) -> DataInstance {
        if let Some(item) = self.collected(key) {
            return item;
        }
        if let Some(item) = self.provisional.borrow().get(key).cloned() {
            return item;
        }

        let value = match self.config.provisional {
            ProvisionalValue::Null => Value::Null,
            ProvisionalValue::Key => {
                let mut record = Map::new();
                record.insert(self.config.primary_key.clone(), Value::String(key.to_string()));
                Value::Object(record)
            }
        };
        let item = DataInstance::new(
            runtime,
            self.key,
            key,
            value,
            &self.config.primary_key,
            true,
        );
        debug!(collection = %self.config.name, key, "created provisional item");
        self.provisional
            .borrow_mut()
            .insert(key.to_string(), item.clone());
        item
    }

    /// Values of the collected items among `keys`, in the order given.
    pub(crate) fn collected_values(&self, keys: &[String]) -> Vec<Value> {
        let items: Vec<DataInstance> = {
            let data = self.data.borrow();
            keys.iter().filter_map(|key| data.get(key).cloned()).collect()
        };
        items.iter().map(Watchable::value).collect()
    }

    fn all_values(&self) -> Vec<Value> {
        let items: Vec<DataInstance> = self.data.borrow().values().cloned().collect();
        items.iter().map(Watchable::value).collect()
    }

    fn find_group(&self, name: &str) -> Option<Group> {
        self.groups.borrow().get(name).cloned()
    }

    fn group_or_create(&self, runtime: &Runtime, name: &str) -> Group {
        if let Some(group) = self.find_group(name) {
            return group;
        }
        let group = Group::new(runtime, self.key, name);
        self.groups
            .borrow_mut()
            .insert(name.to_string(), group.clone());
        group
    }

    // =========================================================================
    // COLLECT
    // =========================================================================

    /// Store `items`, then file their keys under the default group and
    /// `groups`.
    pub(crate) fn apply_collect(&self, runtime: &Runtime, items: Vec<Value>, groups: &[String]) {
        let primary_key = self.config.primary_key.as_str();
        let mut touched: Vec<String> = Vec::new();
        let mut added = false;

        for item in items {
            let Some(key) = item.get(primary_key).and_then(normalize_key) else {
                warn!(
                    collection = %self.config.name,
                    primary_key,
                    "item without a usable primary key skipped"
                );
                continue;
            };

            match self.collected(&key) {
                Some(existing) => {
                    existing.patch(item);
                }
                None => {
                    let promoted = self.provisional.borrow_mut().shift_remove(&key);
                    match promoted {
                        Some(instance) => {
                            instance.promote();
                            self.data
                                .borrow_mut()
                                .insert(key.clone(), instance.clone());
                            instance.set(item);
                        }
                        None => {
                            let instance = DataInstance::new(
                                runtime,
                                self.key,
                                &key,
                                item,
                                primary_key,
                                false,
                            );
                            self.data.borrow_mut().insert(key.clone(), instance);
                        }
                    }
                    added = true;
                }
            }

            if !touched.contains(&key) {
                touched.push(key);
            }
        }

        let mut targets: Vec<&str> = Vec::new();
        if self.config.default_group {
            targets.push(self.config.default_group_name.as_str());
        }
        for name in groups {
            if !targets.contains(&name.as_str()) {
                targets.push(name);
            }
        }
        for name in targets {
            self.group_or_create(runtime, name).add(touched.iter().cloned());
        }

        if added {
            self.core.broadcast(runtime);
        }
    }

    fn apply_delete(&self, runtime: &Runtime, keys: &[String]) {
        let mut removed = Vec::new();
        for key in keys {
            let gone = self.data.borrow_mut().shift_remove(key);
            let provisional = self.provisional.borrow_mut().shift_remove(key);
            if gone.is_some() {
                removed.push(key.clone());
            }
            drop((gone, provisional));
        }

        let groups: Vec<Group> = self.groups.borrow().values().cloned().collect();
        for group in groups {
            group.remove(keys.iter());
        }

        let selectors: Vec<Selector> = self.selectors.borrow().values().cloned().collect();
        for selector in selectors {
            if keys.iter().any(|key| selector.is_selecting(key)) {
                selector.rebind(runtime);
            }
        }

        if !removed.is_empty() {
            debug!(collection = %self.config.name, removed = removed.len(), "items deleted");
            self.core.broadcast(runtime);
        }
    }
}

// =============================================================================
// COLLECTION
// =============================================================================

/// A named keyed store of records.
///
/// # Example
///
/// ```
/// use spark_state::{json, CollectionConfig, Runtime, Watchable};
///
/// let rt = Runtime::new();
/// let todos = rt.collection(CollectionConfig::new("todos").default_group(true)).unwrap();
///
/// todos.collect(json!([
///     {"id": 1, "title": "write", "done": false},
///     {"id": 2, "title": "review", "done": false},
/// ]));
/// todos.update("1", json!({"done": true}));
///
/// assert_eq!(todos.size(), 2);
/// assert_eq!(todos.get_item_value("1")["done"], json!(true));
/// assert_eq!(todos.get_group("default").value().as_array().map(Vec::len), Some(2));
/// ```
#[derive(Clone)]
pub struct Collection {
    runtime: Runtime,
    inner: Rc<CollectionInner>,
}

impl Runtime {
    /// Create a collection. Fails when the name or primary key is empty.
    pub fn collection(&self, config: CollectionConfig) -> Result<Collection, StateError> {
        config.validate()?;
        if self.is_killed() {
            return Err(StateError::RuntimeKilled);
        }

        let key = self.inner.collections.borrow_mut().insert_with_key(|key| {
            Rc::new_cyclic(|self_ref: &Weak<CollectionInner>| {
                let weak = self_ref.clone();
                let fetcher: Fetcher = Rc::new(move || {
                    weak.upgrade()
                        .map_or(Value::Null, |c| Value::Array(c.all_values()))
                });
                CollectionInner {
                    key,
                    core: CellCore::with_fetcher(self, fetcher),
                    config,
                    data: RefCell::new(IndexMap::new()),
                    provisional: RefCell::new(IndexMap::new()),
                    groups: RefCell::new(IndexMap::new()),
                    selectors: RefCell::new(IndexMap::new()),
                }
            })
        });
        let inner = self
            .collection_inner(key)
            .ok_or(StateError::RuntimeKilled)?;

        debug!(collection = %inner.config.name, "collection created");
        if inner.config.default_group {
            inner.group_or_create(self, &inner.config.default_group_name);
        }
        Ok(Collection {
            runtime: self.clone(),
            inner,
        })
    }
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.inner.config
    }

    pub fn key(&self) -> CollectionKey {
        self.inner.key
    }

    fn live(&self, op: &str) -> bool {
        if self.runtime.is_killed() {
            warn!(collection = %self.inner.config.name, op, "ignored: runtime has been killed");
            return false;
        }
        true
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Collect one record or an array of records.
    pub fn collect(&self, items: impl Into<Value>) -> &Self {
        self.collect_into(items, &[])
    }

    /// Collect records and also add their keys to each group in `groups`.
    /// Missing groups are created.
    pub fn collect_into(&self, items: impl Into<Value>, groups: &[&str]) -> &Self {
        if !self.live("collect") {
            return self;
        }
        let items = match items.into() {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            single => vec![single],
        };
        let groups: Vec<String> = groups.iter().map(|g| g.to_string()).collect();

        if self.inner.config.batch && self.runtime.is_batching() {
            self.runtime.defer(BatchOp::Collect {
                target: self.inner.key,
                items,
                groups,
            });
            return self;
        }
        self.inner.apply_collect(&self.runtime, items, &groups);
        self
    }

    /// Patch the record at `key`. Unknown keys are logged and skipped.
    pub fn update(&self, key: &str, partial: impl Into<Value>) -> &Self {
        match self.inner.collected(key) {
            Some(item) => {
                item.patch(partial);
            }
            None => warn!(collection = %self.inner.config.name, key, "update on unknown key"),
        }
        self
    }

    /// Remove records from the store and from every group.
    pub fn delete<I, K>(&self, keys: I) -> &Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        if !self.live("delete") {
            return self;
        }
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        self.inner.apply_delete(&self.runtime, &keys);
        self
    }

    /// `None` deletes every record. `Some(group)` empties only that group's
    /// membership.
    pub fn clear(&self, group: Option<&str>) -> &Self {
        match group {
            None => {
                let keys = self.keys();
                self.delete(keys);
            }
            Some(name) => match self.inner.find_group(name) {
                Some(group) => {
                    group.clear();
                }
                None => warn!(collection = %self.inner.config.name, group = name, "clear on unknown group"),
            },
        }
        self
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Instance for `key`. Uncollected keys get a cached provisional
    /// instance, so repeated lookups return the same one.
    pub fn get_item(&self, key: &str) -> DataInstance {
        self.inner.item(&self.runtime, key)
    }

    pub fn get_item_value(&self, key: &str) -> Value {
        self.get_item(key).value()
    }

    /// Whether `key` has been collected.
    pub fn has(&self, key: &str) -> bool {
        self.inner.data.borrow().contains_key(key)
    }

    /// Collected keys in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.inner.data.borrow().keys().cloned().collect()
    }

    pub fn size(&self) -> usize {
        self.inner.data.borrow().len()
    }

    // =========================================================================
    // GROUPS
    // =========================================================================

    /// Create a group holding `keys`, or add `keys` to an existing group of
    /// that name.
    pub fn create_group<I, K>(&self, name: &str, keys: I) -> Group
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let group = self.inner.group_or_create(&self.runtime, name);
        group.add(keys);
        group
    }

    /// Group called `name`. An unknown name is logged and an empty group is
    /// created in its place.
    pub fn get_group(&self, name: &str) -> Group {
        if let Some(group) = self.inner.find_group(name) {
            return group;
        }
        warn!(collection = %self.inner.config.name, group = name, "unknown group; creating an empty one");
        self.inner.group_or_create(&self.runtime, name)
    }

    /// Group called `name`, without the fallback.
    pub fn find_group(&self, name: &str) -> Option<Group> {
        self.inner.find_group(name)
    }

    pub fn group_names(&self) -> Vec<String> {
        self.inner.groups.borrow().keys().cloned().collect()
    }

    /// Add keys to a group, creating the group if needed.
    pub fn add_to_group<I, K>(&self, keys: I, group: &str) -> &Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.inner.group_or_create(&self.runtime, group).add(keys);
        self
    }

    /// Alias of [`Collection::add_to_group`].
    pub fn put<I, K>(&self, keys: I, group: &str) -> &Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.add_to_group(keys, group)
    }

    /// Remove keys from a group. An unknown group is logged and skipped.
    pub fn remove_from_group<I, K>(&self, keys: I, group: &str) -> &Self
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        match self.inner.find_group(group) {
            Some(found) => {
                found.remove(keys);
            }
            None => warn!(collection = %self.inner.config.name, group, "remove from unknown group"),
        }
        self
    }

    /// Watch the group called `name` (see [`Collection::get_group`]).
    pub fn watch_group(&self, name: &str, callback: impl Fn(&Value) + 'static) -> Subscription {
        self.get_group(name).watch(callback)
    }

    // =========================================================================
    // SELECTORS
    // =========================================================================

    /// Create a selector, optionally pointing at `key`. An existing selector
    /// of that name is reused and re-pointed.
    pub fn create_selector(&self, name: &str, key: Option<&str>) -> Selector {
        self.create_selector_with(name, key, SelectorOptions::default())
    }

    pub fn create_selector_with(
        &self,
        name: &str,
        key: Option<&str>,
        options: SelectorOptions,
    ) -> Selector {
        let existing = self.inner.selectors.borrow().get(name).cloned();
        let selector = match existing {
            Some(selector) => selector,
            None => {
                let selector = Selector::new(&self.runtime, self.inner.key, name, options);
                self.inner
                    .selectors
                    .borrow_mut()
                    .insert(name.to_string(), selector.clone());
                selector
            }
        };
        if let Some(key) = key {
            selector.select(key);
        }
        selector
    }

    pub fn get_selector(&self, name: &str) -> Option<Selector> {
        self.inner.selectors.borrow().get(name).cloned()
    }

    pub fn selector_names(&self) -> Vec<String> {
        self.inner.selectors.borrow().keys().cloned().collect()
    }
}

impl Watchable for Collection {
    fn id(&self) -> WatchableId {
        self.inner.core.id
    }

    fn kind(&self) -> WatchableKind {
        WatchableKind::Collection
    }

    /// Array of collected record values, in insertion order.
    fn value(&self) -> Value {
        self.inner.core.read()
    }

    /// Fires when records are added or deleted, not on record edits.
    fn watch_boxed(&self, callback: WatchFn) -> Subscription {
        let weak = Rc::downgrade(&self.inner);
        self.inner.core.subscribe(
            move || weak.upgrade().map_or(Value::Null, |c| c.core.read()),
            callback,
            &format!("watch collection {}", self.inner.config.name),
        )
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.inner.config.name)
            .field("size", &self.size())
            .field("groups", &self.group_names())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;
    use tracing_test::traced_test;

    fn todos(rt: &Runtime) -> Collection {
        rt.collection(CollectionConfig::new("todos").default_group(true))
            .unwrap()
    }

    #[test]
    fn config_validation() {
        let rt = Runtime::new();
        assert!(matches!(
            rt.collection(CollectionConfig::default()),
            Err(StateError::MissingCollectionName)
        ));
        assert!(matches!(
            rt.collection(CollectionConfig::new("x").primary_key("")),
            Err(StateError::MissingPrimaryKey(name)) if name == "x"
        ));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: CollectionConfig = serde_json::from_value(json!({
            "name": "users",
            "primary_key": "uid",
            "provisional": "key"
        }))
        .unwrap();
        assert_eq!(config.primary_key, "uid");
        assert_eq!(config.provisional, ProvisionalValue::Key);
        assert!(!config.default_group);
        assert!(!config.batch);
    }

    #[test]
    fn collect_single_and_many() {
        let rt = Runtime::new();
        let c = todos(&rt);
        c.collect(json!({"id": "a", "n": 1}));
        c.collect(json!([{"id": "b", "n": 2}, {"id": 3, "n": 3}]));

        assert_eq!(c.keys(), vec!["a", "b", "3"]);
        assert_eq!(c.value(), json!([{"id": "a", "n": 1}, {"id": "b", "n": 2}, {"id": 3, "n": 3}]));
        assert!(c.has("3"));
    }

    #[test]
    fn collecting_twice_patches_in_place() {
        let rt = Runtime::new();
        let c = todos(&rt);
        c.collect(json!({"id": 1, "title": "a", "tags": {"x": true}}));
        let first = c.get_item("1");

        c.collect(json!({"id": 1, "tags": {"y": true}}));
        assert_eq!(c.size(), 1);
        assert!(c.get_item("1").ptr_eq(&first));
        assert_eq!(
            first.value(),
            json!({"id": 1, "title": "a", "tags": {"x": true, "y": true}})
        );
        assert_eq!(c.get_group("default").keys(), vec!["1"]);
    }

    #[test]
    #[traced_test]
    fn items_without_primary_key_are_skipped() {
        let rt = Runtime::new();
        let c = todos(&rt);
        c.collect(json!([{"title": "no id"}, {"id": null}, {"id": "ok"}]));
        assert_eq!(c.keys(), vec!["ok"]);
        assert!(logs_contain("without a usable primary key"));
    }

    #[test]
    fn provisional_items_are_cached_and_excluded() {
        let rt = Runtime::new();
        let c = todos(&rt);
        let a = c.get_item("ghost");
        let b = c.get_item("ghost");

        assert!(a.ptr_eq(&b));
        assert!(a.is_provisional());
        assert_eq!(a.value(), Value::Null);
        assert_eq!(c.size(), 0);
        assert!(!c.has("ghost"));
        assert_eq!(c.value(), json!([]));
    }

    #[test]
    fn provisional_is_promoted_on_collect() {
        let rt = Runtime::new();
        let c = todos(&rt);
        let early = c.get_item("7");

        let seen = Rc::new(RefCell::new(Value::Null));
        let seen_clone = seen.clone();
        let _sub = early.watch(move |v| *seen_clone.borrow_mut() = v.clone());

        c.collect(json!({"id": 7, "name": "late"}));
        assert!(!early.is_provisional());
        assert!(c.get_item("7").ptr_eq(&early));
        assert_eq!(*seen.borrow(), json!({"id": 7, "name": "late"}));
    }

    #[test]
    fn provisional_key_value() {
        let rt = Runtime::new();
        let c = rt
            .collection(CollectionConfig::new("users").primary_key("uid").provisional(ProvisionalValue::Key))
            .unwrap();
        assert_eq!(c.get_item_value("u1"), json!({"uid": "u1"}));
    }

    #[test]
    #[traced_test]
    fn update_unknown_key_warns() {
        let rt = Runtime::new();
        let c = todos(&rt);
        c.update("missing", json!({"x": 1}));
        assert!(logs_contain("update on unknown key"));
        assert_eq!(c.size(), 0);
    }

    #[test]
    fn update_patches_existing() {
        let rt = Runtime::new();
        let c = todos(&rt);
        c.collect(json!({"id": 1, "done": false, "title": "t"}));
        c.update("1", json!({"done": true}));
        assert_eq!(c.get_item_value("1"), json!({"id": 1, "done": true, "title": "t"}));
    }

    #[test]
    fn delete_removes_from_store_and_groups() {
        let rt = Runtime::new();
        let c = todos(&rt);
        c.collect_into(json!([{"id": 1}, {"id": 2}]), &["mine"]);
        c.delete(["1"]);

        assert_eq!(c.keys(), vec!["2"]);
        assert_eq!(c.get_group("default").keys(), vec!["2"]);
        assert_eq!(c.get_group("mine").value(), json!([{"id": 2}]));
    }

    #[test]
    fn clear_all_and_clear_group() {
        let rt = Runtime::new();
        let c = todos(&rt);
        c.collect_into(json!([{"id": 1}, {"id": 2}]), &["mine"]);

        c.clear(Some("mine"));
        assert_eq!(c.get_group("mine").size(), 0);
        assert_eq!(c.size(), 2);

        c.clear(None);
        assert_eq!(c.size(), 0);
        assert_eq!(c.get_group("default").value(), json!([]));
    }

    #[test]
    fn explicit_groups_are_deduplicated_against_default() {
        let rt = Runtime::new();
        let c = todos(&rt);
        let calls = Rc::new(Cell::new(0));
        let calls_clone = calls.clone();
        let _sub = c.watch_group("default", move |_| calls_clone.set(calls_clone.get() + 1));

        c.collect_into(json!({"id": 1}), &["default", "default"]);
        assert_eq!(calls.get(), 1);
        assert_eq!(c.get_group("default").keys(), vec!["1"]);
        assert_eq!(c.group_names(), vec!["default"]);
    }

    #[test]
    #[traced_test]
    fn unknown_group_lookups() {
        let rt = Runtime::new();
        let c = todos(&rt);
        assert!(c.find_group("nope").is_none());

        c.remove_from_group(["1"], "nope");
        assert!(logs_contain("remove from unknown group"));

        let placeholder = c.get_group("nope");
        assert!(logs_contain("unknown group"));
        assert_eq!(placeholder.size(), 0);
        assert!(c.get_group("nope").ptr_eq(&placeholder));
    }

    #[test]
    fn collection_watch_fires_on_membership_change_only() {
        let rt = Runtime::new();
        let c = todos(&rt);
        let calls = Rc::new(Cell::new(0));
        let calls_clone = calls.clone();
        let _sub = c.watch(move |_| calls_clone.set(calls_clone.get() + 1));

        c.collect(json!({"id": 1, "n": 0}));
        assert_eq!(calls.get(), 1);

        c.update("1", json!({"n": 1}));
        assert_eq!(calls.get(), 1);

        c.delete(["1"]);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn batched_collection_defers_collect() {
        let rt = Runtime::new();
        let c = rt.collection(CollectionConfig::new("events").batch(true)).unwrap();

        rt.transaction(|| {
            c.collect(json!({"id": 1}));
            assert_eq!(c.size(), 0);
        });
        assert_eq!(c.size(), 1);
    }

    #[test]
    fn unbatched_collection_applies_inside_batch() {
        let rt = Runtime::new();
        let c = todos(&rt);
        rt.transaction(|| {
            c.collect(json!({"id": 1}));
            assert_eq!(c.size(), 1);
        });
    }
}
