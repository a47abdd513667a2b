// ============================================================================
// spark-state - Reactive state runtime for Rust
// ============================================================================
//
// Mutable and computed watchables, keyed collections with groups and
// selectors, batching, actions and a small task scheduler, all living inside
// an owned Runtime. Values are JSON (`serde_json::Value`) so records of any
// shape can be merged, diffed and patched.
// ============================================================================

//! Reactive state with collections, batching and undo history.
//!
//! Everything starts from a [`Runtime`]:
//!
//! ```
//! use spark_state::{json, CollectionConfig, Runtime, Watchable};
//!
//! let rt = Runtime::new();
//!
//! let user = rt.state(json!({"name": "Ada", "prefs": {"theme": "dark"}}));
//! user.history(10);
//! user.patch(json!({"prefs": {"font": "mono"}}));
//! assert_eq!(user.value()["prefs"], json!({"theme": "dark", "font": "mono"}));
//! user.undo();
//! assert_eq!(user.value()["prefs"], json!({"theme": "dark"}));
//!
//! let posts = rt.collection(CollectionConfig::new("posts").default_group(true)).unwrap();
//! posts.collect(json!([{"id": 1, "title": "hello"}, {"id": 2, "title": "world"}]));
//! let current = posts.create_selector("current", Some("2"));
//! assert_eq!(current.value()["title"], json!("world"));
//! ```

pub mod collections;
pub mod core;
pub mod primitives;
pub mod reactivity;

mod macros;

pub use serde_json::{json, Value};

pub use collections::{
    Collection, CollectionConfig, CollectionKey, DataInstance, Group, ProvisionalValue, Selector,
    SelectorOptions,
};
pub use crate::core::{
    ErrorHandler, Runtime, RuntimeConfig, RuntimeRef, RuntimeStats, StateError, WatchFn,
    Watchable, WatchableId, WatchableKind,
};
pub use primitives::{Action, ActionOptions, Computed, State};
pub use reactivity::{
    Deferred, Event, EventEngine, Scheduler, Subscription, TaskId, TaskOptions, TaskOutput,
};

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn computed_over_a_selector_follows_reselection() {
        let rt = Runtime::new();
        let users = rt.collection(CollectionConfig::new("users")).unwrap();
        users.collect(json!([
            {"id": "a", "name": "Ada"},
            {"id": "g", "name": "Grace"},
        ]));

        let current = users.create_selector("current", Some("a"));
        let greeting = computed!(rt, [current] => format!(
            "hi {}",
            current.value()["name"].as_str().unwrap_or("nobody")
        ));
        assert_eq!(greeting.value(), json!("hi Ada"));

        current.select("g");
        assert_eq!(greeting.value(), json!("hi Grace"));

        users.update("g", json!({"name": "G. Hopper"}));
        assert_eq!(greeting.value(), json!("hi G. Hopper"));
    }

    #[test]
    fn batched_collection_work_reaches_watchers_once() {
        let rt = Runtime::new();
        let todos = rt
            .collection(CollectionConfig::new("todos").default_group(true))
            .unwrap();
        todos.collect(json!([{"id": 1, "done": false}, {"id": 2, "done": false}]));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = todos.watch_group("default", move |v| seen_clone.borrow_mut().push(v.clone()));

        rt.transaction(|| {
            todos.update("1", json!({"done": true}));
            todos.update("1", json!({"note": "shipped"}));
        });

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0],
            json!([{"id": 1, "done": true, "note": "shipped"}, {"id": 2, "done": false}])
        );
    }

    #[test]
    fn action_drives_collection_and_state() {
        let rt = Runtime::new();
        let log = rt.collection(CollectionConfig::new("log")).unwrap();
        let counter = rt.state(0);

        let action = {
            let log = log.clone();
            let counter = counter.clone();
            rt.action_with("append", ActionOptions { batched: true }, move || {
                let n = counter.get_as::<i64>()? + 1;
                counter.set(n);
                log.collect(json!({"id": n, "line": format!("entry {n}")}));
                Ok(json!(n))
            })
            .unwrap()
        };

        let fired = Rc::new(Cell::new(0));
        let fired_clone = fired.clone();
        let _sub = counter.watch(move |_| fired_clone.set(fired_clone.get() + 1));

        assert_eq!(action.run().unwrap(), Some(json!(1)));
        assert_eq!(action.run().unwrap(), Some(json!(2)));
        assert_eq!(log.keys(), vec!["1", "2"]);
        assert_eq!(fired.get(), 2);
    }

    #[test]
    fn stats_count_everything_created() {
        let rt = Runtime::new();
        let a = rt.state(1);
        let _b = computed!(rt, [a] => a.get_as::<i64>().unwrap_or(0) * 2);
        let _c = rt.collection(CollectionConfig::new("c")).unwrap();

        let stats = rt.stats();
        assert_eq!(stats.states, 1);
        assert_eq!(stats.computeds, 1);
        assert_eq!(stats.collections, 1);
        assert!(stats.listeners >= 1);
        assert_eq!(stats.batch_depth, 0);
    }
}
