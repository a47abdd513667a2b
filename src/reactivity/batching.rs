// ============================================================================
// spark-state - Batching
// Group many writes into a single consistent notification pass
// ============================================================================
//
// A transaction raises the runtime's batch depth and halts the event engine.
// While the depth is above zero, writes are not applied: they are queued as
// `BatchOp` commands. When the outermost transaction closes, the queue is
// drained in FIFO order and the engine is released afterwards, so every
// watchable touched by the batch broadcasts exactly once with its final value.
// ============================================================================

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::collections::collection::CollectionKey;
use crate::core::id::WatchableId;
use crate::core::runtime::Runtime;
use crate::reactivity::engine::Release;
use crate::reactivity::scheduler::TaskOptions;

// =============================================================================
// BATCH OP
// =============================================================================

/// A write captured while a batch is open, replayed when it closes.
pub enum BatchOp {
    /// `set(value)`; `None` applies the staged next value.
    Set {
        target: WatchableId,
        value: Option<Value>,
    },
    Patch {
        target: WatchableId,
        partial: Value,
    },
    Undo {
        target: WatchableId,
    },
    Redo {
        target: WatchableId,
    },
    Collect {
        target: CollectionKey,
        items: Vec<Value>,
        groups: Vec<String>,
    },
    Call(Box<dyn FnOnce()>),
}

impl BatchOp {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Self::Set { .. } => "set",
            Self::Patch { .. } => "patch",
            Self::Undo { .. } => "undo",
            Self::Redo { .. } => "redo",
            Self::Collect { .. } => "collect",
            Self::Call(_) => "call",
        }
    }
}

impl std::fmt::Debug for BatchOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Set { target, value } => f
                .debug_struct("Set")
                .field("target", target)
                .field("value", value)
                .finish(),
            Self::Patch { target, partial } => f
                .debug_struct("Patch")
                .field("target", target)
                .field("partial", partial)
                .finish(),
            Self::Undo { target } => f.debug_struct("Undo").field("target", target).finish(),
            Self::Redo { target } => f.debug_struct("Redo").field("target", target).finish(),
            Self::Collect { items, groups, .. } => f
                .debug_struct("Collect")
                .field("items", &items.len())
                .field("groups", groups)
                .finish(),
            Self::Call(_) => f.write_str("Call"),
        }
    }
}

// =============================================================================
// DEFERRED
// =============================================================================

/// Result slot of a [`Runtime::batch_deferred`] call. Filled immediately for
/// an outermost batch, or when the enclosing batch flushes.
pub struct Deferred<T> {
    slot: Rc<RefCell<Option<T>>>,
}

impl<T> Deferred<T> {
    pub fn is_ready(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Move the result out, leaving the slot empty.
    pub fn take(&self) -> Option<T> {
        self.slot.borrow_mut().take()
    }
}

impl<T: Clone> Deferred<T> {
    pub fn get(&self) -> Option<T> {
        self.slot.borrow().clone()
    }
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

// =============================================================================
// TRANSACTION GUARD
// =============================================================================

// Closes the transaction on drop, so a panicking body still restores the
// batch depth and releases the engine.
struct TransactionGuard {
    runtime: Runtime,
    release: Option<Release>,
}

impl TransactionGuard {
    fn open(runtime: &Runtime) -> Self {
        let depth = runtime.inner.batch_depth.get() + 1;
        runtime.inner.batch_depth.set(depth);
        if depth == 1 {
            debug!(label = %runtime.inner.config.label, "batch opened");
        }
        Self {
            runtime: runtime.clone(),
            release: Some(runtime.inner.engine.halt()),
        }
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        let inner = &self.runtime.inner;
        let depth = inner.batch_depth.get().saturating_sub(1);
        inner.batch_depth.set(depth);

        // A panicking body abandons its batch: queued writes are dropped, not
        // replayed on top of a half-finished unwind.
        if depth == 0 && std::thread::panicking() {
            let dropped = std::mem::take(&mut *inner.pending_ops.borrow_mut());
            warn!(label = %inner.config.label, dropped = dropped.len(), "batch abandoned by panic");
            drop(dropped);
        } else if depth == 0 {
            // Drain before releasing: replayed writes land in the halted
            // engine and coalesce with everything else the batch emitted.
            let drained = self.runtime.drain_pending();
            debug!(label = %inner.config.label, replayed = drained, "batch closed");
        }
        drop(self.release.take());
    }
}

// =============================================================================
// BATCH
// =============================================================================

impl Runtime {
    /// Run `f` as one batch.
    ///
    /// When no batch is open, `f` runs immediately inside a new transaction
    /// and its result is returned. When a batch is already open, `f` is queued
    /// to run when that batch drains and `None` is returned; use
    /// [`Runtime::batch_deferred`] to get the result in that case.
    ///
    /// # Example
    ///
    /// ```
    /// use spark_state::{Runtime, Watchable};
    /// use std::cell::Cell;
    /// use std::rc::Rc;
    ///
    /// let rt = Runtime::new();
    /// let count = rt.state(0);
    /// let calls = Rc::new(Cell::new(0));
    /// let calls_clone = calls.clone();
    /// let _sub = count.watch(move |_| calls_clone.set(calls_clone.get() + 1));
    ///
    /// let count_clone = count.clone();
    /// rt.batch(move || {
    ///     count_clone.set(1);
    ///     count_clone.set(2);
    ///     count_clone.set(3);
    /// });
    ///
    /// assert_eq!(calls.get(), 1);
    /// assert_eq!(count.get_as::<i32>().unwrap(), 3);
    /// ```
    pub fn batch<T: 'static>(&self, f: impl FnOnce() -> T + 'static) -> Option<T> {
        if self.is_batching() {
            self.defer(BatchOp::Call(Box::new(move || {
                f();
            })));
            return None;
        }
        Some(self.transaction(f))
    }

    /// Like [`Runtime::batch`], but always hands back a result slot. Nested
    /// calls fill it when the outer batch drains.
    pub fn batch_deferred<T: 'static>(&self, f: impl FnOnce() -> T + 'static) -> Deferred<T> {
        let deferred = Deferred {
            slot: Rc::new(RefCell::new(None)),
        };
        let slot = deferred.slot.clone();
        if self.is_batching() {
            self.defer(BatchOp::Call(Box::new(move || {
                let result = f();
                *slot.borrow_mut() = Some(result);
            })));
        } else {
            let result = self.transaction(f);
            *slot.borrow_mut() = Some(result);
        }
        deferred
    }

    /// Run `f` inside the current transaction, opening one if needed.
    ///
    /// Unlike [`Runtime::batch`], nested calls run `f` inline rather than
    /// queueing it, so the closure need not be `'static`.
    pub fn transaction<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = TransactionGuard::open(self);
        f()
    }

    /// Async form of [`Runtime::batch`]: the transaction stays open until
    /// the future returned by `f` completes.
    ///
    /// Nested inside an open batch, the work is queued as a scheduler task
    /// started when the outer batch drains, and `None` is returned.
    pub async fn batch_async<F, Fut, T>(&self, f: F) -> Option<T>
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = T> + 'static,
        T: 'static,
    {
        if self.is_batching() {
            let rt = self.downgrade();
            self.defer(BatchOp::Call(Box::new(move || {
                let Some(runtime) = rt.upgrade() else {
                    return;
                };
                let task_rt = rt.clone();
                runtime.scheduler().add_async(
                    move || async move {
                        if let Some(runtime) = task_rt.upgrade() {
                            runtime.transaction_async(f).await;
                        }
                    },
                    TaskOptions::named("batch_async"),
                );
            })));
            return None;
        }
        Some(self.transaction_async(f).await)
    }

    async fn transaction_async<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = TransactionGuard::open(self);
        f().await
    }

    // =========================================================================
    // REPLAY
    // =========================================================================

    fn drain_pending(&self) -> usize {
        let mut replayed = 0;
        loop {
            let op = self.inner.pending_ops.borrow_mut().pop_front();
            let Some(op) = op else {
                break;
            };
            self.replay(op);
            replayed += 1;
        }
        replayed
    }

    fn replay(&self, op: BatchOp) {
        match op {
            BatchOp::Set { target, value } => match self.lookup_state(target) {
                Some(state) => match value {
                    Some(value) => {
                        state.set(value);
                    }
                    None => {
                        state.commit();
                    }
                },
                None => warn!(%target, "deferred set dropped: state no longer exists"),
            },
            BatchOp::Patch { target, partial } => match self.lookup_state(target) {
                Some(state) => {
                    state.patch(partial);
                }
                None => warn!(%target, "deferred patch dropped: state no longer exists"),
            },
            BatchOp::Undo { target } => {
                if let Some(state) = self.lookup_state(target) {
                    state.undo();
                }
            }
            BatchOp::Redo { target } => {
                if let Some(state) = self.lookup_state(target) {
                    state.redo();
                }
            }
            BatchOp::Collect {
                target,
                items,
                groups,
            } => match self.collection_inner(target) {
                Some(collection) => collection.apply_collect(self, items, &groups),
                None => warn!("deferred collect dropped: collection no longer exists"),
            },
            BatchOp::Call(f) => f(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Watchable;
    use serde_json::json;
    use std::cell::Cell;

    fn counter(state: &impl Watchable) -> (Rc<Cell<i32>>, crate::Subscription) {
        let calls = Rc::new(Cell::new(0));
        let calls_clone = calls.clone();
        let sub = state.watch(move |_| calls_clone.set(calls_clone.get() + 1));
        (calls, sub)
    }

    #[test]
    fn batch_coalesces_and_returns_result() {
        let rt = Runtime::new();
        let a = rt.state(0);
        let (calls, _sub) = counter(&a);

        let a_clone = a.clone();
        let result = rt.batch(move || {
            a_clone.set(1);
            a_clone.set(2);
            "done"
        });

        assert_eq!(result, Some("done"));
        assert_eq!(calls.get(), 1);
        assert_eq!(a.value(), json!(2));
        assert!(!rt.is_batching());
    }

    #[test]
    fn writes_are_invisible_until_close() {
        let rt = Runtime::new();
        let a = rt.state(1);
        let a_clone = a.clone();
        let seen = Rc::new(RefCell::new(Value::Null));
        let seen_clone = seen.clone();
        rt.batch(move || {
            a_clone.set(5);
            *seen_clone.borrow_mut() = a_clone.value();
        });

        assert_eq!(*seen.borrow(), json!(1));
        assert_eq!(a.value(), json!(5));
    }

    #[test]
    fn nested_batch_is_queued_and_returns_none() {
        let rt = Runtime::new();
        let a = rt.state(0);
        let order = Rc::new(RefCell::new(Vec::new()));

        let (rt_clone, a_clone, order_clone) = (rt.clone(), a.clone(), order.clone());
        rt.batch(move || {
            let order_inner = order_clone.clone();
            let a_inner = a_clone.clone();
            let nested = rt_clone.batch(move || {
                order_inner.borrow_mut().push("nested");
                a_inner.set(10);
            });
            assert!(nested.is_none());
            order_clone.borrow_mut().push("outer");
            a_clone.set(1);
        });

        assert_eq!(*order.borrow(), vec!["outer", "nested"]);
        // The nested call was queued before the outer set(1), so replay
        // applies set(10) first and set(1) last.
        assert_eq!(a.value(), json!(1));
    }

    #[test]
    fn batch_deferred_resolves_after_flush() {
        let rt = Runtime::new();
        let slot: Rc<RefCell<Option<Deferred<i32>>>> = Rc::new(RefCell::new(None));

        let (rt_clone, slot_clone) = (rt.clone(), slot.clone());
        rt.batch(move || {
            let deferred = rt_clone.batch_deferred(|| 42);
            assert!(!deferred.is_ready());
            *slot_clone.borrow_mut() = Some(deferred);
        });

        let deferred = slot.borrow_mut().take().unwrap();
        assert!(deferred.is_ready());
        assert_eq!(deferred.get(), Some(42));
        assert_eq!(deferred.take(), Some(42));
        assert!(!deferred.is_ready());

        assert_eq!(rt.batch_deferred(|| 7).take(), Some(7));
    }

    #[test]
    fn transaction_runs_inline_when_nested() {
        let rt = Runtime::new();
        let a = rt.state(0);
        let (calls, _sub) = counter(&a);

        let total = rt.transaction(|| {
            a.set(1);
            rt.transaction(|| {
                a.set(2);
                assert_eq!(rt.batch_depth(), 2);
            });
            3
        });

        assert_eq!(total, 3);
        assert_eq!(calls.get(), 1);
        assert_eq!(rt.batch_depth(), 0);
    }

    #[test]
    fn deferred_ops_replay_in_order() {
        let rt = Runtime::new();
        let a = rt.state(json!({"x": 1}));
        rt.transaction(|| {
            a.set(json!({"x": 2}));
            a.patch(json!({"y": 3}));
            assert_eq!(rt.inner.pending_ops.borrow().len(), 2);
        });
        assert_eq!(a.value(), json!({"x": 2, "y": 3}));
    }

    #[test]
    fn panic_in_batch_restores_depth() {
        let rt = Runtime::new();
        let rt_clone = rt.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: () = rt_clone.transaction(|| panic!("boom"));
        }));
        assert!(result.is_err());
        assert!(!rt.is_batching());
        assert!(!rt.engine().is_halted());
    }

    #[test]
    fn panic_in_batch_discards_queued_writes() {
        let rt = Runtime::new();
        let a = rt.state(1);
        let (calls, _sub) = counter(&a);

        let (rt_clone, a_clone) = (rt.clone(), a.clone());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: () = rt_clone.transaction(|| {
                a_clone.set(2);
                a_clone.patch(json!({"half": "done"}));
                panic!("boom");
            });
        }));

        assert!(result.is_err());
        assert_eq!(a.value(), json!(1));
        assert_eq!(calls.get(), 0);
        assert!(rt.inner.pending_ops.borrow().is_empty());
        assert!(!rt.is_batching());

        // The runtime is usable afterwards.
        a.set(3);
        assert_eq!(a.value(), json!(3));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn batch_async_closes_after_future() {
        let rt = Runtime::new();
        let a = rt.state(0);
        let (calls, _sub) = counter(&a);

        let a_clone = a.clone();
        let rt_clone = rt.clone();
        let out = futures::executor::block_on(rt.batch_async(move || async move {
            a_clone.set(1);
            assert!(rt_clone.is_batching());
            a_clone.set(2);
            "ok"
        }));

        assert_eq!(out, Some("ok"));
        assert_eq!(calls.get(), 1);
        assert_eq!(a.value(), json!(2));
    }
}
