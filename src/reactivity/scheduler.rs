// ============================================================================
// spark-state - Task Scheduler
// Single-lane FIFO queue for sync and async side effects
// ============================================================================
//
// Tasks run one at a time in the order they were added. A synchronous task
// returns `TaskOutput::Done` and the runner moves straight on. An async task
// returns `TaskOutput::Pending(future)`: the runner keeps the future and
// holds the lane until every tracked future has completed. Nothing polls
// those futures on its own; `settled().await` drives them and resumes the
// lane, so the caller decides which executor runs them.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use futures::future::{join_all, LocalBoxFuture};
use futures::FutureExt;
use tracing::{debug, trace};

// =============================================================================
// TASK TYPES
// =============================================================================

/// What a task hands back to the runner.
pub enum TaskOutput {
    /// Finished synchronously.
    Done,
    /// Still running; the lane is held until the future completes.
    Pending(LocalBoxFuture<'static, ()>),
}

/// Options accepted by [`Scheduler::add_task`].
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Name shown in log output.
    pub name: Option<String>,
}

impl TaskOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

/// Handle for cancelling a task that has not started yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

struct Task {
    id: TaskId,
    name: Option<String>,
    action: Box<dyn FnOnce() -> TaskOutput>,
}

// Counts futures being joined; released even if the join is dropped early.
struct SettlingGuard<'a> {
    settling: &'a Cell<usize>,
    count: usize,
}

impl<'a> SettlingGuard<'a> {
    fn hold(settling: &'a Cell<usize>, count: usize) -> Self {
        settling.set(settling.get() + count);
        Self { settling, count }
    }
}

impl Drop for SettlingGuard<'_> {
    fn drop(&mut self) {
        self.settling
            .set(self.settling.get().saturating_sub(self.count));
    }
}

// =============================================================================
// SCHEDULER
// =============================================================================

struct SchedulerInner {
    queue: RefCell<VecDeque<Task>>,
    in_flight: RefCell<Vec<LocalBoxFuture<'static, ()>>>,
    // Futures moved out of `in_flight` and currently being joined by
    // `settled()`. They still hold the lane.
    settling: Cell<usize>,
    running: Cell<bool>,
    stopped: Cell<bool>,
    next_id: Cell<u64>,
    completed: Cell<u64>,
}

/// Single-lane task queue. Cloning shares the queue.
///
/// # Example
///
/// ```
/// use spark_state::reactivity::scheduler::{Scheduler, TaskOptions};
/// use std::cell::RefCell;
/// use std::rc::Rc;
///
/// let scheduler = Scheduler::new();
/// let log = Rc::new(RefCell::new(Vec::new()));
///
/// let log_clone = log.clone();
/// scheduler.add_async(
///     move || async move { log_clone.borrow_mut().push("async") },
///     TaskOptions::default(),
/// );
/// let log_clone = log.clone();
/// scheduler.add_sync(move || log_clone.borrow_mut().push("sync"), TaskOptions::default());
///
/// // The async task holds the lane, so the sync task waits.
/// assert!(log.borrow().is_empty());
///
/// futures::executor::block_on(scheduler.settled());
/// assert_eq!(*log.borrow(), vec!["async", "sync"]);
/// ```
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(SchedulerInner {
                queue: RefCell::new(VecDeque::new()),
                in_flight: RefCell::new(Vec::new()),
                settling: Cell::new(0),
                running: Cell::new(false),
                stopped: Cell::new(false),
                next_id: Cell::new(1),
                completed: Cell::new(0),
            }),
        }
    }

    // =========================================================================
    // ADD
    // =========================================================================

    /// Queue `action` and start the runner if the lane is free.
    pub fn add_task(
        &self,
        action: impl FnOnce() -> TaskOutput + 'static,
        options: TaskOptions,
    ) -> TaskId {
        let id = TaskId(self.inner.next_id.get());
        self.inner.next_id.set(id.0 + 1);
        trace!(%id, name = options.name.as_deref(), "task queued");
        self.inner.queue.borrow_mut().push_back(Task {
            id,
            name: options.name,
            action: Box::new(action),
        });
        self.run();
        id
    }

    /// Queue a synchronous task.
    pub fn add_sync(&self, action: impl FnOnce() + 'static, options: TaskOptions) -> TaskId {
        self.add_task(
            move || {
                action();
                TaskOutput::Done
            },
            options,
        )
    }

    /// Queue a task whose work is the future returned by `action`.
    pub fn add_async<F, Fut>(&self, action: F, options: TaskOptions) -> TaskId
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        self.add_task(move || TaskOutput::Pending(action().boxed_local()), options)
    }

    // =========================================================================
    // RUNNER
    // =========================================================================

    /// Start tasks until the queue is empty, the lane is held by an async
    /// task, or the scheduler is stopped.
    pub fn run(&self) {
        let inner = &self.inner;
        if inner.running.get() {
            return;
        }

        // Resets the running flag even if a task panics.
        struct RunGuard<'a>(&'a Cell<bool>);
        impl Drop for RunGuard<'_> {
            fn drop(&mut self) {
                self.0.set(false);
            }
        }
        inner.running.set(true);
        let _guard = RunGuard(&inner.running);

        loop {
            if inner.stopped.get() || self.lane_held() {
                break;
            }
            let task = inner.queue.borrow_mut().pop_front();
            let Some(task) = task else {
                break;
            };

            trace!(id = %task.id, name = task.name.as_deref(), "task started");
            match (task.action)() {
                TaskOutput::Done => inner.completed.set(inner.completed.get() + 1),
                TaskOutput::Pending(future) => {
                    debug!(id = %task.id, "lane held by async task");
                    inner.in_flight.borrow_mut().push(future);
                }
            }
        }
    }

    /// Drive tracked futures and keep the lane moving until nothing is left
    /// to run. Returns early if the scheduler is stopped.
    pub async fn settled(&self) {
        loop {
            let futures = std::mem::take(&mut *self.inner.in_flight.borrow_mut());
            if futures.is_empty() {
                self.run();
                if !self.lane_held() {
                    break;
                }
                if self.inner.in_flight.borrow().is_empty() {
                    // Another `settled()` is joining the futures holding the
                    // lane; it will resume the queue.
                    break;
                }
                continue;
            }

            let count = futures.len();
            {
                let _hold = SettlingGuard::hold(&self.inner.settling, count);
                join_all(futures).await;
            }
            self.inner
                .completed
                .set(self.inner.completed.get() + count as u64);
            debug!(settled = count, "async tasks settled");
            self.run();
        }
    }

    fn lane_held(&self) -> bool {
        self.inner.settling.get() > 0 || !self.inner.in_flight.borrow().is_empty()
    }

    // =========================================================================
    // CONTROL
    // =========================================================================

    /// Pause intake: queued tasks stay queued and no new task starts.
    pub fn stop(&self) {
        debug!("scheduler stopped");
        self.inner.stopped.set(true);
    }

    /// Lift a `stop()` and start the runner.
    pub fn resume(&self) {
        debug!("scheduler resumed");
        self.inner.stopped.set(false);
        self.run();
    }

    /// Drop every task that has not started. Started async work keeps
    /// running and still holds the lane.
    pub fn clear(&self) {
        let queued = std::mem::take(&mut *self.inner.queue.borrow_mut());
        if !queued.is_empty() {
            debug!(queued = queued.len(), "scheduler cleared");
        }
    }

    /// Drop queued tasks and the in-flight futures not currently being
    /// driven by `settled()`. Used when the owning runtime is killed.
    pub fn abort_all(&self) {
        self.clear();
        let in_flight = std::mem::take(&mut *self.inner.in_flight.borrow_mut());
        if !in_flight.is_empty() {
            debug!(in_flight = in_flight.len(), "in-flight tasks aborted");
        }
    }

    /// Cancel a task that has not started. Returns whether it was found.
    pub fn remove_task(&self, id: TaskId) -> bool {
        let mut queue = self.inner.queue.borrow_mut();
        let before = queue.len();
        queue.retain(|task| task.id != id);
        before != queue.len()
    }

    // =========================================================================
    // INTROSPECTION
    // =========================================================================

    /// Tasks waiting to start.
    pub fn pending_count(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    /// Async tasks currently holding the lane.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.borrow().len() + self.inner.settling.get()
    }

    /// Whether anything is queued or in flight.
    pub fn is_busy(&self) -> bool {
        self.pending_count() > 0 || self.in_flight_count() > 0
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.get()
    }

    /// Tasks finished so far.
    pub fn completed(&self) -> u64 {
        self.inner.completed.get()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending_count())
            .field("in_flight", &self.in_flight_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::oneshot;
    use futures::executor::block_on;

    fn log() -> Rc<RefCell<Vec<&'static str>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    #[test]
    fn sync_tasks_run_immediately_in_order() {
        let scheduler = Scheduler::new();
        let log = log();

        for name in ["a", "b", "c"] {
            let log_clone = log.clone();
            scheduler.add_sync(move || log_clone.borrow_mut().push(name), TaskOptions::default());
        }

        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
        assert_eq!(scheduler.completed(), 3);
        assert!(!scheduler.is_busy());
    }

    #[test]
    fn task_added_from_a_task_runs_after_it() {
        let scheduler = Scheduler::new();
        let log = log();

        let (scheduler_clone, log_clone) = (scheduler.clone(), log.clone());
        scheduler.add_sync(
            move || {
                let log_inner = log_clone.clone();
                scheduler_clone.add_sync(
                    move || log_inner.borrow_mut().push("child"),
                    TaskOptions::default(),
                );
                log_clone.borrow_mut().push("parent");
            },
            TaskOptions::default(),
        );

        assert_eq!(*log.borrow(), vec!["parent", "child"]);
    }

    #[test]
    fn async_task_holds_the_lane_until_settled() {
        let scheduler = Scheduler::new();
        let log = log();
        let (tx, rx) = oneshot::channel::<()>();

        let log_clone = log.clone();
        scheduler.add_async(
            move || async move {
                let _ = rx.await;
                log_clone.borrow_mut().push("async");
            },
            TaskOptions::named("wait"),
        );
        let log_clone = log.clone();
        scheduler.add_sync(move || log_clone.borrow_mut().push("sync"), TaskOptions::default());

        assert_eq!(scheduler.in_flight_count(), 1);
        assert_eq!(scheduler.pending_count(), 1);
        assert!(log.borrow().is_empty());

        tx.send(()).unwrap();
        block_on(scheduler.settled());

        assert_eq!(*log.borrow(), vec!["async", "sync"]);
        assert!(!scheduler.is_busy());
    }

    #[test]
    fn stop_pauses_and_resume_restarts() {
        let scheduler = Scheduler::new();
        let log = log();

        scheduler.stop();
        let log_clone = log.clone();
        scheduler.add_sync(move || log_clone.borrow_mut().push("a"), TaskOptions::default());
        assert!(log.borrow().is_empty());
        assert!(scheduler.is_stopped());

        // settled() does not spin while stopped
        block_on(scheduler.settled());
        assert_eq!(scheduler.pending_count(), 1);

        scheduler.resume();
        assert_eq!(*log.borrow(), vec!["a"]);
    }

    #[test]
    fn remove_task_cancels_pending_work() {
        let scheduler = Scheduler::new();
        let log = log();
        scheduler.stop();

        let log_clone = log.clone();
        let first = scheduler.add_sync(move || log_clone.borrow_mut().push("a"), TaskOptions::default());
        let log_clone = log.clone();
        scheduler.add_sync(move || log_clone.borrow_mut().push("b"), TaskOptions::default());

        assert!(scheduler.remove_task(first));
        assert!(!scheduler.remove_task(first));

        scheduler.resume();
        assert_eq!(*log.borrow(), vec!["b"]);
    }

    #[test]
    fn clear_drops_pending_tasks() {
        let scheduler = Scheduler::new();
        let log = log();
        scheduler.stop();

        let log_clone = log.clone();
        scheduler.add_sync(move || log_clone.borrow_mut().push("a"), TaskOptions::default());
        scheduler.clear();
        scheduler.resume();

        assert!(log.borrow().is_empty());
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn clear_leaves_started_work_alone() {
        let scheduler = Scheduler::new();
        let log = log();
        let (tx, rx) = oneshot::channel::<()>();

        let log_clone = log.clone();
        scheduler.add_async(
            move || async move {
                let _ = rx.await;
                log_clone.borrow_mut().push("done");
            },
            TaskOptions::default(),
        );
        let log_clone = log.clone();
        scheduler.add_sync(move || log_clone.borrow_mut().push("queued"), TaskOptions::default());

        scheduler.clear();
        assert_eq!(scheduler.pending_count(), 0);
        assert_eq!(scheduler.in_flight_count(), 1);

        tx.send(()).unwrap();
        block_on(scheduler.settled());
        assert_eq!(*log.borrow(), vec!["done"]);
    }

    #[test]
    fn abort_all_drops_in_flight_futures() {
        let scheduler = Scheduler::new();
        let log = log();

        let log_clone = log.clone();
        scheduler.add_async(
            move || async move { log_clone.borrow_mut().push("never") },
            TaskOptions::default(),
        );
        scheduler.abort_all();
        assert!(!scheduler.is_busy());

        block_on(scheduler.settled());
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn lane_stays_held_while_settling() {
        let scheduler = Scheduler::new();
        let log = log();
        let (tx, rx) = oneshot::channel::<()>();

        let log_clone = log.clone();
        scheduler.add_async(
            move || async move {
                log_clone.borrow_mut().push("async-start");
                let _ = rx.await;
                log_clone.borrow_mut().push("async-end");
            },
            TaskOptions::named("wait"),
        );

        let (scheduler_clone, log_clone) = (scheduler.clone(), log.clone());
        let feeder = async move {
            let log_inner = log_clone.clone();
            scheduler_clone.add_sync(
                move || log_inner.borrow_mut().push("sync"),
                TaskOptions::default(),
            );
            assert_eq!(scheduler_clone.pending_count(), 1);
            assert_eq!(*log_clone.borrow(), vec!["async-start"]);
            tx.send(()).unwrap();
        };
        block_on(futures::future::join(scheduler.settled(), feeder));

        assert_eq!(*log.borrow(), vec!["async-start", "async-end", "sync"]);
        assert!(!scheduler.is_busy());
    }

    #[test]
    fn panicking_task_does_not_wedge_the_runner() {
        let scheduler = Scheduler::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            scheduler.add_sync(|| panic!("task failed"), TaskOptions::default());
        }));
        assert!(result.is_err());

        let log = log();
        let log_clone = log.clone();
        scheduler.add_sync(move || log_clone.borrow_mut().push("after"), TaskOptions::default());
        assert_eq!(*log.borrow(), vec!["after"]);
    }
}
