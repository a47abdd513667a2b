use futures::channel::oneshot;
use futures::executor::block_on;
use spark_state::{json, ActionOptions, Runtime, TaskOptions, Value, Watchable};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[test]
fn test_tasks_run_in_fifo_order() {
    let rt = Runtime::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let scheduler = rt.scheduler();

    scheduler.stop();
    for name in ["a", "b", "c"] {
        let log_clone = log.clone();
        scheduler.add_sync(move || log_clone.borrow_mut().push(name), TaskOptions::named(name));
    }
    assert!(log.borrow().is_empty());

    scheduler.resume();
    assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
    assert_eq!(scheduler.completed(), 3);
}

#[test]
fn test_async_task_holds_the_lane_until_settled() {
    let rt = Runtime::new();
    let scheduler = rt.scheduler().clone();
    let log = Rc::new(RefCell::new(Vec::new()));
    let (tx, rx) = oneshot::channel::<&'static str>();

    let log_clone = log.clone();
    scheduler.add_async(
        move || async move {
            let msg = rx.await.unwrap_or("dropped");
            log_clone.borrow_mut().push(msg);
        },
        TaskOptions::named("wait"),
    );
    let log_clone = log.clone();
    scheduler.add_sync(move || log_clone.borrow_mut().push("after"), TaskOptions::default());

    assert_eq!(scheduler.in_flight_count(), 1);
    assert_eq!(scheduler.pending_count(), 1);

    tx.send("ready").unwrap();
    block_on(scheduler.settled());
    assert_eq!(*log.borrow(), vec!["ready", "after"]);
    assert!(!scheduler.is_busy());
}

#[test]
fn test_task_added_while_settling_waits_for_the_lane() {
    let rt = Runtime::new();
    let scheduler = rt.scheduler().clone();
    let log = Rc::new(RefCell::new(Vec::new()));
    let (tx, rx) = oneshot::channel::<()>();

    let log_clone = log.clone();
    scheduler.add_async(
        move || async move {
            log_clone.borrow_mut().push("fetch started");
            let _ = rx.await;
            log_clone.borrow_mut().push("fetch done");
        },
        TaskOptions::named("fetch"),
    );

    let (scheduler_clone, log_clone) = (scheduler.clone(), log.clone());
    let late_arrival = async move {
        scheduler_clone.add_sync(
            move || log_clone.borrow_mut().push("render"),
            TaskOptions::named("render"),
        );
        tx.send(()).unwrap();
    };
    block_on(futures::future::join(scheduler.settled(), late_arrival));

    assert_eq!(*log.borrow(), vec!["fetch started", "fetch done", "render"]);
}

#[test]
fn test_clear_does_not_cancel_started_work() {
    let rt = Runtime::new();
    let scheduler = rt.scheduler().clone();
    let log = Rc::new(RefCell::new(Vec::new()));
    let (tx, rx) = oneshot::channel::<()>();

    let log_clone = log.clone();
    scheduler.add_async(
        move || async move {
            let _ = rx.await;
            log_clone.borrow_mut().push("started task finished");
        },
        TaskOptions::default(),
    );
    scheduler.clear();

    tx.send(()).unwrap();
    block_on(scheduler.settled());
    assert_eq!(*log.borrow(), vec!["started task finished"]);
}

#[test]
fn test_remove_and_clear_pending_tasks() {
    let rt = Runtime::new();
    let scheduler = rt.scheduler();
    let ran = Rc::new(Cell::new(0));

    scheduler.stop();
    let ran_clone = ran.clone();
    let first = scheduler.add_sync(move || ran_clone.set(ran_clone.get() + 1), TaskOptions::default());
    let ran_clone = ran.clone();
    scheduler.add_sync(move || ran_clone.set(ran_clone.get() + 10), TaskOptions::default());

    assert!(scheduler.remove_task(first));
    assert!(!scheduler.remove_task(first));
    scheduler.resume();
    assert_eq!(ran.get(), 10);

    scheduler.stop();
    let ran_clone = ran.clone();
    scheduler.add_sync(move || ran_clone.set(ran_clone.get() + 100), TaskOptions::default());
    scheduler.clear();
    scheduler.resume();
    assert_eq!(ran.get(), 10);
}

#[test]
fn test_batch_async_closes_after_the_future() {
    let rt = Runtime::new();
    let n = rt.state(0);
    let fired = Rc::new(Cell::new(0));
    let fired_clone = fired.clone();
    let _sub = n.watch(move |_| fired_clone.set(fired_clone.get() + 1));

    let n_clone = n.clone();
    let rt_clone = rt.clone();
    let result = block_on(rt.batch_async(move || async move {
        n_clone.set(1);
        n_clone.set(2);
        assert!(rt_clone.is_batching());
        n_clone.value()
    }));

    // Writes inside the batch are deferred, so the future saw the old value.
    assert_eq!(result, Some(json!(0)));
    assert_eq!(n.value(), json!(2));
    assert_eq!(fired.get(), 1);
    assert!(!rt.is_batching());
}

#[test]
fn test_nested_batch_async_runs_on_the_scheduler() {
    let rt = Runtime::new();
    let n = rt.state(0);

    let inner_rt = rt.clone();
    let n_clone = n.clone();
    let nested = rt.transaction(|| {
        block_on(inner_rt.batch_async(move || async move {
            n_clone.set(5);
        }))
    });
    assert_eq!(nested, None);
    assert_eq!(rt.scheduler().in_flight_count(), 1);

    block_on(rt.scheduler().settled());
    assert_eq!(n.value(), json!(5));
}

#[test]
fn test_batched_action_enqueued_twice() {
    let rt = Runtime::new();
    let total = rt.state(0);
    let fired = Rc::new(Cell::new(0));
    let fired_clone = fired.clone();
    let _sub = total.watch(move |_| fired_clone.set(fired_clone.get() + 1));

    let total_clone = total.clone();
    let add_ten = rt
        .action_with("add-ten", ActionOptions { batched: true }, move || {
            for _ in 0..10 {
                let n = total_clone.get_as::<i64>()?;
                total_clone.set(n + 1);
            }
            Ok(Value::Null)
        })
        .unwrap();

    rt.scheduler().stop();
    add_ten.enqueue().unwrap();
    add_ten.enqueue().unwrap();
    rt.scheduler().resume();

    // Reads inside the batch see the pre-batch value each time.
    assert_eq!(total.value(), json!(2));
    assert_eq!(fired.get(), 2);
    assert_eq!(add_ten.run_count(), 2);
}

#[test]
fn test_batch_deferred_resolves_after_outer_close() {
    let rt = Runtime::new();
    let n = rt.state(1);

    let inner_rt = rt.clone();
    let n_clone = n.clone();
    let handle = rt.transaction(move || {
        let handle = inner_rt.batch_deferred(move || n_clone.value());
        assert!(!handle.is_ready());
        handle
    });

    assert!(handle.is_ready());
    assert_eq!(handle.take(), Some(json!(1)));
}
