// ============================================================================
// spark-state - Action
// Named, optionally batched unit of work with error routing
// ============================================================================

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use serde_json::Value;
use tracing::{debug, error};

use crate::core::error::StateError;
use crate::core::runtime::{ErrorHandler, Runtime, RuntimeRef};
use crate::reactivity::scheduler::{TaskId, TaskOptions};

type ActionBody = Box<dyn Fn() -> anyhow::Result<Value>>;

/// Options for [`Runtime::action_with`].
#[derive(Debug, Clone, Default)]
pub struct ActionOptions {
    /// Run the body inside a transaction so its writes notify once.
    pub batched: bool,
}

struct ActionInner {
    name: String,
    runtime: RuntimeRef,
    body: ActionBody,
    batched: bool,
    handlers: RefCell<Vec<ErrorHandler>>,
    runs: Cell<u64>,
}

/// A named piece of work that mutates state.
///
/// A failing body is routed to the action's own error handlers first, then to
/// the runtime's catch handler. Only when neither exists does `run` return
/// the error.
///
/// # Example
///
/// ```
/// use spark_state::{json, ActionOptions, Runtime, Watchable};
///
/// let rt = Runtime::new();
/// let count = rt.state(0);
///
/// let count_clone = count.clone();
/// let bump = rt
///     .action_with("bump", ActionOptions { batched: true }, move || {
///         let n = count_clone.get_as::<i64>()?;
///         count_clone.set(n + 1);
///         count_clone.set(n + 2);
///         Ok(json!(n + 2))
///     })
///     .unwrap();
///
/// assert_eq!(bump.run().unwrap(), Some(json!(2)));
/// assert_eq!(count.value(), json!(2));
/// ```
#[derive(Clone)]
pub struct Action {
    inner: Rc<ActionInner>,
}

impl Runtime {
    /// Create an unbatched action.
    pub fn action(
        &self,
        name: &str,
        body: impl Fn() -> anyhow::Result<Value> + 'static,
    ) -> Result<Action, StateError> {
        self.action_with(name, ActionOptions::default(), body)
    }

    /// Create an action with explicit options. Fails on an empty name.
    pub fn action_with(
        &self,
        name: &str,
        options: ActionOptions,
        body: impl Fn() -> anyhow::Result<Value> + 'static,
    ) -> Result<Action, StateError> {
        if name.trim().is_empty() {
            return Err(StateError::MissingActionName);
        }
        Ok(Action {
            inner: Rc::new(ActionInner {
                name: name.to_string(),
                runtime: self.downgrade(),
                body: Box::new(body),
                batched: options.batched,
                handlers: RefCell::new(Vec::new()),
                runs: Cell::new(0),
            }),
        })
    }
}

impl Action {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn run_count(&self) -> u64 {
        self.inner.runs.get()
    }

    /// Add a handler that receives this action's failures.
    pub fn on_error(&self, handler: impl Fn(&StateError) + 'static) -> &Self {
        self.inner.handlers.borrow_mut().push(Rc::new(handler));
        self
    }

    /// Run the body now.
    ///
    /// Returns `Ok(Some(value))` on success and `Ok(None)` when a failure was
    /// taken by a handler.
    pub fn run(&self) -> Result<Option<Value>, StateError> {
        let runtime = self.live_runtime()?;
        self.inner.runs.set(self.inner.runs.get() + 1);
        debug!(action = %self.inner.name, batched = self.inner.batched, "running action");

        let outcome = if self.inner.batched {
            runtime.transaction(|| (self.inner.body)())
        } else {
            (self.inner.body)()
        };

        match outcome {
            Ok(value) => Ok(Some(value)),
            Err(source) => self.route_error(&runtime, source),
        }
    }

    /// Queue the action on the runtime's scheduler. Failures that no handler
    /// takes are logged.
    pub fn enqueue(&self) -> Result<TaskId, StateError> {
        let runtime = self.live_runtime()?;
        let action = self.clone();
        Ok(runtime.scheduler().add_sync(
            move || {
                if let Err(err) = action.run() {
                    error!(action = %action.inner.name, error = %err, "queued action failed");
                }
            },
            TaskOptions::named(self.inner.name.clone()),
        ))
    }

    fn live_runtime(&self) -> Result<Runtime, StateError> {
        match self.inner.runtime.upgrade() {
            Some(runtime) if !runtime.is_killed() => Ok(runtime),
            _ => Err(StateError::RuntimeKilled),
        }
    }

    fn route_error(
        &self,
        runtime: &Runtime,
        source: anyhow::Error,
    ) -> Result<Option<Value>, StateError> {
        let err = StateError::Action {
            action: self.inner.name.clone(),
            source,
        };

        let handlers = self.inner.handlers.borrow().clone();
        if !handlers.is_empty() {
            for handler in handlers {
                handler(&err);
            }
            return Ok(None);
        }
        if runtime.report_error(&err) {
            return Ok(None);
        }
        Err(err)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.inner.name)
            .field("batched", &self.inner.batched)
            .field("runs", &self.inner.runs.get())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
