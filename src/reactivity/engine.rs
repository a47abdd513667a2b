// ============================================================================
// spark-state - Event Engine
// Keyed publish/subscribe with halt/release coalescing
// ============================================================================
//
// Every watchable broadcasts under its own event key. Subscribers for a key
// run synchronously in registration order, followed by the wildcard
// subscribers that see every event.
//
// While the engine is halted, emits do not fan out. Payloads are deep-merged
// into a pending map keyed by event id (last write wins per key, arrays
// concatenate). Releasing the outermost halt emits each pending entry once.
// This is what turns N writes to one watchable inside a batch into a single
// notification.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::reactivity::merge::merge_payload;

// =============================================================================
// EVENT
// =============================================================================

/// What a subscriber receives: the event key and the emitted payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub key: String,
    pub value: Value,
}

/// Subscriber callback type.
pub type EventFn = Box<dyn Fn(&Event)>;

struct Listener {
    token: u64,
    origin: String,
    active: Cell<bool>,
    callback: EventFn,
}

// =============================================================================
// ENGINE INNER
// =============================================================================

struct EngineInner {
    listeners: RefCell<IndexMap<String, Vec<Rc<Listener>>>>,
    wildcard: RefCell<Vec<Rc<Listener>>>,
    next_token: Cell<u64>,
    halt_depth: Cell<u32>,
    pending: RefCell<IndexMap<String, Value>>,
    emitted: Cell<u64>,
    trace_emits: bool,
}

impl EngineInner {
    fn remove(&self, event_id: Option<&str>, token: u64) {
        match event_id {
            Some(id) => {
                let mut listeners = self.listeners.borrow_mut();
                if let Some(list) = listeners.get_mut(id) {
                    list.retain(|l| l.token != token);
                    if list.is_empty() {
                        listeners.shift_remove(id);
                    }
                }
            }
            None => self.wildcard.borrow_mut().retain(|l| l.token != token),
        }
    }
}

// =============================================================================
// EVENT ENGINE
// =============================================================================

/// Publish/subscribe broadcaster keyed by opaque string ids.
///
/// Cloning the engine clones the handle; all clones share listeners.
///
/// # Example
///
/// ```
/// use spark_state::reactivity::engine::EventEngine;
/// use serde_json::json;
/// use std::cell::RefCell;
/// use std::rc::Rc;
///
/// let engine = EventEngine::new();
/// let seen = Rc::new(RefCell::new(Vec::new()));
/// let seen_clone = seen.clone();
/// let _sub = engine.subscribe("count", move |e| seen_clone.borrow_mut().push(e.value.clone()), "doc");
///
/// let release = engine.halt();
/// engine.emit("count", json!(1));
/// engine.emit("count", json!(2));
/// assert!(seen.borrow().is_empty());
///
/// release.release();
/// assert_eq!(*seen.borrow(), vec![json!(2)]);
/// ```
#[derive(Clone)]
pub struct EventEngine {
    inner: Rc<EngineInner>,
}

impl EventEngine {
    pub fn new() -> Self {
        Self::with_tracing(false)
    }

    /// Create an engine that logs every fan-out at `trace` level.
    pub fn with_tracing(trace_emits: bool) -> Self {
        Self {
            inner: Rc::new(EngineInner {
                listeners: RefCell::new(IndexMap::new()),
                wildcard: RefCell::new(Vec::new()),
                next_token: Cell::new(1),
                halt_depth: Cell::new(0),
                pending: RefCell::new(IndexMap::new()),
                emitted: Cell::new(0),
                trace_emits,
            }),
        }
    }

    fn listener(&self, origin: &str, callback: EventFn) -> Rc<Listener> {
        let token = self.inner.next_token.get();
        self.inner.next_token.set(token + 1);
        Rc::new(Listener {
            token,
            origin: origin.to_string(),
            active: Cell::new(true),
            callback,
        })
    }

    // =========================================================================
    // SUBSCRIBE
    // =========================================================================

    /// Register `callback` under `event_id`.
    ///
    /// `origin` is a free-form tag recorded for debugging. An empty
    /// `event_id` is refused with a warning and yields an inert subscription.
    pub fn subscribe(
        &self,
        event_id: &str,
        callback: impl Fn(&Event) + 'static,
        origin: &str,
    ) -> Subscription {
        if event_id.is_empty() {
            warn!(origin, "subscribe called with an empty event id");
            return Subscription::inert();
        }

        let listener = self.listener(origin, Box::new(callback));
        let sub = Subscription {
            engine: Rc::downgrade(&self.inner),
            event_id: Some(event_id.to_string()),
            token: listener.token,
            listener: Rc::downgrade(&listener),
        };
        self.inner
            .listeners
            .borrow_mut()
            .entry(event_id.to_string())
            .or_default()
            .push(listener);
        sub
    }

    /// Register a wildcard callback that receives every emitted event.
    pub fn subscribe_all(&self, callback: impl Fn(&Event) + 'static, origin: &str) -> Subscription {
        let listener = self.listener(origin, Box::new(callback));
        let sub = Subscription {
            engine: Rc::downgrade(&self.inner),
            event_id: None,
            token: listener.token,
            listener: Rc::downgrade(&listener),
        };
        self.inner.wildcard.borrow_mut().push(listener);
        sub
    }

    // =========================================================================
    // EMIT
    // =========================================================================

    /// Broadcast `payload` under `event_id`.
    ///
    /// While halted the payload is merged into the pending map instead.
    pub fn emit(&self, event_id: &str, payload: Value) {
        if self.inner.halt_depth.get() > 0 {
            let mut pending = self.inner.pending.borrow_mut();
            match pending.get_mut(event_id) {
                Some(existing) => merge_payload(existing, payload),
                None => {
                    pending.insert(event_id.to_string(), payload);
                }
            }
            return;
        }

        // Snapshot so listeners can subscribe or unsubscribe mid-dispatch.
        let targets: Vec<Rc<Listener>> = self
            .inner
            .listeners
            .borrow()
            .get(event_id)
            .cloned()
            .unwrap_or_default();
        let wildcard: Vec<Rc<Listener>> = self.inner.wildcard.borrow().clone();

        self.inner.emitted.set(self.inner.emitted.get() + 1);
        if self.inner.trace_emits {
            trace!(
                event = event_id,
                listeners = targets.len(),
                wildcard = wildcard.len(),
                "emit"
            );
        }

        let event = Event {
            key: event_id.to_string(),
            value: payload,
        };
        for listener in targets.iter().chain(wildcard.iter()) {
            if listener.active.get() {
                (listener.callback)(&event);
            }
        }
    }

    // =========================================================================
    // HALT / RELEASE
    // =========================================================================

    /// Stop fanning out emits until the returned [`Release`] is consumed or
    /// dropped. Halts nest.
    pub fn halt(&self) -> Release {
        self.inner.halt_depth.set(self.inner.halt_depth.get() + 1);
        Release {
            engine: Rc::downgrade(&self.inner),
            done: false,
        }
    }

    /// Undo one `halt()`. The outermost release flushes pending emits.
    pub fn release(&self) {
        let depth = self.inner.halt_depth.get();
        if depth == 0 {
            debug!("release called on an engine that is not halted");
            return;
        }
        self.inner.halt_depth.set(depth - 1);
        if depth == 1 {
            self.flush();
        }
    }

    fn flush(&self) {
        let pending = std::mem::take(&mut *self.inner.pending.borrow_mut());
        if pending.is_empty() {
            return;
        }
        debug!(events = pending.len(), "flushing coalesced emits");
        for (event_id, payload) in pending {
            self.emit(&event_id, payload);
        }
    }

    // =========================================================================
    // INTROSPECTION
    // =========================================================================

    pub fn is_halted(&self) -> bool {
        self.inner.halt_depth.get() > 0
    }

    pub fn halt_depth(&self) -> u32 {
        self.inner.halt_depth.get()
    }

    /// Number of listeners registered for one event id.
    pub fn listener_count(&self, event_id: &str) -> usize {
        self.inner
            .listeners
            .borrow()
            .get(event_id)
            .map_or(0, Vec::len)
    }

    /// Listeners across all ids, wildcard included.
    pub fn total_listeners(&self) -> usize {
        let keyed: usize = self.inner.listeners.borrow().values().map(Vec::len).sum();
        keyed + self.inner.wildcard.borrow().len()
    }

    /// Origin tags of the listeners for `event_id`, in registration order.
    pub fn origins(&self, event_id: &str) -> Vec<String> {
        self.inner
            .listeners
            .borrow()
            .get(event_id)
            .map(|list| list.iter().map(|l| l.origin.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of event ids waiting for the outermost release.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    /// Total fan-outs performed.
    pub fn emitted(&self) -> u64 {
        self.inner.emitted.get()
    }

    /// Drop every listener and pending payload.
    pub fn clear(&self) {
        let listeners = std::mem::take(&mut *self.inner.listeners.borrow_mut());
        let wildcard = std::mem::take(&mut *self.inner.wildcard.borrow_mut());
        for listener in listeners.values().flatten().chain(wildcard.iter()) {
            listener.active.set(false);
        }
        self.inner.pending.borrow_mut().clear();
    }
}

impl Default for EventEngine {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// RELEASE
// =============================================================================

/// Pending release of one `halt()`. Consuming or dropping it releases.
#[must_use = "dropping a Release immediately undoes the halt"]
pub struct Release {
    engine: Weak<EngineInner>,
    done: bool,
}

impl Release {
    pub fn release(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(inner) = self.engine.upgrade() {
            EventEngine { inner }.release();
        }
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        self.run();
    }
}

// =============================================================================
// SUBSCRIPTION
// =============================================================================

/// Handle returned by `subscribe`. Call [`Subscription::unsubscribe`] to stop
/// receiving events; dropping the handle leaves the listener in place.
pub struct Subscription {
    engine: Weak<EngineInner>,
    event_id: Option<String>,
    token: u64,
    listener: Weak<Listener>,
}

impl Subscription {
    /// A subscription that is not attached to anything.
    pub fn inert() -> Self {
        Self {
            engine: Weak::new(),
            event_id: None,
            token: 0,
            listener: Weak::new(),
        }
    }

    /// Detach the listener. Safe to call more than once, and safe to call
    /// from inside a callback that is currently being dispatched.
    pub fn unsubscribe(&self) {
        if let Some(listener) = self.listener.upgrade() {
            listener.active.set(false);
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.remove(self.event_id.as_deref(), self.token);
        }
    }

    /// Whether the listener will still receive events.
    pub fn is_active(&self) -> bool {
        self.listener.upgrade().is_some_and(|l| l.active.get())
    }

    /// The event id this subscription listens to; `None` for wildcard or
    /// inert subscriptions.
    pub fn event_id(&self) -> Option<&str> {
        self.event_id.as_deref()
    }
}

impl Default for Subscription {
    fn default() -> Self {
        Self::inert()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event_id", &self.event_id)
            .field("active", &self.is_active())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
