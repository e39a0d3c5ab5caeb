//! Effect Implementation
//!
//! An effect is an eager computation split into two halves:
//!
//! - a tracked **compute** phase that pulls signals (pure), and
//! - a non-tracking **action** phase that performs the side effect.
//!
//! The compute phase runs during the pure fixed point of a flush. When it
//! succeeds, the action is enqueued to the render or user slot of the
//! owner's queue; render actions of one flush run strictly before user
//! actions. A cleanup returned by the action runs before the next action
//! and on disposal.
//!
//! A compute that hits a waiting source suppresses the action (the effect
//! stays pending until the data arrives). A compute failure goes to the
//! effect's own error handler, then the nearest owner handler, then the
//! queue notification walk, and finally the host error hook.
//!
//! [`EagerComputation`] is the readable sibling: a derived cell that is
//! always considered observed and recomputes during the pure phase whether
//! or not anything reads it.

use std::cell::{Cell, RefCell};
use std::error::Error;
use std::fmt;
use std::rc::Rc;

use crate::errors::Interrupt;
use crate::graph::node::{self, CellBehavior, CellState, ComputeOutcome, NodeId, UpdateStatus};
use crate::graph::runtime;
use crate::graph::scheduler::{self, NotifyMask, QueueSlot};

use super::memo::{create_derived, read_derived, DerivedState};
use super::owner::{self, OwnerId};
use super::signal::SignalOptions;

// ----------------------------------------------------------------------------
// Cleanup adapter
// ----------------------------------------------------------------------------

/// Conversion of an action's return value into an optional cleanup.
///
/// Returning `()` means no cleanup; returning a closure (or `Some(closure)`)
/// registers it to run before the next action and on disposal.
pub trait IntoCleanup {
    fn into_cleanup(self) -> Option<Box<dyn FnOnce()>>;
}

impl IntoCleanup for () {
    fn into_cleanup(self) -> Option<Box<dyn FnOnce()>> {
        None
    }
}

impl<F: FnOnce() + 'static> IntoCleanup for F {
    fn into_cleanup(self) -> Option<Box<dyn FnOnce()>> {
        Some(Box::new(self))
    }
}

impl<F: FnOnce() + 'static> IntoCleanup for Option<F> {
    fn into_cleanup(self) -> Option<Box<dyn FnOnce()>> {
        self.map(|f| Box::new(f) as Box<dyn FnOnce()>)
    }
}

// ----------------------------------------------------------------------------
// Effect
// ----------------------------------------------------------------------------

/// Which effect phase the action runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectTier {
    /// Synchronous view updates; run right after the pure fixed point.
    Render,
    /// Post-render side effects.
    User,
}

impl EffectTier {
    fn slot(self) -> QueueSlot {
        match self {
            EffectTier::Render => QueueSlot::Render,
            EffectTier::User => QueueSlot::User,
        }
    }
}

/// Construction options for effects.
pub struct EffectOptions {
    /// Debug name surfaced in diagnostics.
    pub name: Option<&'static str>,
    /// The phase the action runs in.
    pub tier: EffectTier,
    /// Handler receiving compute failures before any other routing.
    pub error_handler: Option<Rc<dyn Fn(Rc<dyn Error + 'static>)>>,
}

impl Default for EffectOptions {
    fn default() -> Self {
        Self {
            name: None,
            tier: EffectTier::User,
            error_handler: None,
        }
    }
}

#[allow(clippy::type_complexity)]
struct EffectState<T> {
    value: RefCell<Option<T>>,
    prev: RefCell<Option<T>>,
    compute: RefCell<Box<dyn FnMut(Option<&T>) -> Result<T, Interrupt>>>,
    action: RefCell<Box<dyn FnMut(&T, Option<&T>) -> Option<Box<dyn FnOnce()>>>>,
    cleanup: RefCell<Option<Box<dyn FnOnce()>>>,
    error_handler: Option<Rc<dyn Fn(Rc<dyn Error + 'static>)>>,
    tier: EffectTier,
    scope: OwnerId,
    action_queued: Cell<bool>,
}

struct EffectBehavior<T: 'static> {
    state: Rc<EffectState<T>>,
}

impl<T: 'static> EffectBehavior<T> {
    fn schedule_action(&self, id: NodeId) {
        let state = self.state.clone();
        if state.action_queued.replace(true) {
            return;
        }
        let queue = match runtime::queue_of_node(id) {
            Some(queue) => queue,
            None => return,
        };
        scheduler::enqueue_task(
            queue,
            state.tier.slot(),
            Box::new(move || {
                state.action_queued.set(false);
                if !runtime::node_exists(id) {
                    return;
                }
                if let Some(cleanup) = state.cleanup.borrow_mut().take() {
                    cleanup();
                }
                let next_cleanup = {
                    let value = state.value.borrow();
                    let Some(current) = value.as_ref() else { return };
                    let prev = state.prev.borrow();
                    let mut action = state.action.borrow_mut();
                    (*action)(current, prev.as_ref())
                };
                *state.cleanup.borrow_mut() = next_cleanup;
            }),
        );
    }

    fn resolve_error(&self, id: NodeId, payload: Rc<dyn Error + 'static>) {
        tracing::trace!(cell = id.raw(), error = %payload, "effect compute failed");
        if let Some(handler) = &self.state.error_handler {
            (&**handler)(payload);
            return;
        }
        if let Some(handler) = owner::error_handler_for(self.state.scope) {
            (&*handler)(payload);
            return;
        }
        let queue = runtime::queue_of_node(id).unwrap_or_else(scheduler::root_queue);
        if scheduler::notify(queue, id, NotifyMask::Error, true, Some(payload.clone())) {
            return;
        }
        scheduler::report_error(payload);
    }
}

impl<T: 'static> CellBehavior for EffectBehavior<T> {
    fn recompute(&self) -> ComputeOutcome {
        let state = &self.state;
        owner::reset_scope(state.scope);
        let _scope = owner::enter_scope(state.scope);

        let result = {
            let previous = state.value.borrow();
            let mut compute = state.compute.borrow_mut();
            (*compute)(previous.as_ref())
        };

        match result {
            Ok(next) => {
                let mut value = state.value.borrow_mut();
                *state.prev.borrow_mut() = value.take();
                *value = Some(next);
                // A successful compute always re-fires the action: gating by
                // equality happens upstream, at the cells the compute reads.
                ComputeOutcome::Value { changed: true }
            }
            Err(Interrupt::NotReady(_)) => ComputeOutcome::NotReady,
            Err(Interrupt::Failure(payload)) => ComputeOutcome::Failed(payload),
        }
    }

    fn after_update(&self, id: NodeId, status: UpdateStatus) {
        match status {
            UpdateStatus::Changed => self.schedule_action(id),
            UpdateStatus::Failed(payload) => self.resolve_error(id, payload),
            UpdateStatus::Unchanged | UpdateStatus::NotReady => {}
        }
    }

    fn dispose(&self) {
        if let Some(cleanup) = self.state.cleanup.borrow_mut().take() {
            cleanup();
        }
        owner::dispose_owner(self.state.scope);
    }
}

/// Handle to a two-phase effect.
///
/// # Example
///
/// ```rust,ignore
/// let count = Signal::new(0);
/// let effect = Effect::new(
///     { let count = count.clone(); move || count.get() },
///     |value, _prev| println!("count is {value}"),
/// );
/// flush_sync(); // prints "count is 0"
/// count.set(5);
/// flush_sync(); // prints "count is 5"
/// effect.dispose();
/// ```
pub struct Effect {
    id: NodeId,
}

impl Effect {
    /// Create a user-tier effect from an infallible compute.
    pub fn new<T, C, F, A>(compute: F, action: A) -> Self
    where
        T: 'static,
        C: IntoCleanup,
        F: FnMut() -> T + 'static,
        A: FnMut(&T, Option<&T>) -> C + 'static,
    {
        let mut compute = compute;
        Self::with_options(
            None,
            move |_: Option<&T>| Ok(compute()),
            action,
            EffectOptions::default(),
        )
    }

    /// Create a render-tier effect from an infallible compute.
    pub fn render<T, C, F, A>(compute: F, action: A) -> Self
    where
        T: 'static,
        C: IntoCleanup,
        F: FnMut() -> T + 'static,
        A: FnMut(&T, Option<&T>) -> C + 'static,
    {
        let mut compute = compute;
        Self::with_options(
            None,
            move |_: Option<&T>| Ok(compute()),
            action,
            EffectOptions {
                tier: EffectTier::Render,
                ..EffectOptions::default()
            },
        )
    }

    /// Full constructor: optional seed value, fallible compute, action, and
    /// options carrying the tier and an error handler.
    pub fn with_options<T, C, F, A>(
        initial: Option<T>,
        compute: F,
        mut action: A,
        options: EffectOptions,
    ) -> Self
    where
        T: 'static,
        C: IntoCleanup,
        F: FnMut(Option<&T>) -> Result<T, Interrupt> + 'static,
        A: FnMut(&T, Option<&T>) -> C + 'static,
    {
        let scope = owner::create_scope(None, false);
        let state = Rc::new(EffectState {
            value: RefCell::new(initial),
            prev: RefCell::new(None),
            compute: RefCell::new(Box::new(compute)),
            action: RefCell::new(Box::new(move |value: &T, prev: Option<&T>| {
                action(value, prev).into_cleanup()
            })),
            cleanup: RefCell::new(None),
            error_handler: options.error_handler,
            tier: options.tier,
            scope,
            action_queued: Cell::new(false),
        });
        let id = runtime::register_node(
            node::DERIVED | node::DIRTY | node::EAGER,
            options.name,
            Some(Rc::new(EffectBehavior { state })),
            owner::current_queue_id(),
        );
        owner::adopt_node(id);
        runtime::schedule_eager(id);
        Self { id }
    }

    /// The cell's graph identifier.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Stop the effect: run its cleanup and release the cell.
    pub fn dispose(&self) {
        runtime::release_node(self.id);
    }

    /// True once the effect has been disposed (directly or with its owner).
    pub fn is_disposed(&self) -> bool {
        !runtime::node_exists(self.id)
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.id.raw())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// EagerComputation
// ----------------------------------------------------------------------------

/// A derived cell that is always considered observed.
///
/// Unlike a [`Memo`](super::memo::Memo), it registers itself on the queue
/// at construction and recomputes during the pure phase of every flush in
/// which it was marked, regardless of downstream demand.
pub struct EagerComputation<T: 'static> {
    id: NodeId,
    state: Rc<DerivedState<T>>,
}

impl<T: 'static> EagerComputation<T> {
    /// Create an eager computation from an infallible compute closure.
    pub fn new(mut compute: impl FnMut() -> T + 'static) -> Self
    where
        T: PartialEq,
    {
        Self::try_new(move |_| Ok(compute()))
    }

    /// Create an eager computation whose compute can propagate conditions.
    pub fn try_new(compute: impl FnMut(Option<&T>) -> Result<T, Interrupt> + 'static) -> Self
    where
        T: PartialEq,
    {
        Self::with_options(None, compute, SignalOptions::default())
    }

    /// Full constructor: optional seed value, fallible compute, options.
    pub fn with_options(
        initial: Option<T>,
        compute: impl FnMut(Option<&T>) -> Result<T, Interrupt> + 'static,
        options: SignalOptions<T>,
    ) -> Self {
        let (id, state) = create_derived(initial, compute, options, true);
        runtime::schedule_eager(id);
        Self { id, state }
    }

    /// The cell's graph identifier.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Read the value; panics on a waiting or errored cell.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        match self.try_get() {
            Ok(value) => value,
            Err(interrupt) => panic!("eager computation read failed: {interrupt}"),
        }
    }

    /// Read the value, or the cell's waiting/error condition.
    pub fn try_get(&self) -> Result<T, Interrupt>
    where
        T: Clone,
    {
        read_derived(self.id, &self.state)
    }

    /// Current staleness, for introspection.
    pub fn state(&self) -> CellState {
        runtime::node_state(self.id).unwrap_or(CellState::Clean)
    }

    /// Stop recomputing and release the cell.
    pub fn dispose(&self) {
        runtime::release_node(self.id);
    }
}

impl<T: 'static> Clone for EagerComputation<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            state: Rc::clone(&self.state),
        }
    }
}

impl<T: fmt::Debug + Clone + 'static> fmt::Debug for EagerComputation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EagerComputation")
            .field("id", &self.id.raw())
            .field("value", &self.state.cached())
            .field("state", &self.state())
            .finish()
    }
}
