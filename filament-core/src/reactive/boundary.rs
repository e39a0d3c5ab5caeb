//! Boundaries
//!
//! A boundary installs a child queue for a subtree and intercepts the
//! LOADING/ERROR notifications climbing out of it.
//!
//! - A **suspense boundary** aggregates waiting cells. It exposes a
//!   reactive view of whether any descendant is waiting and, depending on
//!   its mode, gates the subtree's effect phases until the data arrives.
//!
//! - An **error boundary** captures the first error its subtree reports,
//!   exposes it reactively, and offers `reset` to clear the capture and
//!   replay the subtree.
//!
//! Both run their scope body under an owner whose queue pointer is the
//! boundary's child queue, so every cell created inside notifies the
//! boundary first.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::rc::Rc;

use crate::graph::node::NodeId;
use crate::graph::runtime;
use crate::graph::scheduler::{self, NotifyHandler, NotifyMask, Queue, QueueId};

use super::owner::{self, on_cleanup, run_with_owner, Owner};
use super::signal::{Equality, Signal, SignalOptions};

// ----------------------------------------------------------------------------
// Suspense
// ----------------------------------------------------------------------------

/// How a suspense boundary treats its subtree while data is waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspenseMode {
    /// Keep running effects against the existing (stale) content.
    ShowStale,
    /// Gate the subtree's effects until the subtree is quiescent; the host
    /// renders a fallback from the reactive waiting view meanwhile.
    Hide,
    /// Compute the new tree in the child queue while the old one stays
    /// live, then commit the retained effects on a single flush once
    /// nothing is waiting.
    Transition,
}

struct SuspenseController {
    queue: Cell<QueueId>,
    mode: SuspenseMode,
    waiting: RefCell<HashSet<NodeId>>,
    pending: Signal<usize>,
}

impl NotifyHandler for SuspenseController {
    fn on_notify(
        &self,
        source: NodeId,
        mask: NotifyMask,
        set: bool,
        _payload: Option<Rc<dyn Error + 'static>>,
    ) -> bool {
        if mask != NotifyMask::Loading {
            return false;
        }
        let (before, after) = {
            let mut waiting = self.waiting.borrow_mut();
            let before = waiting.len();
            if set {
                waiting.insert(source);
            } else {
                waiting.remove(&source);
            }
            (before, waiting.len())
        };
        tracing::trace!(source = source.raw(), set, pending = after, "suspense notify");
        self.pending.set(after);
        if !matches!(self.mode, SuspenseMode::ShowStale) {
            if before == 0 && after > 0 {
                scheduler::set_paused(self.queue.get(), true);
            } else if before > 0 && after == 0 {
                scheduler::set_paused(self.queue.get(), false);
            }
        }
        true
    }
}

/// Scope-installation handle for a suspense boundary.
pub struct SuspenseBoundary {
    owner: Owner,
    queue: Queue,
    controller: Rc<SuspenseController>,
}

impl SuspenseBoundary {
    /// Create a boundary under the current scope.
    ///
    /// The reactive waiting view lives outside the boundary (on the parent
    /// queue) so fallback rendering is never gated by the boundary itself.
    pub fn new(mode: SuspenseMode) -> Self {
        let pending = Signal::with_options(
            0usize,
            SignalOptions {
                name: Some("suspense-pending"),
                equality: Equality::strict(),
            },
        );
        let controller = Rc::new(SuspenseController {
            queue: Cell::new(scheduler::root_queue()),
            mode,
            waiting: RefCell::new(HashSet::new()),
            pending,
        });
        let queue = scheduler::create_queue(Some(controller.clone()));
        controller.queue.set(queue);
        scheduler::attach_child(owner::current_queue_id(), queue);

        let scope = owner::create_scope(Some(queue), false);
        let boundary_owner = Owner::from_id(scope);
        let _ = run_with_owner(boundary_owner, || {
            on_cleanup(move || scheduler::remove_queue(queue))
        });
        Self {
            owner: boundary_owner,
            queue: Queue::from_id(queue),
            controller,
        }
    }

    /// Run `f` inside the boundary's scope: cells created in `f` notify
    /// this boundary and their effects run on its child queue.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        run_with_owner(self.owner, f)
    }

    /// Reactive view: true while any descendant is waiting on data.
    pub fn is_loading(&self) -> bool {
        self.controller.pending.get() > 0
    }

    /// Reactive view: how many descendant cells are waiting.
    pub fn pending_count(&self) -> usize {
        self.controller.pending.get()
    }

    pub fn mode(&self) -> SuspenseMode {
        self.controller.mode
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn queue(&self) -> Queue {
        self.queue
    }

    /// Tear the boundary down: dispose the subtree and detach the queue.
    pub fn dispose(&self) {
        owner::dispose_owner(self.owner.id());
    }
}

impl fmt::Debug for SuspenseBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspenseBoundary")
            .field("mode", &self.controller.mode)
            .field("pending", &self.controller.waiting.borrow().len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Error boundary
// ----------------------------------------------------------------------------

struct ErrorController {
    captured: RefCell<Option<Rc<dyn Error + 'static>>>,
    errored: RefCell<HashSet<NodeId>>,
    error: Signal<Option<Rc<dyn Error + 'static>>>,
    on_error: Option<Rc<dyn Fn(Rc<dyn Error + 'static>)>>,
}

impl NotifyHandler for ErrorController {
    fn on_notify(
        &self,
        source: NodeId,
        mask: NotifyMask,
        set: bool,
        payload: Option<Rc<dyn Error + 'static>>,
    ) -> bool {
        if mask != NotifyMask::Error {
            return false;
        }
        if set {
            self.errored.borrow_mut().insert(source);
            let payload = payload.or_else(|| runtime::error_of(source));
            if let Some(payload) = payload {
                let first = self.captured.borrow().is_none();
                if first {
                    tracing::trace!(source = source.raw(), "error boundary captured");
                    *self.captured.borrow_mut() = Some(payload.clone());
                    self.error.set(Some(payload.clone()));
                    if let Some(on_error) = &self.on_error {
                        (&**on_error)(payload);
                    }
                }
            }
        } else {
            self.errored.borrow_mut().remove(&source);
        }
        true
    }
}

/// Scope-installation handle for an error boundary.
pub struct ErrorBoundary {
    owner: Owner,
    queue: Queue,
    controller: Rc<ErrorController>,
}

impl ErrorBoundary {
    /// Create a boundary under the current scope.
    pub fn new() -> Self {
        Self::with_handler_option(None)
    }

    /// Create a boundary that also invokes `on_error` on capture.
    pub fn with_handler(on_error: impl Fn(Rc<dyn Error + 'static>) + 'static) -> Self {
        Self::with_handler_option(Some(Rc::new(on_error)))
    }

    fn with_handler_option(on_error: Option<Rc<dyn Fn(Rc<dyn Error + 'static>)>>) -> Self {
        let error = Signal::with_options(
            None,
            SignalOptions {
                name: Some("error-boundary"),
                equality: Equality::by(
                    |a: &Option<Rc<dyn Error + 'static>>, b: &Option<Rc<dyn Error + 'static>>| {
                        match (a, b) {
                            (None, None) => true,
                            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
                            _ => false,
                        }
                    },
                ),
            },
        );
        let controller = Rc::new(ErrorController {
            captured: RefCell::new(None),
            errored: RefCell::new(HashSet::new()),
            error,
            on_error,
        });
        let queue = scheduler::create_queue(Some(controller.clone()));
        scheduler::attach_child(owner::current_queue_id(), queue);

        let scope = owner::create_scope(Some(queue), false);
        let boundary_owner = Owner::from_id(scope);
        let _ = run_with_owner(boundary_owner, || {
            on_cleanup(move || scheduler::remove_queue(queue))
        });
        Self {
            owner: boundary_owner,
            queue: Queue::from_id(queue),
            controller,
        }
    }

    /// Run `f` inside the boundary's scope.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        run_with_owner(self.owner, f)
    }

    /// Reactive view of the captured error, if any.
    pub fn error(&self) -> Option<Rc<dyn Error + 'static>> {
        self.controller.error.get()
    }

    /// Reactive view: true while an error is captured.
    pub fn has_error(&self) -> bool {
        self.error().is_some()
    }

    /// Clear the captured error and replay the subtree. Descendants
    /// recompute; the ones that now succeed drop their error bits.
    pub fn reset(&self) {
        *self.controller.captured.borrow_mut() = None;
        self.controller.error.set(None);
        for node in owner::subtree_nodes(self.owner.id()) {
            runtime::invalidate(node);
        }
        scheduler::request_flush();
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn queue(&self) -> Queue {
        self.queue
    }

    /// Tear the boundary down: dispose the subtree and detach the queue.
    pub fn dispose(&self) {
        owner::dispose_owner(self.owner.id());
    }
}

impl Default for ErrorBoundary {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ErrorBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorBoundary")
            .field("captured", &self.controller.captured.borrow().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Interrupt;
    use crate::graph::flush_sync;
    use crate::reactive::effect::{Effect, EffectOptions};
    use crate::reactive::memo::Memo;
    use crate::reactive::owner::create_root;
    use crate::reactive::signal::{Signal, Write};
    use std::cell::Cell as StdCell;

    #[test]
    fn suspense_tracks_waiting_descendants() {
        create_root(|root| {
            let data = Signal::new(0);
            data.write(Write::Unchanged, true);

            let boundary = SuspenseBoundary::new(SuspenseMode::ShowStale);
            let derived = boundary.run(|| {
                Memo::try_new({
                    let data = data.clone();
                    move |_| Ok(data.try_get()? + 1)
                })
            });
            assert!(derived.try_get().unwrap_err().is_not_ready());
            flush_sync();
            assert!(boundary.is_loading());
            assert_eq!(boundary.pending_count(), 1);

            data.write(Write::Value(1), false);
            flush_sync();
            // The memo is lazy: the waiting bit clears on the next pull.
            assert_eq!(derived.try_get().unwrap(), 2);
            assert!(!boundary.is_loading());
            root.dispose();
        });
    }

    #[test]
    fn hide_mode_gates_effects_until_resolved() {
        create_root(|root| {
            let data = Signal::new(0);
            data.write(Write::Unchanged, true);
            let calls = Rc::new(StdCell::new(0));

            let boundary = SuspenseBoundary::new(SuspenseMode::Hide);
            boundary.run(|| {
                let _effect = Effect::with_options(
                    None,
                    {
                        let data = data.clone();
                        move |_: Option<&i32>| data.try_get()
                    },
                    {
                        let calls = calls.clone();
                        move |_: &i32, _| calls.set(calls.get() + 1)
                    },
                    EffectOptions::default(),
                );
            });
            flush_sync();
            assert_eq!(calls.get(), 0);
            assert!(boundary.is_loading());

            data.write(Write::Value(5), false);
            flush_sync();
            assert_eq!(calls.get(), 1);
            assert!(!boundary.is_loading());
            root.dispose();
        });
    }

    #[test]
    fn transition_mode_retains_sibling_effects_until_quiescent() {
        create_root(|root| {
            let gate = Signal::new(0);
            gate.write(Write::Unchanged, true);
            let version = Signal::new(1);
            let seen = Rc::new(StdCell::new(0));

            let boundary = SuspenseBoundary::new(SuspenseMode::Transition);
            boundary.run(|| {
                // Keeps the boundary waiting until `gate` resolves.
                let _pending = Effect::with_options(
                    None,
                    {
                        let gate = gate.clone();
                        move |_: Option<&i32>| gate.try_get()
                    },
                    |_: &i32, _| {},
                    EffectOptions::default(),
                );
                // Unrelated sibling work: must not commit mid-transition.
                let _sibling = Effect::new(
                    {
                        let version = version.clone();
                        move || version.get()
                    },
                    {
                        let seen = seen.clone();
                        move |value: &i32, _| seen.set(*value)
                    },
                );
            });
            flush_sync();
            assert_eq!(seen.get(), 0);

            version.set(2);
            flush_sync();
            assert_eq!(seen.get(), 0);

            gate.write(Write::Value(1), false);
            flush_sync();
            // The retained work committed once, with the latest value.
            assert_eq!(seen.get(), 2);
            root.dispose();
        });
    }

    #[test]
    fn error_boundary_captures_and_resets() {
        #[derive(Debug, thiserror::Error)]
        #[error("subtree failed")]
        struct SubtreeFailed;

        create_root(|root| {
            let broken = Signal::new(true);
            let runs = Rc::new(StdCell::new(0));

            let boundary = ErrorBoundary::new();
            boundary.run(|| {
                let _effect = Effect::with_options(
                    None,
                    {
                        let broken = broken.clone();
                        move |_: Option<&i32>| {
                            if broken.try_get()? {
                                Err(Interrupt::failure(SubtreeFailed))
                            } else {
                                Ok(1)
                            }
                        }
                    },
                    {
                        let runs = runs.clone();
                        move |_: &i32, _| runs.set(runs.get() + 1)
                    },
                    EffectOptions::default(),
                );
            });
            flush_sync();
            assert!(boundary.has_error());
            assert_eq!(runs.get(), 0);

            broken.set(false);
            boundary.reset();
            flush_sync();
            assert!(!boundary.has_error());
            assert_eq!(runs.get(), 1);
            root.dispose();
        });
    }

    #[test]
    fn error_boundary_invokes_its_handler_on_capture() {
        #[derive(Debug, thiserror::Error)]
        #[error("boom")]
        struct Boom;

        create_root(|root| {
            let messages = Rc::new(RefCell::new(Vec::new()));
            let boundary = ErrorBoundary::with_handler({
                let messages = messages.clone();
                move |payload| messages.borrow_mut().push(payload.to_string())
            });
            boundary.run(|| {
                let _effect = Effect::with_options(
                    None,
                    |_: Option<&i32>| Err(Interrupt::failure(Boom)),
                    |_: &i32, _| {},
                    EffectOptions::default(),
                );
            });
            flush_sync();
            assert_eq!(*messages.borrow(), vec!["boom".to_string()]);
            root.dispose();
        });
    }
}
