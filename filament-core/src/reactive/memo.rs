//! Memo Implementation
//!
//! A Memo is a cached derived cell: it recomputes lazily, on read, and only
//! when a dependency actually changed.
//!
//! # How Memos Work
//!
//! 1. On first read the compute closure runs inside a tracking frame and
//!    the cells it reads become sources.
//!
//! 2. A write upstream marks the memo DIRTY (direct source) or CHECK
//!    (transitive). The next read re-validates: a CHECK memo updates its
//!    sources in recorded order and recomputes only if one of them really
//!    changed.
//!
//! 3. The equality predicate decides whether the new value counts as a
//!    change; unchanged results leave observers untouched.
//!
//! The compute closure receives the previous value and returns
//! `Result<T, Interrupt>`, so upstream waiting/error conditions propagate
//! with `?` and the memo enters the matching state itself.

use std::cell::RefCell;
use std::error::Error;
use std::fmt;
use std::rc::Rc;

use crate::errors::{Interrupt, NotReadyError};
use crate::graph::node::{self, CellBehavior, CellState, ComputeOutcome, NodeId, UpdateStatus};
use crate::graph::runtime;
use crate::graph::scheduler::{self, NotifyMask};

use super::owner::{self, OwnerId};
use super::signal::{Equality, SignalOptions};

// ----------------------------------------------------------------------------
// Shared derived-cell state
// ----------------------------------------------------------------------------

pub(crate) struct DerivedState<T> {
    value: RefCell<Option<T>>,
    #[allow(clippy::type_complexity)]
    compute: RefCell<Box<dyn FnMut(Option<&T>) -> Result<T, Interrupt>>>,
    equality: Equality<T>,
    scope: OwnerId,
}

impl<T> DerivedState<T> {
    pub(crate) fn cached(&self) -> Option<T>
    where
        T: Clone,
    {
        self.value.borrow().clone()
    }
}

pub(crate) struct DerivedBehavior<T: 'static> {
    state: Rc<DerivedState<T>>,
}

impl<T: 'static> CellBehavior for DerivedBehavior<T> {
    fn recompute(&self) -> ComputeOutcome {
        let state = &self.state;
        // Cleanups and cells from the previous run die before the next one.
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
                let changed = match value.as_ref() {
                    Some(previous) => !state.equality.test(previous, &next),
                    None => true,
                };
                if changed {
                    *value = Some(next);
                }
                ComputeOutcome::Value { changed }
            }
            Err(Interrupt::NotReady(_)) => ComputeOutcome::NotReady,
            Err(Interrupt::Failure(payload)) => ComputeOutcome::Failed(payload),
        }
    }

    fn after_update(&self, id: NodeId, status: UpdateStatus) {
        // Only the eager path lands here. A lazy memo reports its failure
        // when pulled; an eager cell reports it to its queue right away.
        if let UpdateStatus::Failed(payload) = status {
            let queue = runtime::queue_of_node(id).unwrap_or_else(scheduler::root_queue);
            scheduler::notify(queue, id, NotifyMask::Error, true, Some(payload));
        }
    }

    fn dispose(&self) {
        owner::dispose_owner(self.state.scope);
    }
}

/// Register a derived cell and its private scope. Shared by the lazy memo
/// and the eager computation.
pub(crate) fn create_derived<T: 'static>(
    initial: Option<T>,
    compute: impl FnMut(Option<&T>) -> Result<T, Interrupt> + 'static,
    options: SignalOptions<T>,
    eager: bool,
) -> (NodeId, Rc<DerivedState<T>>) {
    let scope = owner::create_scope(None, false);
    let state = Rc::new(DerivedState {
        value: RefCell::new(initial),
        compute: RefCell::new(Box::new(compute)),
        equality: options.equality,
        scope,
    });
    let mut flags = node::DERIVED | node::DIRTY;
    if eager {
        flags |= node::EAGER;
    }
    let id = runtime::register_node(
        flags,
        options.name,
        Some(Rc::new(DerivedBehavior {
            state: state.clone(),
        })),
        owner::current_queue_id(),
    );
    owner::adopt_node(id);
    (id, state)
}

/// Shared read path for derived handles.
pub(crate) fn read_derived<T: Clone + 'static>(
    id: NodeId,
    state: &DerivedState<T>,
) -> Result<T, Interrupt> {
    match runtime::read_status(id) {
        Ok(()) => state
            .value
            .borrow()
            .clone()
            .ok_or_else(|| Interrupt::from(NotReadyError)),
        Err(interrupt) => {
            if runtime::stale_reads_allowed() {
                if let Some(value) = state.value.borrow().clone() {
                    return Ok(value);
                }
            }
            Err(interrupt)
        }
    }
}

// ----------------------------------------------------------------------------
// Memo
// ----------------------------------------------------------------------------

/// A cached derived value that recomputes only when a dependency changed.
///
/// # Example
///
/// ```rust,ignore
/// let count = Signal::new(2);
/// let doubled = Memo::new({
///     let count = count.clone();
///     move || count.get() * 2
/// });
/// assert_eq!(doubled.get(), 4);
/// ```
pub struct Memo<T: 'static> {
    id: NodeId,
    state: Rc<DerivedState<T>>,
}

impl<T: 'static> Memo<T> {
    /// Create a memo from an infallible compute closure.
    pub fn new(mut compute: impl FnMut() -> T + 'static) -> Self
    where
        T: PartialEq,
    {
        Self::try_new(move |_| Ok(compute()))
    }

    /// Create a memo whose compute can propagate waiting/error conditions.
    /// The closure receives the previously cached value.
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
        let (id, state) = create_derived(initial, compute, options, false);
        Self { id, state }
    }

    /// The cell's graph identifier.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Read the value, recomputing if needed.
    ///
    /// Panics on a waiting or errored cell; use [`try_get`](Self::try_get)
    /// to observe those conditions.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        match self.try_get() {
            Ok(value) => value,
            Err(interrupt) => panic!("memo read failed: {interrupt}"),
        }
    }

    /// Read the value, or the cell's waiting/error condition.
    pub fn try_get(&self) -> Result<T, Interrupt>
    where
        T: Clone,
    {
        read_derived(self.id, &self.state)
    }

    /// The cached value, without tracking or recomputing.
    pub fn get_untracked(&self) -> Option<T>
    where
        T: Clone,
    {
        self.state.cached()
    }

    /// Current staleness, for introspection.
    pub fn state(&self) -> CellState {
        runtime::node_state(self.id).unwrap_or(CellState::Clean)
    }

    /// True while the waiting bit is set.
    pub fn is_loading(&self) -> bool {
        runtime::is_loading(self.id)
    }

    /// True while an error payload is stored.
    pub fn has_error(&self) -> bool {
        runtime::has_error(self.id)
    }

    /// The stored error payload, if any.
    pub fn error(&self) -> Option<Rc<dyn Error + 'static>> {
        runtime::error_of(self.id)
    }
}

impl<T: 'static> Clone for Memo<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            state: Rc::clone(&self.state),
        }
    }
}

impl<T: fmt::Debug + 'static> fmt::Debug for Memo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memo")
            .field("id", &self.id.raw())
            .field("value", &*self.state.value.borrow())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::flush_sync;
    use crate::reactive::signal::Signal;
    use std::cell::Cell;

    #[test]
    fn memo_computes_on_first_access() {
        let calls = Rc::new(Cell::new(0));
        let calls_in = calls.clone();
        let memo = Memo::new(move || {
            calls_in.set(calls_in.get() + 1);
            42
        });

        assert_eq!(calls.get(), 0);
        assert_eq!(memo.get(), 42);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn memo_caches_value_when_clean() {
        let calls = Rc::new(Cell::new(0));
        let calls_in = calls.clone();
        let memo = Memo::new(move || {
            calls_in.set(calls_in.get() + 1);
            42
        });

        assert_eq!(memo.get(), 42);
        assert_eq!(memo.get(), 42);
        assert_eq!(memo.get(), 42);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn memo_recomputes_after_source_write() {
        let source = Signal::new(1);
        let doubled = Memo::new({
            let source = source.clone();
            move || source.get() * 2
        });
        assert_eq!(doubled.get(), 2);

        source.set(2);
        flush_sync();
        assert_eq!(doubled.get(), 4);
    }

    #[test]
    fn memo_reads_are_consistent_before_flush() {
        let source = Signal::new(1);
        let doubled = Memo::new({
            let source = source.clone();
            move || source.get() * 2
        });
        assert_eq!(doubled.get(), 2);
        // A read between write and flush still sees settled values.
        source.set(5);
        assert_eq!(doubled.get(), 10);
    }

    #[test]
    fn memo_depends_on_memo() {
        let source = Signal::new(5);
        let doubled = Memo::new({
            let source = source.clone();
            move || source.get() * 2
        });
        let plus_ten = Memo::new({
            let doubled = doubled.clone();
            move || doubled.get() + 10
        });

        assert_eq!(doubled.get(), 10);
        assert_eq!(plus_ten.get(), 20);

        source.set(10);
        flush_sync();
        assert_eq!(doubled.get(), 20);
        assert_eq!(plus_ten.get(), 30);
    }

    #[test]
    fn equal_recompute_does_not_disturb_downstream() {
        let source = Signal::new(2);
        let parity = Memo::new({
            let source = source.clone();
            move || source.get() % 2
        });
        let calls = Rc::new(Cell::new(0));
        let downstream = Memo::new({
            let parity = parity.clone();
            let calls = calls.clone();
            move || {
                calls.set(calls.get() + 1);
                parity.get() + 100
            }
        });

        assert_eq!(downstream.get(), 100);
        assert_eq!(calls.get(), 1);

        // 2 -> 4 keeps parity 0: downstream must not recompute.
        source.set(4);
        flush_sync();
        assert_eq!(downstream.get(), 100);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn error_in_compute_is_stored_and_re_raised() {
        #[derive(Debug, thiserror::Error)]
        #[error("division by zero")]
        struct DivByZero;

        let source = Signal::new(0);
        let inverse = Memo::try_new({
            let source = source.clone();
            move |_| {
                let v = source.try_get()?;
                if v == 0 {
                    return Err(Interrupt::failure(DivByZero));
                }
                Ok(100 / v)
            }
        });

        let err = inverse.try_get().unwrap_err();
        assert_eq!(err.payload().unwrap().to_string(), "division by zero");
        assert!(inverse.has_error());

        // Downstream readers re-raise the same payload.
        let reader = Memo::try_new({
            let inverse = inverse.clone();
            move |_| Ok(inverse.try_get()? + 1)
        });
        let err = reader.try_get().unwrap_err();
        assert_eq!(err.payload().unwrap().to_string(), "division by zero");

        // A successful recompute clears the error.
        source.set(4);
        flush_sync();
        assert_eq!(inverse.try_get().unwrap(), 25);
        assert!(!inverse.has_error());
        assert_eq!(reader.try_get().unwrap(), 26);
    }

    #[test]
    fn not_ready_source_marks_memo_loading() {
        use crate::reactive::signal::Write;

        let source = Signal::new(1);
        source.write(Write::Unchanged, true);
        let derived = Memo::try_new({
            let source = source.clone();
            move |_| Ok(source.try_get()? * 2)
        });

        assert!(derived.try_get().unwrap_err().is_not_ready());
        assert!(derived.is_loading());

        source.write(Write::Value(21), false);
        flush_sync();
        assert_eq!(derived.try_get().unwrap(), 42);
        assert!(!derived.is_loading());
    }

    #[test]
    fn dropped_branch_source_is_unsubscribed() {
        let toggle = Signal::new(true);
        let a = Signal::new(1);
        let b = Signal::new(10);
        let calls = Rc::new(Cell::new(0));
        let pick = Memo::new({
            let toggle = toggle.clone();
            let a = a.clone();
            let b = b.clone();
            let calls = calls.clone();
            move || {
                calls.set(calls.get() + 1);
                if toggle.get() {
                    a.get()
                } else {
                    b.get()
                }
            }
        });

        assert_eq!(pick.get(), 1);
        assert_eq!(calls.get(), 1);

        toggle.set(false);
        flush_sync();
        assert_eq!(pick.get(), 10);
        assert_eq!(calls.get(), 2);

        // `a` is no longer a source: writing it must not recompute.
        a.set(2);
        flush_sync();
        assert_eq!(pick.get(), 10);
        assert_eq!(calls.get(), 2);
    }
}
