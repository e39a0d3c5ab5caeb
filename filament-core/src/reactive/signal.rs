//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive: a source cell holding a
//! value written from outside the graph.
//!
//! # How Signals Work
//!
//! 1. Reading a signal inside a tracked computation registers a dependency
//!    edge from the signal to that computation.
//!
//! 2. Writing a signal stores the value (unless the equality predicate says
//!    it is unchanged), marks dependents stale, and requests a flush.
//!
//! 3. A signal can also carry the waiting and error conditions: reads of a
//!    waiting cell raise [`NotReadyError`](crate::errors::NotReadyError),
//!    reads of an errored cell re-raise the stored payload. The
//!    [`Write::Unchanged`] sentinel flips those bits without touching the
//!    value.
//!
//! # Thread Model
//!
//! Handles share their state through `Rc` and are deliberately not `Send`;
//! the whole graph lives on one thread.

use std::cell::RefCell;
use std::error::Error;
use std::fmt;
use std::rc::Rc;

use crate::errors::Interrupt;
use crate::graph::node::{self, CellState, NodeId};
use crate::graph::runtime;

use super::owner;

// ----------------------------------------------------------------------------
// Equality
// ----------------------------------------------------------------------------

enum EqKind<T> {
    /// Every write counts as a change.
    Never,
    Predicate(Rc<dyn Fn(&T, &T) -> bool>),
}

/// Decides whether a newly produced value counts as a change.
///
/// The default is structural equality via `PartialEq`. `never` forces every
/// write/compute to notify; `by` installs a custom predicate.
pub struct Equality<T> {
    kind: EqKind<T>,
}

impl<T> Equality<T> {
    /// Structural equality via `PartialEq`.
    pub fn strict() -> Self
    where
        T: PartialEq,
    {
        Self {
            kind: EqKind::Predicate(Rc::new(|a: &T, b: &T| a == b)),
        }
    }

    /// Treat every value as changed.
    pub fn never() -> Self {
        Self { kind: EqKind::Never }
    }

    /// Custom predicate returning true when the two values are equal.
    pub fn by(predicate: impl Fn(&T, &T) -> bool + 'static) -> Self {
        Self {
            kind: EqKind::Predicate(Rc::new(predicate)),
        }
    }

    pub(crate) fn test(&self, previous: &T, next: &T) -> bool {
        match &self.kind {
            EqKind::Never => false,
            EqKind::Predicate(predicate) => (&**predicate)(previous, next),
        }
    }
}

impl<T> Clone for Equality<T> {
    fn clone(&self) -> Self {
        let kind = match &self.kind {
            EqKind::Never => EqKind::Never,
            EqKind::Predicate(predicate) => EqKind::Predicate(predicate.clone()),
        };
        Self { kind }
    }
}

// ----------------------------------------------------------------------------
// Write sentinel and options
// ----------------------------------------------------------------------------

/// Payload of a flag-carrying write.
///
/// `Unchanged` keeps the stored value and only updates the waiting bit;
/// it is a dedicated variant rather than an in-band magic value.
#[derive(Debug, Clone, Copy)]
pub enum Write<T> {
    Value(T),
    Unchanged,
}

/// Construction options shared by signals.
pub struct SignalOptions<T> {
    /// Debug name surfaced in diagnostics.
    pub name: Option<&'static str>,
    /// Change detection for writes.
    pub equality: Equality<T>,
}

impl<T: PartialEq> Default for SignalOptions<T> {
    fn default() -> Self {
        Self {
            name: None,
            equality: Equality::strict(),
        }
    }
}

// ----------------------------------------------------------------------------
// Signal
// ----------------------------------------------------------------------------

struct SignalState<T> {
    value: RefCell<T>,
    equality: Equality<T>,
}

/// A reactive source cell holding a value of type `T`.
///
/// # Example
///
/// ```rust,ignore
/// let count = Signal::new(0);
/// let value = count.get();
/// count.set(5); // dependents recompute on the next flush
/// ```
pub struct Signal<T: 'static> {
    id: NodeId,
    state: Rc<SignalState<T>>,
}

impl<T: 'static> Signal<T> {
    /// Create a signal with the given initial value.
    pub fn new(value: T) -> Self
    where
        T: PartialEq,
    {
        Self::with_options(value, SignalOptions::default())
    }

    /// Create a signal with an explicit equality predicate and debug name.
    pub fn with_options(value: T, options: SignalOptions<T>) -> Self {
        let state = Rc::new(SignalState {
            value: RefCell::new(value),
            equality: options.equality,
        });
        let id = runtime::register_node(
            node::SOURCE,
            options.name,
            None,
            owner::current_queue_id(),
        );
        owner::adopt_node(id);
        Self { id, state }
    }

    /// The cell's graph identifier.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Read the value, registering a dependency when tracking is active.
    ///
    /// Panics if the cell is in the waiting or error state; use
    /// [`try_get`](Self::try_get) to observe those conditions.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        match self.try_get() {
            Ok(value) => value,
            Err(interrupt) => panic!("signal read failed: {interrupt}"),
        }
    }

    /// Read the value, or the cell's waiting/error condition.
    ///
    /// Inside a compute closure, `?` on the result re-raises the condition
    /// in the reader, which is how it travels along observer edges.
    pub fn try_get(&self) -> Result<T, Interrupt>
    where
        T: Clone,
    {
        match runtime::read_status(self.id) {
            Ok(()) => Ok(self.state.value.borrow().clone()),
            Err(interrupt) => {
                if runtime::stale_reads_allowed() {
                    Ok(self.state.value.borrow().clone())
                } else {
                    Err(interrupt)
                }
            }
        }
    }

    /// Read the current value without registering a dependency.
    pub fn get_untracked(&self) -> T
    where
        T: Clone,
    {
        self.state.value.borrow().clone()
    }

    /// Store a new value, ending the waiting state if it was set.
    pub fn set(&self, value: T) {
        self.write(Write::Value(value), false);
    }

    /// Update the value from the current one.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let next = {
            let current = self.state.value.borrow();
            f(&current)
        };
        self.set(next);
    }

    /// Flag-carrying write.
    ///
    /// Stores the payload unless it is [`Write::Unchanged`] or the equality
    /// predicate reports no change, then sets the waiting bit to `loading`.
    /// Flag transitions propagate to observers even when the value is kept.
    pub fn write(&self, value: Write<T>, loading: bool) {
        let changed = match value {
            Write::Value(next) => {
                let mut current = self.state.value.borrow_mut();
                if self.state.equality.test(&current, &next) {
                    false
                } else {
                    *current = next;
                    true
                }
            }
            Write::Unchanged => false,
        };
        runtime::source_written(self.id, changed, Some(loading));
    }

    /// Put the cell into the error state; reads re-raise the payload until
    /// a later write stores a value again.
    pub fn set_error(&self, error: impl Error + 'static) {
        runtime::source_error(self.id, Rc::new(error));
    }

    /// Mark every observer stale as if the value had changed.
    pub fn notify(&self) {
        runtime::force_notify(self.id);
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

impl<T: 'static> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            state: Rc::clone(&self.state),
        }
    }
}

impl<T: fmt::Debug + 'static> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
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

    #[test]
    fn signal_get_and_set() {
        let signal = Signal::new(0);
        assert_eq!(signal.get(), 0);

        signal.set(42);
        assert_eq!(signal.get(), 42);
    }

    #[test]
    fn signal_update() {
        let signal = Signal::new(10);
        signal.update(|v| v + 5);
        assert_eq!(signal.get(), 15);
    }

    #[test]
    fn signal_clone_shares_state() {
        let signal1 = Signal::new(0);
        let signal2 = signal1.clone();

        signal1.set(42);
        assert_eq!(signal2.get(), 42);

        signal2.set(100);
        assert_eq!(signal1.get(), 100);
    }

    #[test]
    fn signal_ids_are_unique() {
        let s1 = Signal::new(0);
        let s2 = Signal::new(0);
        assert_ne!(s1.id(), s2.id());
    }

    #[test]
    fn unchanged_write_keeps_value_but_flips_loading() {
        let signal = Signal::new(7);
        signal.write(Write::Unchanged, true);
        assert!(signal.is_loading());
        assert_eq!(signal.get_untracked(), 7);

        let read = signal.try_get();
        assert!(matches!(read, Err(Interrupt::NotReady(_))));

        signal.write(Write::Value(8), false);
        assert!(!signal.is_loading());
        assert_eq!(signal.try_get().unwrap(), 8);
    }

    #[test]
    fn set_error_shadows_reads_until_next_write() {
        #[derive(Debug, thiserror::Error)]
        #[error("backend unavailable")]
        struct Backend;

        let signal = Signal::new(1);
        signal.set_error(Backend);
        assert!(signal.has_error());
        let err = signal.try_get().unwrap_err();
        assert_eq!(err.payload().unwrap().to_string(), "backend unavailable");

        signal.set(2);
        flush_sync();
        assert!(!signal.has_error());
        assert_eq!(signal.get(), 2);
    }

    #[test]
    fn custom_equality_gates_writes() {
        // Compare only the first tuple field.
        let signal = Signal::with_options(
            (1, "a"),
            SignalOptions {
                name: Some("pair"),
                equality: Equality::by(|a: &(i32, &str), b: &(i32, &str)| a.0 == b.0),
            },
        );
        signal.set((1, "b"));
        // Equal per predicate: the stored value is kept.
        assert_eq!(signal.get(), (1, "a"));
        signal.set((2, "b"));
        assert_eq!(signal.get(), (2, "b"));
    }

    #[test]
    fn never_equality_always_counts_as_changed() {
        let signal = Signal::with_options(
            0,
            SignalOptions {
                name: None,
                equality: Equality::never(),
            },
        );
        signal.set(0);
        assert_eq!(signal.state(), CellState::Dirty);
        flush_sync();
        assert_eq!(signal.state(), CellState::Clean);
    }
}
