//! Introspection
//!
//! Escape hatches over the tracking machinery: reading without
//! registering, probing for staleness or pending state, reading through
//! error/waiting conditions, and transplanting the observer slot across
//! resumptions.

use crate::errors::Interrupt;
use crate::graph::node::NodeId;
use crate::graph::runtime;

use super::effect::EagerComputation;
use super::memo::Memo;
use super::signal::Signal;

/// Read the value of a reactive cell inside a tracked scope.
///
/// The seam shared by [`Signal`], [`Memo`] and [`EagerComputation`];
/// combinators like [`flatten`] accept any of them through it.
pub trait Readable<T> {
    fn read(&self) -> Result<T, Interrupt>;
}

impl<T: Clone + 'static> Readable<T> for Signal<T> {
    fn read(&self) -> Result<T, Interrupt> {
        self.try_get()
    }
}

impl<T: Clone + 'static> Readable<T> for Memo<T> {
    fn read(&self) -> Result<T, Interrupt> {
        self.try_get()
    }
}

impl<T: Clone + 'static> Readable<T> for EagerComputation<T> {
    fn read(&self) -> Result<T, Interrupt> {
        self.try_get()
    }
}

/// Run `f` without registering dependencies on the current computation.
pub fn untrack<T>(f: impl FnOnce() -> T) -> T {
    runtime::untracked(f)
}

/// Handle to the currently executing computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverRef {
    id: NodeId,
}

/// The computation currently tracking reads, if any.
pub fn get_observer() -> Option<ObserverRef> {
    runtime::observer().map(|id| ObserverRef { id })
}

/// Run `f` with `observer` installed as the tracking computation.
///
/// Reads made by `f` are appended to the observer's existing dependencies;
/// nothing is removed. Together with
/// [`Owner::capture`](super::Owner::capture) this is the async-resumption
/// path: a computation keeps collecting dependencies after ceding to the
/// host.
pub fn run_with_observer<T>(observer: ObserverRef, f: impl FnOnce() -> T) -> T {
    runtime::with_observer_extend(observer.id, f)
}

/// True when any cell read by `f` changed in the most recent flush.
pub fn has_updated<T>(f: impl FnOnce() -> T) -> bool {
    let (_, reads) = runtime::capture_reads(f);
    let clock = runtime::clock();
    reads
        .into_iter()
        .any(|id| runtime::updated_at(id) == Some(clock))
}

/// True when evaluating `f` hits a waiting cell.
///
/// With `include_self`, a computation that is itself in the waiting state
/// also reports pending.
pub fn is_pending<T>(f: impl FnOnce() -> Result<T, Interrupt>, include_self: bool) -> bool {
    if matches!(f(), Err(Interrupt::NotReady(_))) {
        return true;
    }
    if include_self {
        if let Some(observer) = runtime::observer() {
            return runtime::is_loading(observer);
        }
    }
    false
}

/// Evaluate `f` reading through waiting/error conditions: cells hand out
/// their last good value instead of raising. Only a cell that never
/// produced a value still propagates its condition.
pub fn latest<T>(f: impl FnOnce() -> Result<T, Interrupt>) -> Result<T, Interrupt> {
    runtime::with_stale_reads(f)
}

/// Memoize a nested reactive read: `f` picks a cell, the memo tracks both
/// the picking and the picked cell's value.
pub fn flatten<T, S, F>(mut f: F) -> Memo<T>
where
    T: Clone + PartialEq + 'static,
    S: Readable<T>,
    F: FnMut() -> S + 'static,
{
    Memo::try_new(move |_| f().read())
}

/// True when no live cell is marked stale. Holds after `flush_sync`
/// settles every observed cell.
pub fn is_settled() -> bool {
    runtime::is_settled()
}

/// Diagnostics: verify that every dependency edge is recorded on both of
/// its endpoints.
pub fn edges_consistent() -> bool {
    runtime::edges_consistent()
}

/// The current value of the batch clock.
pub fn current_clock() -> u64 {
    runtime::clock()
}
