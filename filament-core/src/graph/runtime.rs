//! Graph Runtime
//!
//! The runtime is the central coordinator for the dependency graph. It owns
//! the thread-local cell registry, the currently-tracking observer slot, the
//! global clock, and the update protocol that drives cells from CHECK/DIRTY
//! back to CLEAN.
//!
//! # How updates flow
//!
//! 1. A write stores the new value, marks the source DIRTY, marks its direct
//!    observers DIRTY and their observers CHECK, and requests a flush.
//!
//! 2. A read of a non-clean cell pulls it up to date first. A CHECK cell
//!    re-validates its sources in recorded order and recomputes only if one
//!    of them actually changed; otherwise the CHECK bit is dropped and the
//!    cached value stands.
//!
//! 3. Recomputation runs inside a tracking frame: reads self-register on the
//!    frame, and afterwards the cell's source edges are reconciled against
//!    what was actually read this time.
//!
//! This push-pull split is what makes reads glitch-free: within a flush a
//! cell recomputes at most once and always observes settled sources.
//!
//! # Single-thread contract
//!
//! Everything here lives in thread-local storage; there are no locks and no
//! atomics. Registry borrows are never held across user code (compute
//! closures, effect bodies, cleanups), which is what makes re-entrant graph
//! operations from inside those closures safe.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::error::Error;
use std::mem;
use std::rc::Rc;

use smallvec::SmallVec;

use super::node::{
    CellBehavior, CellState, Node, NodeId, UpdateStatus, CHECK, DIRTY, EAGER, ERROR, LOADING,
    QUEUED, RUNNING, STATUS_MASK,
};
use super::scheduler::{self, NotifyMask, QueueId, QueueSlot};
use crate::errors::{Interrupt, NotReadyError};

thread_local! {
    static GRAPH: Graph = Graph::new();
}

/// Thread-local graph state.
struct Graph {
    /// All live cells, keyed by ID.
    nodes: RefCell<HashMap<NodeId, Node>>,
    /// The currently executing computation, to which reads attach.
    observer: Cell<Option<NodeId>>,
    /// Tentative source list of the active tracking frame, in read order.
    reads: RefCell<Vec<NodeId>>,
    /// Stack of read-capture frames used by introspection.
    probes: RefCell<Vec<Vec<NodeId>>>,
    /// Depth of `latest` scopes: reads return stale values instead of
    /// raising while this is non-zero.
    stale_depth: Cell<u32>,
    /// Monotonic batch clock; advances once per flush that performed work.
    clock: Cell<u64>,
    /// Source cells written since the last flush settled them.
    written: RefCell<Vec<NodeId>>,
}

impl Graph {
    fn new() -> Self {
        Self {
            nodes: RefCell::new(HashMap::new()),
            observer: Cell::new(None),
            reads: RefCell::new(Vec::new()),
            probes: RefCell::new(Vec::new()),
            stale_depth: Cell::new(0),
            clock: Cell::new(0),
            written: RefCell::new(Vec::new()),
        }
    }
}

/// Run `f` on the node record, if it is still live.
///
/// The registry stays borrowed while `f` runs, so `f` must not call back
/// into user code.
fn with_node<R>(id: NodeId, f: impl FnOnce(&mut Node) -> R) -> Option<R> {
    GRAPH.with(|g| g.nodes.borrow_mut().get_mut(&id).map(f))
}

// ----------------------------------------------------------------------------
// Registration and release
// ----------------------------------------------------------------------------

pub(crate) fn register_node(
    flags: u32,
    name: Option<&'static str>,
    behavior: Option<Rc<dyn CellBehavior>>,
    queue: QueueId,
) -> NodeId {
    let id = NodeId::next();
    GRAPH.with(|g| {
        let node = Node::new(flags, name, behavior, queue, g.clock.get());
        g.nodes.borrow_mut().insert(id, node);
    });
    id
}

/// Remove a cell from the graph, detaching its edges in both directions and
/// running its behavior's dispose hook (effect cleanups) afterwards.
pub(crate) fn release_node(id: NodeId) {
    let removed = GRAPH.with(|g| {
        let mut nodes = g.nodes.borrow_mut();
        let node = nodes.remove(&id)?;
        for source in node.sources.iter() {
            if let Some(record) = nodes.get_mut(source) {
                record.observers.retain(|observer| *observer != id);
            }
        }
        for observer in node.observers.iter() {
            if let Some(record) = nodes.get_mut(observer) {
                record.sources.retain(|source| *source != id);
            }
        }
        Some(node)
    });
    if let Some(node) = removed {
        if let Some(behavior) = node.behavior {
            behavior.dispose();
        }
    }
}

pub(crate) fn node_exists(id: NodeId) -> bool {
    GRAPH.with(|g| g.nodes.borrow().contains_key(&id))
}

// ----------------------------------------------------------------------------
// Introspection accessors
// ----------------------------------------------------------------------------

pub(crate) fn node_state(id: NodeId) -> Option<CellState> {
    with_node(id, |n| n.state())
}

pub(crate) fn is_loading(id: NodeId) -> bool {
    with_node(id, |n| n.flags & LOADING != 0).unwrap_or(false)
}

pub(crate) fn has_error(id: NodeId) -> bool {
    with_node(id, |n| n.flags & ERROR != 0).unwrap_or(false)
}

pub(crate) fn error_of(id: NodeId) -> Option<Rc<dyn Error + 'static>> {
    with_node(id, |n| n.error.clone()).flatten()
}

pub(crate) fn updated_at(id: NodeId) -> Option<u64> {
    with_node(id, |n| n.updated_at)
}

pub(crate) fn queue_of_node(id: NodeId) -> Option<QueueId> {
    with_node(id, |n| n.queue)
}

pub(crate) fn observer() -> Option<NodeId> {
    GRAPH.with(|g| g.observer.get())
}

pub(crate) fn clock() -> u64 {
    GRAPH.with(|g| g.clock.get())
}

pub(crate) fn bump_clock() {
    GRAPH.with(|g| g.clock.set(g.clock.get() + 1));
}

/// True when no live cell is marked CHECK or DIRTY.
pub(crate) fn is_settled() -> bool {
    GRAPH.with(|g| {
        g.nodes
            .borrow()
            .values()
            .all(|node| node.flags & (CHECK | DIRTY) == 0)
    })
}

/// Edge integrity check used by tests: every edge is recorded on both ends.
pub(crate) fn edges_consistent() -> bool {
    GRAPH.with(|g| {
        let nodes = g.nodes.borrow();
        nodes.iter().all(|(id, node)| {
            node.sources.iter().all(|source| {
                nodes
                    .get(source)
                    .map(|record| record.observers.contains(id))
                    .unwrap_or(false)
            }) && node.observers.iter().all(|observer| {
                nodes
                    .get(observer)
                    .map(|record| record.sources.contains(id))
                    .unwrap_or(false)
            })
        })
    })
}

// ----------------------------------------------------------------------------
// Tracking
// ----------------------------------------------------------------------------

/// Record a read of `id` on the active tracking frame, if any.
pub(crate) fn track(id: NodeId) {
    GRAPH.with(|g| {
        if let Some(observer) = g.observer.get() {
            if observer != id {
                g.reads.borrow_mut().push(id);
            }
        }
        if let Some(frame) = g.probes.borrow_mut().last_mut() {
            frame.push(id);
        }
    });
}

/// Guard that restores the tracking frame (and clears the RUNNING bit of
/// the computing cell) even if the compute unwinds.
struct FrameGuard {
    running: Option<NodeId>,
    prev_observer: Option<NodeId>,
    prev_reads: Vec<NodeId>,
}

impl FrameGuard {
    fn enter(observer: Option<NodeId>, running: Option<NodeId>) -> Self {
        let prev_observer = GRAPH.with(|g| g.observer.replace(observer));
        let prev_reads = GRAPH.with(|g| mem::take(&mut *g.reads.borrow_mut()));
        Self {
            running,
            prev_observer,
            prev_reads,
        }
    }

    /// Take the reads collected so far in this frame.
    fn collect(&self) -> Vec<NodeId> {
        GRAPH.with(|g| mem::take(&mut *g.reads.borrow_mut()))
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        GRAPH.with(|g| {
            g.observer.set(self.prev_observer);
            *g.reads.borrow_mut() = mem::take(&mut self.prev_reads);
        });
        if let Some(id) = self.running {
            with_node(id, |n| n.flags &= !RUNNING);
        }
    }
}

/// Run `f` with no tracking observer installed.
pub(crate) fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let _guard = FrameGuard::enter(None, None);
    f()
}

/// Run `f` with `id` installed as the observer, then append what was read
/// to `id`'s existing source set without removing anything.
///
/// This is the resumption path: a computation that continues collecting
/// dependencies after ceding to the host keeps the edges it already had.
pub(crate) fn with_observer_extend<R>(id: NodeId, f: impl FnOnce() -> R) -> R {
    let guard = FrameGuard::enter(Some(id), None);
    let result = f();
    let reads = guard.collect();
    drop(guard);
    extend_sources(id, reads);
    result
}

/// Run `f` while recording every cell it reads, tracked or not.
pub(crate) fn capture_reads<R>(f: impl FnOnce() -> R) -> (R, Vec<NodeId>) {
    struct ProbeGuard;
    impl Drop for ProbeGuard {
        fn drop(&mut self) {
            GRAPH.with(|g| {
                g.probes.borrow_mut().pop();
            });
        }
    }
    GRAPH.with(|g| g.probes.borrow_mut().push(Vec::new()));
    let guard = ProbeGuard;
    let result = f();
    let reads = GRAPH.with(|g| {
        g.probes
            .borrow_mut()
            .last_mut()
            .map(mem::take)
            .unwrap_or_default()
    });
    drop(guard);
    (result, reads)
}

pub(crate) fn stale_reads_allowed() -> bool {
    GRAPH.with(|g| g.stale_depth.get() > 0)
}

/// Run `f` with stale reads allowed: cells with LOADING or ERROR set hand
/// out their last good value instead of raising.
pub(crate) fn with_stale_reads<R>(f: impl FnOnce() -> R) -> R {
    struct StaleGuard;
    impl Drop for StaleGuard {
        fn drop(&mut self) {
            GRAPH.with(|g| g.stale_depth.set(g.stale_depth.get() - 1));
        }
    }
    GRAPH.with(|g| g.stale_depth.set(g.stale_depth.get() + 1));
    let _guard = StaleGuard;
    f()
}

// ----------------------------------------------------------------------------
// Reads
// ----------------------------------------------------------------------------

/// Register the read and bring the cell up to date, then report its
/// LOADING/ERROR condition. The typed handle clones the value out (or falls
/// back to its last good value under a stale-read scope).
pub(crate) fn read_status(id: NodeId) -> Result<(), Interrupt> {
    track(id);
    read_status_untracked(id)
}

pub(crate) fn read_status_untracked(id: NodeId) -> Result<(), Interrupt> {
    let Some(flags) = with_node(id, |n| n.flags) else {
        // Released cell: the handle still holds the last value.
        return Ok(());
    };
    if flags & (CHECK | DIRTY) != 0 {
        update_node(id);
    }
    let Some((flags, error)) = with_node(id, |n| (n.flags, n.error.clone())) else {
        return Ok(());
    };
    if flags & ERROR != 0 {
        if let Some(payload) = error {
            return Err(Interrupt::Failure(payload));
        }
    }
    if flags & LOADING != 0 {
        return Err(NotReadyError.into());
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Writes and marking
// ----------------------------------------------------------------------------

/// Commit a write on a source cell.
///
/// `changed` reports the equality verdict made by the typed handle;
/// `loading` optionally overwrites the LOADING bit. Flag propagation runs
/// even when the value is kept (the UNCHANGED path).
pub(crate) fn source_written(id: NodeId, changed: bool, loading: Option<bool>) {
    let stamp = clock() + 1;
    let mut loading_transition = None;
    let mut cleared_error = false;
    let queue = with_node(id, |n| {
        if changed {
            n.flags |= DIRTY;
            n.updated_at = stamp;
            if n.flags & ERROR != 0 {
                n.flags &= !ERROR;
                n.error = None;
                cleared_error = true;
            }
        }
        if let Some(on) = loading {
            let was = n.flags & LOADING != 0;
            if was != on {
                if on {
                    n.flags |= LOADING;
                } else {
                    n.flags &= !LOADING;
                }
                loading_transition = Some(on);
            }
        }
        n.queue
    });
    let Some(queue) = queue else { return };
    if changed {
        GRAPH.with(|g| g.written.borrow_mut().push(id));
    }
    if cleared_error {
        scheduler::notify(queue, id, NotifyMask::Error, false, None);
    }
    if let Some(on) = loading_transition {
        scheduler::notify(queue, id, NotifyMask::Loading, on, None);
    }
    if changed || loading_transition.is_some() || cleared_error {
        propagate_change(id);
        scheduler::request_flush();
    }
}

/// Put a source cell into the error state.
pub(crate) fn source_error(id: NodeId, payload: Rc<dyn Error + 'static>) {
    let mut was_loading = false;
    let queue = with_node(id, |n| {
        was_loading = n.flags & LOADING != 0;
        n.flags &= !LOADING;
        n.flags |= ERROR;
        n.error = Some(payload.clone());
        n.queue
    });
    let Some(queue) = queue else { return };
    if was_loading {
        scheduler::notify(queue, id, NotifyMask::Loading, false, None);
    }
    scheduler::notify(queue, id, NotifyMask::Error, true, Some(payload));
    propagate_change(id);
    scheduler::request_flush();
}

/// Mark every observer stale as if the cell had changed, without touching
/// the value. The notification hook of the event layer.
pub(crate) fn force_notify(id: NodeId) {
    propagate_change(id);
    scheduler::request_flush();
}

/// Mark a computation DIRTY and reschedule it if eager. Used when a
/// boundary replays its subtree.
pub(crate) fn invalidate(id: NodeId) {
    let Some((is_computation, eager, queued)) = with_node(id, |n| {
        (
            n.behavior.is_some(),
            n.flags & EAGER != 0,
            n.flags & QUEUED != 0,
        )
    }) else {
        return;
    };
    if !is_computation {
        return;
    }
    with_node(id, |n| n.flags |= DIRTY);
    if eager && !queued {
        schedule_eager(id);
    }
}

/// Mark the direct observers of a cell DIRTY (the cell is an input to
/// their computation) and their transitive observers CHECK.
fn propagate_change(id: NodeId) {
    let observers = with_node(id, |n| n.observers.clone()).unwrap_or_default();
    for observer in observers {
        mark_node(observer, true);
    }
}

fn mark_node(id: NodeId, dirty: bool) {
    let Some((newly_marked, eager, queued)) = with_node(id, |n| {
        let prev_status = n.flags & (CHECK | DIRTY);
        if dirty {
            n.flags |= DIRTY;
        } else {
            n.flags |= CHECK;
        }
        (
            prev_status == 0,
            n.flags & EAGER != 0,
            n.flags & QUEUED != 0,
        )
    }) else {
        return;
    };
    if eager && !queued {
        schedule_eager(id);
    }
    if newly_marked {
        let observers = with_node(id, |n| n.observers.clone()).unwrap_or_default();
        for observer in observers {
            mark_node(observer, false);
        }
    }
}

/// Enqueue the pure-phase task that updates an eager cell.
pub(crate) fn schedule_eager(id: NodeId) {
    let Some(queue) = with_node(id, |n| {
        n.flags |= QUEUED;
        n.queue
    }) else {
        return;
    };
    scheduler::enqueue_task(queue, QueueSlot::Pure, Box::new(move || run_eager_task(id)));
    scheduler::request_flush();
}

fn run_eager_task(id: NodeId) {
    let Some(behavior) = with_node(id, |n| {
        n.flags &= !QUEUED;
        n.behavior.clone()
    })
    .flatten() else {
        return;
    };
    let status = update_node(id);
    behavior.after_update(id, status);
}

/// Clear the staleness bits of sources written this batch. Runs after the
/// pure fixed point so the settled graph carries no DIRTY/CHECK marks.
pub(crate) fn settle_sources() -> usize {
    GRAPH.with(|g| {
        let written = mem::take(&mut *g.written.borrow_mut());
        let mut nodes = g.nodes.borrow_mut();
        let count = written.len();
        for id in written {
            if let Some(node) = nodes.get_mut(&id) {
                node.flags &= STATUS_MASK;
            }
        }
        count
    })
}

// ----------------------------------------------------------------------------
// Update protocol
// ----------------------------------------------------------------------------

/// Drive a cell from CHECK/DIRTY back to CLEAN.
pub(crate) fn update_node(id: NodeId) -> UpdateStatus {
    let Some((flags, label)) = with_node(id, |n| (n.flags, n.label(id))) else {
        return UpdateStatus::Unchanged;
    };
    if flags & RUNNING != 0 {
        panic!("cycle detected in reactive graph: {label} reads itself while computing");
    }
    if flags & (CHECK | DIRTY) == 0 {
        return UpdateStatus::Unchanged;
    }

    let has_behavior = with_node(id, |n| n.behavior.is_some()).unwrap_or(false);
    if !has_behavior {
        // A marked source settles by accepting its already-committed value.
        with_node(id, |n| n.flags &= STATUS_MASK);
        return UpdateStatus::Unchanged;
    }

    if flags & DIRTY == 0 {
        // CHECK only: re-validate sources in recorded order. A source that
        // actually changed marks this cell DIRTY through propagation, at
        // which point re-validation can stop early.
        let sources = with_node(id, |n| n.sources.clone()).unwrap_or_default();
        for source in sources {
            update_node(source);
            if with_node(id, |n| n.flags & DIRTY != 0).unwrap_or(false) {
                break;
            }
        }
    }

    let Some(flags) = with_node(id, |n| n.flags) else {
        return UpdateStatus::Unchanged;
    };
    if flags & DIRTY != 0 {
        run_compute(id)
    } else {
        // Every source proved equal; the cached value stands.
        with_node(id, |n| n.flags &= !CHECK);
        UpdateStatus::Unchanged
    }
}

fn run_compute(id: NodeId) -> UpdateStatus {
    let Some(behavior) = with_node(id, |n| n.behavior.clone()).flatten() else {
        return UpdateStatus::Unchanged;
    };
    with_node(id, |n| n.flags |= RUNNING);
    tracing::trace!(cell = id.raw(), "recompute");

    let guard = FrameGuard::enter(Some(id), Some(id));
    let outcome = behavior.recompute();
    let reads = guard.collect();
    drop(guard);
    reconcile_sources(id, reads);

    let stamp = clock() + 1;
    let Some((had_loading, had_error, eager, queue)) = with_node(id, |n| {
        (
            n.flags & LOADING != 0,
            n.flags & ERROR != 0,
            n.flags & EAGER != 0,
            n.queue,
        )
    }) else {
        return UpdateStatus::Unchanged;
    };

    match outcome {
        super::node::ComputeOutcome::Value { changed } => {
            with_node(id, |n| {
                n.flags &= STATUS_MASK;
                n.flags &= !(LOADING | ERROR);
                n.error = None;
                if changed {
                    n.updated_at = stamp;
                }
            });
            if had_loading {
                scheduler::notify(queue, id, NotifyMask::Loading, false, None);
            }
            if had_error {
                scheduler::notify(queue, id, NotifyMask::Error, false, None);
            }
            if changed || had_loading || had_error {
                propagate_change(id);
            }
            if changed {
                UpdateStatus::Changed
            } else {
                UpdateStatus::Unchanged
            }
        }
        super::node::ComputeOutcome::NotReady => {
            with_node(id, |n| {
                n.flags &= STATUS_MASK;
                n.flags |= LOADING;
            });
            if !had_loading {
                scheduler::notify(queue, id, NotifyMask::Loading, true, None);
                propagate_change(id);
            }
            UpdateStatus::NotReady
        }
        super::node::ComputeOutcome::Failed(payload) => {
            with_node(id, |n| {
                n.flags &= STATUS_MASK;
                n.flags &= !LOADING;
                n.flags |= ERROR;
                n.error = Some(payload.clone());
            });
            if had_loading {
                scheduler::notify(queue, id, NotifyMask::Loading, false, None);
            }
            if !eager {
                // Eager cells route their failure through their own handler
                // chain in `after_update`.
                scheduler::notify(queue, id, NotifyMask::Error, true, Some(payload.clone()));
            }
            propagate_change(id);
            UpdateStatus::Failed(payload)
        }
    }
}

// ----------------------------------------------------------------------------
// Edge reconciliation
// ----------------------------------------------------------------------------

/// Replace a cell's source list with what it read this compute, updating
/// observer lists on both the dropped and the added sources.
fn reconcile_sources(id: NodeId, reads: Vec<NodeId>) {
    GRAPH.with(|g| {
        let mut nodes = g.nodes.borrow_mut();
        let mut next: SmallVec<[NodeId; 4]> = SmallVec::new();
        for read in reads {
            if !next.contains(&read) && nodes.contains_key(&read) {
                next.push(read);
            }
        }
        let Some(node) = nodes.get_mut(&id) else { return };
        let prev = mem::replace(&mut node.sources, next.clone());
        for source in prev.iter() {
            if !next.contains(source) {
                if let Some(record) = nodes.get_mut(source) {
                    record.observers.retain(|observer| *observer != id);
                }
            }
        }
        for source in next.iter() {
            if !prev.contains(source) {
                if let Some(record) = nodes.get_mut(source) {
                    if !record.observers.contains(&id) {
                        record.observers.push(id);
                    }
                }
            }
        }
    });
}

/// Append-only variant of reconciliation used by `with_observer_extend`.
fn extend_sources(id: NodeId, reads: Vec<NodeId>) {
    GRAPH.with(|g| {
        let mut nodes = g.nodes.borrow_mut();
        let Some(node) = nodes.get(&id) else { return };
        let existing = node.sources.clone();
        let mut added: SmallVec<[NodeId; 4]> = SmallVec::new();
        for read in reads {
            if !existing.contains(&read) && !added.contains(&read) && nodes.contains_key(&read) {
                added.push(read);
            }
        }
        for source in added.iter() {
            if let Some(record) = nodes.get_mut(source) {
                if !record.observers.contains(&id) {
                    record.observers.push(id);
                }
            }
        }
        if let Some(node) = nodes.get_mut(&id) {
            node.sources.extend(added);
        }
    });
}
