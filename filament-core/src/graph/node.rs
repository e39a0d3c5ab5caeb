//! Graph Nodes
//!
//! This module defines the cell records that live in the dependency graph.
//!
//! A cell is either a source (a signal holding externally written state) or
//! a computation (a derived value or an effect). The graph stores the
//! untyped half of every cell: its state bits, its ordered edge lists, and
//! an erased recompute hook. The typed half (the value, the equality
//! predicate, the compute closure) lives behind the public handle and is
//! reached through the hook.

use std::cell::Cell;
use std::error::Error;
use std::fmt;
use std::rc::Rc;

use smallvec::SmallVec;

use super::scheduler::QueueId;

// ----------------------------------------------------------------------------
// State bits
// ----------------------------------------------------------------------------

/// Cell is a source signal (written from outside, never recomputed).
pub(crate) const SOURCE: u32 = 1 << 0;

/// Cell is a derived computation (has a compute hook).
pub(crate) const DERIVED: u32 = 1 << 1;

/// Cell is eager: it is always considered observed and recomputes during
/// the pure phase of a flush instead of waiting for a read.
pub(crate) const EAGER: u32 = 1 << 2;

/// A transitive upstream cell changed; this cell may still prove equal.
pub(crate) const CHECK: u32 = 1 << 3;

/// The cell is known out-of-date and must recompute before the next read.
pub(crate) const DIRTY: u32 = 1 << 4;

/// An upstream cell is waiting on data; the stored value is the last one.
pub(crate) const LOADING: u32 = 1 << 5;

/// The cell holds an error payload that shadows value reads.
pub(crate) const ERROR: u32 = 1 << 6;

/// The cell's compute is on the stack right now. Re-entry is a cycle.
pub(crate) const RUNNING: u32 = 1 << 7;

/// An eager cell already has a pending pure-phase task this batch.
pub(crate) const QUEUED: u32 = 1 << 8;

/// Mask clearing the staleness bits (CHECK, DIRTY).
pub(crate) const STATUS_MASK: u32 = !(CHECK | DIRTY);

/// Staleness of a cell, as seen by introspection.
///
/// `Clean` means the stored value is current. `Check` means an upstream cell
/// was marked but this cell may still prove equal without recomputing.
/// `Dirty` means recomputation is required before the next read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    /// The cached value is up-to-date.
    Clean,
    /// A dependency might have changed; needs re-validation.
    Check,
    /// The cell definitely needs to recompute.
    Dirty,
}

impl CellState {
    pub(crate) fn from_flags(flags: u32) -> Self {
        if flags & DIRTY != 0 {
            CellState::Dirty
        } else if flags & CHECK != 0 {
            CellState::Check
        } else {
            CellState::Clean
        }
    }
}

// ----------------------------------------------------------------------------
// Identifiers
// ----------------------------------------------------------------------------

thread_local! {
    static NODE_ID_COUNTER: Cell<u64> = const { Cell::new(0) };
}

/// Unique identifier for a cell in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique cell ID on this thread.
    pub(crate) fn next() -> Self {
        NODE_ID_COUNTER.with(|counter| {
            let id = counter.get();
            counter.set(id + 1);
            Self(id)
        })
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

// ----------------------------------------------------------------------------
// Behavior hook
// ----------------------------------------------------------------------------

/// Result of running a cell's compute closure once.
pub(crate) enum ComputeOutcome {
    /// The compute produced a value; `changed` is the equality verdict.
    Value { changed: bool },
    /// The compute read a cell that is still waiting on data.
    NotReady,
    /// The compute failed; the payload is stored on the cell.
    Failed(Rc<dyn Error + 'static>),
}

/// Result of driving a cell through its update protocol.
#[derive(Clone)]
pub(crate) enum UpdateStatus {
    /// Nothing to do, or the value proved equal to the previous one.
    Unchanged,
    /// The cell recomputed to a new value.
    Changed,
    /// The cell entered (or stayed in) the waiting state.
    NotReady,
    /// The cell's compute failed with this payload.
    Failed(Rc<dyn Error + 'static>),
}

/// The typed half of a cell, reached from the untyped graph record.
///
/// Implementations live next to the public handles (`Memo`, `Effect`); the
/// graph drives them without knowing the value type.
pub(crate) trait CellBehavior {
    /// Run the compute closure once. Tracking is already set up by the
    /// caller: reads made inside self-register on the active frame.
    fn recompute(&self) -> ComputeOutcome;

    /// Called after a pure-phase task updated the cell. Effects use this to
    /// enqueue their side-effecting half or to route a compute failure.
    fn after_update(&self, _id: NodeId, _status: UpdateStatus) {}

    /// Called when the cell is released from the graph.
    fn dispose(&self) {}
}

// ----------------------------------------------------------------------------
// Node record
// ----------------------------------------------------------------------------

/// The untyped graph record of a cell.
///
/// `sources` is ordered by first-read-during-the-last-compute; `observers`
/// is kept in insertion order. Both directions are maintained together so
/// edge integrity is an invariant: `a` appears in `b.sources` exactly when
/// `b` appears in `a.observers`.
pub(crate) struct Node {
    pub(crate) flags: u32,
    pub(crate) name: Option<&'static str>,
    pub(crate) created_at: u64,
    pub(crate) updated_at: u64,
    pub(crate) sources: SmallVec<[NodeId; 4]>,
    pub(crate) observers: SmallVec<[NodeId; 4]>,
    pub(crate) behavior: Option<Rc<dyn CellBehavior>>,
    pub(crate) error: Option<Rc<dyn Error + 'static>>,
    pub(crate) queue: QueueId,
}

impl Node {
    pub(crate) fn new(
        flags: u32,
        name: Option<&'static str>,
        behavior: Option<Rc<dyn CellBehavior>>,
        queue: QueueId,
        created_at: u64,
    ) -> Self {
        Self {
            flags,
            name,
            created_at,
            updated_at: created_at,
            sources: SmallVec::new(),
            observers: SmallVec::new(),
            behavior,
            error: None,
            queue,
        }
    }

    pub(crate) fn state(&self) -> CellState {
        CellState::from_flags(self.flags)
    }

    /// Label used in diagnostics; falls back to the raw id.
    pub(crate) fn label(&self, id: NodeId) -> String {
        match self.name {
            Some(name) => name.to_string(),
            None => format!("cell#{}", id.raw()),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("loading", &(self.flags & LOADING != 0))
            .field("error", &(self.flags & ERROR != 0))
            .field("sources", &self.sources.len())
            .field("observers", &self.observers.len())
            .field("created_at", &self.created_at)
            .finish()
    }
}
