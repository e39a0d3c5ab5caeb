//! Dependency Graph
//!
//! This module implements the reactive dependency graph and its scheduler.
//!
//! # Overview
//!
//! The graph is a DAG of cells where:
//!
//! - Nodes are sources (signals) or computations (memos, effects)
//! - Edges are dependencies: a cell observed during a tracked compute
//!   becomes a source of the computing cell
//!
//! Writes push staleness marks down the observer edges; reads pull cells
//! back up to date on demand. The scheduler batches the eager half of that
//! work into flushes with a pure fixed point followed by two effect phases.
//!
//! # Design Decisions
//!
//! 1. The graph is centralized in a thread-local registry keyed by cell ID
//!    rather than distributed through the handles. This keeps edge
//!    reconciliation and disposal in one place and makes the bidirectional
//!    edge invariant checkable.
//!
//! 2. The typed half of each cell (value, equality, compute closure) stays
//!    behind its public handle; the registry reaches it through an erased
//!    behavior hook. Graph algorithms never know the value type.
//!
//! 3. The whole module assumes a single thread: no locks, no atomics, and
//!    registry borrows are never held across user closures.

pub(crate) mod node;
pub(crate) mod runtime;
pub(crate) mod scheduler;

pub use node::{CellState, NodeId};
pub use scheduler::{
    batch, clear_error_hook, clear_flush_hook, flush_sync, set_error_hook, set_flush_hook,
    NotifyHandler, NotifyMask, Queue, QueueSlot,
};
