//! Reactive Primitives
//!
//! This module implements the typed surface of the runtime: signals, memos,
//! effects, ownership scopes, keyed context, boundaries, and the event-layer
//! contract.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A [`Signal`] is a container for mutable state. Reading it inside a
//! tracked computation registers a dependency; writing it marks dependents
//! stale and schedules a flush.
//!
//! ## Memos
//!
//! A [`Memo`] is a cached derived value. It recomputes lazily, on read, and
//! only when a dependency actually changed, so a burst of writes costs at
//! most one recomputation per flush.
//!
//! ## Effects
//!
//! An [`Effect`] splits into a tracked compute phase and a side-effecting
//! action phase. Actions run in the render or user slot of a flush,
//! strictly after the graph has settled.
//!
//! ## Owners and boundaries
//!
//! Every computation runs under an [`Owner`] scope carrying cleanups,
//! context, and a queue pointer. [`SuspenseBoundary`] and [`ErrorBoundary`]
//! install child queues that gate waiting and error propagation for their
//! subtree.

pub mod boundary;
pub mod context;
pub mod effect;
pub mod inspect;
pub mod memo;
pub mod owner;
pub mod signal;
pub mod subscriber;

pub use boundary::{ErrorBoundary, SuspenseBoundary, SuspenseMode};
pub use context::{create_context, get_context, has_context, set_context, Context};
pub use effect::{EagerComputation, Effect, EffectOptions, EffectTier, IntoCleanup};
pub use inspect::{
    current_clock, edges_consistent, flatten, get_observer, has_updated, is_pending, is_settled,
    latest, run_with_observer, untrack, ObserverRef, Readable,
};
pub use memo::Memo;
pub use owner::{
    create_root, get_owner, on_cleanup, on_error, run_with_owner, Owner, OwnerHandle, RootHandle,
};
pub use signal::{Equality, Signal, SignalOptions, Write};
pub use subscriber::{Emitter, Event, EventObserver, Handler};
