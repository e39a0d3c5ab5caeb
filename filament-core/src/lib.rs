//! Filament Core
//!
//! This crate provides the core runtime for the Filament fine-grained
//! reactive framework. It implements:
//!
//! - Reactive primitives (signals, memos, effects) with dependency tracking
//! - A batched scheduler with pure/render/user phases and a global clock
//! - Ownership scopes with LIFO cleanup, keyed context, and error handlers
//! - Suspense and error boundaries gating waiting/error propagation
//!
//! The runtime is single-threaded cooperative: all state lives in
//! thread-local storage, handles are `Rc`-based, and there are no locks or
//! atomics. Hosts integrate through two hooks: a microtask primitive
//! ([`set_flush_hook`]) that schedules [`flush_sync`] after the current
//! synchronous region, and an unhandled-error sink ([`set_error_hook`]).
//!
//! # Architecture
//!
//! The crate is organized into two modules:
//!
//! - `graph`: the untyped dependency graph, update protocol, and scheduler
//! - `reactive`: the typed public primitives layered on top
//!
//! # Example
//!
//! ```rust,ignore
//! use filament_core::{Effect, Memo, Signal, flush_sync};
//!
//! let count = Signal::new(0);
//! let doubled = Memo::new({
//!     let count = count.clone();
//!     move || count.get() * 2
//! });
//! let _effect = Effect::new(
//!     { let doubled = doubled.clone(); move || doubled.get() },
//!     |value, _prev| println!("doubled is {value}"),
//! );
//!
//! flush_sync(); // prints "doubled is 0"
//! count.set(5);
//! flush_sync(); // prints "doubled is 10"
//! ```

pub mod errors;
pub mod graph;
pub mod reactive;

pub use errors::{ContextNotFoundError, Interrupt, NoOwnerError, NotReadyError};
pub use graph::{
    batch, clear_error_hook, clear_flush_hook, flush_sync, set_error_hook, set_flush_hook,
    CellState, NodeId, NotifyHandler, NotifyMask, Queue, QueueSlot,
};
pub use reactive::{
    create_context, create_root, current_clock, edges_consistent, flatten, get_context,
    get_observer, get_owner, has_context, has_updated, is_pending, is_settled, latest, on_cleanup,
    on_error,
    run_with_observer, run_with_owner, set_context, untrack, Context, EagerComputation, Effect,
    EffectOptions, EffectTier, Emitter, Equality, ErrorBoundary, Event, EventObserver, Handler,
    IntoCleanup, Memo, ObserverRef, Owner, OwnerHandle, Readable, RootHandle, Signal,
    SignalOptions, SuspenseBoundary, SuspenseMode, Write,
};
