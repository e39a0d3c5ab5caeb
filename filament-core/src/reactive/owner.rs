//! Ownership Scopes
//!
//! Owners form a tree of scopes rooted at a user-created root. Every scope
//! carries:
//!
//! - an ordered cleanup stack interleaving cleanup closures, child scopes,
//!   and the cells created under it,
//! - a context map for identity-keyed values,
//! - an optional error handler,
//! - a pointer to the queue responsible for the scope (the nearest
//!   boundary's child queue, or the root queue).
//!
//! Disposing a scope pops its stack in LIFO order, so the most recently
//! registered cleanup runs first and child scopes die before anything that
//! was registered before them. After disposal further registrations are
//! rejected.
//!
//! Computations own a private scope that is reset before every run; that is
//! what gives `on_cleanup` inside a compute its run-to-run lifetime.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::rc::Rc;

use crate::errors::NoOwnerError;
use crate::graph::node::NodeId;
use crate::graph::runtime as graph;
use crate::graph::scheduler::{self, QueueId};

thread_local! {
    static OWNERS: OwnerTree = OwnerTree::new();
    static OWNER_ID_COUNTER: Cell<u64> = const { Cell::new(0) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct OwnerId(u64);

impl OwnerId {
    fn next() -> Self {
        OWNER_ID_COUNTER.with(|counter| {
            let id = counter.get();
            counter.set(id + 1);
            Self(id)
        })
    }
}

/// One slot on a scope's cleanup stack.
enum Entry {
    Cleanup(Box<dyn FnOnce()>),
    Child(OwnerId),
    Node(NodeId),
}

struct OwnerRecord {
    parent: Option<OwnerId>,
    entries: Vec<Entry>,
    context: HashMap<u64, Rc<dyn Any>>,
    error_handler: Option<Rc<dyn Fn(Rc<dyn Error + 'static>)>>,
    queue: QueueId,
    disposed: bool,
}

struct OwnerTree {
    records: RefCell<HashMap<OwnerId, OwnerRecord>>,
    current: Cell<Option<OwnerId>>,
}

impl OwnerTree {
    fn new() -> Self {
        Self {
            records: RefCell::new(HashMap::new()),
            current: Cell::new(None),
        }
    }
}

// ----------------------------------------------------------------------------
// Internal scope machinery
// ----------------------------------------------------------------------------

/// Create a scope under the current owner. `queue` overrides the inherited
/// queue pointer (boundaries do this); `detached` roots have no parent.
pub(crate) fn create_scope(queue: Option<QueueId>, detached: bool) -> OwnerId {
    let id = OwnerId::next();
    OWNERS.with(|tree| {
        let parent = if detached { None } else { tree.current.get() };
        let inherited = parent.and_then(|p| {
            tree.records
                .borrow()
                .get(&p)
                .map(|record| record.queue)
        });
        let record = OwnerRecord {
            parent,
            entries: Vec::new(),
            context: HashMap::new(),
            error_handler: None,
            queue: queue
                .or(inherited)
                .unwrap_or_else(scheduler::root_queue),
            disposed: false,
        };
        tree.records.borrow_mut().insert(id, record);
        if let Some(parent) = parent {
            if let Some(parent_record) = tree.records.borrow_mut().get_mut(&parent) {
                parent_record.entries.push(Entry::Child(id));
            }
        }
    });
    id
}

/// Guard installing a scope as the current owner; restores on drop.
pub(crate) struct ScopeGuard {
    prev: Option<OwnerId>,
}

pub(crate) fn enter_scope(id: OwnerId) -> ScopeGuard {
    let prev = OWNERS.with(|tree| tree.current.replace(Some(id)));
    ScopeGuard { prev }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        OWNERS.with(|tree| tree.current.set(self.prev));
    }
}

fn pop_entry(id: OwnerId) -> Option<Entry> {
    OWNERS.with(|tree| {
        tree.records
            .borrow_mut()
            .get_mut(&id)
            .and_then(|record| record.entries.pop())
    })
}

fn run_entry(entry: Entry) {
    match entry {
        Entry::Cleanup(cleanup) => cleanup(),
        Entry::Child(child) => dispose_owner(child),
        Entry::Node(node) => graph::release_node(node),
    }
}

/// Drain a computation scope before its next run: cleanups fire, inner
/// scopes and cells die, the context map resets. The scope stays alive.
pub(crate) fn reset_scope(id: OwnerId) {
    while let Some(entry) = pop_entry(id) {
        run_entry(entry);
    }
    OWNERS.with(|tree| {
        if let Some(record) = tree.records.borrow_mut().get_mut(&id) {
            record.context.clear();
        }
    });
}

/// Dispose a scope: mark it, drain the stack LIFO, then drop the record.
pub(crate) fn dispose_owner(id: OwnerId) {
    let parent = OWNERS.with(|tree| {
        let mut records = tree.records.borrow_mut();
        match records.get_mut(&id) {
            Some(record) if !record.disposed => {
                record.disposed = true;
                Some(record.parent)
            }
            _ => None,
        }
    });
    let Some(parent) = parent else { return };
    while let Some(entry) = pop_entry(id) {
        run_entry(entry);
    }
    OWNERS.with(|tree| {
        tree.records.borrow_mut().remove(&id);
        if tree.current.get() == Some(id) {
            tree.current.set(parent);
        }
    });
}

pub(crate) fn current_owner_id() -> Option<OwnerId> {
    OWNERS.with(|tree| tree.current.get())
}

/// The queue new cells should land on: the current owner's, or the root.
pub(crate) fn current_queue_id() -> QueueId {
    OWNERS.with(|tree| {
        tree.current
            .get()
            .and_then(|id| tree.records.borrow().get(&id).map(|record| record.queue))
            .unwrap_or_else(scheduler::root_queue)
    })
}

/// Register a cell on the current owner so disposal releases it.
pub(crate) fn adopt_node(id: NodeId) {
    OWNERS.with(|tree| {
        if let Some(owner) = tree.current.get() {
            if let Some(record) = tree.records.borrow_mut().get_mut(&owner) {
                if !record.disposed {
                    record.entries.push(Entry::Node(id));
                }
            }
        }
    });
}

/// Nearest error handler at or above the given scope.
pub(crate) fn error_handler_for(id: OwnerId) -> Option<Rc<dyn Fn(Rc<dyn Error + 'static>)>> {
    OWNERS.with(|tree| {
        let records = tree.records.borrow();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let record = records.get(&current)?;
            if let Some(handler) = &record.error_handler {
                return Some(handler.clone());
            }
            cursor = record.parent;
        }
        None
    })
}

/// Context lookup walking the owner chain from the current scope.
pub(crate) fn context_lookup(key: u64) -> Option<Rc<dyn Any>> {
    OWNERS.with(|tree| {
        let records = tree.records.borrow();
        let mut cursor = tree.current.get();
        while let Some(current) = cursor {
            let record = records.get(&current)?;
            if let Some(value) = record.context.get(&key) {
                return Some(value.clone());
            }
            cursor = record.parent;
        }
        None
    })
}

/// Write a context value on the current scope only.
pub(crate) fn context_insert(key: u64, value: Rc<dyn Any>) -> Result<(), NoOwnerError> {
    OWNERS.with(|tree| {
        let Some(owner) = tree.current.get() else {
            return Err(NoOwnerError);
        };
        let mut records = tree.records.borrow_mut();
        match records.get_mut(&owner) {
            Some(record) if !record.disposed => {
                record.context.insert(key, value);
                Ok(())
            }
            _ => Err(NoOwnerError),
        }
    })
}

/// Every cell registered in the subtree of a scope, in registration order.
pub(crate) fn subtree_nodes(id: OwnerId) -> Vec<NodeId> {
    let mut nodes = Vec::new();
    let mut stack = vec![id];
    OWNERS.with(|tree| {
        let records = tree.records.borrow();
        while let Some(owner) = stack.pop() {
            if let Some(record) = records.get(&owner) {
                for entry in record.entries.iter() {
                    match entry {
                        Entry::Node(node) => nodes.push(*node),
                        Entry::Child(child) => stack.push(*child),
                        Entry::Cleanup(_) => {}
                    }
                }
            }
        }
    });
    nodes
}

// ----------------------------------------------------------------------------
// Public surface
// ----------------------------------------------------------------------------

/// Handle to an ownership scope.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    id: OwnerId,
}

impl Owner {
    pub(crate) fn from_id(id: OwnerId) -> Self {
        Self { id }
    }

    pub(crate) fn id(&self) -> OwnerId {
        self.id
    }

    /// True once the scope has been disposed.
    pub fn is_disposed(&self) -> bool {
        OWNERS.with(|tree| !tree.records.borrow().contains_key(&self.id))
    }

    /// Capture this scope for an async resumption.
    ///
    /// The returned handle re-enters the scope later; once the scope is
    /// disposed the handle turns into a no-op, so writes made after disposal
    /// are discarded.
    pub fn capture(&self) -> OwnerHandle {
        let aborted = Rc::new(Cell::new(false));
        let flag = aborted.clone();
        let registered = OWNERS.with(|tree| {
            let mut records = tree.records.borrow_mut();
            match records.get_mut(&self.id) {
                Some(record) if !record.disposed => {
                    record
                        .entries
                        .push(Entry::Cleanup(Box::new(move || flag.set(true))));
                    true
                }
                _ => false,
            }
        });
        if !registered {
            aborted.set(true);
        }
        OwnerHandle {
            owner: *self,
            aborted,
        }
    }
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Owner")
            .field("id", &self.id.0)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// A captured scope for resuming work after ceding to the host.
#[derive(Clone)]
pub struct OwnerHandle {
    owner: Owner,
    aborted: Rc<Cell<bool>>,
}

impl OwnerHandle {
    /// True once the captured scope was disposed.
    pub fn is_aborted(&self) -> bool {
        self.aborted.get()
    }

    /// Re-enter the captured scope and run `f`, or return `None` if the
    /// scope has been disposed in the meantime.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        if self.aborted.get() {
            return None;
        }
        Some(run_with_owner(self.owner, f))
    }
}

/// Disposer returned to a `create_root` callback.
#[derive(Clone, Copy)]
pub struct RootHandle {
    owner: Owner,
}

impl RootHandle {
    /// The root scope itself.
    pub fn owner(&self) -> Owner {
        self.owner
    }

    /// Dispose the root and everything created under it, in LIFO order.
    pub fn dispose(&self) {
        dispose_owner(self.owner.id);
    }
}

/// Create a detached root scope and run `f` under it.
///
/// The root owns the global queue and has no parent; it lives until the
/// handle passed to `f` disposes it.
pub fn create_root<T>(f: impl FnOnce(RootHandle) -> T) -> T {
    let id = create_scope(None, true);
    let _guard = enter_scope(id);
    f(RootHandle {
        owner: Owner::from_id(id),
    })
}

/// The owner of the currently running scope, if any.
pub fn get_owner() -> Option<Owner> {
    current_owner_id().map(Owner::from_id)
}

/// Run `f` with `owner` installed as the current scope.
pub fn run_with_owner<T>(owner: Owner, f: impl FnOnce() -> T) -> T {
    let _guard = enter_scope(owner.id);
    f()
}

/// Install an error handler on the current scope.
///
/// The nearest handler up the owner chain receives compute failures from
/// the effects it owns, before the queue notification walk runs.
pub fn on_error(
    handler: impl Fn(Rc<dyn Error + 'static>) + 'static,
) -> Result<(), NoOwnerError> {
    OWNERS.with(|tree| {
        let Some(owner) = tree.current.get() else {
            return Err(NoOwnerError);
        };
        let mut records = tree.records.borrow_mut();
        match records.get_mut(&owner) {
            Some(record) if !record.disposed => {
                record.error_handler = Some(Rc::new(handler));
                Ok(())
            }
            _ => Err(NoOwnerError),
        }
    })
}

/// Register a cleanup on the current scope. Cleanups run in LIFO order when
/// the scope is disposed (or, for computation scopes, before the next run).
pub fn on_cleanup(f: impl FnOnce() + 'static) -> Result<(), NoOwnerError> {
    OWNERS.with(|tree| {
        let Some(owner) = tree.current.get() else {
            return Err(NoOwnerError);
        };
        let mut records = tree.records.borrow_mut();
        match records.get_mut(&owner) {
            Some(record) if !record.disposed => {
                record.entries.push(Entry::Cleanup(Box::new(f)));
                Ok(())
            }
            _ => Err(NoOwnerError),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn cleanups_run_in_lifo_order() {
        let order = Rc::new(StdRefCell::new(Vec::new()));
        create_root(|root| {
            let a = order.clone();
            on_cleanup(move || a.borrow_mut().push("a")).unwrap();
            let b = order.clone();
            on_cleanup(move || b.borrow_mut().push("b")).unwrap();
            root.dispose();
        });
        assert_eq!(*order.borrow(), vec!["b", "a"]);
    }

    #[test]
    fn child_scopes_die_before_earlier_parent_cleanups() {
        let order = Rc::new(StdRefCell::new(Vec::new()));
        create_root(|root| {
            let first = order.clone();
            on_cleanup(move || first.borrow_mut().push("parent-first")).unwrap();
            let child = create_scope(None, false);
            {
                let _guard = enter_scope(child);
                let inner = order.clone();
                on_cleanup(move || inner.borrow_mut().push("child")).unwrap();
            }
            let last = order.clone();
            on_cleanup(move || last.borrow_mut().push("parent-last")).unwrap();
            root.dispose();
        });
        assert_eq!(*order.borrow(), vec!["parent-last", "child", "parent-first"]);
    }

    #[test]
    fn registrations_after_disposal_are_rejected() {
        let handle = create_root(|root| root);
        handle.dispose();
        let result = run_with_owner(handle.owner(), || on_cleanup(|| {}));
        assert!(result.is_err());
    }

    #[test]
    fn on_cleanup_without_owner_errors() {
        assert!(on_cleanup(|| {}).is_err());
    }

    #[test]
    fn captured_owner_aborts_after_disposal() {
        let handle = create_root(|root| (root, root.owner().capture()).1);
        assert!(!handle.is_aborted());
        assert_eq!(handle.run(|| 42), Some(42));
        // Dispose through a fresh root handle over the same owner.
        dispose_owner(handle.owner.id);
        assert!(handle.is_aborted());
        assert_eq!(handle.run(|| 42), None);
    }

    #[test]
    fn get_owner_reflects_scope_nesting() {
        assert!(get_owner().is_none() || get_owner().is_some());
        create_root(|root| {
            let current = get_owner().expect("root scope should be current");
            assert_eq!(current, root.owner());
            root.dispose();
        });
    }
}
