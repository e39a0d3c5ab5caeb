//! Flush Scheduler
//!
//! The scheduler owns the tree of task queues and the flush loop that
//! drains them. Every flush has three phases:
//!
//! 1. **Pure** — recompute marked eager cells until no pure work remains
//!    anywhere in the tree (the fixed point). Effects run their tracked
//!    compute here and enqueue their side-effecting half for later.
//! 2. **Render** — side effects meant to update a view synchronously.
//! 3. **User** — everything else, strictly after render.
//!
//! The clock advances between the pure fixed point and the render phase, so
//! every effect of one flush observes the same settled graph.
//!
//! Boundaries hang child queues off the tree. A child queue can be paused:
//! its effect phases return immediately and retain their work, while pure
//! work keeps running so the gated subtree still computes. Resuming forwards
//! the retained work to the parent so it commits on a single flush.
//!
//! Queues also carry the notification walk: when a cell's LOADING or ERROR
//! bit transitions, its queue is notified and the notification climbs the
//! tree until a handler (a boundary) absorbs it.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::error::Error;
use std::mem;
use std::rc::Rc;

use super::node::NodeId;
use super::runtime;

/// Upper bound on flush repetitions before the runtime assumes an effect is
/// writing to its own sources and aborts with a diagnostic.
const LOOP_LIMIT: usize = 100_000;

thread_local! {
    static SCHEDULER: Scheduler = Scheduler::new();
    static QUEUE_ID_COUNTER: Cell<u64> = const { Cell::new(0) };
}

/// Unique identifier for a queue in the scheduler tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(u64);

impl QueueId {
    fn next() -> Self {
        QUEUE_ID_COUNTER.with(|counter| {
            let id = counter.get();
            counter.set(id + 1);
            Self(id)
        })
    }
}

/// The three ordered task slots of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSlot {
    /// Recomputation work; drained to a fixed point first.
    Pure = 0,
    /// Synchronous view updates; run right after the clock advances.
    Render = 1,
    /// Post-render side effects.
    User = 2,
}

/// The state-bit a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyMask {
    /// The source cell entered or left the waiting state.
    Loading,
    /// The source cell stored or cleared an error payload.
    Error,
}

/// Installed on a boundary queue to intercept notifications from its
/// subtree. Returning `true` absorbs the notification; `false` lets it
/// climb to the parent queue.
pub trait NotifyHandler {
    fn on_notify(
        &self,
        source: NodeId,
        mask: NotifyMask,
        set: bool,
        payload: Option<Rc<dyn Error + 'static>>,
    ) -> bool;
}

pub(crate) type Task = Box<dyn FnOnce()>;

struct QueueRecord {
    parent: Option<QueueId>,
    children: Vec<QueueId>,
    slots: [Vec<Task>; 3],
    paused: bool,
    handler: Option<Rc<dyn NotifyHandler>>,
}

impl QueueRecord {
    fn new(handler: Option<Rc<dyn NotifyHandler>>) -> Self {
        Self {
            parent: None,
            children: Vec::new(),
            slots: [Vec::new(), Vec::new(), Vec::new()],
            paused: false,
            handler,
        }
    }
}

struct Scheduler {
    queues: RefCell<HashMap<QueueId, QueueRecord>>,
    root: QueueId,
    flushing: Cell<bool>,
    pending: Cell<bool>,
    batch_depth: Cell<u32>,
    flush_hook: RefCell<Option<Rc<dyn Fn()>>>,
    error_hook: RefCell<Option<Rc<dyn Fn(Rc<dyn Error + 'static>)>>>,
}

impl Scheduler {
    fn new() -> Self {
        let root = QueueId::next();
        let mut queues = HashMap::new();
        queues.insert(root, QueueRecord::new(None));
        Self {
            queues: RefCell::new(queues),
            root,
            flushing: Cell::new(false),
            pending: Cell::new(false),
            batch_depth: Cell::new(0),
            flush_hook: RefCell::new(None),
            error_hook: RefCell::new(None),
        }
    }
}

// ----------------------------------------------------------------------------
// Queue management
// ----------------------------------------------------------------------------

pub(crate) fn root_queue() -> QueueId {
    SCHEDULER.with(|s| s.root)
}

pub(crate) fn create_queue(handler: Option<Rc<dyn NotifyHandler>>) -> QueueId {
    let id = QueueId::next();
    SCHEDULER.with(|s| {
        s.queues.borrow_mut().insert(id, QueueRecord::new(handler));
    });
    id
}

/// Attach `child` under `parent`. A queue belongs to at most one parent for
/// its lifetime; re-attachment is a programming error.
pub(crate) fn attach_child(parent: QueueId, child: QueueId) {
    SCHEDULER.with(|s| {
        let mut queues = s.queues.borrow_mut();
        if let Some(record) = queues.get(&child) {
            if record.parent.is_some() {
                panic!("queue is already attached to a parent; multi-parent attachment is not supported");
            }
        }
        if let Some(record) = queues.get_mut(&child) {
            record.parent = Some(parent);
        }
        if let Some(record) = queues.get_mut(&parent) {
            if !record.children.contains(&child) {
                record.children.push(child);
            }
        }
    });
}

pub(crate) fn detach_child(parent: QueueId, child: QueueId) {
    SCHEDULER.with(|s| {
        let mut queues = s.queues.borrow_mut();
        if let Some(record) = queues.get_mut(&parent) {
            record.children.retain(|c| *c != child);
        }
        if let Some(record) = queues.get_mut(&child) {
            record.parent = None;
        }
    });
}

/// Remove a queue and its whole subtree from the scheduler.
pub(crate) fn remove_queue(queue: QueueId) {
    let parent = SCHEDULER.with(|s| s.queues.borrow().get(&queue).and_then(|r| r.parent));
    if let Some(parent) = parent {
        detach_child(parent, queue);
    }
    let mut stack = vec![queue];
    while let Some(id) = stack.pop() {
        let children = SCHEDULER.with(|s| {
            s.queues
                .borrow_mut()
                .remove(&id)
                .map(|record| record.children)
                .unwrap_or_default()
        });
        stack.extend(children);
    }
}

pub(crate) fn set_paused(queue: QueueId, paused: bool) {
    if paused {
        SCHEDULER.with(|s| {
            if let Some(record) = s.queues.borrow_mut().get_mut(&queue) {
                record.paused = true;
            }
        });
        return;
    }
    // Resuming forwards retained effect work to the parent queue so the
    // whole deferred batch commits on a single flush.
    SCHEDULER.with(|s| {
        let mut queues = s.queues.borrow_mut();
        let moved = {
            let Some(record) = queues.get_mut(&queue) else {
                return;
            };
            record.paused = false;
            match record.parent {
                Some(parent) => {
                    let render = mem::take(&mut record.slots[QueueSlot::Render as usize]);
                    let user = mem::take(&mut record.slots[QueueSlot::User as usize]);
                    Some((parent, render, user))
                }
                None => None,
            }
        };
        if let Some((parent, render, user)) = moved {
            if let Some(record) = queues.get_mut(&parent) {
                record.slots[QueueSlot::Render as usize].extend(render);
                record.slots[QueueSlot::User as usize].extend(user);
            }
        }
    });
    request_flush();
}

pub(crate) fn is_paused(queue: QueueId) -> bool {
    SCHEDULER.with(|s| {
        s.queues
            .borrow()
            .get(&queue)
            .map(|record| record.paused)
            .unwrap_or(false)
    })
}

// ----------------------------------------------------------------------------
// Scheduling
// ----------------------------------------------------------------------------

pub(crate) fn enqueue_task(queue: QueueId, slot: QueueSlot, task: Task) {
    SCHEDULER.with(|s| {
        let mut queues = s.queues.borrow_mut();
        // Fall back to the root queue if the boundary queue is gone.
        let target = if queues.contains_key(&queue) {
            queue
        } else {
            s.root
        };
        if let Some(record) = queues.get_mut(&target) {
            record.slots[slot as usize].push(task);
        }
    });
}

/// Record that a flush is needed and raise the host reschedule hook, unless
/// a flush is already running or a batch is holding writes back.
pub(crate) fn request_flush() {
    let hook = SCHEDULER.with(|s| {
        if s.pending.replace(true) {
            return None;
        }
        if s.flushing.get() || s.batch_depth.get() > 0 {
            return None;
        }
        s.flush_hook.borrow().clone()
    });
    if let Some(hook) = hook {
        (&*hook)();
    }
}

/// Walk a cell's LOADING/ERROR transition up the queue tree. Returns true
/// when some boundary absorbed it.
pub(crate) fn notify(
    queue: QueueId,
    source: NodeId,
    mask: NotifyMask,
    set: bool,
    payload: Option<Rc<dyn Error + 'static>>,
) -> bool {
    let (handler, parent) = SCHEDULER.with(|s| {
        s.queues
            .borrow()
            .get(&queue)
            .map(|record| (record.handler.clone(), record.parent))
            .unwrap_or((None, None))
    });
    if let Some(handler) = handler {
        if handler.on_notify(source, mask, set, payload.clone()) {
            return true;
        }
    }
    match parent {
        Some(parent) => notify(parent, source, mask, set, payload),
        None => false,
    }
}

/// Deliver an error nothing absorbed: the host hook if one is installed,
/// otherwise abort the flush.
pub(crate) fn report_error(payload: Rc<dyn Error + 'static>) {
    let hook = SCHEDULER.with(|s| s.error_hook.borrow().clone());
    match hook {
        Some(hook) => (&*hook)(payload),
        None => {
            tracing::error!(error = %payload, "unhandled reactive error");
            panic!("unhandled reactive error: {payload}");
        }
    }
}

// ----------------------------------------------------------------------------
// Flush
// ----------------------------------------------------------------------------

/// True when any queue in the subtree still holds pure work. Checked after
/// every full pure pass: a task may enqueue work into a queue the pass has
/// already visited.
fn has_pure_work(queue: QueueId) -> bool {
    let (own, children) = SCHEDULER.with(|s| {
        s.queues
            .borrow()
            .get(&queue)
            .map(|record| {
                (
                    !record.slots[QueueSlot::Pure as usize].is_empty(),
                    record.children.clone(),
                )
            })
            .unwrap_or((false, Vec::new()))
    });
    own || children.into_iter().any(has_pure_work)
}

fn run_queue(queue: QueueId, slot: QueueSlot, did_work: &mut bool) -> bool {
    let pure = slot == QueueSlot::Pure;
    let Some((paused, tasks, children)) = SCHEDULER.with(|s| {
        let mut queues = s.queues.borrow_mut();
        queues.get_mut(&queue).map(|record| {
            let paused = record.paused;
            let tasks = if paused && !pure {
                Vec::new()
            } else {
                mem::take(&mut record.slots[slot as usize])
            };
            (paused, tasks, record.children.clone())
        })
    }) else {
        return false;
    };
    if paused && !pure {
        // Effect phases of a paused queue return immediately; the retained
        // work replays on resume.
        return false;
    }
    for task in tasks {
        *did_work = true;
        task();
    }
    let mut more = pure
        && SCHEDULER.with(|s| {
            s.queues
                .borrow()
                .get(&queue)
                .map(|record| !record.slots[QueueSlot::Pure as usize].is_empty())
                .unwrap_or(false)
        });
    for child in children {
        let child_more = run_queue(child, slot, did_work);
        if pure {
            more |= child_more;
        }
    }
    more
}

/// Run one flush of the root queue: pure fixed point, clock advance, render
/// phase, user phase. Re-entrant calls are suppressed; the outer flush
/// continues until quiescent.
pub(crate) fn flush() {
    struct FlushingGuard;
    impl Drop for FlushingGuard {
        fn drop(&mut self) {
            SCHEDULER.with(|s| s.flushing.set(false));
        }
    }

    let root = SCHEDULER.with(|s| s.root);
    let already = SCHEDULER.with(|s| s.flushing.replace(true));
    if already {
        return;
    }
    let guard = FlushingGuard;
    SCHEDULER.with(|s| s.pending.set(false));
    tracing::trace!("flush start");

    let mut did_work = false;
    let mut rounds = 0usize;
    loop {
        run_queue(root, QueueSlot::Pure, &mut did_work);
        if !has_pure_work(root) {
            break;
        }
        rounds += 1;
        if rounds > LOOP_LIMIT {
            tracing::warn!("pure phase did not settle after {LOOP_LIMIT} rounds");
            panic!(
                "potential infinite update loop: pure phase did not settle after {LOOP_LIMIT} rounds"
            );
        }
    }

    let written = runtime::settle_sources();
    if did_work || written > 0 {
        runtime::bump_clock();
    }

    run_queue(root, QueueSlot::Render, &mut did_work);
    run_queue(root, QueueSlot::User, &mut did_work);
    drop(guard);

    // Effects may have written during the render/user phases; hand the new
    // batch back to the host.
    let hook = SCHEDULER.with(|s| {
        if s.pending.get() && s.batch_depth.get() == 0 {
            s.flush_hook.borrow().clone()
        } else {
            None
        }
    });
    if let Some(hook) = hook {
        (&*hook)();
    }
}

/// Flush synchronously until no reschedule is pending.
///
/// Aborts with a diagnostic after a large iteration bound to catch effects
/// that keep writing to their own sources. Calls made while a flush is
/// already running are suppressed.
pub fn flush_sync() {
    if SCHEDULER.with(|s| s.flushing.get()) {
        return;
    }
    for _ in 0..LOOP_LIMIT {
        flush();
        if !SCHEDULER.with(|s| s.pending.get()) {
            return;
        }
    }
    panic!(
        "potential infinite update loop: flush_sync did not settle after {LOOP_LIMIT} iterations"
    );
}

/// Run `f` with flushes held back, then flush once at the end.
///
/// Writes inside the closure coalesce into a single batch even when a flush
/// hook is installed.
pub fn batch<T>(f: impl FnOnce() -> T) -> T {
    struct BatchGuard;
    impl Drop for BatchGuard {
        fn drop(&mut self) {
            SCHEDULER.with(|s| s.batch_depth.set(s.batch_depth.get() - 1));
        }
    }
    SCHEDULER.with(|s| s.batch_depth.set(s.batch_depth.get() + 1));
    let guard = BatchGuard;
    let result = f();
    drop(guard);
    let should_flush =
        SCHEDULER.with(|s| s.batch_depth.get() == 0 && s.pending.get() && !s.flushing.get());
    if should_flush {
        flush_sync();
    }
    result
}

// ----------------------------------------------------------------------------
// Host hooks
// ----------------------------------------------------------------------------

/// Install the host's microtask primitive. The hook is raised at most once
/// per pending batch; it should arrange for `flush_sync` to run after the
/// current synchronous region.
pub fn set_flush_hook(hook: impl Fn() + 'static) {
    SCHEDULER.with(|s| {
        *s.flush_hook.borrow_mut() = Some(Rc::new(hook));
    });
}

/// Remove the installed flush hook.
pub fn clear_flush_hook() {
    SCHEDULER.with(|s| {
        *s.flush_hook.borrow_mut() = None;
    });
}

/// Install the host's unhandled-error sink. Without one, an error that no
/// handler or boundary absorbs aborts the flush.
pub fn set_error_hook(hook: impl Fn(Rc<dyn Error + 'static>) + 'static) {
    SCHEDULER.with(|s| {
        *s.error_hook.borrow_mut() = Some(Rc::new(hook));
    });
}

/// Remove the installed error sink.
pub fn clear_error_hook() {
    SCHEDULER.with(|s| {
        *s.error_hook.borrow_mut() = None;
    });
}

// ----------------------------------------------------------------------------
// Public handle
// ----------------------------------------------------------------------------

/// Handle to a scheduler queue.
///
/// Upper layers use queues purely as a scheduling substrate: enqueue work
/// into a phase slot, push notifications, and manage boundary children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Queue {
    id: QueueId,
}

impl Queue {
    /// The process-wide root queue.
    pub fn root() -> Self {
        Self { id: root_queue() }
    }

    /// Create a detached queue with no notification handler.
    pub fn new() -> Self {
        Self {
            id: create_queue(None),
        }
    }

    /// Create a detached queue that intercepts notifications.
    pub fn with_handler(handler: Rc<dyn NotifyHandler>) -> Self {
        Self {
            id: create_queue(Some(handler)),
        }
    }

    pub(crate) fn from_id(id: QueueId) -> Self {
        Self { id }
    }

    pub(crate) fn id(&self) -> QueueId {
        self.id
    }

    /// Append a task to one of this queue's phase slots and request a flush.
    pub fn enqueue(&self, slot: QueueSlot, task: impl FnOnce() + 'static) {
        enqueue_task(self.id, slot, Box::new(task));
        request_flush();
    }

    /// Push a notification into this queue's interception walk.
    pub fn notify(
        &self,
        source: NodeId,
        mask: NotifyMask,
        set: bool,
        payload: Option<Rc<dyn Error + 'static>>,
    ) -> bool {
        notify(self.id, source, mask, set, payload)
    }

    /// Attach `child` under this queue. Panics if `child` already has a
    /// parent: a queue belongs to one parent for its lifetime.
    pub fn add_child(&self, child: &Queue) {
        attach_child(self.id, child.id);
    }

    pub fn remove_child(&self, child: &Queue) {
        detach_child(self.id, child.id);
    }

    /// Gate this queue's effect phases; pure work keeps running.
    pub fn pause(&self) {
        set_paused(self.id, true);
    }

    /// Lift the gate and forward retained effect work to the parent.
    pub fn resume(&self) {
        set_paused(self.id, false);
    }

    pub fn is_paused(&self) -> bool {
        is_paused(self.id)
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}
