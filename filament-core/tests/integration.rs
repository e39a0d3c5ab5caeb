//! Integration Tests for the Reactive Runtime
//!
//! These tests exercise the full stack: signals, memos, effects, the
//! batched scheduler, ownership scopes, and boundaries working together.

use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use filament_core::{
    batch, create_root, current_clock, flush_sync, has_updated, latest, on_cleanup, untrack,
    Effect, EffectOptions, EffectTier, ErrorBoundary, Interrupt, Memo, Signal, SuspenseBoundary,
    SuspenseMode, Write,
};

/// A write followed by a flush recomputes the derived cell.
#[test]
fn memo_follows_signal_through_flush() {
    let n = Signal::new(1);
    let d = Memo::new({
        let n = n.clone();
        move || n.get() * 2
    });
    n.set(2);
    flush_sync();
    assert_eq!(d.get(), 4);
}

/// Two writes in one synchronous region cost one recompute and one action.
#[test]
fn synchronous_writes_coalesce_into_one_batch() {
    let a = Signal::new(1);
    let b = Signal::new(10);
    let s = Memo::new({
        let a = a.clone();
        let b = b.clone();
        move || a.get() + b.get()
    });
    let calls = Rc::new(Cell::new(0));
    let _effect = Effect::new(
        {
            let s = s.clone();
            move || s.get()
        },
        {
            let calls = calls.clone();
            move |_, _| calls.set(calls.get() + 1)
        },
    );
    flush_sync();
    a.set(2);
    b.set(20);
    flush_sync();
    assert_eq!(s.get(), 22);
    assert_eq!(calls.get(), 2);
}

/// Glitch freedom: a diamond observer never sees mixed generations.
#[test]
fn diamond_reads_are_glitch_free() {
    let a = Signal::new(1);
    let left = Memo::new({
        let a = a.clone();
        move || a.get() + 1
    });
    let right = Memo::new({
        let a = a.clone();
        move || a.get() * 10
    });
    let observed = Rc::new(RefCell::new(Vec::new()));
    let computes = Rc::new(Cell::new(0));
    let _effect = Effect::new(
        {
            let left = left.clone();
            let right = right.clone();
            let computes = computes.clone();
            move || {
                computes.set(computes.get() + 1);
                (left.get(), right.get())
            }
        },
        {
            let observed = observed.clone();
            move |value: &(i32, i32), _| observed.borrow_mut().push(*value)
        },
    );
    flush_sync();
    a.set(2);
    flush_sync();
    a.set(3);
    flush_sync();

    // Each pair is internally consistent: (a + 1, a * 10) for the same a.
    assert_eq!(*observed.borrow(), vec![(2, 10), (3, 20), (4, 30)]);
    // One compute per flush, never one per source write.
    assert_eq!(computes.get(), 3);
}

/// Cleanups run LIFO on disposal.
#[test]
fn root_disposal_runs_cleanups_in_reverse_order() {
    let order = Rc::new(RefCell::new(Vec::new()));
    create_root(|root| {
        let a = order.clone();
        on_cleanup(move || a.borrow_mut().push("A")).unwrap();
        let b = order.clone();
        on_cleanup(move || b.borrow_mut().push("B")).unwrap();
        root.dispose();
    });
    assert_eq!(*order.borrow(), vec!["B", "A"]);
}

/// After an owner disposes, cells it created stop firing effects.
#[test]
fn disposed_owner_silences_its_effects() {
    let source = Signal::new(0);
    let calls = Rc::new(Cell::new(0));
    let handle = create_root(|root| {
        let _effect = Effect::new(
            {
                let source = source.clone();
                move || source.get()
            },
            {
                let calls = calls.clone();
                move |_, _| calls.set(calls.get() + 1)
            },
        );
        root
    });
    flush_sync();
    assert_eq!(calls.get(), 1);

    handle.dispose();
    source.set(1);
    flush_sync();
    assert_eq!(calls.get(), 1);
}

/// Suspense in hide mode gates effects until the waiting cell resolves.
#[test]
fn suspense_gates_effect_until_resolution() {
    create_root(|root| {
        let data = Signal::new(0);
        data.write(Write::Unchanged, true);
        let calls = Rc::new(Cell::new(0));

        let boundary = SuspenseBoundary::new(SuspenseMode::Hide);
        boundary.run(|| {
            let _effect = Effect::with_options(
                None,
                {
                    let data = data.clone();
                    move |_: Option<&i32>| data.try_get()
                },
                {
                    let calls = calls.clone();
                    move |_: &i32, _| calls.set(calls.get() + 1)
                },
                EffectOptions::default(),
            );
        });
        flush_sync();
        assert!(boundary.is_loading());
        assert_eq!(calls.get(), 0);

        data.write(Write::Value(7), false);
        flush_sync();
        assert!(!boundary.is_loading());
        assert_eq!(calls.get(), 1);
        root.dispose();
    });
}

/// An error boundary captures a failing subtree; reset replays it.
#[test]
fn error_boundary_captures_then_recovers() {
    #[derive(Debug, thiserror::Error)]
    #[error("effect failed")]
    struct EffectFailed;

    create_root(|root| {
        let broken = Signal::new(true);
        let completions = Rc::new(Cell::new(0));
        let outer_calls = Rc::new(Cell::new(0));

        // Root-level effect: must be unaffected by the failure.
        let _outer = Effect::new(
            {
                let broken = broken.clone();
                move || broken.get()
            },
            {
                let outer_calls = outer_calls.clone();
                move |_, _| outer_calls.set(outer_calls.get() + 1)
            },
        );

        let boundary = ErrorBoundary::new();
        boundary.run(|| {
            let _inner = Effect::with_options(
                None,
                {
                    let broken = broken.clone();
                    move |_: Option<&i32>| {
                        if broken.try_get()? {
                            Err(Interrupt::failure(EffectFailed))
                        } else {
                            Ok(1)
                        }
                    }
                },
                {
                    let completions = completions.clone();
                    move |_: &i32, _| completions.set(completions.get() + 1)
                },
                EffectOptions::default(),
            );
        });
        flush_sync();
        assert!(boundary.has_error());
        assert_eq!(completions.get(), 0);
        assert_eq!(outer_calls.get(), 1);

        broken.set(false);
        boundary.reset();
        flush_sync();
        assert!(!boundary.has_error());
        assert_eq!(completions.get(), 1);
        root.dispose();
    });
}

/// An effect writing to its own source trips the loop guard instead of
/// hanging.
#[test]
fn self_feeding_effect_trips_the_loop_guard() {
    let counter = Signal::new(0);
    let _effect = Effect::new(
        {
            let counter = counter.clone();
            move || counter.get()
        },
        {
            let counter = counter.clone();
            move |value: &i32, _| {
                let next = *value + 1;
                counter.set(next);
            }
        },
    );
    let result = catch_unwind(AssertUnwindSafe(flush_sync));
    let message = *result
        .expect_err("flush_sync should abort")
        .downcast::<String>()
        .expect("diagnostic should be a string");
    assert!(message.contains("infinite update loop"), "got: {message}");
}

/// A dependency cycle introduced at runtime aborts with a cycle
/// diagnostic instead of recursing forever.
#[test]
fn mutual_memo_cycle_aborts_with_diagnostic() {
    let flag = Signal::new(false);
    let b_slot: Rc<RefCell<Option<Memo<i32>>>> = Rc::new(RefCell::new(None));
    let a = Memo::new({
        let flag = flag.clone();
        let b_slot = b_slot.clone();
        move || {
            if flag.get() {
                match &*b_slot.borrow() {
                    Some(b) => b.get(),
                    None => -1,
                }
            } else {
                0
            }
        }
    });
    let b = Memo::new({
        let a = a.clone();
        move || a.get()
    });
    *b_slot.borrow_mut() = Some(b.clone());

    // Acyclic while the flag is off.
    assert_eq!(b.get(), 0);

    // Turning the flag on closes the loop: a -> b -> a.
    flag.set(true);
    flush_sync();
    let result = catch_unwind(AssertUnwindSafe(|| b.get()));
    let message = *result
        .expect_err("cyclic read should abort")
        .downcast::<String>()
        .expect("diagnostic should be a string");
    assert!(message.contains("cycle detected"), "got: {message}");
}

/// The clock advances exactly once per flush that performed work.
#[test]
fn clock_advances_once_per_working_flush() {
    let source = Signal::new(0);
    let _effect = Effect::new(
        {
            let source = source.clone();
            move || source.get()
        },
        |_, _| {},
    );
    flush_sync();
    let before = current_clock();

    source.set(1);
    flush_sync();
    assert_eq!(current_clock(), before + 1);

    // No pending work: the clock stands still.
    flush_sync();
    assert_eq!(current_clock(), before + 1);

    source.set(2);
    source.set(3);
    flush_sync();
    assert_eq!(current_clock(), before + 2);
}

/// Render actions of a flush run strictly before user actions.
#[test]
fn render_phase_precedes_user_phase() {
    let source = Signal::new(0);
    let order = Rc::new(RefCell::new(Vec::new()));
    let _user = Effect::new(
        {
            let source = source.clone();
            move || source.get()
        },
        {
            let order = order.clone();
            move |_, _| order.borrow_mut().push("user")
        },
    );
    let _render = Effect::with_options(
        None,
        {
            let source = source.clone();
            move |_: Option<&i32>| Ok(source.get())
        },
        {
            let order = order.clone();
            move |_: &i32, _| order.borrow_mut().push("render")
        },
        EffectOptions {
            tier: EffectTier::Render,
            ..EffectOptions::default()
        },
    );
    flush_sync();
    source.set(1);
    flush_sync();
    assert_eq!(*order.borrow(), vec!["render", "user", "render", "user"]);
}

/// `batch` holds the flush until the closure finishes.
#[test]
fn batch_flushes_once_at_the_end() {
    let a = Signal::new(1);
    let b = Signal::new(2);
    let calls = Rc::new(Cell::new(0));
    let _effect = Effect::new(
        {
            let a = a.clone();
            let b = b.clone();
            move || a.get() + b.get()
        },
        {
            let calls = calls.clone();
            move |_, _| calls.set(calls.get() + 1)
        },
    );
    flush_sync();
    assert_eq!(calls.get(), 1);

    batch(|| {
        a.set(10);
        b.set(20);
    });
    assert_eq!(calls.get(), 2);
}

/// A captured owner becomes a no-op after disposal: late writes are
/// discarded instead of resurrecting the scope.
#[test]
fn captured_owner_short_circuits_after_disposal() {
    let resumed = Rc::new(Cell::new(0));
    let (root, captured) = create_root(|root| (root, root.owner().capture()));

    captured.run({
        let resumed = resumed.clone();
        move || resumed.set(resumed.get() + 1)
    });
    assert_eq!(resumed.get(), 1);

    root.dispose();
    assert!(captured.is_aborted());
    let ran = captured.run({
        let resumed = resumed.clone();
        move || resumed.set(resumed.get() + 1)
    });
    assert!(ran.is_none());
    assert_eq!(resumed.get(), 1);
}

/// `latest` exposes the pre-error value; `untrack` and `has_updated`
/// compose with the flush model.
#[test]
fn introspection_helpers_compose() {
    #[derive(Debug, thiserror::Error)]
    #[error("fetch failed")]
    struct FetchFailed;

    let data = Signal::new(41);
    flush_sync();
    data.set(42);
    flush_sync();
    assert!(has_updated(|| data.get()));

    data.set_error(FetchFailed);
    assert_eq!(latest(|| data.try_get()).unwrap(), 42);
    assert!(data.try_get().is_err());

    // untrack inside a memo: writes to the untracked cell do not recompute.
    let tracked = Signal::new(1);
    let peeked = Signal::new(100);
    let combined = Memo::new({
        let tracked = tracked.clone();
        let peeked = peeked.clone();
        move || tracked.get() + untrack(|| peeked.get())
    });
    assert_eq!(combined.get(), 101);
    peeked.set(200);
    flush_sync();
    assert_eq!(combined.get(), 101);
}
