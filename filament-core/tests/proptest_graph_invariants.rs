//! Property-based invariant tests for the reactive graph.
//!
//! These tests verify structural invariants that must hold for any
//! interleaving of writes:
//!
//! 1. After `flush_sync` the observed graph is settled (no cell is marked
//!    CHECK or DIRTY).
//! 2. Dependency edges stay bidirectionally consistent.
//! 3. A derived value always equals its from-scratch recomputation.
//! 4. Within one flush each cell recomputes at most once.
//! 5. Writes of equal values never trigger recomputation.
//! 6. Cleanups run in exact LIFO order for any registration count.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use proptest::prelude::*;

use filament_core::{
    create_root, edges_consistent, flush_sync, is_settled, on_cleanup, Effect, Memo, Signal,
};

/// A sequence of (signal index, value) writes.
fn write_strategy() -> impl Strategy<Value = Vec<(u8, i64)>> {
    proptest::collection::vec((0u8..3u8, -100i64..100i64), 1..40)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn graph_settles_and_stays_consistent(writes in write_strategy()) {
        create_root(|root| {
            let a = Signal::new(0i64);
            let b = Signal::new(0i64);
            let c = Signal::new(0i64);

            let d_runs = Rc::new(Cell::new(0u32));
            let d = Memo::new({
                let (a, b) = (a.clone(), b.clone());
                let runs = d_runs.clone();
                move || {
                    runs.set(runs.get() + 1);
                    a.get() + b.get()
                }
            });
            let e_runs = Rc::new(Cell::new(0u32));
            let e = Memo::new({
                let (b, c) = (b.clone(), c.clone());
                let runs = e_runs.clone();
                move || {
                    runs.set(runs.get() + 1);
                    b.get() + c.get()
                }
            });
            let f_runs = Rc::new(Cell::new(0u32));
            let f = Memo::new({
                let (d, e) = (d.clone(), e.clone());
                let runs = f_runs.clone();
                move || {
                    runs.set(runs.get() + 1);
                    d.get() + e.get()
                }
            });
            let _observer = Effect::new(
                {
                    let f = f.clone();
                    move || f.get()
                },
                |_, _| {},
            );
            flush_sync();

            for chunk in writes.chunks(3) {
                let before = (d_runs.get(), e_runs.get(), f_runs.get());
                for (index, value) in chunk {
                    match index % 3 {
                        0 => a.set(*value),
                        1 => b.set(*value),
                        _ => c.set(*value),
                    }
                }
                flush_sync();

                assert!(is_settled(), "graph not settled after flush");
                assert!(edges_consistent(), "edge lists out of sync");

                let expected =
                    a.get_untracked() + 2 * b.get_untracked() + c.get_untracked();
                assert_eq!(f.get(), expected);

                // At most one recompute per cell per flush.
                assert!(d_runs.get() - before.0 <= 1);
                assert!(e_runs.get() - before.1 <= 1);
                assert!(f_runs.get() - before.2 <= 1);
            }
            root.dispose();
        });
    }

    #[test]
    fn equal_writes_never_recompute(value in -100i64..100i64, repeats in 1usize..10) {
        create_root(|root| {
            let source = Signal::new(value);
            let runs = Rc::new(Cell::new(0u32));
            let _observer = Effect::new(
                {
                    let source = source.clone();
                    let runs = runs.clone();
                    move || {
                        runs.set(runs.get() + 1);
                        source.get()
                    }
                },
                |_, _| {},
            );
            flush_sync();
            assert_eq!(runs.get(), 1);

            for _ in 0..repeats {
                source.set(value);
                flush_sync();
            }
            assert_eq!(runs.get(), 1, "equal writes must not mark observers");
            root.dispose();
        });
    }

    #[test]
    fn cleanups_run_in_lifo_order(count in 1usize..20) {
        let order = Rc::new(RefCell::new(Vec::new()));
        create_root(|root| {
            for i in 0..count {
                let order = order.clone();
                on_cleanup(move || order.borrow_mut().push(i)).unwrap();
            }
            root.dispose();
        });
        let expected: Vec<usize> = (0..count).rev().collect();
        assert_eq!(*order.borrow(), expected);
    }
}
