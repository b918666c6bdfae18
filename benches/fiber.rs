// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use fiber_scheduler::Fiber;

/// Round-trip cost of swapping into a fiber that immediately yields to
/// READY, and swapping back into it until it terminates. Uses
/// `yield_to_ready` rather than `yield_to_hold` because the latter leaves
/// `state()` at EXEC until a scheduler's dispatch loop relabels it --
/// exactly what this microbenchmark, with no scheduler around, cannot do.
fn fiber_swap(c: &mut Criterion) {
    c.bench_function("fiber_swap", |b| {
        b.iter(|| {
            let _bootstrap = Fiber::current();
            let f = Fiber::new(
                || {
                    Fiber::yield_to_ready();
                    black_box(());
                },
                0,
                false,
            )
            .unwrap();

            f.swap_in();
            f.swap_in();
        })
    });
}

/// Cost of constructing a fiber (stack allocation + context priming)
/// without ever running it.
fn fiber_construct(c: &mut Criterion) {
    c.bench_function("fiber_construct", |b| {
        b.iter(|| {
            let f = Fiber::new(|| {}, 0, false).unwrap();
            black_box(&f);
        })
    });
}

/// Cost of `reset` reusing an already-allocated stack, versus
/// constructing a fresh fiber each time.
fn fiber_reset(c: &mut Criterion) {
    let _bootstrap = Fiber::current();
    let f = Fiber::new(|| {}, 0, false).unwrap();
    f.swap_in();

    c.bench_function("fiber_reset", |b| {
        b.iter(|| {
            f.reset(|| {});
            f.swap_in();
        })
    });
}

criterion_group!(benches, fiber_swap, fiber_construct, fiber_reset);
criterion_main!(benches);
