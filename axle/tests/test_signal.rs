// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words SIGCHLD SIGUSR sigusr

//! Signal watcher scenarios. All `#[serial]`: signal dispositions are
//! process-global state.

use axle::{AxleError, Context, EventFlags, TypeSet, backend::registry};
use pretty_assertions::assert_eq;
use serial_test::serial;
use signal_hook::{
    consts::{SIGCHLD, SIGUSR1, SIGUSR2},
    low_level::raise,
};
use std::{cell::Cell, rc::Rc, time::Duration};
use test_case::test_case;

#[test_case("mio" ; "mio engine")]
#[test_case("poll" ; "poll engine")]
#[serial]
fn persistent_signal_watcher_counts_separate_deliveries(backend: &str) {
    registry::reset();
    let ctx = Context::new(Some(backend), TypeSet::SIGNAL | TypeSet::TIMEOUT).unwrap();

    let count = Rc::new(Cell::new(0u32));
    {
        let count = Rc::clone(&count);
        ctx.add_signal(EventFlags::PERSIST, SIGUSR1, move |_ctx, ev| {
            assert_eq!(ev.signal(), Some(SIGUSR1));
            count.set(count.get() + 1);
        })
        .unwrap();
    }
    // Two deliveries in separate cycles, then a check-and-exit timer.
    ctx.add_timeout(EventFlags::empty(), Duration::from_millis(30), |_ctx, _ev| {
        raise(SIGUSR1).unwrap();
    })
    .unwrap();
    ctx.add_timeout(EventFlags::empty(), Duration::from_millis(90), |_ctx, _ev| {
        raise(SIGUSR1).unwrap();
    })
    .unwrap();
    ctx.add_timeout(
        EventFlags::empty(),
        Duration::from_millis(200),
        |ctx, _ev| ctx.break_loop(),
    )
    .unwrap();

    ctx.run().unwrap();
    assert_eq!(count.get(), 2);
}

#[test_case("mio" ; "mio engine")]
#[test_case("poll" ; "poll engine")]
#[serial]
fn signal_watcher_validation(backend: &str) {
    registry::reset();
    let ctx = Context::new(Some(backend), TypeSet::SIGNAL).unwrap();

    assert!(matches!(
        ctx.add_signal(EventFlags::PERSIST, SIGCHLD, |_ctx, _ev| {}),
        Err(AxleError::ReservedSignal { .. })
    ));
    assert!(matches!(
        ctx.add_signal(EventFlags::PERSIST, -4, |_ctx, _ev| {}),
        Err(AxleError::InvalidSignal { .. })
    ));
    assert!(matches!(
        ctx.ignore_signal(EventFlags::empty(), SIGUSR2),
        Err(AxleError::OneShotIgnore)
    ));
}

#[test_case("mio" ; "mio engine")]
#[test_case("poll" ; "poll engine")]
#[serial]
fn ignore_registration_swallows_delivery(backend: &str) {
    registry::reset();
    let ctx = Context::new(Some(backend), TypeSet::SIGNAL | TypeSet::TIMEOUT).unwrap();

    let ignored = ctx.ignore_signal(EventFlags::PERSIST, SIGUSR2).unwrap();
    ctx.add_timeout(EventFlags::empty(), Duration::from_millis(30), |_ctx, _ev| {
        raise(SIGUSR2).unwrap();
    })
    .unwrap();
    ctx.add_timeout(
        EventFlags::empty(),
        Duration::from_millis(120),
        |ctx, _ev| ctx.break_loop(),
    )
    .unwrap();

    // Surviving this run is the point: the delivery was caught, nothing ran.
    ctx.run().unwrap();
    assert!(ignored.is_active());
}

#[test_case("mio" ; "mio engine")]
#[test_case("poll" ; "poll engine")]
#[serial]
fn teardown_detaches_signal_watchers(backend: &str) {
    registry::reset();
    let fired = Rc::new(Cell::new(false));
    {
        let ctx = Context::new(Some(backend), TypeSet::SIGNAL).unwrap();
        let fired = Rc::clone(&fired);
        ctx.add_signal(EventFlags::PERSIST, SIGUSR2, move |_ctx, _ev| {
            fired.set(true);
        })
        .unwrap();
        // Context (and with it the engine's signal plumbing) goes away here.
    }

    // A delivery after teardown must neither crash the process nor reach the
    // dead watcher.
    raise(SIGUSR2).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    assert!(!fired.get());
}
