// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words SIGCHLD waitpid

//! Child watcher scenarios. All `#[serial]`: child reaping and the
//! child-exit signal are process-global.

use axle::{AxleError, ChildStatus, Context, EventFlags, TypeSet, backend::registry};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::{cell::Cell, process::Command, rc::Rc};
use test_case::test_case;

#[test_case("mio" ; "mio engine")]
#[test_case("poll" ; "poll engine")]
#[serial]
fn child_watcher_reports_exit_code(backend: &str) {
    registry::reset();
    let ctx = Context::new(Some(backend), TypeSet::CHILD).unwrap();

    let child = Command::new("/bin/sh").args(["-c", "exit 7"]).spawn().unwrap();
    let pid = i32::try_from(child.id()).unwrap();

    let status = Rc::new(Cell::new(None));
    {
        let status = Rc::clone(&status);
        ctx.add_child(EventFlags::empty(), pid, move |_ctx, ev| {
            assert_eq!(ev.pid(), Some(pid));
            status.set(ev.child_status());
        })
        .unwrap();
    }

    // Child watchers are one-shot by construction; the loop drains after
    // the reap.
    ctx.run().unwrap();
    assert_eq!(status.get(), Some(ChildStatus::Exited(7)));
}

#[test_case("mio" ; "mio engine")]
#[test_case("poll" ; "poll engine")]
#[serial]
fn child_watcher_waits_for_a_slow_child(backend: &str) {
    registry::reset();
    let ctx = Context::new(Some(backend), TypeSet::CHILD).unwrap();

    let child = Command::new("/bin/sh")
        .args(["-c", "sleep 0.2; exit 0"])
        .spawn()
        .unwrap();
    let pid = i32::try_from(child.id()).unwrap();

    let status = Rc::new(Cell::new(None));
    {
        let status = Rc::clone(&status);
        ctx.add_child(EventFlags::empty(), pid, move |_ctx, ev| {
            status.set(ev.child_status());
        })
        .unwrap();
    }

    // The watcher was armed while the child was still running, so this
    // exercises the signal plumbing rather than the pre-block reap.
    ctx.run().unwrap();
    assert_eq!(status.get(), Some(ChildStatus::Exited(0)));
}

#[test_case("mio" ; "mio engine")]
#[test_case("poll" ; "poll engine")]
#[serial]
fn child_watcher_validation(backend: &str) {
    registry::reset();
    let ctx = Context::new(Some(backend), TypeSet::CHILD).unwrap();

    assert!(matches!(
        ctx.add_child(EventFlags::PERSIST, 1, |_ctx, _ev| {}),
        Err(AxleError::PersistentChild)
    ));
    assert!(matches!(
        ctx.add_child(EventFlags::empty(), 0, |_ctx, _ev| {}),
        Err(AxleError::InvalidPid { .. })
    ));
}
