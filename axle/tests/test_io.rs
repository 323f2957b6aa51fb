// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words EBADF

//! I/O watcher scenarios: the pipe read/EOF walk-through, write readiness
//! and descriptor ownership transfer.
//!
//! Everything here is `#[serial]`: the close-fd test reasons about raw
//! descriptor numbers, which other threads in the same process could reuse.

use axle::{Context, EventFlags, IoCondition, TypeSet, backend::registry};
use pretty_assertions::assert_eq;
use rustix::{
    io::{Errno, read, write},
    pipe::pipe,
};
use serial_test::serial;
use std::{
    cell::{Cell, RefCell},
    os::fd::{AsRawFd as _, BorrowedFd, IntoRawFd as _},
    rc::Rc,
};
use test_case::test_case;

#[test_case("mio" ; "mio engine")]
#[test_case("poll" ; "poll engine")]
#[serial]
fn read_watcher_observes_payload_then_eof(backend: &str) {
    registry::reset();
    let ctx = Context::new(Some(backend), TypeSet::IO).unwrap();

    let (read_end, write_end) = pipe().unwrap();
    let calls: Rc<RefCell<Vec<(usize, IoCondition)>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let calls = Rc::clone(&calls);
        ctx.add_io(
            EventFlags::PERSIST | EventFlags::IO_READ,
            read_end.as_raw_fd(),
            move |_ctx, ev| {
                let mut buf = [0u8; 16];
                // SAFETY: the read end outlives the watcher in this test.
                let fd = unsafe { BorrowedFd::borrow_raw(ev.fd().unwrap()) };
                let n = read(fd, &mut buf).unwrap();
                calls.borrow_mut().push((n, ev.fd_state()));
                if calls.borrow().len() == 2 {
                    ev.delete();
                }
            },
        )
        .unwrap();
    }

    assert_eq!(write(&write_end, b"hello").unwrap(), 5);
    ctx.run_once().unwrap();
    {
        let calls = calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, 5);
        assert!(calls[0].1.contains(IoCondition::READABLE));
    }

    drop(write_end);
    ctx.run_once().unwrap();
    let calls = calls.borrow();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].0, 0);
    assert!(
        calls[1]
            .1
            .intersects(IoCondition::HANGUP | IoCondition::ERROR),
        "expected EOF/error condition, got {:?}",
        calls[1].1
    );
}

#[test_case("mio" ; "mio engine")]
#[test_case("poll" ; "poll engine")]
#[serial]
fn write_watcher_fires_when_writable(backend: &str) {
    registry::reset();
    let ctx = Context::new(Some(backend), TypeSet::IO).unwrap();

    let (_read_end, write_end) = pipe().unwrap();
    let state = Rc::new(Cell::new(IoCondition::empty()));
    let fired = Rc::new(Cell::new(0u32));
    {
        let state = Rc::clone(&state);
        let fired = Rc::clone(&fired);
        ctx.add_io(
            EventFlags::IO_WRITE,
            write_end.as_raw_fd(),
            move |_ctx, ev| {
                fired.set(fired.get() + 1);
                state.set(ev.fd_state());
            },
        )
        .unwrap();
    }

    // An empty pipe is writable immediately; the one-shot fires and drains.
    ctx.run().unwrap();
    assert_eq!(fired.get(), 1);
    assert!(state.get().contains(IoCondition::WRITABLE));
}

#[test_case("mio" ; "mio engine")]
#[test_case("poll" ; "poll engine")]
#[serial]
fn close_fd_flag_transfers_descriptor_ownership(backend: &str) {
    registry::reset();
    let ctx = Context::new(Some(backend), TypeSet::IO).unwrap();

    let (read_end, write_end) = pipe().unwrap();
    drop(write_end);
    let raw = read_end.into_raw_fd();

    let ev = ctx
        .add_io(
            EventFlags::IO_READ | EventFlags::IO_CLOSE_FD,
            raw,
            |_ctx, _ev| {},
        )
        .unwrap();
    ev.delete();

    // Teardown closed it: the descriptor must now be invalid.
    // SAFETY: probing a number we just released; nothing reopened it
    // (the test is serialized).
    let fd = unsafe { BorrowedFd::borrow_raw(raw) };
    let mut buf = [0u8; 1];
    assert_eq!(read(fd, &mut buf), Err(Errno::BADF));
}

#[test_case("mio" ; "mio engine")]
#[test_case("poll" ; "poll engine")]
#[serial]
fn io_watcher_validation(backend: &str) {
    registry::reset();
    let ctx = Context::new(Some(backend), TypeSet::IO).unwrap();

    assert!(
        ctx.add_io(EventFlags::IO_READ, -1, |_ctx, _ev| {})
            .is_err()
    );
    let (read_end, _write_end) = pipe().unwrap();
    assert!(
        ctx.add_io(EventFlags::empty(), read_end.as_raw_fd(), |_ctx, _ev| {})
            .is_err()
    );
}
