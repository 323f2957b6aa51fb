// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The event object: one registered watcher and its lifecycle state.
//!
//! An [`Event`] is a cheap cloneable handle; the watcher itself lives in the
//! owning [`Context`]'s event set until it is deleted (explicitly, by context
//! teardown, or automatically after a non-persistent fire). Handles held past
//! that point stay valid — the accessors still answer, [`Event::is_active`]
//! turns false, and [`Event::delete`] becomes a no-op.
//!
//! # Self-delete and the depth counter
//!
//! A callback deleting its own event is the normal "fire once, then
//! unregister" pattern. While the callback runs, the event's depth counter
//! is positive and [`Event::delete`] only marks the event; the real teardown
//! (backend deregistration, fd close, private-data release) happens when the
//! fire protocol unwinds back to depth zero. Without the deferral, the fire
//! path would return into state freed under its feet.
//!
//! [`Context`]: crate::Context

use crate::{
    backend::{AddRequest, BackendSlot, WatcherSpec},
    context::{Context, ContextCore, delete_event},
    types::{ChildStatus, EventFlags, IoCondition, WatcherKind},
};
use std::{
    any::Any,
    cell::{Cell, RefCell},
    os::fd::{FromRawFd as _, OwnedFd, RawFd},
    rc::{Rc, Weak},
    time::Duration,
};

/// What to do when the watcher fires.
pub(crate) enum Callback {
    Handler(Rc<dyn Fn(&Context, &Event)>),
    /// Catch the signal (keeping its default action from running) but invoke
    /// nothing. Only valid for persistent signal watchers.
    Ignore,
}

pub(crate) struct EventCore {
    pub(crate) ctx: Weak<ContextCore>,
    pub(crate) request: AddRequest,
    pub(crate) callback: Callback,
    /// Engine-private handle; `Some` exactly while registered with the
    /// backend.
    pub(crate) slot: Cell<Option<BackendSlot>>,
    /// Flags the backend reported it could honor at add time.
    pub(crate) honored: Cell<EventFlags>,
    /// Re-entrancy depth of the fire protocol.
    pub(crate) depth: Cell<u32>,
    /// Delete was requested from inside a firing callback.
    pub(crate) deferred_delete: Cell<bool>,
    /// Fully torn down; handles outstanding are inert.
    pub(crate) dead: Cell<bool>,
    /// Last I/O condition observed at fire time.
    pub(crate) fd_state: Cell<IoCondition>,
    pub(crate) child_status: Cell<Option<ChildStatus>>,
    private: RefCell<Option<Rc<dyn Any>>>,
}

impl EventCore {
    pub(crate) fn new(ctx: Weak<ContextCore>, request: AddRequest, callback: Callback) -> Self {
        Self {
            ctx,
            request,
            callback,
            slot: Cell::new(None),
            honored: Cell::new(EventFlags::empty()),
            depth: Cell::new(0),
            deferred_delete: Cell::new(false),
            dead: Cell::new(false),
            fd_state: Cell::new(IoCondition::empty()),
            child_status: Cell::new(None),
            private: RefCell::new(None),
        }
    }

    pub(crate) fn priority_rank(&self) -> u8 {
        self.request.flags.priority_rank()
    }

    /// Final teardown once the backend slot is gone: release the descriptor
    /// if the watcher owned it, release the private data (this is the
    /// owner-notified release point), and mark the core inert.
    pub(crate) fn finish_teardown(&self) {
        self.dead.set(true);
        if self.request.flags.contains(EventFlags::IO_CLOSE_FD)
            && let WatcherSpec::Io { fd } = self.request.spec
        {
            // SAFETY: IO_CLOSE_FD is the caller's explicit transfer of fd
            // ownership to the watcher; nothing else closes it.
            drop(unsafe { OwnedFd::from_raw_fd(fd) });
        }
        self.private.borrow_mut().take();
    }
}

/// Handle to one registered watcher.
///
/// Obtained from the typed `add_*` constructors on [`Context`]. Cloning is
/// cheap and does not extend the watcher's registration.
///
/// [`Context`]: crate::Context
#[derive(Clone)]
#[allow(missing_debug_implementations)]
pub struct Event {
    core: Rc<EventCore>,
}

impl Event {
    pub(crate) fn from_core(core: Rc<EventCore>) -> Self {
        Self { core }
    }

    /// Which watcher family this event belongs to.
    #[must_use]
    pub fn kind(&self) -> WatcherKind {
        self.core.request.spec.kind()
    }

    /// The flags this watcher was requested with.
    #[must_use]
    pub fn flags(&self) -> EventFlags {
        self.core.request.flags
    }

    /// Still registered with its context?
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.core.dead.get() && self.core.slot.get().is_some()
    }

    /// The watched descriptor, for I/O watchers.
    #[must_use]
    pub fn fd(&self) -> Option<RawFd> {
        match self.core.request.spec {
            WatcherSpec::Io { fd } => Some(fd),
            _ => None,
        }
    }

    /// I/O condition observed when the watcher last fired.
    #[must_use]
    pub fn fd_state(&self) -> IoCondition {
        self.core.fd_state.get()
    }

    /// The interval, for timeout watchers.
    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        match self.core.request.spec {
            WatcherSpec::Timeout { interval } => Some(interval),
            _ => None,
        }
    }

    /// The signal number, for signal watchers.
    #[must_use]
    pub fn signal(&self) -> Option<i32> {
        match self.core.request.spec {
            WatcherSpec::Signal { signum } => Some(signum),
            _ => None,
        }
    }

    /// The watched process id, for child watchers.
    #[must_use]
    pub fn pid(&self) -> Option<i32> {
        match self.core.request.spec {
            WatcherSpec::Child { pid } => Some(pid),
            _ => None,
        }
    }

    /// How the watched child terminated; `None` until the watcher fires.
    #[must_use]
    pub fn child_status(&self) -> Option<ChildStatus> {
        self.core.child_status.get()
    }

    /// Attach private data, returning whatever was attached before. The data
    /// is dropped — its owner thereby notified — when the event is torn
    /// down, or earlier via [`take_private`].
    ///
    /// [`take_private`]: Self::take_private
    pub fn set_private(&self, data: Rc<dyn Any>) -> Option<Rc<dyn Any>> {
        self.core.private.borrow_mut().replace(data)
    }

    /// The attached private data, if any.
    #[must_use]
    pub fn private(&self) -> Option<Rc<dyn Any>> {
        self.core.private.borrow().clone()
    }

    /// Detach and return the private data without waiting for teardown.
    pub fn take_private(&self) -> Option<Rc<dyn Any>> {
        self.core.private.borrow_mut().take()
    }

    /// Unregister this watcher.
    ///
    /// Synchronous and immediate — unless called from inside this event's own
    /// firing callback, in which case the teardown is deferred until the
    /// callback unwinds (the callback is never invoked again either way).
    /// Calling it on an already-deleted event is a no-op.
    pub fn delete(&self) {
        let Some(ctx) = self.core.ctx.upgrade() else {
            return;
        };
        delete_event(&ctx, &self.core);
    }
}
