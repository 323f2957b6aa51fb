// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words EINTR NVAL POLLHUP POLLNVAL RDNORM SIGCHLD libaxle ppoll

//! The `"poll"` engine: portable `poll(2)` via [`rustix`].
//!
//! Signals become pollable through the self-pipe trick: a handler registered
//! with [`signal_hook`] writes one byte into a non-blocking pipe whose read
//! end sits in the poll set. Child watchers share one such pipe on the
//! child-exit signal and reap with `WNOHANG`.
//!
//! This engine deliberately declares the *smaller* capability surface of the
//! two built-ins: no native break latch (the facade's exit flag drives
//! `run`), and one-shot timers only (the facade re-arms persistent timeouts
//! after every fire). Both facade fallback paths stay exercised by a real
//! engine this way.

use super::{
    AddOutcome, AddRequest, BackendLoop, BackendSlot, FireDetail, LoopCaps,
    MODULE_ABI_VERSION, ModuleTable, Readiness, ReadyBatch, WatcherSpec,
    reap_exited_children, timers::TimerHeap,
};
use crate::types::{EventFlags, IoCondition, TypeSet};
use rustix::{
    event::{PollFd, PollFlags, Timespec, poll},
    io::Errno,
    pipe::{PipeFlags, pipe_with},
};
use signal_hook::{SigId, consts::SIGCHLD, low_level, low_level::pipe as signal_pipe};
use std::{
    collections::{HashMap, hash_map::Entry},
    io,
    os::fd::{AsRawFd as _, BorrowedFd, OwnedFd, RawFd},
    time::{Duration, Instant},
};

pub(crate) static MODULE_TABLE: ModuleTable = ModuleTable {
    version: MODULE_ABI_VERSION,
    name: "poll",
    symbol: None,
    resident: None,
    types: TypeSet::all(),
    new_loop: Some(new_loop),
    default_loop: Some(new_loop),
};

fn new_loop() -> io::Result<Box<dyn BackendLoop>> {
    Ok(Box::new(PollLoop::default()))
}

#[derive(Debug)]
struct IoWatch {
    slot: BackendSlot,
    fd: RawFd,
    flags: PollFlags,
}

/// Self-pipe for one signal number. Dropping it unregisters the handler and
/// closes both ends, so no delivery after teardown can reach dead state.
#[derive(Debug)]
struct SignalPipe {
    sig_id: SigId,
    read_end: OwnedFd,
    _write_end: OwnedFd,
    slots: Vec<BackendSlot>,
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        low_level::unregister(self.sig_id);
    }
}

fn arm_signal_pipe(signum: i32) -> io::Result<SignalPipe> {
    // Non-blocking write end: a full pipe must not wedge the handler.
    let (read_end, write_end) = pipe_with(PipeFlags::CLOEXEC | PipeFlags::NONBLOCK)?;
    let sig_id = signal_pipe::register_raw(signum, write_end.as_raw_fd())?;
    Ok(SignalPipe {
        sig_id,
        read_end,
        _write_end: write_end,
        slots: Vec::new(),
    })
}

fn drain_pipe(fd: &OwnedFd) {
    let mut buf = [0u8; 64];
    loop {
        match rustix::io::read(fd, &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(errno) if errno == Errno::INTR => {}
            // WOULDBLOCK: drained.
            Err(_) => break,
        }
    }
}

fn condition_from(revents: PollFlags) -> IoCondition {
    let mut cond = IoCondition::empty();
    if revents.intersects(PollFlags::IN | PollFlags::PRI) {
        cond |= IoCondition::READABLE;
    }
    if revents.contains(PollFlags::OUT) {
        cond |= IoCondition::WRITABLE;
    }
    if revents.intersects(PollFlags::ERR | PollFlags::NVAL) {
        cond |= IoCondition::ERROR;
    }
    if revents.contains(PollFlags::HUP) {
        cond |= IoCondition::HANGUP;
    }
    cond
}

#[derive(Clone, Copy)]
enum PollTarget {
    Io(BackendSlot),
    Signal(i32),
    ChildPipe,
}

#[derive(Debug, Default)]
pub(crate) struct PollLoop {
    next_slot: u64,
    io: Vec<IoWatch>,
    timers: TimerHeap,
    idles: Vec<BackendSlot>,
    signals: HashMap<i32, SignalPipe>,
    children: HashMap<BackendSlot, i32>,
    child_pipe: Option<SignalPipe>,
}

impl PollLoop {
    fn alloc_slot(&mut self) -> BackendSlot {
        let slot = BackendSlot(self.next_slot);
        self.next_slot += 1;
        slot
    }
}

impl BackendLoop for PollLoop {
    fn caps(&self) -> LoopCaps {
        LoopCaps {
            native_break: false,
        }
    }

    fn wait(&mut self, ready: &mut ReadyBatch) -> io::Result<()> {
        // A child may have exited before its signal plumbing was armed; catch
        // that before blocking.
        reap_exited_children(&mut self.children, ready);
        if !ready.is_empty() {
            return Ok(());
        }

        let now = Instant::now();
        let timeout = if self.idles.is_empty() {
            self.timers.next_timeout(now)
        } else {
            Some(Duration::ZERO)
        };

        let mut plan: Vec<(RawFd, PollFlags, PollTarget)> =
            Vec::with_capacity(self.io.len() + self.signals.len() + 1);
        for w in &self.io {
            plan.push((w.fd, w.flags, PollTarget::Io(w.slot)));
        }
        for (&signum, pipe) in &self.signals {
            plan.push((
                pipe.read_end.as_raw_fd(),
                PollFlags::IN,
                PollTarget::Signal(signum),
            ));
        }
        if let Some(pipe) = &self.child_pipe {
            plan.push((pipe.read_end.as_raw_fd(), PollFlags::IN, PollTarget::ChildPipe));
        }

        let ts = timeout.map(|d| Timespec {
            tv_sec: d.as_secs() as i64,
            tv_nsec: i64::from(d.subsec_nanos()),
        });

        // SAFETY: every fd in `plan` belongs to a live watcher entry or to a
        // pipe this loop owns; none outlives this call.
        let mut fds: Vec<PollFd<'_>> = plan
            .iter()
            .map(|&(fd, flags, _)| {
                PollFd::from_borrowed_fd(unsafe { BorrowedFd::borrow_raw(fd) }, flags)
            })
            .collect();

        match poll(&mut fds, ts.as_ref()) {
            Ok(_) => {}
            // EINTR: retry on the next cycle.
            Err(errno) if errno == Errno::INTR => return Ok(()),
            Err(errno) => return Err(errno.into()),
        }

        let now = Instant::now();
        self.timers.collect_expired(now, ready);

        let revents: Vec<PollFlags> = fds.iter().map(PollFd::revents).collect();
        drop(fds);
        for ((_, _, target), revents) in plan.iter().zip(revents) {
            if revents.is_empty() {
                continue;
            }
            match *target {
                PollTarget::Io(slot) => ready.push(Readiness {
                    slot,
                    detail: FireDetail::Io(condition_from(revents)),
                }),
                PollTarget::Signal(signum) => {
                    if let Some(pipe) = self.signals.get(&signum) {
                        drain_pipe(&pipe.read_end);
                        for &slot in &pipe.slots {
                            ready.push(Readiness {
                                slot,
                                detail: FireDetail::Plain,
                            });
                        }
                    }
                }
                PollTarget::ChildPipe => {
                    if let Some(pipe) = &self.child_pipe {
                        drain_pipe(&pipe.read_end);
                    }
                    reap_exited_children(&mut self.children, ready);
                }
            }
        }

        for &slot in &self.idles {
            ready.push(Readiness {
                slot,
                detail: FireDetail::Plain,
            });
        }
        Ok(())
    }

    fn add(&mut self, req: &AddRequest) -> io::Result<AddOutcome> {
        let slot = self.alloc_slot();
        let mut honored = req.flags;
        match req.spec {
            WatcherSpec::Io { fd } => {
                let mut flags = PollFlags::empty();
                if req.flags.contains(EventFlags::IO_READ) {
                    flags |= PollFlags::IN;
                }
                if req.flags.contains(EventFlags::IO_WRITE) {
                    flags |= PollFlags::OUT;
                }
                if flags.is_empty() {
                    return Err(io::Error::from(io::ErrorKind::InvalidInput));
                }
                self.io.push(IoWatch { slot, fd, flags });
            }
            WatcherSpec::Timeout { interval } => {
                // poll(2) has no timer object; expiries here are one-shot and
                // the facade re-arms persistent timeouts after every fire.
                honored -= EventFlags::PERSIST;
                self.timers.insert(slot, interval, false, Instant::now());
            }
            WatcherSpec::Idle => self.idles.push(slot),
            WatcherSpec::Signal { signum } => {
                let pipe = match self.signals.entry(signum) {
                    Entry::Occupied(occupied) => occupied.into_mut(),
                    Entry::Vacant(vacant) => vacant.insert(arm_signal_pipe(signum)?),
                };
                pipe.slots.push(slot);
            }
            WatcherSpec::Child { pid } => {
                if self.child_pipe.is_none() {
                    self.child_pipe = Some(arm_signal_pipe(SIGCHLD)?);
                }
                self.children.insert(slot, pid);
            }
        }
        Ok(AddOutcome { slot, honored })
    }

    fn del(&mut self, slot: BackendSlot, req: &AddRequest) {
        match req.spec {
            WatcherSpec::Io { .. } => self.io.retain(|w| w.slot != slot),
            WatcherSpec::Timeout { .. } => self.timers.remove(slot),
            WatcherSpec::Idle => self.idles.retain(|s| *s != slot),
            WatcherSpec::Signal { signum } => {
                if let Some(pipe) = self.signals.get_mut(&signum) {
                    pipe.slots.retain(|s| *s != slot);
                    if pipe.slots.is_empty() {
                        // Drop unregisters the handler and closes the pipe.
                        self.signals.remove(&signum);
                    }
                }
            }
            WatcherSpec::Child { .. } => {
                self.children.remove(&slot);
                if self.children.is_empty() {
                    self.child_pipe = None;
                }
            }
        }
    }

    fn brk(&mut self) -> bool {
        false
    }

    fn take_break(&mut self) -> bool {
        false
    }

    fn reinit(&mut self) -> io::Result<()> {
        // Every watcher was already detached at the facade level; drop any
        // plumbing that is left and start a fresh epoch.
        self.signals.clear();
        self.child_pipe = None;
        self.io.clear();
        self.idles.clear();
        self.timers.clear();
        self.children.clear();
        Ok(())
    }
}
