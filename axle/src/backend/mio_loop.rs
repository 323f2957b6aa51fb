// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words EEXIST EINTR SIGCHLD epoll eventfd kqueue libaxle

//! The `"mio"` engine: epoll on Linux, kqueue on macOS.
//!
//! # Resources Managed
//!
//! | Resource           | Purpose                                              |
//! | :----------------- | :--------------------------------------------------- |
//! | [`mio::Poll`]      | Wait efficiently on watcher fds and signals together |
//! | [`mio::Waker`]     | Native break latch: interrupt a blocked wait         |
//! | [`Signals`]        | Pipe adapter turning signal delivery into readability |
//! | [`TimerHeap`]      | Deadline heap; recurring timers re-arm in-engine     |
//!
//! Token space: watcher slots map 1:1 onto [`mio::Token`]s counting up from
//! zero; the waker and the signal adapter sit at the top of the range where
//! no slot can collide with them.
//!
//! One epoll registration per fd: asking for a second I/O watcher on the
//! same descriptor surfaces the OS-level `EEXIST` as an add refusal.
//!
//! Readiness is edge-style (mio registers edge-triggered): a persistent I/O
//! watcher's callback should drain the descriptor before returning, or the
//! next readiness notification may not come.
//!
//! [`Signals`]: signal_hook_mio::v1_0::Signals

use super::{
    AddOutcome, AddRequest, BackendLoop, BackendSlot, FireDetail, LoopCaps,
    MODULE_ABI_VERSION, ModuleTable, Readiness, ReadyBatch, WatcherSpec,
    reap_exited_children, timers::TimerHeap,
};
use crate::types::{EventFlags, IoCondition, TypeSet};
use mio::{Events, Interest, Poll, Token, Waker, unix::SourceFd};
use signal_hook::consts::SIGCHLD;
use signal_hook_mio::v1_0::Signals;
use smallvec::SmallVec;
use std::{
    collections::{HashMap, HashSet},
    io::{self, ErrorKind},
    time::{Duration, Instant},
};

/// Capacity for the [`mio::Events`] buffer.
const EVENTS_CAPACITY: usize = 8;

const WAKER_TOKEN: Token = Token(usize::MAX);
const SIGNALS_TOKEN: Token = Token(usize::MAX - 1);

pub(crate) static MODULE_TABLE: ModuleTable = ModuleTable {
    version: MODULE_ABI_VERSION,
    name: "mio",
    symbol: None,
    resident: None,
    types: TypeSet::all(),
    new_loop: Some(new_loop),
    default_loop: Some(new_loop),
};

fn new_loop() -> io::Result<Box<dyn BackendLoop>> {
    Ok(Box::new(MioLoop::new()?))
}

#[allow(missing_debug_implementations)]
pub(crate) struct MioLoop {
    poll: Poll,
    ready_events: Events,
    waker: Waker,
    broke: bool,
    next_slot: u64,
    /// Tokens currently registered for fd readiness.
    io: HashSet<Token>,
    timers: TimerHeap,
    idles: Vec<BackendSlot>,
    /// Signal adapter; rebuilt whenever the watched signal set changes
    /// (the adapter cannot shrink in place).
    signals: Option<Signals>,
    signal_set: Vec<i32>,
    signal_slots: HashMap<i32, Vec<BackendSlot>>,
    children: HashMap<BackendSlot, i32>,
}

impl MioLoop {
    fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        // Waker comes from the poll's registry, before any sources register.
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(Self {
            poll,
            ready_events: Events::with_capacity(EVENTS_CAPACITY),
            waker,
            broke: false,
            next_slot: 0,
            io: HashSet::new(),
            timers: TimerHeap::default(),
            idles: Vec::new(),
            signals: None,
            signal_set: Vec::new(),
            signal_slots: HashMap::new(),
            children: HashMap::new(),
        })
    }

    fn alloc_slot(&mut self) -> BackendSlot {
        let slot = BackendSlot(self.next_slot);
        self.next_slot += 1;
        slot
    }

    fn watch_signal(&mut self, signum: i32) -> io::Result<()> {
        if self.signal_set.contains(&signum) {
            return Ok(());
        }
        self.signal_set.push(signum);
        if let Err(err) = self.rebuild_signals() {
            self.signal_set.pop();
            let _ = self.rebuild_signals();
            return Err(err);
        }
        Ok(())
    }

    fn unwatch_signal(&mut self, signum: i32) {
        self.signal_set.retain(|s| *s != signum);
        let _ = self.rebuild_signals();
    }

    fn rebuild_signals(&mut self) -> io::Result<()> {
        if let Some(mut old) = self.signals.take() {
            let _ = self.poll.registry().deregister(&mut old);
        }
        if self.signal_set.is_empty() {
            return Ok(());
        }
        let mut signals = Signals::new(self.signal_set.iter().copied())?;
        self.poll
            .registry()
            .register(&mut signals, SIGNALS_TOKEN, Interest::READABLE)?;
        self.signals = Some(signals);
        Ok(())
    }

    fn drain_signals(&mut self, ready: &mut ReadyBatch) {
        let Some(signals) = self.signals.as_mut() else {
            return;
        };
        for signum in signals.pending() {
            if signum == SIGCHLD {
                reap_exited_children(&mut self.children, ready);
                continue;
            }
            if let Some(slots) = self.signal_slots.get(&signum) {
                for &slot in slots {
                    ready.push(Readiness {
                        slot,
                        detail: FireDetail::Plain,
                    });
                }
            }
        }
    }
}

impl BackendLoop for MioLoop {
    fn caps(&self) -> LoopCaps {
        LoopCaps { native_break: true }
    }

    fn wait(&mut self, ready: &mut ReadyBatch) -> io::Result<()> {
        // A child may have exited before SIGCHLD plumbing was armed; catch
        // that before blocking.
        reap_exited_children(&mut self.children, ready);
        if !ready.is_empty() {
            return Ok(());
        }

        let timeout = if self.idles.is_empty() {
            self.timers.next_timeout(Instant::now())
        } else {
            Some(Duration::ZERO)
        };

        match self.poll.poll(&mut self.ready_events, timeout) {
            Ok(()) => {}
            // EINTR: retry on the next cycle.
            Err(err) if err.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }

        self.timers.collect_expired(Instant::now(), ready);

        // Copy out tokens and conditions so dispatch below can borrow self.
        let mut hits: SmallVec<[(Token, IoCondition); 8]> = SmallVec::new();
        for event in self.ready_events.iter() {
            let mut cond = IoCondition::empty();
            if event.is_readable() {
                cond |= IoCondition::READABLE;
            }
            if event.is_writable() {
                cond |= IoCondition::WRITABLE;
            }
            if event.is_error() {
                cond |= IoCondition::ERROR;
            }
            if event.is_read_closed() || event.is_write_closed() {
                cond |= IoCondition::HANGUP;
            }
            hits.push((event.token(), cond));
        }

        for (token, cond) in hits {
            if token == WAKER_TOKEN {
                // Wake-up only; the latch is read through take_break.
                continue;
            }
            if token == SIGNALS_TOKEN {
                self.drain_signals(ready);
                continue;
            }
            if self.io.contains(&token) {
                ready.push(Readiness {
                    slot: BackendSlot(token.0 as u64),
                    detail: FireDetail::Io(cond),
                });
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
        match req.spec {
            WatcherSpec::Io { fd } => {
                let interest = match (
                    req.flags.contains(EventFlags::IO_READ),
                    req.flags.contains(EventFlags::IO_WRITE),
                ) {
                    (true, true) => Interest::READABLE | Interest::WRITABLE,
                    (true, false) => Interest::READABLE,
                    (false, true) => Interest::WRITABLE,
                    (false, false) => return Err(io::Error::from(ErrorKind::InvalidInput)),
                };
                let token = Token(slot.0 as usize);
                self.poll
                    .registry()
                    .register(&mut SourceFd(&fd), token, interest)?;
                self.io.insert(token);
            }
            WatcherSpec::Timeout { interval } => self.timers.insert(
                slot,
                interval,
                req.flags.contains(EventFlags::PERSIST),
                Instant::now(),
            ),
            WatcherSpec::Idle => self.idles.push(slot),
            WatcherSpec::Signal { signum } => {
                self.watch_signal(signum)?;
                self.signal_slots.entry(signum).or_default().push(slot);
            }
            WatcherSpec::Child { pid } => {
                self.watch_signal(SIGCHLD)?;
                self.children.insert(slot, pid);
            }
        }
        Ok(AddOutcome {
            slot,
            honored: req.flags,
        })
    }

    fn del(&mut self, slot: BackendSlot, req: &AddRequest) {
        match req.spec {
            WatcherSpec::Io { fd } => {
                let token = Token(slot.0 as usize);
                if self.io.remove(&token) {
                    let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                }
            }
            WatcherSpec::Timeout { .. } => self.timers.remove(slot),
            WatcherSpec::Idle => self.idles.retain(|s| *s != slot),
            WatcherSpec::Signal { signum } => {
                if let Some(slots) = self.signal_slots.get_mut(&signum) {
                    slots.retain(|s| *s != slot);
                    if slots.is_empty() {
                        self.signal_slots.remove(&signum);
                        self.unwatch_signal(signum);
                    }
                }
            }
            WatcherSpec::Child { .. } => {
                self.children.remove(&slot);
                if self.children.is_empty() {
                    self.unwatch_signal(SIGCHLD);
                }
            }
        }
    }

    fn brk(&mut self) -> bool {
        self.broke = true;
        // A blocked wait, if any, must observe the latch promptly.
        let _ = self.waker.wake();
        true
    }

    fn take_break(&mut self) -> bool {
        std::mem::replace(&mut self.broke, false)
    }

    fn reinit(&mut self) -> io::Result<()> {
        // epoll descriptors and signal plumbing are shared with the parent
        // after a fork; rebuild all OS state from scratch.
        self.signals = None;
        self.signal_set.clear();
        self.signal_slots.clear();
        self.poll = Poll::new()?;
        self.waker = Waker::new(self.poll.registry(), WAKER_TOKEN)?;
        self.ready_events = Events::with_capacity(EVENTS_CAPACITY);
        self.broke = false;
        self.io.clear();
        self.idles.clear();
        self.timers.clear();
        self.children.clear();
        Ok(())
    }
}
