// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words ECHILD NOHANG epoll kqueue reapable waitpid

//! # Architecture Overview
//!
//! The engine seam of the facade. A polling engine plugs in with two pieces:
//!
//! | Piece           | Responsibility                                                              |
//! | :-------------- | :-------------------------------------------------------------------------- |
//! | [`ModuleTable`] | Versioned capability table: name, ABI version, supported watcher families,  |
//! |                 | residency probe, loop constructors. Validated by the [`registry`] loader.   |
//! | [`BackendLoop`] | One live loop instance: block for readiness, add/remove watchers, break,    |
//! |                 | rebuild after a fork.                                                       |
//!
//! The table deliberately keeps its constructor entries as `Option` function
//! pointers: "table lacks mandatory entries" is a real rejection condition in
//! the loader, exactly as it was for a table resolved out of a shared object.
//! Everything *behind* a constructor is an ordinary trait object.
//!
//! # The dispatch contract
//!
//! The facade, not the engine, owns callback invocation. One cycle looks
//! like:
//!
//! ```text
//! Context::run_once
//!   └─ BackendLoop::wait(&mut batch)     blocks in the engine's native wait
//!        └─ batch: [(slot, detail), …]   readiness records, no callbacks yet
//!   └─ fire protocol                     priority order, depth counting,
//!                                        persistence, deferred deletion
//! ```
//!
//! An engine therefore never re-enters the facade; it only fills a
//! [`ReadyBatch`]. The slot in each record is the engine-private handle the
//! engine returned from [`BackendLoop::add`].
//!
//! # Two built-in engines
//!
//! | Engine   | Wait primitive           | Native break | Native timer persist |
//! | :------- | :----------------------- | :----------- | :------------------- |
//! | `"mio"`  | epoll / kqueue via `mio` | yes (waker)  | yes                  |
//! | `"poll"` | `poll(2)` via `rustix`   | no           | no                   |
//!
//! The deliberately uneven capability declarations keep both facade fallback
//! paths (exit-flag run loop, fire-time re-arm) exercised by real engines.

pub mod registry;

pub(crate) mod mio_loop;
pub(crate) mod poll_loop;
pub(crate) mod timers;

use crate::types::{ChildStatus, EventFlags, IoCondition, TypeSet, WatcherKind};
use rustix::process::{Pid, WaitOptions, waitpid};
use smallvec::SmallVec;
use std::{collections::HashMap, io, os::fd::RawFd, time::Duration};

/// ABI version a [`ModuleTable`] must declare to be loadable.
pub const MODULE_ABI_VERSION: u32 = 1;

/// Filename convention prefix for engine modules (`libaxle-<name>.so`).
pub const MODULE_FILE_PREFIX: &str = "libaxle-";

/// Filename convention suffix for engine modules.
pub const MODULE_FILE_SUFFIX: &str = ".so";

/// Versioned capability table describing one engine module.
///
/// Built-in engines expose one of these as a `static`; out-of-tree adapters
/// do the same and hand theirs to [`registry::register_module`]. The
/// [`registry`] validates version, mandatory constructor entries and declared
/// watcher-family support before a table is ever used.
#[derive(Debug, Clone, Copy)]
pub struct ModuleTable {
    /// Must equal [`MODULE_ABI_VERSION`].
    pub version: u32,

    /// Engine name; also the `<name>` in the `libaxle-<name>.so` convention.
    pub name: &'static str,

    /// Name of a symbol whose presence in the running process indicates the
    /// host is already linked against the wrapped engine. `None` for engines
    /// with nothing to probe (all statically linked built-ins).
    pub symbol: Option<&'static str>,

    /// Probe standing in for resolving [`symbol`] in-process. The loader's
    /// preference pass skips modules that declare a symbol whose probe is
    /// absent or returns `false`.
    ///
    /// [`symbol`]: Self::symbol
    pub resident: Option<fn() -> bool>,

    /// Watcher families this engine supports.
    pub types: TypeSet,

    /// Fresh-loop constructor. Mandatory; kept as `Option` so an incomplete
    /// table is a checkable loader rejection, not a compile error in the
    /// wrong crate.
    pub new_loop: Option<fn() -> io::Result<Box<dyn BackendLoop>>>,

    /// Default-loop constructor. Mandatory. Engines without an engine-global
    /// default loop point this at the same function as [`new_loop`].
    ///
    /// [`new_loop`]: Self::new_loop
    pub default_loop: Option<fn() -> io::Result<Box<dyn BackendLoop>>>,
}

/// Engine-private handle for one registered watcher.
///
/// Allocated by [`BackendLoop::add`], never reused within one loop instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendSlot(pub u64);

/// Kind-specific payload of an add request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherSpec {
    Io { fd: RawFd },
    Timeout { interval: Duration },
    Idle,
    Signal { signum: i32 },
    Child { pid: i32 },
}

impl WatcherSpec {
    #[must_use]
    pub const fn kind(self) -> WatcherKind {
        match self {
            Self::Io { .. } => WatcherKind::Io,
            Self::Timeout { .. } => WatcherKind::Timeout,
            Self::Idle => WatcherKind::Idle,
            Self::Signal { .. } => WatcherKind::Signal,
            Self::Child { .. } => WatcherKind::Child,
        }
    }
}

/// Everything an engine needs to register one watcher.
#[derive(Debug, Clone, Copy)]
pub struct AddRequest {
    pub spec: WatcherSpec,
    /// Flags as requested by the caller. The engine reports what it honored
    /// in [`AddOutcome::honored`].
    pub flags: EventFlags,
}

/// What the engine hands back from a successful [`BackendLoop::add`].
#[derive(Debug, Clone, Copy)]
pub struct AddOutcome {
    pub slot: BackendSlot,
    /// The requested flags minus anything the engine cannot express natively
    /// (e.g. `PERSIST` on an engine with one-shot timers). The facade
    /// compensates for the difference at fire time.
    pub honored: EventFlags,
}

/// Why a watcher became ready.
#[derive(Debug, Clone, Copy)]
pub enum FireDetail {
    /// Timeout, idle or signal: readiness itself is the whole story.
    Plain,
    /// I/O readiness with the observed condition bits.
    Io(IoCondition),
    /// Child termination with the reaped status.
    Child(ChildStatus),
}

/// One readiness record produced by [`BackendLoop::wait`].
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub slot: BackendSlot,
    pub detail: FireDetail,
}

/// Batch buffer for one wait cycle.
pub type ReadyBatch = SmallVec<[Readiness; 8]>;

/// Static capabilities of one live loop instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopCaps {
    /// The engine can latch a break request itself and report it through
    /// [`BackendLoop::take_break`]. Without this the facade falls back to its
    /// own exit flag, checked between cycles.
    pub native_break: bool,
}

/// One live engine loop.
///
/// Single-threaded by contract: every method is called from the thread that
/// owns the [`Context`], and [`wait`] is the only point that blocks.
///
/// [`Context`]: crate::Context
/// [`wait`]: Self::wait
pub trait BackendLoop {
    /// Static capabilities of this instance.
    fn caps(&self) -> LoopCaps;

    /// Block in the engine's native wait primitive until something is ready,
    /// then fill `ready`. Returning with an empty batch is legal (interrupted
    /// wait, wake-up with nothing to deliver); the facade just cycles again.
    fn wait(&mut self, ready: &mut ReadyBatch) -> io::Result<()>;

    /// Register one watcher. On success the engine owns whatever OS
    /// resources the watcher needs and reports the flags it honored.
    fn add(&mut self, req: &AddRequest) -> io::Result<AddOutcome>;

    /// Remove one watcher and release its OS resources. Must tolerate a slot
    /// that is already gone (e.g. a child watcher reaped in the same cycle).
    fn del(&mut self, slot: BackendSlot, req: &AddRequest);

    /// Request a break. Returns `true` if natively latched, `false` if the
    /// engine has no such notion (the facade then uses its exit flag).
    fn brk(&mut self) -> bool;

    /// Consume a natively latched break request, if any.
    fn take_break(&mut self) -> bool;

    /// Rebuild internal OS state after a process discontinuity (fork). All
    /// watchers have already been detached at the facade level; survivors are
    /// re-added through [`add`] afterwards.
    ///
    /// [`add`]: Self::add
    fn reinit(&mut self) -> io::Result<()>;
}

/// Reap any exited children among the registered child watchers.
///
/// Shared by both built-in engines: called when SIGCHLD plumbing fires, and
/// once at the top of every `wait` to close the gap where a child exits
/// before its watcher's signal plumbing is in place.
pub(crate) fn reap_exited_children(
    children: &mut HashMap<BackendSlot, i32>,
    ready: &mut ReadyBatch,
) {
    let mut done: SmallVec<[(BackendSlot, ChildStatus); 4]> = SmallVec::new();
    for (&slot, &raw_pid) in children.iter() {
        let Some(pid) = Pid::from_raw(raw_pid) else {
            done.push((slot, ChildStatus::Unknown));
            continue;
        };
        match waitpid(Some(pid), WaitOptions::NOHANG) {
            Ok(Some((_, status))) => {
                let status = status
                    .exit_status()
                    .map_or(ChildStatus::Signaled, |code| {
                        ChildStatus::Exited(code as i32)
                    });
                done.push((slot, status));
            }
            Ok(None) => {}
            // ECHILD: someone else reaped it. The watcher still completes.
            Err(_) => done.push((slot, ChildStatus::Unknown)),
        }
    }
    for (slot, status) in done {
        children.remove(&slot);
        ready.push(Readiness {
            slot,
            detail: FireDetail::Child(status),
        });
    }
}
