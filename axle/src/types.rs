// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words SIGCHLD watmask

//! Watcher classification and flag types shared by the facade and the engines.
//!
//! | Type            | Role                                                          |
//! | :-------------- | :------------------------------------------------------------ |
//! | [`WatcherKind`] | Which of the five watcher families an event belongs to        |
//! | [`TypeSet`]     | Bitmask of watcher families (engine capability declarations)  |
//! | [`EventFlags`]  | Per-watcher request flags (persist, priority, I/O direction)  |
//! | [`IoCondition`] | What an I/O watcher observed when it became ready             |
//! | [`ChildStatus`] | How a watched child process terminated                        |

use bitflags::bitflags;
use strum_macros::{Display, EnumIter};

/// The five mutually exclusive watcher families.
///
/// Every event carries exactly one kind, stamped at construction. The kind
/// selects which payload accessor on [`Event`] is meaningful.
///
/// [`Event`]: crate::Event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum WatcherKind {
    /// File descriptor readiness (read and/or write).
    Io,
    /// A monotonic interval elapsed.
    Timeout,
    /// Nothing better to do this cycle.
    Idle,
    /// A POSIX signal was delivered to the process.
    Signal,
    /// A specific child process terminated.
    Child,
}

impl WatcherKind {
    /// The [`TypeSet`] bit corresponding to this kind.
    #[must_use]
    pub const fn as_type(self) -> TypeSet {
        match self {
            Self::Io => TypeSet::IO,
            Self::Timeout => TypeSet::TIMEOUT,
            Self::Idle => TypeSet::IDLE,
            Self::Signal => TypeSet::SIGNAL,
            Self::Child => TypeSet::CHILD,
        }
    }
}

bitflags! {
    /// Bitmask over [`WatcherKind`] families.
    ///
    /// Engines declare the families they support in their
    /// [`ModuleTable::types`] entry; callers pass the families they require
    /// to the loader, which rejects any module whose declared support does
    /// not cover the requested mask.
    ///
    /// [`ModuleTable::types`]: crate::backend::ModuleTable::types
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TypeSet: u8 {
        const IO      = 1 << 0;
        const TIMEOUT = 1 << 1;
        const IDLE    = 1 << 2;
        const SIGNAL  = 1 << 3;
        const CHILD   = 1 << 4;
    }
}

bitflags! {
    /// Flags requested when a watcher is added.
    ///
    /// The engine reports back, at add time, which of these it was able to
    /// honor (e.g. an engine with one-shot timers reports `PERSIST` off even
    /// when asked for it — the facade then re-arms the watcher itself after
    /// every fire).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventFlags: u16 {
        /// Fire repeatedly until deleted, instead of exactly once.
        const PERSIST         = 1 << 0;
        /// Dispatch after default-priority watchers in the same ready batch.
        const PRIORITY_LOW    = 1 << 1;
        /// Dispatch with default-priority watchers in the same ready batch.
        const PRIORITY_MEDIUM = 1 << 2;
        /// Dispatch before default-priority watchers in the same ready batch.
        const PRIORITY_HIGH   = 1 << 3;
        /// Watch the descriptor for readability.
        const IO_READ         = 1 << 4;
        /// Watch the descriptor for writability.
        const IO_WRITE        = 1 << 5;
        /// Close the watched descriptor when the event is torn down.
        const IO_CLOSE_FD     = 1 << 6;
        /// Keep this watcher across [`Context::reinitialize`].
        ///
        /// [`Context::reinitialize`]: crate::Context::reinitialize
        const REINITIABLE     = 1 << 7;
    }
}

impl EventFlags {
    /// Dispatch rank within one ready batch. Higher fires first; the default
    /// (no priority flag) ranks with `PRIORITY_MEDIUM`.
    #[must_use]
    pub(crate) const fn priority_rank(self) -> u8 {
        if self.contains(Self::PRIORITY_HIGH) {
            3
        } else if self.contains(Self::PRIORITY_LOW) {
            1
        } else {
            2
        }
    }
}

bitflags! {
    /// What an I/O watcher observed when it last became ready.
    ///
    /// Reported by the engine alongside readiness and readable through
    /// [`Event::fd_state`] from inside the callback.
    ///
    /// [`Event::fd_state`]: crate::Event::fd_state
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct IoCondition: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        /// The descriptor is in an error state (or is no longer valid).
        const ERROR    = 1 << 2;
        /// The peer closed its end; reads will return 0 once drained.
        const HANGUP   = 1 << 3;
    }
}

/// How a watched child process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    /// Normal exit with the given code.
    Exited(i32),
    /// Terminated by a signal.
    Signaled,
    /// The child was reaped by someone else before we could observe it.
    Unknown,
}
