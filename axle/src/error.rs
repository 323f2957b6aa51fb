// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words SIGCHLD

//! Diagnostic error type for every sentinel failure in the facade.
//!
//! All fallible API surface returns `Result<_, AxleError>`; nothing panics
//! for configuration errors, invalid watcher parameters, or engine refusals.
//! The two invariant violations the abstraction cannot recover from (an
//! engine refusing to re-arm or re-add a watcher it previously accepted) are
//! deliberate panics in [`crate::context`], not variants here.

use crate::types::WatcherKind;
use miette::Diagnostic;
use std::{io, os::fd::RawFd};

/// Everything that can go wrong while selecting an engine or managing
/// watchers.
#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum AxleError {
    /// No module satisfied the lookup. Nothing was loaded and nothing
    /// changed; callers decide whether to treat this as fatal.
    #[error("no usable event loop backend (requested: {requested:?})")]
    #[diagnostic(
        code(axle::loader::no_backend),
        help("check the backend name and the watcher types you required; registered modules must match the loader ABI version")
    )]
    NoBackend {
        /// The name the caller asked for, if any.
        requested: Option<String>,
    },

    /// The chosen module's loop constructor failed.
    #[error("backend `{backend}` failed to construct its loop")]
    #[diagnostic(
        code(axle::backend::init),
        help("this usually means the system ran out of file descriptors")
    )]
    BackendInit {
        backend: &'static str,
        #[source]
        source: io::Error,
    },

    /// The engine's blocking wait failed with something other than a
    /// retryable interruption.
    #[error("backend wait failed")]
    #[diagnostic(code(axle::backend::wait))]
    Wait(#[source] io::Error),

    /// The engine could not rebuild its internal state after a process
    /// discontinuity.
    #[error("backend reinitialization failed")]
    #[diagnostic(code(axle::backend::reinit))]
    Reinit(#[source] io::Error),

    /// The engine refused to add a watcher. The half-built event is freed
    /// before this is returned.
    #[error("backend `{backend}` refused to add the watcher")]
    #[diagnostic(code(axle::watcher::refused))]
    WatcherRefused {
        backend: &'static str,
        #[source]
        source: io::Error,
    },

    /// The active engine declared no support for this watcher family.
    #[error("backend `{backend}` does not support {kind} watchers")]
    #[diagnostic(
        code(axle::watcher::unsupported_type),
        help("pass the required TypeSet when constructing the Context to select a capable backend up front")
    )]
    UnsupportedType {
        kind: WatcherKind,
        backend: &'static str,
    },

    /// I/O watchers need a real descriptor.
    #[error("invalid file descriptor {fd} for an I/O watcher")]
    #[diagnostic(code(axle::watcher::bad_fd))]
    BadFileDescriptor { fd: RawFd },

    /// I/O watchers need at least one of `IO_READ` / `IO_WRITE`.
    #[error("an I/O watcher needs at least one of IO_READ / IO_WRITE")]
    #[diagnostic(code(axle::watcher::missing_io_direction))]
    MissingIoDirection,

    /// The child-exit signal is reserved for child watchers.
    #[error("signal {signum} is reserved for child watchers")]
    #[diagnostic(
        code(axle::watcher::reserved_signal),
        help("use add_child to watch for child termination instead of watching SIGCHLD directly")
    )]
    ReservedSignal { signum: i32 },

    /// Signal numbers must be non-negative.
    #[error("invalid signal number {signum}")]
    #[diagnostic(code(axle::watcher::invalid_signal))]
    InvalidSignal { signum: i32 },

    /// Child watchers need a real process id.
    #[error("invalid process id {pid} for a child watcher")]
    #[diagnostic(code(axle::watcher::invalid_pid))]
    InvalidPid { pid: i32 },

    /// A process terminates at most once, so a persistent child watcher has
    /// no meaning.
    #[error("PERSIST is not valid on a child watcher")]
    #[diagnostic(code(axle::watcher::persistent_child))]
    PersistentChild,

    /// Ignoring a signal exactly once has no defined semantics.
    #[error("an ignore-signal watcher must request PERSIST")]
    #[diagnostic(code(axle::watcher::one_shot_ignore))]
    OneShotIgnore,
}
