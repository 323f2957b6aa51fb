// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words SIGCHLD SIGUSR epoll kqueue libaxle reentrancy watmask

//! # axle
//!
//! Backend-agnostic event loop facade. Application and library code register
//! I/O, timeout, idle, signal and child-process watchers through one API; the
//! actual polling and readiness detection is delegated to exactly one of
//! several interchangeable engines, selected at runtime through a versioned
//! module table.
//!
//! What the facade owns — identically across engines:
//!
//! | Concern             | Behavior                                                             |
//! | :------------------ | :------------------------------------------------------------------- |
//! | Watcher lifecycle   | One-shot vs persistent, priorities, typed payload accessors          |
//! | Re-entrancy         | A callback may delete its own watcher, or run nested dispatch        |
//! | Persistence repair  | Engines without native persistence get re-armed by the facade        |
//! | Teardown            | Ordered force-delete of watchers, signal handlers unregistered       |
//! | Fork recovery       | [`Context::reinitialize`] rebuilds engine state, re-adds survivors   |
//! | Engine selection    | Name / residency-preference / cached-default lookup over modules     |
//!
//! # Quick start
//!
//! ```no_run
//! use axle::{Context, EventFlags, TypeSet};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), axle::AxleError> {
//!     // "Best available" engine that can do timeouts.
//!     let ctx = Context::new(None, TypeSet::TIMEOUT)?;
//!     ctx.add_timeout(EventFlags::empty(), Duration::from_millis(100), |ctx, _ev| {
//!         println!("tick");
//!         ctx.break_loop();
//!     })?;
//!     ctx.run()?;
//!     Ok(())
//! }
//! ```
//!
//! # Engines
//!
//! Two engines are built in: `"mio"` (epoll/kqueue) and `"poll"`
//! (portable `poll(2)`). Out-of-tree engines implement
//! [`backend::BackendLoop`], describe themselves with a
//! [`backend::ModuleTable`] and hand it to
//! [`backend::registry::register_module`]; the loader treats them exactly
//! like the built-ins, convention filename (`libaxle-<name>.so`) included.
//!
//! # Threading
//!
//! Single-threaded and cooperative by contract. A [`Context`] and its
//! [`Event`]s belong to the thread that runs them (`!Send`); callbacks run
//! synchronously on that thread, never concurrently with each other, and
//! [`Context::break_loop`] takes effect when control returns to the
//! dispatch loop. Unix only.

pub mod backend;

mod context;
mod error;
mod event;
mod types;

pub use context::Context;
pub use error::AxleError;
pub use event::Event;
pub use types::{ChildStatus, EventFlags, IoCondition, TypeSet, WatcherKind};
