// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words SIGCHLD reentrancy watmask

//! The context: one engine loop plus its registered watchers.
//!
//! # Construction paths
//!
//! | Path                     | Loop instance                | Sharing                           |
//! | :----------------------- | :--------------------------- | :-------------------------------- |
//! | [`Context::new`]         | Fresh, via module lookup     | None                              |
//! | [`Context::default_for`] | Per-module process singleton | Handle-counted; dies on last drop |
//! | [`Context::convert`]     | Caller-supplied loop         | None; seeds the default module    |
//!
//! A `Context` is a counted handle (`Rc` underneath, cloning is the incref).
//! When the last handle drops, every still-registered watcher is force
//! deleted in insertion order, then the engine loop itself is freed. The
//! singleton registry holds only weak references, so the default context's
//! teardown timing is exactly last-handle-drop — not garbage-collection
//! someday.
//!
//! # The fire protocol
//!
//! One readiness record dispatches as:
//!
//! 1. Stamp the observed payload (I/O condition, child status).
//! 2. Depth += 1, invoke the callback, depth -= 1.
//! 3. Back at depth zero: a deferred delete wins; otherwise a non-persistent
//!    watcher is deleted (exactly one shot); otherwise, if the engine could
//!    not honor persistence natively, the watcher is torn down at the engine
//!    and re-added from scratch — an engine refusing to re-add what it
//!    previously accepted is a fatal invariant violation, there is no
//!    defined fallback for a dangling watcher description.
//!
//! The depth counter exists because "fire, then self-unregister" is a
//! completely ordinary callback; without the deferral the unwind path would
//! walk through freed watcher state. It also tolerates nested dispatch (a
//! callback may call [`Context::run_once`]).

use crate::{
    backend::{
        AddRequest, BackendLoop, FireDetail, ModuleTable, ReadyBatch, WatcherSpec,
        registry::{self, ModuleRecord},
    },
    error::AxleError,
    event::{Callback, Event, EventCore},
    types::{EventFlags, TypeSet},
};
use signal_hook::consts::SIGCHLD;
use smallvec::SmallVec;
use std::{
    cell::{Cell, RefCell},
    os::fd::RawFd,
    rc::Rc,
    time::Duration,
};

#[allow(missing_debug_implementations)]
pub(crate) struct ContextCore {
    record: ModuleRecord,
    /// The engine loop. Binding is immutable after construction; the
    /// `RefCell` only serializes call-outs.
    backend: RefCell<Box<dyn BackendLoop>>,
    /// Insertion order is load-bearing only for teardown iteration.
    events: RefCell<Vec<Rc<EventCore>>>,
    /// Exit flag for engines without a native break latch; checked between
    /// cycles only.
    exit_requested: Cell<bool>,
    /// Was this handed out by the singleton path?
    is_default: Cell<bool>,
}

impl Drop for ContextCore {
    fn drop(&mut self) {
        // Force-delete every watcher, oldest first, before the engine goes.
        let events = std::mem::take(&mut *self.events.borrow_mut());
        for ev in &events {
            if let Some(slot) = ev.slot.take() {
                self.backend.borrow_mut().del(slot, &ev.request);
            }
            ev.finish_teardown();
        }
        tracing::debug!(
            message = "context torn down",
            backend = self.record.name(),
            events = events.len()
        );
        registry::forget_dead_defaults();
    }
}

/// Handle to one engine loop and its watchers. See the [module docs] for the
/// lifecycle and dispatch rules.
///
/// Not `Send`: a context and its events belong to the thread that runs them.
///
/// [module docs]: self
#[derive(Clone)]
#[allow(missing_debug_implementations)]
pub struct Context {
    core: Rc<ContextCore>,
}

impl Context {
    // ╭──────────────────────────────────────────────────────────╮
    // │ Construction                                             │
    // ╰──────────────────────────────────────────────────────────╯

    fn from_parts(record: ModuleRecord, backend: Box<dyn BackendLoop>, is_default: bool) -> Self {
        tracing::debug!(
            message = "context constructed",
            backend = record.name(),
            is_default
        );
        Self {
            core: Rc::new(ContextCore {
                record,
                backend: RefCell::new(backend),
                events: RefCell::new(Vec::new()),
                exit_requested: Cell::new(false),
                is_default: Cell::new(is_default),
            }),
        }
    }

    /// A fresh loop from the module selected by `name` (or the best
    /// available when `None`) that supports at least the `required` watcher
    /// families.
    ///
    /// # Errors
    ///
    /// [`AxleError::NoBackend`] when no module satisfies the lookup;
    /// [`AxleError::BackendInit`] when the module's constructor fails.
    pub fn new(name: Option<&str>, required: TypeSet) -> Result<Self, AxleError> {
        let record = registry::load(name, required)?;
        let ctor = record.table().new_loop.ok_or_else(|| AxleError::NoBackend {
            requested: name.map(String::from),
        })?;
        let backend = ctor().map_err(|source| AxleError::BackendInit {
            backend: record.name(),
            source,
        })?;
        Ok(Self::from_parts(record, backend, false))
    }

    /// The shared per-module default loop: if a default context for the
    /// selected module is alive, another handle to it; otherwise a new one,
    /// built with the module's default-loop constructor and recorded against
    /// the module.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Context::new`].
    pub fn default_for(name: Option<&str>, required: TypeSet) -> Result<Self, AxleError> {
        let record = registry::load(name, required)?;
        if let Some(core) = registry::live_default_context(record.table()) {
            return Ok(Self { core });
        }
        let ctor = record
            .table()
            .default_loop
            .ok_or_else(|| AxleError::NoBackend {
                requested: name.map(String::from),
            })?;
        let backend = ctor().map_err(|source| AxleError::BackendInit {
            backend: record.name(),
            source,
        })?;
        let ctx = Self::from_parts(record, backend, true);
        registry::remember_default_context(ctx.core.record.table(), &ctx.core);
        Ok(ctx)
    }

    /// Adopt an already-constructed engine loop under its module table. Also
    /// seeds the process default module, the way adopting a foreign loop
    /// always has.
    ///
    /// # Errors
    ///
    /// [`AxleError::NoBackend`] when the table itself does not validate.
    pub fn convert(
        table: &'static ModuleTable,
        backend: Box<dyn BackendLoop>,
    ) -> Result<Self, AxleError> {
        let record = registry::record_for(table)?;
        Ok(Self::from_parts(record, backend, false))
    }

    // ╭──────────────────────────────────────────────────────────╮
    // │ Introspection                                            │
    // ╰──────────────────────────────────────────────────────────╯

    /// Name of the engine module behind this context.
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.core.record.name()
    }

    /// Watcher families the active engine declared support for.
    #[must_use]
    pub fn supported_types(&self) -> TypeSet {
        self.core.record.types()
    }

    /// The loader record for the active module.
    #[must_use]
    pub fn module(&self) -> &ModuleRecord {
        &self.core.record
    }

    /// Was this handle obtained through the singleton path?
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.core.is_default.get()
    }

    /// Do two handles refer to the same underlying loop?
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }

    // ╭──────────────────────────────────────────────────────────╮
    // │ Running                                                  │
    // ╰──────────────────────────────────────────────────────────╯

    /// Dispatch until broken or until no watchers remain.
    ///
    /// With a native-break engine the engine's own latch ends the loop; with
    /// anything else the facade's exit flag does, checked between cycles — a
    /// break issued mid-cycle takes effect once that cycle completes.
    ///
    /// # Errors
    ///
    /// [`AxleError::Wait`] when the engine's wait fails unrecoverably.
    pub fn run(&self) -> Result<(), AxleError> {
        let native_break = self.core.backend.borrow().caps().native_break;
        loop {
            if self.core.events.borrow().is_empty() {
                return Ok(());
            }
            self.run_once()?;
            let broken = if native_break {
                self.core.backend.borrow_mut().take_break()
            } else if self.core.exit_requested.get() {
                self.core.exit_requested.set(false);
                true
            } else {
                false
            };
            if broken {
                return Ok(());
            }
        }
    }

    /// One cycle: block until something is ready, dispatch the whole batch.
    /// Returns immediately when no watchers are registered.
    ///
    /// # Errors
    ///
    /// [`AxleError::Wait`] when the engine's wait fails unrecoverably.
    pub fn run_once(&self) -> Result<(), AxleError> {
        run_cycle(&self.core)
    }

    /// Ask the dispatch loop to stop. Idempotent: repeated breaks before the
    /// loop re-checks its exit condition collapse into one.
    pub fn break_loop(&self) {
        let native = self.core.backend.borrow_mut().brk();
        if !native {
            self.core.exit_requested.set(true);
        }
    }

    /// Recover the loop across a process discontinuity (fork).
    ///
    /// Watchers flagged [`EventFlags::REINITIABLE`] are torn down at the
    /// engine but kept as events; everything else is fully deleted. The
    /// engine rebuilds its internal state, then every survivor is re-added.
    ///
    /// # Errors
    ///
    /// [`AxleError::Reinit`] when the engine cannot rebuild its state.
    ///
    /// # Panics
    ///
    /// When the engine refuses to re-add a surviving watcher — there is no
    /// well-defined recovery for a dangling watcher description.
    pub fn reinitialize(&self) -> Result<(), AxleError> {
        let snapshot: Vec<Rc<EventCore>> = self.core.events.borrow().clone();
        for ev in &snapshot {
            if ev.request.flags.contains(EventFlags::REINITIABLE) {
                if let Some(slot) = ev.slot.take() {
                    self.core.backend.borrow_mut().del(slot, &ev.request);
                }
            } else {
                destroy_event(&self.core, ev);
            }
        }
        self.core
            .backend
            .borrow_mut()
            .reinit()
            .map_err(AxleError::Reinit)?;
        let survivors: Vec<Rc<EventCore>> = self.core.events.borrow().clone();
        for ev in &survivors {
            match self.core.backend.borrow_mut().add(&ev.request) {
                Ok(outcome) => {
                    ev.slot.set(Some(outcome.slot));
                    ev.honored.set(outcome.honored);
                }
                Err(err) => {
                    panic!("backend could not re-add a reinitialized watcher: {err}")
                }
            }
        }
        Ok(())
    }

    // ╭──────────────────────────────────────────────────────────╮
    // │ Typed watcher constructors                               │
    // ╰──────────────────────────────────────────────────────────╯

    /// Watch a descriptor for readiness in the direction(s) named by
    /// `IO_READ` / `IO_WRITE`.
    ///
    /// # Errors
    ///
    /// Rejects a negative descriptor and a request with no direction flag;
    /// engine refusal surfaces as [`AxleError::WatcherRefused`].
    pub fn add_io(
        &self,
        flags: EventFlags,
        fd: RawFd,
        callback: impl Fn(&Context, &Event) + 'static,
    ) -> Result<Event, AxleError> {
        if fd < 0 {
            return Err(AxleError::BadFileDescriptor { fd });
        }
        if !flags.intersects(EventFlags::IO_READ | EventFlags::IO_WRITE) {
            return Err(AxleError::MissingIoDirection);
        }
        self.add_event(
            WatcherSpec::Io { fd },
            flags,
            Callback::Handler(Rc::new(callback)),
        )
    }

    /// Fire after `interval`, and every `interval` thereafter with
    /// `PERSIST`.
    ///
    /// # Errors
    ///
    /// Engine refusal surfaces as [`AxleError::WatcherRefused`].
    pub fn add_timeout(
        &self,
        flags: EventFlags,
        interval: Duration,
        callback: impl Fn(&Context, &Event) + 'static,
    ) -> Result<Event, AxleError> {
        self.add_event(
            WatcherSpec::Timeout { interval },
            flags,
            Callback::Handler(Rc::new(callback)),
        )
    }

    /// Fire whenever a cycle has nothing better to do.
    ///
    /// # Errors
    ///
    /// Engine refusal surfaces as [`AxleError::WatcherRefused`].
    pub fn add_idle(
        &self,
        flags: EventFlags,
        callback: impl Fn(&Context, &Event) + 'static,
    ) -> Result<Event, AxleError> {
        self.add_event(WatcherSpec::Idle, flags, Callback::Handler(Rc::new(callback)))
    }

    /// Fire when `signum` is delivered to the process.
    ///
    /// # Errors
    ///
    /// Rejects negative signal numbers and the child-exit signal (reserved
    /// for [`Context::add_child`]); engine refusal surfaces as
    /// [`AxleError::WatcherRefused`].
    pub fn add_signal(
        &self,
        flags: EventFlags,
        signum: i32,
        callback: impl Fn(&Context, &Event) + 'static,
    ) -> Result<Event, AxleError> {
        validate_signal(signum)?;
        self.add_event(
            WatcherSpec::Signal { signum },
            flags,
            Callback::Handler(Rc::new(callback)),
        )
    }

    /// Catch `signum` without invoking anything — the "ignore" registration.
    /// Requires `PERSIST`: ignoring a signal exactly once has no defined
    /// semantics.
    ///
    /// # Errors
    ///
    /// [`AxleError::OneShotIgnore`] without `PERSIST`; otherwise as
    /// [`Context::add_signal`].
    pub fn ignore_signal(&self, flags: EventFlags, signum: i32) -> Result<Event, AxleError> {
        if !flags.contains(EventFlags::PERSIST) {
            return Err(AxleError::OneShotIgnore);
        }
        validate_signal(signum)?;
        self.add_event(WatcherSpec::Signal { signum }, flags, Callback::Ignore)
    }

    /// Fire once when child process `pid` terminates. `PERSIST` is always
    /// rejected: a process terminates at most once.
    ///
    /// # Errors
    ///
    /// [`AxleError::PersistentChild`] with `PERSIST`;
    /// [`AxleError::InvalidPid`] for a non-positive pid; engine refusal
    /// surfaces as [`AxleError::WatcherRefused`].
    pub fn add_child(
        &self,
        flags: EventFlags,
        pid: i32,
        callback: impl Fn(&Context, &Event) + 'static,
    ) -> Result<Event, AxleError> {
        if flags.contains(EventFlags::PERSIST) {
            return Err(AxleError::PersistentChild);
        }
        if pid < 1 {
            return Err(AxleError::InvalidPid { pid });
        }
        self.add_event(
            WatcherSpec::Child { pid },
            flags,
            Callback::Handler(Rc::new(callback)),
        )
    }

    fn add_event(
        &self,
        spec: WatcherSpec,
        flags: EventFlags,
        callback: Callback,
    ) -> Result<Event, AxleError> {
        let kind = spec.kind();
        if !self.core.record.types().contains(kind.as_type()) {
            return Err(AxleError::UnsupportedType {
                kind,
                backend: self.core.record.name(),
            });
        }
        let request = AddRequest { spec, flags };
        let ev = Rc::new(EventCore::new(Rc::downgrade(&self.core), request, callback));
        let outcome = self
            .core
            .backend
            .borrow_mut()
            .add(&ev.request)
            .map_err(|source| AxleError::WatcherRefused {
                backend: self.core.record.name(),
                source,
            })?;
        ev.slot.set(Some(outcome.slot));
        ev.honored.set(outcome.honored);
        self.core.events.borrow_mut().push(Rc::clone(&ev));
        Ok(Event::from_core(ev))
    }
}

fn validate_signal(signum: i32) -> Result<(), AxleError> {
    if signum < 0 {
        return Err(AxleError::InvalidSignal { signum });
    }
    if signum == SIGCHLD {
        return Err(AxleError::ReservedSignal { signum });
    }
    Ok(())
}

// ╭──────────────────────────────────────────────────────────╮
// │ Dispatch                                                 │
// ╰──────────────────────────────────────────────────────────╯

fn run_cycle(core: &Rc<ContextCore>) -> Result<(), AxleError> {
    if core.events.borrow().is_empty() {
        return Ok(());
    }
    let mut ready = ReadyBatch::new();
    core.backend
        .borrow_mut()
        .wait(&mut ready)
        .map_err(AxleError::Wait)?;
    if ready.is_empty() {
        return Ok(());
    }

    // Resolve slots to events before any callback can mutate the set.
    let mut batch: SmallVec<[(Rc<EventCore>, FireDetail); 8]> = SmallVec::new();
    {
        let events = core.events.borrow();
        for record in &ready {
            match events.iter().find(|ev| ev.slot.get() == Some(record.slot)) {
                Some(ev) => batch.push((Rc::clone(ev), record.detail)),
                None => {
                    tracing::warn!(
                        message = "readiness for unknown backend slot",
                        slot = ?record.slot
                    );
                }
            }
        }
    }
    // Stable: equal priorities keep engine delivery order.
    batch.sort_by(|a, b| b.0.priority_rank().cmp(&a.0.priority_rank()));

    for (ev, detail) in batch {
        // Deleted by an earlier callback in this same batch.
        if ev.dead.get() || ev.slot.get().is_none() {
            continue;
        }
        fire(core, &ev, detail);
    }
    Ok(())
}

fn fire(core: &Rc<ContextCore>, ev: &Rc<EventCore>, detail: FireDetail) {
    match detail {
        FireDetail::Io(cond) => ev.fd_state.set(cond),
        FireDetail::Child(status) => ev.child_status.set(Some(status)),
        FireDetail::Plain => {}
    }

    ev.depth.set(ev.depth.get() + 1);
    if let Callback::Handler(callback) = &ev.callback {
        let callback = Rc::clone(callback);
        let ctx = Context {
            core: Rc::clone(core),
        };
        let handle = Event::from_core(Rc::clone(ev));
        callback(&ctx, &handle);
    }
    ev.depth.set(ev.depth.get() - 1);

    if ev.depth.get() > 0 {
        // Nested dispatch still unwinding; the outermost frame settles it.
        return;
    }
    if ev.deferred_delete.get() {
        destroy_event(core, ev);
    } else if !ev.request.flags.contains(EventFlags::PERSIST) {
        // Non-persistent watchers are exactly one-shot.
        destroy_event(core, ev);
    } else if !ev.honored.get().contains(EventFlags::PERSIST) {
        rearm(core, ev);
    }
    // Else the engine auto-persists; nothing to do.
}

/// Re-register a persistent watcher whose engine could not persist it
/// natively, replacing its engine-private slot.
fn rearm(core: &ContextCore, ev: &Rc<EventCore>) {
    if let Some(slot) = ev.slot.take() {
        core.backend.borrow_mut().del(slot, &ev.request);
    }
    match core.backend.borrow_mut().add(&ev.request) {
        Ok(outcome) => {
            ev.slot.set(Some(outcome.slot));
            ev.honored.set(outcome.honored);
        }
        Err(err) => panic!("backend refused to re-arm a watcher it previously accepted: {err}"),
    }
}

/// Entry point for all delete requests; defers when the event is firing.
pub(crate) fn delete_event(core: &Rc<ContextCore>, ev: &Rc<EventCore>) {
    if ev.dead.get() {
        return;
    }
    if ev.depth.get() > 0 {
        ev.deferred_delete.set(true);
        return;
    }
    destroy_event(core, ev);
}

fn destroy_event(core: &ContextCore, ev: &Rc<EventCore>) {
    // Idempotent: a firing event can reach here twice when its callback
    // forced a teardown (e.g. via reinitialize) before the unwind did.
    if ev.dead.get() {
        return;
    }
    if let Some(slot) = ev.slot.take() {
        core.backend.borrow_mut().del(slot, &ev.request);
    }
    core.events.borrow_mut().retain(|e| !Rc::ptr_eq(e, ev));
    ev.finish_teardown();
}
