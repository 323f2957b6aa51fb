// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words libaxle

//! Module selection scenarios: naming convention, validation rejections,
//! residency preference, default caching, and the out-of-tree module ABI.
//!
//! The synthetic modules here implement the full [`BackendLoop`] trait —
//! they double as proof the adapter seam is usable from outside the crate.

use axle::{
    AxleError, Context, EventFlags, TypeSet,
    backend::{
        AddOutcome, AddRequest, BackendLoop, BackendSlot, LoopCaps, MODULE_ABI_VERSION,
        ModuleTable, ReadyBatch, registry,
    },
};
use pretty_assertions::assert_eq;
use std::{io, time::Duration};

/// Capture loader trace records in test output (`--nocapture` to see them).
fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// ╭──────────────────────────────────────────────────────────╮
// │ A minimal out-of-tree engine                             │
// ╰──────────────────────────────────────────────────────────╯

#[derive(Debug, Default)]
struct NullLoop {
    next_slot: u64,
    broke: bool,
}

impl BackendLoop for NullLoop {
    fn caps(&self) -> LoopCaps {
        LoopCaps { native_break: true }
    }

    fn wait(&mut self, _ready: &mut ReadyBatch) -> io::Result<()> {
        Ok(())
    }

    fn add(&mut self, req: &AddRequest) -> io::Result<AddOutcome> {
        let slot = BackendSlot(self.next_slot);
        self.next_slot += 1;
        Ok(AddOutcome {
            slot,
            honored: req.flags,
        })
    }

    fn del(&mut self, _slot: BackendSlot, _req: &AddRequest) {}

    fn brk(&mut self) -> bool {
        self.broke = true;
        true
    }

    fn take_break(&mut self) -> bool {
        std::mem::replace(&mut self.broke, false)
    }

    fn reinit(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn null_new() -> io::Result<Box<dyn BackendLoop>> {
    Ok(Box::new(NullLoop::default()))
}

fn probe_present() -> bool {
    true
}

fn probe_absent() -> bool {
    false
}

static NULL_TABLE: ModuleTable = ModuleTable {
    version: MODULE_ABI_VERSION,
    name: "null",
    symbol: None,
    resident: None,
    types: TypeSet::all(),
    new_loop: Some(null_new),
    default_loop: Some(null_new),
};

static TIMER_ONLY_TABLE: ModuleTable = ModuleTable {
    version: MODULE_ABI_VERSION,
    name: "timeronly",
    symbol: None,
    resident: None,
    types: TypeSet::TIMEOUT,
    new_loop: Some(null_new),
    default_loop: Some(null_new),
};

static STALE_TABLE: ModuleTable = ModuleTable {
    version: MODULE_ABI_VERSION + 1,
    name: "stale",
    symbol: None,
    resident: None,
    types: TypeSet::all(),
    new_loop: Some(null_new),
    default_loop: Some(null_new),
};

static HALF_TABLE: ModuleTable = ModuleTable {
    version: MODULE_ABI_VERSION,
    name: "half",
    symbol: None,
    resident: None,
    types: TypeSet::all(),
    new_loop: Some(null_new),
    default_loop: None,
};

static LINKED_TABLE: ModuleTable = ModuleTable {
    version: MODULE_ABI_VERSION,
    name: "linked",
    symbol: Some("fake_engine_present"),
    resident: Some(probe_present),
    types: TypeSet::all(),
    new_loop: Some(null_new),
    default_loop: Some(null_new),
};

static UNLINKED_TABLE: ModuleTable = ModuleTable {
    version: MODULE_ABI_VERSION,
    name: "unlinked",
    symbol: Some("fake_engine_absent"),
    resident: Some(probe_absent),
    types: TypeSet::all(),
    new_loop: Some(null_new),
    default_loop: Some(null_new),
};

// ╭──────────────────────────────────────────────────────────╮
// │ Lookup                                                   │
// ╰──────────────────────────────────────────────────────────╯

#[test]
fn named_lookup_finds_builtins() {
    init_logging();
    registry::reset();
    let mio = Context::new(Some("mio"), TypeSet::all()).unwrap();
    assert_eq!(mio.backend_name(), "mio");
    let poll = Context::new(Some("poll"), TypeSet::all()).unwrap();
    assert_eq!(poll.backend_name(), "poll");
    assert_eq!(poll.supported_types(), TypeSet::all());
    assert_eq!(poll.module().filename(), "libaxle-poll.so");
}

#[test]
fn path_shaped_names_resolve_through_the_filename_convention() {
    registry::reset();
    let ctx = Context::new(Some("/usr/lib64/libaxle-poll.so"), TypeSet::IO).unwrap();
    assert_eq!(ctx.backend_name(), "poll");
}

#[test]
fn unknown_name_is_not_found() {
    registry::reset();
    assert!(matches!(
        Context::new(Some("no-such-engine"), TypeSet::empty()),
        Err(AxleError::NoBackend { .. })
    ));
}

// ╭──────────────────────────────────────────────────────────╮
// │ Validation rejections                                    │
// ╰──────────────────────────────────────────────────────────╯

#[test]
fn version_mismatch_is_rejected_without_side_effects() {
    init_logging();
    registry::reset();
    registry::register_module(&STALE_TABLE);
    assert!(matches!(
        Context::new(Some("stale"), TypeSet::empty()),
        Err(AxleError::NoBackend { .. })
    ));
    // The failed lookup cached nothing: the unconstrained scan still picks
    // the first builtin.
    assert_eq!(
        Context::new(None, TypeSet::empty()).unwrap().backend_name(),
        "mio"
    );
}

#[test]
fn missing_constructor_entry_is_rejected() {
    registry::reset();
    registry::register_module(&HALF_TABLE);
    assert!(matches!(
        Context::new(Some("half"), TypeSet::empty()),
        Err(AxleError::NoBackend { .. })
    ));
}

#[test]
fn required_watcher_types_are_validated() {
    registry::reset();
    registry::register_module(&TIMER_ONLY_TABLE);
    assert!(Context::new(Some("timeronly"), TypeSet::TIMEOUT).is_ok());
    assert!(matches!(
        Context::new(Some("timeronly"), TypeSet::TIMEOUT | TypeSet::IO),
        Err(AxleError::NoBackend { .. })
    ));
}

#[test]
fn unsupported_watcher_family_is_refused_at_add_time() {
    registry::reset();
    registry::register_module(&TIMER_ONLY_TABLE);
    let ctx = Context::new(Some("timeronly"), TypeSet::TIMEOUT).unwrap();
    let ev = ctx
        .add_timeout(EventFlags::empty(), Duration::from_secs(1), |_ctx, _ev| {})
        .unwrap();
    assert!(matches!(
        ctx.add_idle(EventFlags::empty(), |_ctx, _ev| {}),
        Err(AxleError::UnsupportedType { .. })
    ));
    ev.delete();
}

// ╭──────────────────────────────────────────────────────────╮
// │ Selection preference and caching                         │
// ╰──────────────────────────────────────────────────────────╯

#[test]
fn scan_prefers_modules_whose_symbol_is_resident() {
    registry::reset();
    // Registered modules scan before the builtins, but this one's declared
    // symbol does not resolve, so the preference pass skips it.
    registry::register_module(&UNLINKED_TABLE);
    assert_eq!(
        Context::new(None, TypeSet::empty()).unwrap().backend_name(),
        "mio"
    );

    registry::reset();
    registry::register_module(&LINKED_TABLE);
    assert_eq!(
        Context::new(None, TypeSet::empty()).unwrap().backend_name(),
        "linked"
    );
}

#[test]
fn unresident_module_still_loads_by_name() {
    registry::reset();
    registry::register_module(&UNLINKED_TABLE);
    // Residency is a scan preference, not a named-lookup requirement.
    assert_eq!(
        Context::new(Some("unlinked"), TypeSet::empty())
            .unwrap()
            .backend_name(),
        "unlinked"
    );
}

#[test]
fn first_success_is_cached_for_no_name_lookups() {
    registry::reset();
    let first = Context::new(Some("poll"), TypeSet::empty()).unwrap();
    drop(first);
    // The cache survives the context; a no-name lookup reuses it.
    assert_eq!(
        Context::new(None, TypeSet::empty()).unwrap().backend_name(),
        "poll"
    );

    registry::reset();
    assert_eq!(
        Context::new(None, TypeSet::empty()).unwrap().backend_name(),
        "mio"
    );
}

#[test]
fn cached_default_lacking_required_types_falls_back_to_scan() {
    registry::reset();
    registry::register_module(&TIMER_ONLY_TABLE);
    let _seed = Context::new(Some("timeronly"), TypeSet::TIMEOUT).unwrap();
    // The cached module cannot satisfy IO; the scan must take over.
    assert_eq!(
        Context::new(None, TypeSet::IO).unwrap().backend_name(),
        "mio"
    );
}

// ╭──────────────────────────────────────────────────────────╮
// │ Convert and the module ABI                               │
// ╰──────────────────────────────────────────────────────────╯

#[test]
fn convert_adopts_a_foreign_loop_and_seeds_the_default() {
    registry::reset();
    let foreign = null_new().unwrap();
    let ctx = Context::convert(&NULL_TABLE, foreign).unwrap();
    assert_eq!(ctx.backend_name(), "null");

    // Adoption set the process default module.
    assert_eq!(
        Context::new(None, TypeSet::empty()).unwrap().backend_name(),
        "null"
    );
}

#[test]
fn convert_validates_the_table() {
    registry::reset();
    assert!(matches!(
        Context::convert(&STALE_TABLE, null_new().unwrap()),
        Err(AxleError::NoBackend { .. })
    ));
}

#[test]
fn registered_engine_accepts_watchers_through_the_facade() {
    registry::reset();
    registry::register_module(&NULL_TABLE);
    let ctx = Context::new(Some("null"), TypeSet::all()).unwrap();
    let ev = ctx
        .add_timeout(EventFlags::PERSIST, Duration::from_secs(5), |_ctx, _ev| {})
        .unwrap();
    assert!(ev.is_active());
    ev.delete();
    assert!(!ev.is_active());
}

#[test]
fn registering_twice_is_a_no_op() {
    registry::reset();
    registry::register_module(&NULL_TABLE);
    registry::register_module(&NULL_TABLE);
    assert_eq!(
        Context::new(Some("null"), TypeSet::empty())
            .unwrap()
            .backend_name(),
        "null"
    );
}
