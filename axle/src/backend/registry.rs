// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words libaxle resolvable

//! Module selection: the loader half of the facade.
//!
//! All engine modules — the two built-ins plus anything handed to
//! [`register_module`] — are described by [`ModuleTable`]s. This module owns
//! the process-wide selection state and implements the lookup algorithm:
//!
//! 1. A name containing a path separator is parsed against the
//!    `libaxle-<name>.so` filename convention and resolved directly.
//! 2. A plain name synthesizes the convention filename and resolves that.
//! 3. No name: the cached default wins if it validates; otherwise the
//!    candidate list is scanned preferring modules whose declared required
//!    symbol is resident in the process, then the compile-time default
//!    (`AXLE_DEFAULT_BACKEND`, read at build time) is tried, then the scan
//!    repeats without the residency preference.
//!
//! A candidate is rejected when its ABI version does not match, when either
//! loop constructor entry is missing, or when it does not declare support
//! for a watcher family the caller requires. Rejection is silent except for
//! a trace record; lookup failure is [`AxleError::NoBackend`], never a
//! panic, and has no side effects.
//!
//! The first successful lookup caches its winner so later no-name lookups
//! are O(1). Selection state lives in one `thread_local` — the whole facade
//! is single-threaded by contract (a [`Context`] cannot leave its thread),
//! and [`reset`] exists so tests can isolate themselves.
//!
//! [`Context`]: crate::Context

use super::{
    MODULE_ABI_VERSION, MODULE_FILE_PREFIX, MODULE_FILE_SUFFIX, ModuleTable, mio_loop,
    poll_loop,
};
use crate::{context::ContextCore, error::AxleError, types::TypeSet};
use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

thread_local! {
    static STATE: RefCell<SelectionState> = RefCell::new(SelectionState::default());
}

#[derive(Default)]
struct SelectionState {
    /// Out-of-tree tables, scanned before the built-ins (an installed plugin
    /// shadows a stock one).
    external: Vec<&'static ModuleTable>,
    /// Winner of the first successful lookup.
    cached_default: Option<&'static ModuleTable>,
    /// Per-module singleton contexts handed out by [`Context::default_for`].
    ///
    /// [`Context::default_for`]: crate::Context::default_for
    default_contexts: Vec<(usize, Weak<ContextCore>)>,
}

/// A validated module plus the metadata the loader derived for it.
#[derive(Debug, Clone)]
pub struct ModuleRecord {
    table: &'static ModuleTable,
    filename: String,
}

impl ModuleRecord {
    fn new(table: &'static ModuleTable) -> Self {
        Self {
            table,
            filename: module_filename(table.name),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.table.name
    }

    /// The convention filename this module answers to.
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Watcher families the module declared support for.
    #[must_use]
    pub fn types(&self) -> TypeSet {
        self.table.types
    }

    pub(crate) fn table(&self) -> &'static ModuleTable {
        self.table
    }
}

static BUILTINS: [&ModuleTable; 2] = [&mio_loop::MODULE_TABLE, &poll_loop::MODULE_TABLE];

/// The built-in engine tables, in scan order.
#[must_use]
pub fn builtin_modules() -> &'static [&'static ModuleTable] {
    &BUILTINS
}

/// Make an out-of-tree engine table visible to the loader.
///
/// Registering the same table twice is a no-op. No validation happens here;
/// an unusable table is simply never selected.
pub fn register_module(table: &'static ModuleTable) {
    STATE.with(|state| {
        let mut state = state.borrow_mut();
        if !state
            .external
            .iter()
            .any(|t| std::ptr::eq(*t, table))
        {
            state.external.push(table);
        }
    });
}

/// Drop all selection state: external registrations, the cached default and
/// the default-context registry. For test isolation.
pub fn reset() {
    STATE.with(|state| {
        let mut state = state.borrow_mut();
        state.external.clear();
        state.cached_default = None;
        state.default_contexts.clear();
    });
}

/// Synthesize the convention filename for an engine name.
#[must_use]
pub fn module_filename(name: &str) -> String {
    format!("{MODULE_FILE_PREFIX}{name}{MODULE_FILE_SUFFIX}")
}

/// Extract the engine name from a convention-shaped path, if it is one.
pub(crate) fn module_name_from_path(path: &str) -> Option<&str> {
    let file = path.rsplit('/').next().unwrap_or(path);
    let name = file
        .strip_prefix(MODULE_FILE_PREFIX)?
        .strip_suffix(MODULE_FILE_SUFFIX)?;
    (!name.is_empty()).then_some(name)
}

fn validate(table: &'static ModuleTable, required: TypeSet) -> Result<(), &'static str> {
    if table.version != MODULE_ABI_VERSION {
        return Err("ABI version mismatch");
    }
    if table.new_loop.is_none() {
        return Err("missing loop constructor");
    }
    if table.default_loop.is_none() {
        return Err("missing default-loop constructor");
    }
    if !table.types.contains(required) {
        return Err("required watcher types unsupported");
    }
    Ok(())
}

/// Whether the module's declared required symbol resolves in this process.
/// Modules that declare nothing pass trivially, as they always have.
fn is_resident(table: &'static ModuleTable) -> bool {
    match (table.symbol, table.resident) {
        (None, _) => true,
        (Some(_), Some(probe)) => probe(),
        (Some(_), None) => false,
    }
}

fn candidates() -> Vec<&'static ModuleTable> {
    let mut all =
        STATE.with(|state| state.borrow().external.clone());
    all.extend_from_slice(builtin_modules());
    all
}

fn lookup_by_filename(
    filename: &str,
    required: TypeSet,
    need_resident: bool,
) -> Option<ModuleRecord> {
    for table in candidates() {
        if module_filename(table.name) != filename {
            continue;
        }
        if need_resident && !is_resident(table) {
            tracing::debug!(
                message = "module skipped in residency-preference pass",
                module = table.name
            );
            continue;
        }
        match validate(table, required) {
            Ok(()) => return Some(ModuleRecord::new(table)),
            Err(reason) => {
                tracing::debug!(
                    message = "module rejected",
                    module = table.name,
                    reason
                );
            }
        }
    }
    None
}

fn scan(required: TypeSet, need_resident: bool) -> Option<ModuleRecord> {
    for table in candidates() {
        if let Some(record) =
            lookup_by_filename(&module_filename(table.name), required, need_resident)
        {
            return Some(record);
        }
    }
    None
}

fn cache_winner(table: &'static ModuleTable) {
    STATE.with(|state| {
        let mut state = state.borrow_mut();
        if state.cached_default.is_none() {
            state.cached_default = Some(table);
            tracing::info!(message = "default backend module cached", module = table.name);
        }
    });
}

/// Run the full selection algorithm.
pub(crate) fn load(
    name: Option<&str>,
    required: TypeSet,
) -> Result<ModuleRecord, AxleError> {
    if let Some(raw) = name {
        let mut found = None;
        if raw.contains('/') {
            // Exact-path form: parse the name back out of the filename.
            if let Some(n) = module_name_from_path(raw) {
                found = lookup_by_filename(&module_filename(n), required, false);
            }
        }
        if found.is_none() {
            found = lookup_by_filename(&module_filename(raw), required, false);
        }
        let record = found.ok_or_else(|| AxleError::NoBackend {
            requested: Some(raw.to_string()),
        })?;
        cache_winner(record.table());
        return Ok(record);
    }

    // Cached default first; one that fails this caller's validation is
    // skipped, not an error.
    let cached = STATE.with(|state| state.borrow().cached_default);
    if let Some(table) = cached
        && validate(table, required).is_ok()
    {
        return Ok(ModuleRecord::new(table));
    }

    let record = scan(required, true)
        .or_else(|| {
            option_env!("AXLE_DEFAULT_BACKEND").and_then(|n| {
                lookup_by_filename(&module_filename(n), required, false)
            })
        })
        .or_else(|| scan(required, false))
        .ok_or(AxleError::NoBackend { requested: None })?;
    cache_winner(record.table());
    Ok(record)
}

/// Validate an arbitrary table for [`Context::convert`] and seed the default
/// cache with it, mirroring what adopting a foreign loop has always implied.
///
/// [`Context::convert`]: crate::Context::convert
pub(crate) fn record_for(table: &'static ModuleTable) -> Result<ModuleRecord, AxleError> {
    validate(table, TypeSet::empty()).map_err(|reason| {
        tracing::debug!(message = "module rejected", module = table.name, reason);
        AxleError::NoBackend {
            requested: Some(table.name.to_string()),
        }
    })?;
    cache_winner(table);
    Ok(ModuleRecord::new(table))
}

fn table_key(table: &'static ModuleTable) -> usize {
    std::ptr::from_ref(table) as usize
}

/// The live singleton context for a module, if one exists.
pub(crate) fn live_default_context(table: &'static ModuleTable) -> Option<Rc<ContextCore>> {
    STATE.with(|state| {
        let state = state.borrow();
        state
            .default_contexts
            .iter()
            .find(|(key, _)| *key == table_key(table))
            .and_then(|(_, weak)| weak.upgrade())
    })
}

pub(crate) fn remember_default_context(table: &'static ModuleTable, core: &Rc<ContextCore>) {
    STATE.with(|state| {
        let mut state = state.borrow_mut();
        state
            .default_contexts
            .retain(|(key, weak)| *key != table_key(table) && weak.strong_count() > 0);
        state
            .default_contexts
            .push((table_key(table), Rc::downgrade(core)));
    });
}

/// Prune dead singleton entries. Safe to call from drop glue during thread
/// teardown, when the `thread_local` may already be gone.
pub(crate) fn forget_dead_defaults() {
    let _ = STATE.try_with(|state| {
        if let Ok(mut state) = state.try_borrow_mut() {
            state
                .default_contexts
                .retain(|(_, weak)| weak.strong_count() > 0);
        }
    });
}
