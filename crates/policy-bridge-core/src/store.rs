//! Per-instance execution state and store management.
//!
//! This module provides:
//! - [`GuestState`]: host bookkeeping attached to each Wasmtime store
//! - [`LogEntry`] and [`LogLevel`]: text the guest emitted through host imports
//! - [`classify_fault`]: turning a failed guest call into a [`GuestFault`]
//!
//! A store (and with it linear memory and globals) belongs to exactly one pool
//! slot. It is never shared between concurrent evaluations.

use std::collections::HashMap;

use tracing::warn;
use wasmtime::{Memory, Store, StoreLimits, StoreLimitsBuilder, Trap};

use crate::WasmEngine;
use crate::instance::ExecutionLimits;
use policy_bridge_common::{EngineError, GuestAbort, GuestFault};

/// Host-side state attached to one instance's store.
///
/// Host imports reach it through [`wasmtime::Caller::data_mut`]. Evaluation
/// scratch (logs, abort message, builtin failures) is cleared at the start of
/// every evaluation; the rest lives as long as the slot.
pub struct GuestState {
    /// Pool slot this state belongs to (for tracing).
    pub slot_id: usize,

    /// Text the guest emitted during the current evaluation.
    pub logs: Vec<LogEntry>,

    /// Message passed to `opa_abort`, if the guest aborted.
    abort_message: Option<String>,

    /// Builtin ids that could not be served during the current evaluation.
    failed_builtins: Vec<i32>,

    /// Builtin id to name map published by the module.
    builtin_names: HashMap<i32, String>,

    /// The instance's linear memory (imported or exported).
    memory: Option<Memory>,

    /// Resource limits enforced by Wasmtime.
    limits: StoreLimits,
}

/// A single line of guest output.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Severity assigned by the import that received it.
    pub level: LogLevel,

    /// Message content (invalid UTF-8 replaced).
    pub message: String,
}

/// Log level for guest output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// `opa_println` output.
    Debug,
    /// `opa_abort` messages.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl GuestState {
    /// Create state for the given slot with a linear memory cap in bytes.
    pub fn new(slot_id: usize, memory_limit_bytes: usize) -> Self {
        Self {
            slot_id,
            logs: Vec::new(),
            abort_message: None,
            failed_builtins: Vec::new(),
            builtin_names: HashMap::new(),
            memory: None,
            limits: StoreLimitsBuilder::new()
                .memory_size(memory_limit_bytes)
                .instances(1)
                .build(),
        }
    }

    /// Add a log entry.
    pub fn log(&mut self, level: LogLevel, message: String) {
        self.logs.push(LogEntry { level, message });
    }

    /// Record that the guest called `opa_abort`.
    pub fn record_abort(&mut self, message: String) {
        self.abort_message = Some(message);
    }

    /// The abort message of the current evaluation, if any.
    pub fn abort_message(&self) -> Option<&str> {
        self.abort_message.as_deref()
    }

    /// Record a builtin call the host could not serve.
    pub fn record_failed_builtin(&mut self, builtin_id: i32) {
        if !self.failed_builtins.contains(&builtin_id) {
            self.failed_builtins.push(builtin_id);
        }
    }

    /// Drain the builtin ids that failed since the last call.
    pub fn take_failed_builtins(&mut self) -> Vec<i32> {
        std::mem::take(&mut self.failed_builtins)
    }

    /// Name of the builtin the module assigned to `builtin_id`.
    pub fn builtin_name(&self, builtin_id: i32) -> Option<&str> {
        self.builtin_names.get(&builtin_id).map(String::as_str)
    }

    /// Replace the builtin id map.
    pub fn set_builtin_names(&mut self, names: HashMap<i32, String>) {
        self.builtin_names = names;
    }

    /// The instance's linear memory.
    pub fn memory(&self) -> Option<Memory> {
        self.memory
    }

    /// Remember the instance's linear memory.
    pub fn set_memory(&mut self, memory: Memory) {
        self.memory = Some(memory);
    }

    /// Reset per-evaluation scratch.
    pub fn begin_evaluation(&mut self) {
        self.logs.clear();
        self.abort_message = None;
        self.failed_builtins.clear();
    }
}

/// Create a new Wasmtime store for one pool slot.
///
/// The store is armed with the configured fuel and epoch deadline so that
/// instantiation (which may run a start function) is already bounded.
///
/// # Errors
///
/// Returns an error if fuel cannot be set on the store.
pub fn create_store(
    engine: &WasmEngine,
    limits: &ExecutionLimits,
    slot_id: usize,
) -> Result<Store<GuestState>, EngineError> {
    let state = GuestState::new(slot_id, limits.memory_limit_bytes);
    let mut store = Store::new(engine.inner(), state);
    store.limiter(|state| &mut state.limits);

    if let Some(fuel) = limits.fuel {
        store
            .set_fuel(fuel)
            .map_err(|e| EngineError::invalid_config(format!("Failed to set fuel: {e}")))?;
    }
    if let Some(ticks) = limits.deadline_ticks {
        store.set_epoch_deadline(ticks);
    }

    Ok(store)
}

/// Re-arm the watchdog and fuel budget before an evaluation.
pub fn arm_store(store: &mut Store<GuestState>, limits: &ExecutionLimits) {
    if let Some(fuel) = limits.fuel {
        if let Err(e) = store.set_fuel(fuel) {
            warn!(slot = store.data().slot_id, error = %e, "Failed to refuel store");
        }
    }
    if let Some(ticks) = limits.deadline_ticks {
        store.set_epoch_deadline(ticks);
    }
}

/// Get remaining fuel from a store.
pub fn get_remaining_fuel(store: &Store<GuestState>) -> Option<u64> {
    store.get_fuel().ok()
}

/// Classify the error of a failed guest call.
///
/// An abort is recognised either by the [`GuestAbort`] payload travelling in
/// the error chain or by the message recorded on the state.
pub fn classify_fault(error: &wasmtime::Error, state: &GuestState) -> GuestFault {
    if error.downcast_ref::<GuestAbort>().is_some() || state.abort_message.is_some() {
        return GuestFault::Abort;
    }

    match error.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => GuestFault::FuelExhausted,
        Some(Trap::Interrupt) => GuestFault::Timeout,
        Some(trap) => GuestFault::Trap {
            code: Some(format!("{trap:?}")),
        },
        None => GuestFault::Trap { code: None },
    }
}
