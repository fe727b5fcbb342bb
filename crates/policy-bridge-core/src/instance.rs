//! Module instantiation and the capability descriptor.
//!
//! This module provides:
//! - [`InstanceFactory`]: binds the compiled artifact to a fresh store and the
//!   host import table, producing one [`ModuleInstance`] per pool slot
//! - [`ModuleInstance`]: an instantiated policy module plus its typed exports
//! - [`Capabilities`]: which evaluation protocols the module supports,
//!   computed once at instantiation
//!
//! Guest calls made through [`ModuleInstance`] never return raw Wasmtime
//! errors; failures are classified into [`GuestFault`] on the spot.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use wasmtime::{Instance, Linker, Memory, Store, TypedFunc, Val, WasmParams, WasmResults};

use crate::engine::deadline_ticks;
use crate::memory::read_c_string;
use crate::store::{GuestState, arm_store, classify_fault, create_store, get_remaining_fuel};
use crate::{CompiledArtifact, WasmEngine};
use policy_bridge_common::{BridgeConfig, EngineError, GuestFault, LoadError, MarshalError};

/// Major ABI version this host speaks.
pub const SUPPORTED_ABI_MAJOR: i32 = 1;

/// Per-evaluation resource limits applied to every store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Fuel granted per evaluation; `None` when metering is off.
    pub fuel: Option<u64>,
    /// Epoch deadline per evaluation; `None` when interruption is off.
    pub deadline_ticks: Option<u64>,
    /// Upper bound for NUL-terminated reads.
    pub max_result_bytes: usize,
    /// Linear memory cap per instance.
    pub memory_limit_bytes: usize,
}

impl ExecutionLimits {
    /// Derive limits from the bridge configuration.
    pub fn from_config(config: &BridgeConfig) -> Self {
        let engine = &config.engine;
        Self {
            fuel: engine.fuel_metering.then_some(config.evaluation.max_fuel),
            deadline_ticks: engine
                .epoch_interruption
                .then(|| deadline_ticks(config.evaluation.timeout_ms, engine.epoch_tick_ms)),
            max_result_bytes: config.evaluation.max_result_bytes,
            memory_limit_bytes: engine.instance_memory_bytes(),
        }
    }
}

/// What the instantiated module can do.
///
/// Protocol selection consults these flags instead of probing export names
/// on every call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// Context API exports, allocator, and memory are all present.
    pub supports_context_api: bool,
    /// A single-call `eval(input_addr)` export is present.
    pub supports_simple_api: bool,
    /// `opa_malloc` and `opa_free` are exported.
    pub has_allocator: bool,
    /// The instance has a linear memory.
    pub has_memory: bool,
    /// `opa_json_parse` is exported.
    pub has_json_parse: bool,
    /// `opa_json_dump` is exported.
    pub has_json_dump: bool,
    /// `opa_eval_ctx_get_result_len` is exported.
    pub has_result_len: bool,
    /// `opa_heap_ptr_get` and `opa_heap_ptr_set` are exported.
    pub has_heap_reset: bool,
    /// `builtins` is exported.
    pub has_builtins: bool,
}

/// ABI version declared by the module's globals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AbiVersion {
    /// `opa_wasm_abi_version`.
    pub major: i32,
    /// `opa_wasm_abi_minor_version`, `0` when not exported.
    pub minor: i32,
}

impl std::fmt::Display for AbiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Allocation counters kept by the host side of the marshaler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarshalStats {
    /// Successful `opa_malloc` calls made by the host.
    pub allocations: u64,
    /// `opa_free` calls made by the host.
    pub frees: u64,
}

pub(crate) struct Allocator {
    malloc: TypedFunc<i32, i32>,
    free: TypedFunc<i32, ()>,
}

pub(crate) struct ContextApi {
    ctx_new: TypedFunc<(), i32>,
    set_input: TypedFunc<(i32, i32), ()>,
    eval: TypedFunc<i32, i32>,
    get_result: TypedFunc<i32, i32>,
    result_len: Option<TypedFunc<i32, i32>>,
}

pub(crate) struct HeapPointer {
    get: TypedFunc<(), i32>,
    set: TypedFunc<i32, ()>,
}

/// Typed guest exports resolved at instantiation.
pub(crate) struct GuestExports {
    allocator: Option<Allocator>,
    context: Option<ContextApi>,
    simple_eval: Option<TypedFunc<i32, i32>>,
    json_parse: Option<TypedFunc<(i32, i32), i32>>,
    json_dump: Option<TypedFunc<i32, i32>>,
    heap: Option<HeapPointer>,
    builtins: Option<TypedFunc<(), i32>>,
}

impl GuestExports {
    fn resolve(instance: &Instance, store: &mut Store<GuestState>) -> Self {
        let allocator = match (
            typed_export(instance, store, "opa_malloc"),
            typed_export(instance, store, "opa_free"),
        ) {
            (Some(malloc), Some(free)) => Some(Allocator { malloc, free }),
            _ => None,
        };

        let opa_eval = typed_export::<i32, i32>(instance, store, "opa_eval");
        let plain_eval = typed_export::<i32, i32>(instance, store, "eval");
        let ctx_new = typed_export(instance, store, "opa_eval_ctx_new");
        let set_input = typed_export(instance, store, "opa_eval_ctx_set_input");
        let get_result = typed_export(instance, store, "opa_eval_ctx_get_result");
        let result_len = typed_export(instance, store, "opa_eval_ctx_get_result_len");

        // `eval` is the context evaluator only when `opa_eval` is absent.
        let (context, simple_eval) = match (ctx_new, set_input, get_result) {
            (Some(ctx_new), Some(set_input), Some(get_result)) => match opa_eval {
                Some(eval) => (
                    Some(ContextApi {
                        ctx_new,
                        set_input,
                        eval,
                        get_result,
                        result_len,
                    }),
                    plain_eval,
                ),
                None => (
                    plain_eval.map(|eval| ContextApi {
                        ctx_new,
                        set_input,
                        eval,
                        get_result,
                        result_len,
                    }),
                    None,
                ),
            },
            _ => (None, plain_eval),
        };

        let heap = match (
            typed_export(instance, store, "opa_heap_ptr_get"),
            typed_export(instance, store, "opa_heap_ptr_set"),
        ) {
            (Some(get), Some(set)) => Some(HeapPointer { get, set }),
            _ => None,
        };

        Self {
            allocator,
            context,
            simple_eval,
            json_parse: typed_export(instance, store, "opa_json_parse"),
            json_dump: typed_export(instance, store, "opa_json_dump"),
            heap,
            builtins: typed_export(instance, store, "builtins"),
        }
    }

    fn capabilities(&self, has_memory: bool) -> Capabilities {
        let has_allocator = self.allocator.is_some();
        Capabilities {
            supports_context_api: self.context.is_some() && has_allocator && has_memory,
            supports_simple_api: self.simple_eval.is_some(),
            has_allocator,
            has_memory,
            has_json_parse: self.json_parse.is_some(),
            has_json_dump: self.json_dump.is_some(),
            has_result_len: self
                .context
                .as_ref()
                .is_some_and(|context| context.result_len.is_some()),
            has_heap_reset: self.heap.is_some(),
            has_builtins: self.builtins.is_some(),
        }
    }
}

fn context_api(exports: &GuestExports) -> Result<&ContextApi, MarshalError> {
    exports.context.as_ref().ok_or(MarshalError::MissingExport {
        name: "opa_eval_ctx_new",
    })
}

/// Look up an export with the expected signature.
///
/// Exports with a different signature are treated as absent.
fn typed_export<P, R>(
    instance: &Instance,
    store: &mut Store<GuestState>,
    name: &str,
) -> Option<TypedFunc<P, R>>
where
    P: WasmParams,
    R: WasmResults,
{
    let func = instance.get_func(&mut *store, name)?;
    match func.typed::<P, R>(&*store) {
        Ok(typed) => Some(typed),
        Err(e) => {
            debug!(export = name, error = %e, "Export has unexpected signature, ignoring");
            None
        }
    }
}

/// Call a typed guest function, classifying any failure.
fn call<P, R>(
    store: &mut Store<GuestState>,
    func: &TypedFunc<P, R>,
    params: P,
) -> Result<R, GuestFault>
where
    P: WasmParams,
    R: WasmResults,
{
    func.call(&mut *store, params).map_err(|e| {
        let fault = classify_fault(&e, store.data());
        debug!(slot = store.data().slot_id, fault = %fault, error = %e, "Guest call failed");
        fault
    })
}

/// An instantiated policy module bound to one execution state.
///
/// Owned by exactly one pool slot; never shared between concurrent
/// evaluations.
pub struct ModuleInstance {
    slot_id: usize,
    store: Store<GuestState>,
    instance: Instance,
    exports: GuestExports,
    capabilities: Capabilities,
    abi_version: Option<AbiVersion>,
    limits: ExecutionLimits,
    stats: MarshalStats,
}

impl ModuleInstance {
    /// Pool slot this instance occupies.
    pub fn slot_id(&self) -> usize {
        self.slot_id
    }

    /// Capability descriptor computed at instantiation.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Declared ABI version, if the module exports one.
    pub fn abi_version(&self) -> Option<AbiVersion> {
        self.abi_version
    }

    /// Limits applied to each evaluation.
    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Host-side allocation counters.
    pub fn stats(&self) -> MarshalStats {
        self.stats
    }

    /// The underlying store.
    pub fn store(&self) -> &Store<GuestState> {
        &self.store
    }

    /// The underlying store, mutably.
    pub fn store_mut(&mut self) -> &mut Store<GuestState> {
        &mut self.store
    }

    /// The Wasmtime instance.
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// The instance's linear memory.
    pub fn memory(&self) -> Option<Memory> {
        self.store.data().memory()
    }

    /// Refuel, re-arm the watchdog, and clear per-evaluation scratch.
    pub fn begin_evaluation(&mut self) {
        arm_store(&mut self.store, &self.limits);
        self.store.data_mut().begin_evaluation();
    }

    /// Fuel burned since the last [`begin_evaluation`](Self::begin_evaluation).
    ///
    /// `None` when fuel metering is off.
    pub fn fuel_consumed(&self) -> Option<u64> {
        let granted = self.limits.fuel?;
        let remaining = get_remaining_fuel(&self.store)?;
        Some(granted.saturating_sub(remaining))
    }

    /// Builtin ids the host could not serve since the last call.
    pub fn take_failed_builtins(&mut self) -> Vec<i32> {
        self.store.data_mut().take_failed_builtins()
    }

    /// Call an exported `() -> i32` function by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the export is missing or the call faults.
    pub fn call_export_i32(&mut self, name: &'static str) -> Result<i32, MarshalError> {
        let func = self
            .instance
            .get_typed_func::<(), i32>(&mut self.store, name)
            .map_err(|_| MarshalError::MissingExport { name })?;
        Ok(call(&mut self.store, &func, ())?)
    }

    pub(crate) fn guest_malloc(&mut self, len: i32) -> Result<i32, MarshalError> {
        let allocator = self
            .exports
            .allocator
            .as_ref()
            .ok_or(MarshalError::MissingExport { name: "opa_malloc" })?;
        let addr = call(&mut self.store, &allocator.malloc, len)?;
        if addr != 0 {
            self.stats.allocations += 1;
        }
        Ok(addr)
    }

    pub(crate) fn guest_free(&mut self, addr: i32) -> Result<(), MarshalError> {
        let allocator = self
            .exports
            .allocator
            .as_ref()
            .ok_or(MarshalError::MissingExport { name: "opa_free" })?;
        self.stats.frees += 1;
        Ok(call(&mut self.store, &allocator.free, addr)?)
    }

    /// Create a fresh evaluation context.
    pub(crate) fn ctx_new(&mut self) -> Result<i32, MarshalError> {
        let func = &context_api(&self.exports)?.ctx_new;
        Ok(call(&mut self.store, func, ())?)
    }

    /// Point the context at a parsed input value.
    pub(crate) fn ctx_set_input(&mut self, ctx: i32, value: i32) -> Result<(), MarshalError> {
        let func = &context_api(&self.exports)?.set_input;
        Ok(call(&mut self.store, func, (ctx, value))?)
    }

    /// Run the evaluator; returns its error code.
    pub(crate) fn ctx_eval(&mut self, ctx: i32) -> Result<i32, MarshalError> {
        let func = &context_api(&self.exports)?.eval;
        Ok(call(&mut self.store, func, ctx)?)
    }

    /// Address of the context's result, `0` when undefined.
    pub(crate) fn ctx_result(&mut self, ctx: i32) -> Result<i32, MarshalError> {
        let func = &context_api(&self.exports)?.get_result;
        Ok(call(&mut self.store, func, ctx)?)
    }

    /// Declared result length, if the module exports it.
    pub(crate) fn ctx_result_len(&mut self, ctx: i32) -> Result<Option<i32>, MarshalError> {
        match &context_api(&self.exports)?.result_len {
            Some(func) => Ok(Some(call(&mut self.store, func, ctx)?)),
            None => Ok(None),
        }
    }

    /// Parse `len` JSON bytes at `addr` into a guest value.
    pub(crate) fn json_parse(&mut self, addr: i32, len: i32) -> Result<Option<i32>, MarshalError> {
        match &self.exports.json_parse {
            Some(func) => Ok(Some(call(&mut self.store, func, (addr, len))?)),
            None => Ok(None),
        }
    }

    /// Serialise a guest value to a NUL-terminated JSON string.
    pub(crate) fn json_dump(&mut self, value: i32) -> Result<Option<i32>, MarshalError> {
        match &self.exports.json_dump {
            Some(func) => Ok(Some(call(&mut self.store, func, value)?)),
            None => Ok(None),
        }
    }

    /// Single-call evaluation entry point.
    pub(crate) fn simple_eval(&mut self, input: i32) -> Result<i32, MarshalError> {
        let func = self
            .exports
            .simple_eval
            .as_ref()
            .ok_or(MarshalError::MissingExport { name: "eval" })?;
        Ok(call(&mut self.store, func, input)?)
    }

    /// Current guest heap pointer, if the module exposes it.
    pub(crate) fn heap_ptr(&mut self) -> Result<Option<i32>, GuestFault> {
        match &self.exports.heap {
            Some(heap) => Ok(Some(call(&mut self.store, &heap.get, ())?)),
            None => Ok(None),
        }
    }

    /// Restore the guest heap pointer.
    pub(crate) fn set_heap_ptr(&mut self, ptr: i32) -> Result<(), GuestFault> {
        match &self.exports.heap {
            Some(heap) => call(&mut self.store, &heap.set, ptr),
            None => Ok(()),
        }
    }

    /// Read the module's builtin name to id map.
    fn resolve_builtins(&mut self) -> Result<HashMap<i32, String>, MarshalError> {
        let Some(builtins) = &self.exports.builtins else {
            return Ok(HashMap::new());
        };
        let addr = call(&mut self.store, builtins, ())?;
        let text_addr = self.json_dump(addr)?.unwrap_or(addr);
        let memory = self
            .memory()
            .ok_or(MarshalError::MissingExport { name: "memory" })?;
        let bytes = read_c_string(&self.store, &memory, text_addr, self.limits.max_result_bytes)?;

        let map: HashMap<String, i32> = serde_json::from_slice(&bytes)
            .map_err(|e| MarshalError::decode(format!("builtins map: {e}")))?;
        Ok(map.into_iter().map(|(name, id)| (id, name)).collect())
    }
}

impl std::fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("slot_id", &self.slot_id)
            .field("capabilities", &self.capabilities)
            .field("abi_version", &self.abi_version)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// Creates [`ModuleInstance`]s for pool slots.
///
/// Holds the shared engine, artifact, and host import linker; cheap to share
/// behind an `Arc`.
pub struct InstanceFactory {
    engine: WasmEngine,
    artifact: Arc<CompiledArtifact>,
    linker: Arc<Linker<GuestState>>,
    limits: ExecutionLimits,
}

impl InstanceFactory {
    /// Create a new factory.
    ///
    /// `linker` must define every function the artifact imports; an imported
    /// memory is created per instance here.
    pub fn new(
        engine: WasmEngine,
        artifact: Arc<CompiledArtifact>,
        linker: Linker<GuestState>,
        limits: ExecutionLimits,
    ) -> Self {
        Self {
            engine,
            artifact,
            linker: Arc::new(linker),
            limits,
        }
    }

    /// The compiled artifact instances are created from.
    pub fn artifact(&self) -> &Arc<CompiledArtifact> {
        &self.artifact
    }

    /// Limits applied to every instance.
    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Instantiate the artifact for `slot_id`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InstantiationFailed`] if linking or the start
    /// function fails, and [`LoadError::UnsupportedAbi`] if the module declares
    /// an ABI major version other than 1.
    pub fn instantiate(&self, slot_id: usize) -> Result<ModuleInstance, EngineError> {
        let mut store = create_store(&self.engine, &self.limits, slot_id)?;

        let instance = match self.artifact.imported_memory() {
            Some((module, name, ty)) => {
                let memory = Memory::new(&mut store, ty).map_err(|e| {
                    EngineError::instantiation_failed(format!("Failed to create memory: {e}"))
                })?;
                store.data_mut().set_memory(memory);

                let mut linker = (*self.linker).clone();
                linker.define(&store, &module, &name, memory).map_err(|e| {
                    EngineError::instantiation_failed(format!("Failed to define memory: {e}"))
                })?;
                linker.instantiate(&mut store, self.artifact.module())
            }
            None => self.linker.instantiate(&mut store, self.artifact.module()),
        }
        .map_err(|e| EngineError::instantiation_failed(format!("{e:#}")))?;

        if store.data().memory().is_none() {
            let exported = instance.get_memory(&mut store, "memory");
            if let Some(memory) = exported {
                store.data_mut().set_memory(memory);
            }
        }

        let abi_version = read_abi_version(&instance, &mut store)?;
        let exports = GuestExports::resolve(&instance, &mut store);
        let capabilities = exports.capabilities(store.data().memory().is_some());

        let mut module_instance = ModuleInstance {
            slot_id,
            store,
            instance,
            exports,
            capabilities,
            abi_version,
            limits: self.limits,
            stats: MarshalStats::default(),
        };

        if capabilities.has_builtins {
            match module_instance.resolve_builtins() {
                Ok(names) => {
                    debug!(slot = slot_id, builtins = names.len(), "Builtin ids resolved");
                    module_instance.store.data_mut().set_builtin_names(names);
                }
                Err(e) => {
                    warn!(slot = slot_id, error = %e, "Failed to resolve builtin ids");
                }
            }
        }
        module_instance.begin_evaluation();

        info!(
            slot = slot_id,
            context_api = capabilities.supports_context_api,
            simple_api = capabilities.supports_simple_api,
            "Policy module instantiated"
        );

        Ok(module_instance)
    }
}

impl std::fmt::Debug for InstanceFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceFactory")
            .field("artifact", &self.artifact)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

fn read_global_i32(instance: &Instance, store: &mut Store<GuestState>, name: &str) -> Option<i32> {
    let global = instance.get_global(&mut *store, name)?;
    match global.get(&mut *store) {
        Val::I32(value) => Some(value),
        _ => None,
    }
}

/// Check the ABI globals; a missing version global is accepted.
fn read_abi_version(
    instance: &Instance,
    store: &mut Store<GuestState>,
) -> Result<Option<AbiVersion>, EngineError> {
    let Some(major) = read_global_i32(instance, store, "opa_wasm_abi_version") else {
        return Ok(None);
    };
    let minor = read_global_i32(instance, store, "opa_wasm_abi_minor_version").unwrap_or(0);

    if major != SUPPORTED_ABI_MAJOR {
        return Err(LoadError::UnsupportedAbi { major, minor }.into());
    }
    Ok(Some(AbiVersion { major, minor }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy_bridge_common::EngineConfig;

    fn factory(wat: &str) -> InstanceFactory {
        let config = BridgeConfig::default();
        let engine = WasmEngine::new(&EngineConfig::default(), 1).unwrap();
        let artifact = CompiledArtifact::from_wat(engine.inner(), wat).unwrap();
        let linker = Linker::new(engine.inner());
        InstanceFactory::new(
            engine,
            Arc::new(artifact),
            linker,
            ExecutionLimits::from_config(&config),
        )
    }

    const CONTEXT_MODULE: &str = r#"
        (module
            (memory (export "memory") 1)
            (global (export "opa_wasm_abi_version") i32 (i32.const 1))
            (global (export "opa_wasm_abi_minor_version") i32 (i32.const 3))
            (func (export "opa_malloc") (param i32) (result i32) (i32.const 1024))
            (func (export "opa_free") (param i32))
            (func (export "opa_eval_ctx_new") (result i32) (i32.const 8))
            (func (export "opa_eval_ctx_set_input") (param i32 i32))
            (func (export "opa_eval") (param i32) (result i32) (i32.const 0))
            (func (export "opa_eval_ctx_get_result") (param i32) (result i32) (i32.const 0))
            (func (export "opa_heap_ptr_get") (result i32) (i32.const 2048))
            (func (export "opa_heap_ptr_set") (param i32))
        )
    "#;

    #[test]
    fn test_limits_from_config() {
        let mut config = BridgeConfig::default();
        let limits = ExecutionLimits::from_config(&config);

        assert_eq!(limits.fuel, Some(100_000_000));
        assert_eq!(limits.deadline_ticks, Some(201));
        assert_eq!(limits.max_result_bytes, 1024 * 1024);

        config.engine.fuel_metering = false;
        config.engine.epoch_interruption = false;
        let limits = ExecutionLimits::from_config(&config);
        assert!(limits.fuel.is_none());
        assert!(limits.deadline_ticks.is_none());
    }

    #[test]
    fn test_context_capabilities() {
        let instance = factory(CONTEXT_MODULE).instantiate(0).unwrap();
        let caps = instance.capabilities();

        assert!(caps.supports_context_api);
        assert!(!caps.supports_simple_api);
        assert!(caps.has_allocator);
        assert!(caps.has_memory);
        assert!(caps.has_heap_reset);
        assert!(!caps.has_result_len);
        assert!(!caps.has_json_parse);
        assert_eq!(
            instance.abi_version(),
            Some(AbiVersion { major: 1, minor: 3 })
        );
    }

    #[test]
    fn test_plain_eval_is_context_evaluator() {
        let wat = r#"
            (module
                (memory (export "memory") 1)
                (func (export "opa_malloc") (param i32) (result i32) (i32.const 1024))
                (func (export "opa_free") (param i32))
                (func (export "opa_eval_ctx_new") (result i32) (i32.const 8))
                (func (export "opa_eval_ctx_set_input") (param i32 i32))
                (func (export "eval") (param i32) (result i32) (i32.const 0))
                (func (export "opa_eval_ctx_get_result") (param i32) (result i32) (i32.const 0))
            )
        "#;
        let caps = factory(wat).instantiate(0).unwrap().capabilities();

        assert!(caps.supports_context_api);
        assert!(!caps.supports_simple_api);
    }

    #[test]
    fn test_simple_capabilities() {
        let wat = r#"
            (module
                (memory (export "memory") 1)
                (func (export "opa_malloc") (param i32) (result i32) (i32.const 1024))
                (func (export "opa_free") (param i32))
                (func (export "eval") (param i32) (result i32) (i32.const 1))
            )
        "#;
        let instance = factory(wat).instantiate(2).unwrap();
        let caps = instance.capabilities();

        assert!(!caps.supports_context_api);
        assert!(caps.supports_simple_api);
        assert_eq!(instance.slot_id(), 2);
        assert!(instance.abi_version().is_none());
    }

    #[test]
    fn test_mismatched_signature_treated_as_absent() {
        let wat = r#"
            (module
                (memory (export "memory") 1)
                (func (export "opa_malloc") (param i64) (result i64) (i64.const 0))
                (func (export "opa_free") (param i32))
            )
        "#;
        let caps = factory(wat).instantiate(0).unwrap().capabilities();
        assert!(!caps.has_allocator);
    }

    #[test]
    fn test_empty_module() {
        let instance = factory("(module)").instantiate(0).unwrap();
        assert_eq!(instance.capabilities(), Capabilities::default());
        assert!(instance.memory().is_none());
    }

    #[test]
    fn test_imported_memory_is_provided() {
        let wat = r#"
            (module
                (import "env" "memory" (memory 2))
                (func (export "size") (result i32) (memory.size))
            )
        "#;
        let mut instance = factory(wat).instantiate(0).unwrap();

        assert!(instance.capabilities().has_memory);
        assert_eq!(instance.call_export_i32("size").unwrap(), 2);
    }

    #[test]
    fn test_unsupported_abi_major() {
        let wat = r#"(module (global (export "opa_wasm_abi_version") i32 (i32.const 2)))"#;
        let err = factory(wat).instantiate(0).unwrap_err();

        assert!(matches!(
            err,
            EngineError::Load(LoadError::UnsupportedAbi { major: 2, minor: 0 })
        ));
    }

    #[test]
    fn test_trapping_start_fails_instantiation() {
        let wat = r#"(module (func $start unreachable) (start $start))"#;
        let err = factory(wat).instantiate(0).unwrap_err();
        assert!(matches!(err, EngineError::InstantiationFailed { .. }));
    }

    #[test]
    fn test_guest_call_fault_is_classified() {
        let wat = r#"(module (func (export "boom") (result i32) unreachable))"#;
        let mut instance = factory(wat).instantiate(0).unwrap();

        let err = instance.call_export_i32("boom").unwrap_err();
        assert!(matches!(
            err.guest_fault(),
            Some(GuestFault::Trap { code: Some(_) })
        ));
        assert!(matches!(
            instance.call_export_i32("missing"),
            Err(MarshalError::MissingExport { name: "missing" })
        ));
    }

    #[test]
    fn test_fuel_consumed_resets_per_evaluation() {
        let wat = r#"
            (module
                (func (export "work") (result i32)
                    (local $i i32)
                    (loop $again
                        (local.set $i (i32.add (local.get $i) (i32.const 1)))
                        (br_if $again (i32.lt_u (local.get $i) (i32.const 100))))
                    (local.get $i))
            )
        "#;
        let mut instance = factory(wat).instantiate(0).unwrap();
        assert_eq!(instance.fuel_consumed(), Some(0));

        assert_eq!(instance.call_export_i32("work").unwrap(), 100);
        let burned = instance.fuel_consumed().unwrap();
        assert!(burned > 100);

        instance.begin_evaluation();
        assert_eq!(instance.fuel_consumed(), Some(0));
    }

    #[test]
    fn test_fuel_consumed_without_metering() {
        let mut config = BridgeConfig::default();
        config.engine.fuel_metering = false;
        let engine = WasmEngine::new(&config.engine, 1).unwrap();
        let artifact = CompiledArtifact::from_wat(engine.inner(), "(module)").unwrap();
        let linker = Linker::new(engine.inner());
        let instance = InstanceFactory::new(
            engine,
            Arc::new(artifact),
            linker,
            ExecutionLimits::from_config(&config),
        )
        .instantiate(0)
        .unwrap();

        assert!(instance.fuel_consumed().is_none());
    }

    #[test]
    fn test_heap_pointer_roundtrip() {
        let mut instance = factory(CONTEXT_MODULE).instantiate(0).unwrap();

        assert_eq!(instance.heap_ptr().unwrap(), Some(2048));
        assert!(instance.set_heap_ptr(4096).is_ok());
    }
}
