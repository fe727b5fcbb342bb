//! Host import registration for Wasmtime linkers.
//!
//! [`create_linker`] walks the artifact's import section and defines every
//! `env` function it finds with the signature the module declared. Imports
//! the host does not know fail linking with a clear error instead of a
//! Wasmtime "unknown import" message at instantiation time.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};
use wasmtime::{Caller, Extern, FuncType, Linker, Memory, TypedFunc, Val, ValType};

use crate::builtins::BuiltinTable;
use crate::logging::LoggingHost;
use policy_bridge_common::{EngineError, GuestAbort};
use policy_bridge_core::memory::{read_c_string, read_exact, write_exact};
use policy_bridge_core::{CompiledArtifact, FunctionImport, GuestState, WasmEngine};

/// Value returned to the guest when a builtin cannot be served.
pub const BUILTIN_NOT_IMPLEMENTED: i32 = 0;

/// Import module every policy import lives in.
const IMPORT_MODULE: &str = "env";

/// Longest NUL-terminated message read from the guest.
const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Longest serialized builtin argument read from the guest.
const MAX_VALUE_BYTES: usize = 1024 * 1024;

/// Highest builtin arity in the ABI (`opa_builtin4`).
const MAX_BUILTIN_ARITY: usize = 4;

/// Build a linker defining every function `artifact` imports.
///
/// # Errors
///
/// Returns [`EngineError::InstantiationFailed`] for imports outside `env`,
/// unknown import names, unexpected signatures, and non-function imports
/// other than memory.
pub fn create_linker(
    engine: &WasmEngine,
    artifact: &CompiledArtifact,
    builtins: &Arc<BuiltinTable>,
) -> Result<Linker<GuestState>, EngineError> {
    let unsupported = artifact.unsupported_imports();
    if !unsupported.is_empty() {
        return Err(EngineError::instantiation_failed(format!(
            "unsupported imports: {}",
            unsupported.join(", ")
        )));
    }

    let mut linker = Linker::new(engine.inner());

    for import in artifact.function_imports() {
        if import.module != IMPORT_MODULE {
            return Err(EngineError::instantiation_failed(format!(
                "unsupported import module '{}' for '{}'",
                import.module, import.name
            )));
        }

        match import.name.as_str() {
            "opa_abort" => register_abort(&mut linker, &import)?,
            "opa_println" => register_println(&mut linker, &import)?,
            name if name.starts_with("opa_builtin") => {
                register_builtin(&mut linker, &import, Arc::clone(builtins))?;
            }
            other => {
                return Err(EngineError::instantiation_failed(format!(
                    "unknown host import 'env::{other}'"
                )));
            }
        }
        debug!(import = %import.name, "Host import linked");
    }

    Ok(linker)
}

fn all_i32(mut types: impl Iterator<Item = ValType>) -> bool {
    types.all(|ty| matches!(ty, ValType::I32))
}

fn signature_error(import: &FunctionImport, expected: &str) -> EngineError {
    EngineError::instantiation_failed(format!(
        "import 'env::{}' has signature {:?}, expected {expected}",
        import.name, import.ty
    ))
}

/// Message imports take `(ptr, len)` or a NUL-terminated `(ptr)`.
fn check_message_signature(
    import: &FunctionImport,
    max_results: usize,
) -> Result<(), EngineError> {
    let ty: &FuncType = &import.ty;
    let params = ty.params().len();
    let results = ty.results().len();
    if !(1..=2).contains(&params)
        || results > max_results
        || !all_i32(ty.params())
        || !all_i32(ty.results())
    {
        return Err(signature_error(import, "(i32 [i32])"));
    }
    Ok(())
}

fn link_error(import: &FunctionImport, e: &wasmtime::Error) -> EngineError {
    EngineError::instantiation_failed(format!("failed to link 'env::{}': {e}", import.name))
}

/// `opa_abort(ptr[, len])`: log and stop the current evaluation.
fn register_abort(
    linker: &mut Linker<GuestState>,
    import: &FunctionImport,
) -> Result<(), EngineError> {
    check_message_signature(import, 0)?;

    linker
        .func_new(
            IMPORT_MODULE,
            &import.name,
            import.ty.clone(),
            |mut caller: Caller<'_, GuestState>, params: &[Val], _results: &mut [Val]| {
                let message = read_message(&mut caller, params)
                    .unwrap_or_else(|| "<unreadable abort message>".to_string());
                LoggingHost::abort(caller.data_mut(), &message);
                Err(wasmtime::Error::new(GuestAbort { message }))
            },
        )
        .map_err(|e| link_error(import, &e))?;
    Ok(())
}

/// `opa_println(ptr[, len]) [-> i32]`: forward text; status is always 0.
fn register_println(
    linker: &mut Linker<GuestState>,
    import: &FunctionImport,
) -> Result<(), EngineError> {
    check_message_signature(import, 1)?;

    linker
        .func_new(
            IMPORT_MODULE,
            &import.name,
            import.ty.clone(),
            |mut caller: Caller<'_, GuestState>, params: &[Val], results: &mut [Val]| {
                let message = read_message(&mut caller, params)
                    .unwrap_or_else(|| "<unreadable message>".to_string());
                LoggingHost::println(caller.data_mut(), &message);
                if let Some(status) = results.first_mut() {
                    *status = Val::I32(0);
                }
                Ok(())
            },
        )
        .map_err(|e| link_error(import, &e))?;
    Ok(())
}

/// `opa_builtinN(id, ctx, args...) -> i32`.
fn register_builtin(
    linker: &mut Linker<GuestState>,
    import: &FunctionImport,
    builtins: Arc<BuiltinTable>,
) -> Result<(), EngineError> {
    let arity = import
        .name
        .strip_prefix("opa_builtin")
        .and_then(|suffix| suffix.parse::<usize>().ok())
        .filter(|arity| *arity <= MAX_BUILTIN_ARITY)
        .ok_or_else(|| {
            EngineError::instantiation_failed(format!("unknown host import 'env::{}'", import.name))
        })?;

    let ty = &import.ty;
    if ty.params().len() != arity + 2
        || ty.results().len() != 1
        || !all_i32(ty.params())
        || !all_i32(ty.results())
    {
        return Err(signature_error(import, "(id, ctx, args...) -> i32"));
    }

    linker
        .func_new(
            IMPORT_MODULE,
            &import.name,
            import.ty.clone(),
            move |mut caller: Caller<'_, GuestState>, params: &[Val], results: &mut [Val]| {
                let builtin_id = params.first().and_then(Val::i32).unwrap_or(-1);
                let args: Vec<i32> = params.iter().skip(2).filter_map(Val::i32).collect();

                let addr = match dispatch_builtin(&mut caller, &builtins, builtin_id, &args) {
                    Ok(addr) => addr,
                    Err(DispatchFailure::Trap(e)) => return Err(e),
                    Err(DispatchFailure::Unserved(reason)) => {
                        warn!(
                            slot = caller.data().slot_id,
                            builtin_id,
                            reason = %reason,
                            "Builtin not served"
                        );
                        caller.data_mut().record_failed_builtin(builtin_id);
                        BUILTIN_NOT_IMPLEMENTED
                    }
                };

                if let Some(result) = results.first_mut() {
                    *result = Val::I32(addr);
                }
                Ok(())
            },
        )
        .map_err(|e| link_error(import, &e))?;
    Ok(())
}

/// Why a builtin call produced no value.
enum DispatchFailure {
    /// A reentrant guest call trapped; propagated as-is.
    Trap(wasmtime::Error),
    /// The host cannot serve the call; the guest gets the sentinel.
    Unserved(String),
}

fn dispatch_builtin(
    caller: &mut Caller<'_, GuestState>,
    builtins: &BuiltinTable,
    builtin_id: i32,
    args: &[i32],
) -> Result<i32, DispatchFailure> {
    let name = caller
        .data()
        .builtin_name(builtin_id)
        .map(str::to_string)
        .ok_or_else(|| DispatchFailure::Unserved(format!("unknown builtin id {builtin_id}")))?;
    let handler = builtins
        .get(&name)
        .cloned()
        .ok_or_else(|| DispatchFailure::Unserved(format!("no handler for '{name}'")))?;

    let values = args
        .iter()
        .map(|addr| read_guest_value(caller, *addr))
        .collect::<Result<Vec<_>, _>>()?;

    let result = handler(&values)
        .map_err(|e| DispatchFailure::Unserved(format!("'{name}' failed: {e}")))?;

    debug!(slot = caller.data().slot_id, builtin = %name, "Builtin dispatched");
    write_guest_value(caller, &result)
}

fn guest_memory(caller: &mut Caller<'_, GuestState>) -> Option<Memory> {
    caller
        .data()
        .memory()
        .or_else(|| caller.get_export("memory").and_then(Extern::into_memory))
}

fn guest_func<P, R>(
    caller: &mut Caller<'_, GuestState>,
    name: &str,
) -> Result<TypedFunc<P, R>, DispatchFailure>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    caller
        .get_export(name)
        .and_then(Extern::into_func)
        .ok_or_else(|| DispatchFailure::Unserved(format!("missing export '{name}'")))?
        .typed::<P, R>(&*caller)
        .map_err(|e| DispatchFailure::Unserved(format!("export '{name}': {e}")))
}

/// Read text passed as `(ptr, len)` or a NUL-terminated `(ptr)`.
///
/// Invalid UTF-8 is replaced, never an error.
fn read_message(caller: &mut Caller<'_, GuestState>, params: &[Val]) -> Option<String> {
    let memory = guest_memory(caller)?;
    let addr = params.first().and_then(Val::i32)?;

    let bytes = match params.get(1).and_then(Val::i32) {
        Some(len) => read_exact(&*caller, &memory, addr, usize::try_from(len).ok()?).ok()?,
        None => read_c_string(&*caller, &memory, addr, MAX_MESSAGE_BYTES).ok()?,
    };
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Serialize a guest value through `opa_json_dump` and parse it.
fn read_guest_value(
    caller: &mut Caller<'_, GuestState>,
    addr: i32,
) -> Result<Value, DispatchFailure> {
    let dump = guest_func::<i32, i32>(caller, "opa_json_dump")?;
    let text = dump.call(&mut *caller, addr).map_err(DispatchFailure::Trap)?;

    let memory = guest_memory(caller)
        .ok_or_else(|| DispatchFailure::Unserved("module has no memory".into()))?;
    let bytes = read_c_string(&*caller, &memory, text, MAX_VALUE_BYTES)
        .map_err(|e| DispatchFailure::Unserved(e.to_string()))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| DispatchFailure::Unserved(format!("argument is not JSON: {e}")))
}

/// Place `value` in guest memory through `opa_malloc` and `opa_json_parse`.
///
/// The serialized bytes are reclaimed by the per-evaluation heap reset.
fn write_guest_value(
    caller: &mut Caller<'_, GuestState>,
    value: &Value,
) -> Result<i32, DispatchFailure> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| DispatchFailure::Unserved(format!("result not serializable: {e}")))?;
    let len = i32::try_from(bytes.len())
        .map_err(|_| DispatchFailure::Unserved("result too large".into()))?;

    let malloc = guest_func::<i32, i32>(caller, "opa_malloc")?;
    let parse = guest_func::<(i32, i32), i32>(caller, "opa_json_parse")?;
    let memory = guest_memory(caller)
        .ok_or_else(|| DispatchFailure::Unserved("module has no memory".into()))?;

    let addr = malloc.call(&mut *caller, len).map_err(DispatchFailure::Trap)?;
    if addr == 0 {
        return Err(DispatchFailure::Unserved("guest allocation failed".into()));
    }
    write_exact(&mut *caller, &memory, addr, &bytes)
        .map_err(|e| DispatchFailure::Unserved(e.to_string()))?;

    let parsed = parse.call(&mut *caller, (addr, len)).map_err(DispatchFailure::Trap)?;
    if parsed == 0 {
        return Err(DispatchFailure::Unserved("guest rejected builtin result".into()));
    }
    Ok(parsed)
}
