//! Host import table for policy modules.
//!
//! This crate provides the host side of the functions a policy module
//! imports from `env`. Guest modules call these to report failures, emit
//! debug output, and reach host-implemented builtins.
//!
//! # Imports
//!
//! - `opa_abort`: terminate the current evaluation with a message
//! - `opa_println`: forward text to the logging sink
//! - `opa_builtin0` to `opa_builtin4`: dispatch a builtin by id through
//!   the [`BuiltinTable`]
//!
//! Import signatures are taken from the artifact, so both the `(ptr, len)`
//! and the NUL-terminated `(ptr)` message shapes are accepted.
//!
//! # Modules
//!
//! - [`linker`]: builds the Wasmtime linker for an artifact
//! - [`builtins`]: builtin handlers registered by name
//! - [`logging`]: guest output to `tracing`

pub mod builtins;
pub mod linker;
pub mod logging;

pub use builtins::{BuiltinError, BuiltinHandler, BuiltinTable};
pub use linker::{BUILTIN_NOT_IMPLEMENTED, create_linker};
pub use logging::LoggingHost;
