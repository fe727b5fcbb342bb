//! Error types for policy-bridge.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`LoadError`] and [`EngineError`]: startup failures that degrade the engine
//! - [`MarshalError`]: per-call failures at the host/guest memory boundary
//! - [`GuestFault`]: the guest trapped, aborted, or ran out of time or fuel
//! - [`EvaluationError`]: the only errors an external caller ever sees

use std::io;

use thiserror::Error;

/// Failure to load the policy artifact.
///
/// Any of these is fatal for the engine: it comes up `Degraded` and serves
/// fallback decisions only.
#[derive(Error, Debug)]
pub enum LoadError {
    /// No artifact path was configured.
    #[error("No policy artifact configured")]
    NotConfigured,

    /// The artifact file does not exist.
    #[error("Policy artifact not found: {path}")]
    NotFound {
        /// The path that was checked.
        path: String,
    },

    /// Reading the artifact failed.
    #[error("Failed to read policy artifact '{path}': {source}")]
    Io {
        /// The path that was read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The artifact is not a WebAssembly binary.
    #[error("Invalid artifact header: {reason}")]
    InvalidHeader {
        /// Description of the header problem.
        reason: String,
    },

    /// Wasmtime rejected the module.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// The module declares an ABI version this host does not speak.
    #[error("Unsupported policy ABI version {major}.{minor}")]
    UnsupportedAbi {
        /// Declared major version.
        major: i32,
        /// Declared minor version (0 when not exported).
        minor: i32,
    },
}

/// Startup errors for the whole engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The artifact could not be loaded.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Linking host imports or instantiating the module failed.
    #[error("Instantiation failed: {reason}")]
    InstantiationFailed {
        /// Description of the instantiation failure.
        reason: String,
    },

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

/// The guest stopped executing abnormally.
///
/// Display output never contains raw guest text; abort messages are logged
/// where they are received.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuestFault {
    /// The guest called its abort import.
    #[error("Guest aborted the evaluation")]
    Abort,

    /// The evaluation watchdog expired.
    #[error("Evaluation watchdog expired")]
    Timeout,

    /// Fuel metering stopped the guest.
    #[error("Fuel exhausted: CPU limit exceeded")]
    FuelExhausted,

    /// Any other WebAssembly trap.
    #[error("Wasm trap: {}", .code.as_deref().unwrap_or("unknown"))]
    Trap {
        /// Trap code if Wasmtime reported one.
        code: Option<String>,
    },
}

/// Trap payload raised by the host `abort` import.
///
/// Carried inside the `wasmtime::Error` returned from the import so the
/// evaluation layer can recognise a deliberate abort.
#[derive(Error, Debug, Clone)]
#[error("guest abort: {message}")]
pub struct GuestAbort {
    /// Message read from guest memory.
    pub message: String,
}

/// Errors moving data across the host/guest memory boundary.
#[derive(Error, Debug)]
pub enum MarshalError {
    /// The module lacks an export the operation needs.
    #[error("Missing export: {name}")]
    MissingExport {
        /// Name of the missing export.
        name: &'static str,
    },

    /// The guest allocator returned a null address.
    #[error("Allocation of {len} bytes failed")]
    AllocationFailed {
        /// Requested size in bytes.
        len: usize,
    },

    /// A buffer does not fit in the 32-bit guest address space.
    #[error("Buffer too large for guest memory: {len} bytes")]
    TooLarge {
        /// Buffer length in bytes.
        len: usize,
    },

    /// An address range falls outside linear memory.
    #[error("Memory access out of bounds: {addr:#x}+{len} (memory size {memory_size})")]
    OutOfBounds {
        /// Start address.
        addr: u32,
        /// Length of the access.
        len: usize,
        /// Current memory size in bytes.
        memory_size: usize,
    },

    /// Guest output could not be decoded.
    #[error("Decode error: {reason}")]
    Decode {
        /// Description of the decode failure.
        reason: String,
    },

    /// A call into the guest faulted.
    #[error(transparent)]
    Guest(#[from] GuestFault),
}

impl MarshalError {
    /// Create a new `Decode` error.
    pub fn decode(reason: impl Into<String>) -> Self {
        Self::Decode {
            reason: reason.into(),
        }
    }

    /// The guest fault behind this error, if any.
    pub fn guest_fault(&self) -> Option<&GuestFault> {
        match self {
            Self::Guest(fault) => Some(fault),
            _ => None,
        }
    }
}

/// Errors surfaced to callers of `evaluate`.
///
/// Callers must treat every variant as a deny.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvaluationError {
    /// `initialize` has not been called.
    #[error("Policy engine not initialized")]
    NotInitialized,

    /// The engine is shutting down or stopped.
    #[error("Policy engine stopped")]
    Stopped,

    /// No pool slot became idle within the acquire timeout.
    #[error("Policy engine overloaded: no instance available after {waited_ms}ms")]
    PoolExhausted {
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The guest faulted; its slot was poisoned.
    #[error("Policy evaluation failed: {0}")]
    GuestFault(#[from] GuestFault),

    /// The task running the evaluation panicked or was cancelled.
    #[error("Policy evaluation task failed")]
    TaskFailed,
}

impl EngineError {
    /// Create a new `InstantiationFailed` error.
    pub fn instantiation_failed(reason: impl Into<String>) -> Self {
        Self::InstantiationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

impl LoadError {
    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidHeader` error.
    pub fn invalid_header(reason: impl Into<String>) -> Self {
        Self::InvalidHeader {
            reason: reason.into(),
        }
    }
}

impl EvaluationError {
    /// Returns `true` if the caller should treat this as an overload signal.
    pub fn is_overload(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }

    /// Returns `true` if the guest faulted.
    pub fn is_guest_fault(&self) -> bool {
        matches!(self, Self::GuestFault(_))
    }
}
