//! Wasmtime host for compiled policy modules.
//!
//! This crate provides the building blocks for evaluating a precompiled
//! policy module:
//! - [`WasmEngine`]: Configured Wasmtime engine (fuel, epochs, allocator)
//! - [`CompiledArtifact`]: The compiled policy module, loaded once
//! - [`InstanceFactory`] and [`ModuleInstance`]: One instantiated module per
//!   pool slot, with its [`Capabilities`]
//! - [`Arena`]: Scoped guest allocations for one evaluation
//! - [`InstancePool`]: Bounded pool of instances with poisoning
//! - [`ProtocolSelector`]: Context tier, simple tier, fallback rule
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     WasmEngine                          │
//! │  (Shared, thread-safe; EpochTicker drives the watchdog) │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                  CompiledArtifact                       │
//! │  (Loaded once, shared read-only by every slot)          │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │        InstancePool of Store<GuestState> + Instance     │
//! │  (One exclusive slot per in-flight evaluation)          │
//! │  - Fuel and epoch deadline                              │
//! │  - Linear memory, heap reset                            │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                  ProtocolSelector                       │
//! │  context API → simple eval → fallback rule              │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod decision;
pub mod engine;
pub mod instance;
pub mod memory;
pub mod module;
pub mod pool;
pub mod protocol;
pub mod store;

pub use decision::{Decision, Tier};
pub use engine::{EpochTicker, WasmEngine};
pub use instance::{
    AbiVersion, Capabilities, ExecutionLimits, InstanceFactory, MarshalStats, ModuleInstance,
};
pub use memory::Arena;
pub use module::{CompiledArtifact, FunctionImport};
pub use pool::{InstancePool, PoolHandle};
pub use protocol::{
    ContextTier, FallbackRule, ProtocolSelector, ProtocolTier, SimpleTier, TierFailure,
    TierOutcome, extract_allow,
};
pub use store::{GuestState, LogEntry, LogLevel};
