//! Lifecycle handle for policy-bridge.
//!
//! [`PolicyEngine`] composes the core crate (engine, artifact, pool,
//! protocol selector) with the host import table and exposes the calls an
//! application makes:
//!
//! - [`PolicyEngine::initialize`] loads the module once, or degrades to the
//!   fallback rule
//! - [`PolicyEngine::evaluate`] and [`PolicyEngine::is_allowed`]
//! - [`PolicyEngine::status`] and [`PolicyEngine::describe`] for health checks
//! - [`PolicyEngine::shutdown`]
//!
//! # Quick Start
//!
//! ```ignore
//! use policy_bridge_common::BridgeConfig;
//! use policy_bridge_runtime::{EngineStatus, PolicyEngine};
//!
//! let engine = PolicyEngine::new(BridgeConfig::with_artifact("/opt/policy.wasm"));
//! if engine.initialize() == EngineStatus::Degraded {
//!     eprintln!("serving fallback decisions: {:?}", engine.degraded_reason());
//! }
//!
//! let decision = engine.evaluate(&serde_json::json!({"user": {"role": "admin"}}))?;
//! println!("allowed={} tier={}", decision.allowed(), decision.tier());
//! ```

pub mod lifecycle;
pub mod status;

pub use lifecycle::PolicyEngine;
pub use status::{EngineStatus, ExportCategories, ModuleDescription};

pub use policy_bridge_core::{Decision, Tier};
pub use policy_bridge_host::BuiltinTable;
