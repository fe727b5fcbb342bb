//! Common types, errors, and configuration for policy-bridge.
//!
//! This crate provides shared functionality used across the policy-bridge workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for the engine, pool, and evaluation limits
//! - TOML configuration file loading

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{
    ArtifactConfig, BridgeConfig, EngineConfig, EvaluationConfig, FallbackConfig, PoolConfig,
};
pub use config_file::{ConfigFile, ConfigFileError, LoggingConfig};
pub use error::{
    EngineError, EvaluationError, GuestAbort, GuestFault, LoadError, MarshalError,
};
