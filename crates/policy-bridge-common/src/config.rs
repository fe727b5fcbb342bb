//! Configuration structures for policy-bridge.
//!
//! This module defines configuration options for various components:
//! - [`BridgeConfig`]: Top-level configuration containing all settings
//! - [`ArtifactConfig`]: Where the compiled policy module lives
//! - [`EngineConfig`]: Wasmtime engine settings (allocator, fuel, epochs)
//! - [`PoolConfig`]: Instance pool size and acquire timeout
//! - [`EvaluationConfig`]: Per-call limits (watchdog, fuel, result size)
//! - [`FallbackConfig`]: The host-side rule used when the module cannot decide
//!
//! The core never reads configuration sources itself; callers build these
//! structs (directly or through [`crate::ConfigFile`]) and pass them in.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::EngineError;

/// Longest evaluation watchdog accepted by [`BridgeConfig::validate`].
pub const MAX_EVALUATION_TIMEOUT_MS: u64 = 60 * 60 * 1000;

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BridgeConfig {
    /// Policy artifact location.
    #[serde(default)]
    pub artifact: ArtifactConfig,

    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Instance pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Per-call evaluation limits.
    #[serde(default)]
    pub evaluation: EvaluationConfig,

    /// Fallback rule configuration.
    #[serde(default)]
    pub fallback: FallbackConfig,
}

/// Policy artifact location.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ArtifactConfig {
    /// Path to the compiled policy module (`.wasm`).
    ///
    /// When unset the engine starts `Degraded`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Wasmtime engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable the Wasmtime pooling allocator for instance memories.
    ///
    /// Slots are sized from `pool.size` plus headroom for recreation.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Linear memory cap per instance in megabytes.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Enable fuel metering.
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,

    /// Enable epoch-based interruption (the evaluation watchdog).
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,

    /// Interval between epoch ticks in milliseconds.
    #[serde(default = "defaults::epoch_tick_ms")]
    pub epoch_tick_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            instance_memory_mb: defaults::instance_memory_mb(),
            fuel_metering: defaults::fuel_metering(),
            epoch_interruption: defaults::epoch_interruption(),
            epoch_tick_ms: defaults::epoch_tick_ms(),
        }
    }
}

impl EngineConfig {
    /// Get the epoch tick interval as a `Duration`.
    pub fn epoch_tick(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_ms)
    }

    /// Linear memory cap in bytes.
    pub fn instance_memory_bytes(&self) -> usize {
        (self.instance_memory_mb as usize) * 1024 * 1024
    }
}

/// Instance pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Number of pre-instantiated slots; bounds evaluation concurrency.
    #[serde(default = "defaults::pool_size")]
    pub size: usize,

    /// How long `acquire` waits for an idle slot before reporting overload.
    #[serde(default = "defaults::acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: defaults::pool_size(),
            acquire_timeout_ms: defaults::acquire_timeout_ms(),
        }
    }
}

impl PoolConfig {
    /// Get the acquire timeout as a `Duration`.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Per-call evaluation limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvaluationConfig {
    /// Watchdog timeout for one `evaluate` call in milliseconds.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Fuel granted to each evaluation when metering is enabled.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Largest result the host will read when scanning for a terminator.
    #[serde(default = "defaults::max_result_bytes")]
    pub max_result_bytes: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::timeout_ms(),
            max_fuel: defaults::max_fuel(),
            max_result_bytes: defaults::max_result_bytes(),
        }
    }
}

/// Host-side fallback rule.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FallbackConfig {
    /// `input.user.role` value that is allowed when the module cannot decide.
    #[serde(default = "defaults::privileged_role")]
    pub privileged_role: String,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            privileged_role: defaults::privileged_role(),
        }
    }
}

impl BridgeConfig {
    /// Build a configuration for the artifact at `path` with default settings.
    pub fn with_artifact(path: impl Into<PathBuf>) -> Self {
        Self {
            artifact: ArtifactConfig {
                path: Some(path.into()),
            },
            ..Default::default()
        }
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.pool.size == 0 {
            return Err(EngineError::invalid_config("pool.size must be at least 1"));
        }
        if self.pool.acquire_timeout_ms == 0 {
            return Err(EngineError::invalid_config(
                "pool.acquire_timeout_ms must be positive",
            ));
        }
        if self.evaluation.timeout_ms == 0 {
            return Err(EngineError::invalid_config(
                "evaluation.timeout_ms must be positive",
            ));
        }
        if self.evaluation.timeout_ms > MAX_EVALUATION_TIMEOUT_MS {
            return Err(EngineError::invalid_config(format!(
                "evaluation.timeout_ms must be at most {MAX_EVALUATION_TIMEOUT_MS}"
            )));
        }
        if self.engine.epoch_interruption && self.engine.epoch_tick_ms == 0 {
            return Err(EngineError::invalid_config(
                "engine.epoch_tick_ms must be positive",
            ));
        }
        if self.evaluation.max_result_bytes == 0 {
            return Err(EngineError::invalid_config(
                "evaluation.max_result_bytes must be positive",
            ));
        }
        if self.artifact.path.is_none() {
            warn!("No policy artifact configured; decisions will use the fallback rule");
        }
        Ok(())
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        false
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn fuel_metering() -> bool {
        true
    }

    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn epoch_tick_ms() -> u64 {
        5
    }

    pub const fn pool_size() -> usize {
        8
    }

    pub const fn acquire_timeout_ms() -> u64 {
        250
    }

    pub const fn timeout_ms() -> u64 {
        1000
    }

    pub const fn max_fuel() -> u64 {
        100_000_000
    }

    pub const fn max_result_bytes() -> usize {
        1024 * 1024
    }

    pub fn privileged_role() -> String {
        "admin".to_string()
    }
}
