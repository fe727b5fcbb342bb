//! Wasmtime engine configuration and the epoch ticker.
//!
//! The [`WasmEngine`] is the foundation of the bridge. It is:
//! - Thread-safe and shared by every pool slot
//! - Optionally configured with the pooling allocator
//! - Set up with fuel metering and epoch interruption for the evaluation watchdog
//!
//! The [`EpochTicker`] drives epoch interruption from a background thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use tracing::{debug, info};
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use policy_bridge_common::{EngineConfig, EngineError};

/// Thread-safe WebAssembly engine wrapper.
///
/// Wraps a Wasmtime [`Engine`] configured for policy evaluation. The engine
/// holds no per-evaluation state and is shared by all instances.
///
/// # Example
///
/// ```ignore
/// use policy_bridge_common::EngineConfig;
/// use policy_bridge_core::WasmEngine;
///
/// let engine = WasmEngine::new(&EngineConfig::default(), 8)?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Create a new WebAssembly engine.
    ///
    /// `max_instances` sizes the pooling allocator when it is enabled; pass the
    /// pool size (headroom for slot recreation is added here).
    ///
    /// # Errors
    ///
    /// Returns an error if the Wasmtime configuration is invalid.
    pub fn new(config: &EngineConfig, max_instances: u32) -> Result<Self, EngineError> {
        let mut wasmtime_config = Config::new();

        wasmtime_config.consume_fuel(config.fuel_metering);
        wasmtime_config.epoch_interruption(config.epoch_interruption);
        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config, max_instances);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            EngineError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        debug!(
            fuel_metering = config.fuel_metering,
            epoch_interruption = config.epoch_interruption,
            "Wasmtime engine initialized"
        );

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    /// Create pooling allocation configuration.
    ///
    /// Each slot may briefly exist twice while a poisoned instance is being
    /// replaced, so twice the pool size is reserved.
    fn create_pooling_config(config: &EngineConfig, max_instances: u32) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();
        let total = max_instances.saturating_mul(2).max(2);

        pooling.total_core_instances(total);
        pooling.total_memories(total);
        pooling.total_tables(total);
        pooling.max_memory_size(config.instance_memory_bytes());

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Increment the epoch counter.
    pub fn increment_epoch(&self) {
        self.engine.increment_epoch();
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("fuel_metering", &self.config.fuel_metering)
            .field("epoch_interruption", &self.config.epoch_interruption)
            .finish_non_exhaustive()
    }
}

/// Background thread advancing the engine epoch every `epoch_tick_ms`.
///
/// Stores armed with an epoch deadline trap with [`wasmtime::Trap::Interrupt`]
/// once the deadline passes. The thread stops when the ticker is stopped or
/// dropped.
pub struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    /// Start ticking the given engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start(engine: &WasmEngine) -> Result<Self, EngineError> {
        let stop = Arc::new(AtomicBool::new(false));
        let tick = engine.config().epoch_tick();
        let ticking = engine.clone();
        let flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("policy-bridge-epoch".into())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    std::thread::sleep(tick);
                    ticking.increment_epoch();
                }
            })
            .map_err(|e| {
                EngineError::invalid_config(format!("Failed to spawn epoch ticker: {e}"))
            })?;

        debug!(tick_ms = engine.config().epoch_tick_ms, "Epoch ticker started");

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the ticker and wait for its thread to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            debug!("Epoch ticker stopped");
        }
    }

    /// Returns `true` while the ticker thread is running.
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for EpochTicker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochTicker")
            .field("running", &self.is_running())
            .finish()
    }
}

/// Number of epoch ticks covering `timeout_ms`, rounded up, plus one tick so
/// that a deadline armed just before a tick still gets the full timeout.
pub fn deadline_ticks(timeout_ms: u64, tick_ms: u64) -> u64 {
    timeout_ms.div_ceil(tick_ms.max(1)).saturating_add(1)
}
