//! Engine lifecycle handle.
//!
//! [`PolicyEngine`] owns everything an evaluation needs: the Wasmtime engine,
//! the compiled artifact, the instance pool, the protocol selector, and the
//! epoch ticker. Callers hold it by reference; there is no global instance.
//!
//! ```text
//! Uninitialized ──initialize──▶ Ready ────┐
//!       │                                 ├──shutdown──▶ ShuttingDown ──▶ Stopped
//!       └──────initialize (fails)──▶ Degraded ┘
//! ```

use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::task::JoinError;
use tracing::{Instrument as _, debug, error, info, info_span, warn};
use uuid::Uuid;

use policy_bridge_common::{BridgeConfig, EngineError, EvaluationError, LoadError};
use policy_bridge_core::{
    CompiledArtifact, Decision, EpochTicker, ExecutionLimits, FallbackRule, InstanceFactory,
    InstancePool, ProtocolSelector, WasmEngine,
};
use policy_bridge_host::{BuiltinTable, create_linker};

use crate::status::{EngineStatus, ExportCategories, ModuleDescription};

enum EngineState {
    Uninitialized,
    Ready(Arc<LoadedPolicy>),
    Degraded { reason: String },
    ShuttingDown,
    Stopped,
}

impl EngineState {
    fn status(&self) -> EngineStatus {
        match self {
            Self::Uninitialized => EngineStatus::Uninitialized,
            Self::Ready(_) => EngineStatus::Ready,
            Self::Degraded { .. } => EngineStatus::Degraded,
            Self::ShuttingDown => EngineStatus::ShuttingDown,
            Self::Stopped => EngineStatus::Stopped,
        }
    }
}

/// A loaded policy with its pool.
struct LoadedPolicy {
    pool: InstancePool,
    selector: ProtocolSelector,
    description: ModuleDescription,
    ticker: Mutex<Option<EpochTicker>>,
}

impl LoadedPolicy {
    fn load(
        config: &BridgeConfig,
        builtins: &Arc<BuiltinTable>,
        fallback: FallbackRule,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let path = config
            .artifact
            .path
            .as_ref()
            .ok_or(LoadError::NotConfigured)?;

        let max_instances = u32::try_from(config.pool.size).unwrap_or(u32::MAX);
        let engine = WasmEngine::new(&config.engine, max_instances)?;
        debug!(
            max_instances,
            pooling_allocator = engine.is_pooling_enabled(),
            "Wasm engine created"
        );
        let artifact = Arc::new(CompiledArtifact::load(engine.inner(), path)?);
        let linker = create_linker(&engine, &artifact, builtins)?;

        // Start ticking before instantiation so start functions are bounded too.
        let ticker = if config.engine.epoch_interruption {
            Some(EpochTicker::start(&engine)?)
        } else {
            None
        };

        let factory = InstanceFactory::new(
            engine,
            Arc::clone(&artifact),
            linker,
            ExecutionLimits::from_config(config),
        );
        let pool = InstancePool::new(
            Arc::new(factory),
            config.pool.size,
            config.pool.acquire_timeout(),
        )?;
        let description =
            ModuleDescription::new(&artifact, pool.capabilities(), pool.abi_version());

        Ok(Self {
            pool,
            selector: ProtocolSelector::new(fallback),
            description,
            ticker: Mutex::new(ticker),
        })
    }

    fn evaluate(&self, input: &Value) -> Result<Decision, EvaluationError> {
        let start = Instant::now();
        let mut handle = self.pool.acquire()?;
        let slot = handle.slot_id();

        match self.selector.evaluate(handle.instance_mut(), input) {
            Ok(decision) => {
                debug!(
                    slot,
                    tier = %decision.tier(),
                    allowed = decision.allowed(),
                    fuel_consumed = handle.instance_mut().fuel_consumed(),
                    duration_us = elapsed_us(start),
                    "Evaluation complete"
                );
                Ok(decision)
            }
            Err(fault) => {
                handle.poison();
                warn!(
                    slot,
                    fault = %fault,
                    duration_us = elapsed_us(start),
                    "Guest fault, slot poisoned"
                );
                Err(fault.into())
            }
        }
    }

    fn close(&self) {
        self.pool.close();
        if let Some(mut ticker) = self.ticker.lock().take() {
            ticker.stop();
        }
    }
}

/// Process-wide handle for evaluating authorization inputs.
///
/// # Example
///
/// ```ignore
/// use policy_bridge_common::BridgeConfig;
/// use policy_bridge_runtime::PolicyEngine;
///
/// let engine = PolicyEngine::new(BridgeConfig::with_artifact("policy.wasm"));
/// engine.initialize();
///
/// let allowed = engine.is_allowed(&serde_json::json!({"user": {"role": "admin"}}));
/// engine.shutdown();
/// ```
pub struct PolicyEngine {
    config: BridgeConfig,
    builtins: Arc<BuiltinTable>,
    fallback: FallbackRule,
    state: RwLock<EngineState>,
}

impl PolicyEngine {
    /// Create an uninitialized engine with the default builtins.
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_builtins(config, BuiltinTable::with_defaults())
    }

    /// Create an uninitialized engine serving `builtins` to the module.
    pub fn with_builtins(config: BridgeConfig, builtins: BuiltinTable) -> Self {
        let fallback = FallbackRule::from_config(&config.fallback);
        Self {
            config,
            builtins: Arc::new(builtins),
            fallback,
            state: RwLock::new(EngineState::Uninitialized),
        }
    }

    /// Load the artifact and build the pool.
    ///
    /// A failed load leaves the engine `Degraded` rather than returning an
    /// error. Calling this again returns the current status without
    /// reloading; a stopped engine stays stopped.
    pub fn initialize(&self) -> EngineStatus {
        let mut state = self.state.write();
        if !matches!(*state, EngineState::Uninitialized) {
            return state.status();
        }

        let start = Instant::now();
        *state = match LoadedPolicy::load(&self.config, &self.builtins, self.fallback.clone()) {
            Ok(policy) => {
                info!(
                    pool_size = policy.pool.size(),
                    exports = policy.description.export_names.len(),
                    context_api = policy.description.supports_context_api,
                    simple_api = policy.description.supports_simple_api,
                    duration_us = elapsed_us(start),
                    "Policy engine ready"
                );
                EngineState::Ready(Arc::new(policy))
            }
            Err(e) => {
                warn!(
                    error = %e,
                    degraded = true,
                    "Policy module unavailable, serving fallback decisions"
                );
                EngineState::Degraded {
                    reason: e.to_string(),
                }
            }
        };
        state.status()
    }

    /// Current lifecycle state.
    pub fn status(&self) -> EngineStatus {
        self.state.read().status()
    }

    /// Returns `true` once initialization has run, whether or not it loaded
    /// the module.
    pub fn is_initialized(&self) -> bool {
        self.status().is_initialized()
    }

    /// Returns `true` if decisions come from the policy module.
    pub fn is_ready(&self) -> bool {
        self.status() == EngineStatus::Ready
    }

    /// Why the engine is degraded.
    pub fn degraded_reason(&self) -> Option<String> {
        match &*self.state.read() {
            EngineState::Degraded { reason } => Some(reason.clone()),
            _ => None,
        }
    }

    /// The loaded module, if any.
    pub fn describe(&self) -> Option<ModuleDescription> {
        match &*self.state.read() {
            EngineState::Ready(policy) => Some(policy.description.clone()),
            _ => None,
        }
    }

    /// Exports of the loaded module grouped by purpose.
    pub fn describe_exports(&self) -> Option<ExportCategories> {
        self.describe().map(|description| description.categorize())
    }

    /// Configuration the engine was created with.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Evaluate `input` against the policy.
    ///
    /// While degraded the fallback rule decides. Blocks for at most the pool
    /// acquire timeout plus the evaluation timeout.
    ///
    /// # Errors
    ///
    /// - [`EvaluationError::NotInitialized`] before [`initialize`](Self::initialize)
    /// - [`EvaluationError::Stopped`] after [`shutdown`](Self::shutdown)
    /// - [`EvaluationError::PoolExhausted`] when every slot stays busy
    /// - [`EvaluationError::GuestFault`] when the module traps, aborts, or
    ///   runs out of time or fuel
    pub fn evaluate(&self, input: &Value) -> Result<Decision, EvaluationError> {
        let policy = match &*self.state.read() {
            EngineState::Ready(policy) => Arc::clone(policy),
            EngineState::Degraded { .. } => return Ok(self.fallback.evaluate(input)),
            EngineState::Uninitialized => return Err(EvaluationError::NotInitialized),
            EngineState::ShuttingDown | EngineState::Stopped => {
                return Err(EvaluationError::Stopped);
            }
        };

        let evaluation_id = Uuid::new_v4();
        let span = info_span!("evaluate", %evaluation_id);
        let _entered = span.enter();
        policy.evaluate(input)
    }

    /// Evaluate `input`, treating every error as a deny.
    pub fn is_allowed(&self, input: &Value) -> bool {
        match self.evaluate(input) {
            Ok(decision) => decision.allowed(),
            Err(e) => {
                debug!(error = %e, "Evaluation failed, denying");
                false
            }
        }
    }

    /// Evaluate `input` on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// Same as [`evaluate`](Self::evaluate), plus
    /// [`EvaluationError::TaskFailed`] if the blocking task panics.
    pub async fn evaluate_blocking(
        self: &Arc<Self>,
        input: Value,
    ) -> Result<Decision, EvaluationError> {
        let engine = Arc::clone(self);
        tokio::task::spawn_blocking(move || engine.evaluate(&input))
            .instrument(info_span!("evaluate_blocking"))
            .await
            .unwrap_or_else(|e| Err(task_failure(&e)))
    }

    /// Tear down the pool and stop the epoch ticker. Idempotent.
    ///
    /// Evaluations already holding a slot finish; later calls are rejected.
    pub fn shutdown(&self) {
        let previous = {
            let mut state = self.state.write();
            if matches!(*state, EngineState::ShuttingDown | EngineState::Stopped) {
                return;
            }
            std::mem::replace(&mut *state, EngineState::ShuttingDown)
        };

        if let EngineState::Ready(policy) = previous {
            policy.close();
        }

        *self.state.write() = EngineState::Stopped;
        info!("Policy engine stopped");
    }
}

impl Drop for PolicyEngine {
    fn drop(&mut self) {
        if let EngineState::Ready(policy) = &*self.state.get_mut() {
            policy.close();
        }
    }
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("status", &self.status())
            .field("builtins", &self.builtins)
            .finish_non_exhaustive()
    }
}

fn task_failure(error: &JoinError) -> EvaluationError {
    error!(error = %error, panicked = error.is_panic(), "Evaluation task failed");
    EvaluationError::TaskFailed
}

fn elapsed_us(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX)
}
