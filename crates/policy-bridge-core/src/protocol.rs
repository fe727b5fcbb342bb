//! Evaluation protocol tiers.
//!
//! A policy module may speak the context API, a single-call `eval` export,
//! or neither. [`ProtocolSelector`] tries each [`ProtocolTier`] in order
//! against the slot's [`Capabilities`](crate::Capabilities) and stops at the
//! first decision. When every module tier is unavailable or fails without a
//! guest fault, the host-side [`FallbackRule`] decides.
//!
//! A guest fault stops the module tiers for the call and is returned to the
//! caller so the slot can be poisoned.

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::ModuleInstance;
use crate::decision::{Decision, Tier};
use crate::memory::Arena;
use policy_bridge_common::{FallbackConfig, GuestFault, MarshalError};

/// Outcome of one tier attempt.
#[derive(Debug)]
pub enum TierOutcome {
    /// The tier produced a decision.
    Success(Decision),
    /// The module lacks what the tier needs.
    Unavailable,
    /// The tier ran and failed.
    Failed(TierFailure),
}

/// Why a tier failed.
#[derive(Error, Debug)]
pub enum TierFailure {
    /// Moving data across the memory boundary failed.
    #[error(transparent)]
    Marshal(#[from] MarshalError),

    /// `opa_eval_ctx_new` returned a null context.
    #[error("Evaluation context could not be created")]
    NullContext,

    /// The guest JSON parser rejected the input.
    #[error("Guest rejected the input document")]
    InputRejected,

    /// The evaluator returned a non-zero error code.
    #[error("Evaluator returned error code {0}")]
    ErrorCode(i32),

    /// The policy called builtins the host does not serve.
    #[error("Unserved builtin ids {ids:?}")]
    Builtins {
        /// Builtin ids that returned the not-implemented sentinel.
        ids: Vec<i32>,
    },
}

impl TierFailure {
    /// The guest fault behind this failure, if any.
    pub fn guest_fault(&self) -> Option<&GuestFault> {
        match self {
            Self::Marshal(e) => e.guest_fault(),
            _ => None,
        }
    }
}

impl From<GuestFault> for TierFailure {
    fn from(fault: GuestFault) -> Self {
        Self::Marshal(MarshalError::Guest(fault))
    }
}

/// One way of asking the module for a decision.
pub trait ProtocolTier: Send + Sync {
    /// Tier reported on decisions.
    fn tier(&self) -> Tier;

    /// Evaluate serialized `input` on `instance`.
    fn attempt(&self, instance: &mut ModuleInstance, input: &[u8]) -> TierOutcome;
}

/// Context API: `opa_eval_ctx_new`, `opa_eval_ctx_set_input`, `opa_eval` (or
/// `eval`), `opa_eval_ctx_get_result`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextTier;

impl ContextTier {
    fn run(instance: &mut ModuleInstance, input: &[u8]) -> Result<Decision, TierFailure> {
        let len =
            i32::try_from(input.len()).map_err(|_| MarshalError::TooLarge { len: input.len() })?;
        let mut arena = Arena::new(instance);

        let ctx = arena.instance().ctx_new()?;
        if ctx == 0 {
            return Err(TierFailure::NullContext);
        }

        let input_addr = arena.write_bytes(input)?;
        let value_addr = match arena.instance().json_parse(input_addr, len)? {
            Some(0) => return Err(TierFailure::InputRejected),
            Some(parsed) => parsed,
            None => input_addr,
        };

        arena.instance().ctx_set_input(ctx, value_addr)?;
        let code = arena.instance().ctx_eval(ctx)?;
        if code != 0 {
            return Err(TierFailure::ErrorCode(code));
        }

        let result_addr = arena.instance().ctx_result(ctx)?;
        let bytes = if result_addr == 0 {
            None
        } else {
            Some(read_context_result(arena.instance(), ctx, result_addr)?)
        };
        arena.finish()?;

        let Some(bytes) = bytes else {
            // Undefined result
            return Ok(Decision::new(false, Tier::Context, None));
        };
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| MarshalError::decode(format!("result is not JSON: {e}")))?;

        Ok(Decision::new(extract_allow(&value), Tier::Context, Some(value)))
    }
}

/// Read the serialized result of `ctx`.
///
/// With `opa_eval_ctx_get_result_len` the declared length is read exactly.
/// Otherwise the result (dumped through `opa_json_dump` when exported) is
/// read as a bounded NUL-terminated string.
fn read_context_result(
    instance: &mut ModuleInstance,
    ctx: i32,
    result_addr: i32,
) -> Result<Vec<u8>, MarshalError> {
    if let Some(len) = instance.ctx_result_len(ctx)? {
        let len = usize::try_from(len)
            .map_err(|_| MarshalError::decode(format!("negative result length {len}")))?;
        return instance.read_result(result_addr, len);
    }

    let text_addr = instance.json_dump(result_addr)?.unwrap_or(result_addr);
    if text_addr == 0 {
        return Err(MarshalError::decode("result could not be serialized"));
    }
    instance.read_c_string(text_addr)
}

impl ProtocolTier for ContextTier {
    fn tier(&self) -> Tier {
        Tier::Context
    }

    fn attempt(&self, instance: &mut ModuleInstance, input: &[u8]) -> TierOutcome {
        if !instance.capabilities().supports_context_api {
            return TierOutcome::Unavailable;
        }
        match Self::run(instance, input) {
            Ok(decision) => TierOutcome::Success(decision),
            Err(failure) => TierOutcome::Failed(failure),
        }
    }
}

/// Single-call API: `eval(input_addr) -> i32`, non-zero allows.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleTier;

impl SimpleTier {
    fn run(instance: &mut ModuleInstance, input: &[u8]) -> Result<Decision, TierFailure> {
        let mut arena = Arena::new(instance);
        let input_addr = arena.write_bytes(input)?;
        let verdict = arena.instance().simple_eval(input_addr)?;
        arena.finish()?;

        let allowed = verdict != 0;
        Ok(Decision::new(allowed, Tier::Simple, Some(Value::Bool(allowed))))
    }
}

impl ProtocolTier for SimpleTier {
    fn tier(&self) -> Tier {
        Tier::Simple
    }

    fn attempt(&self, instance: &mut ModuleInstance, input: &[u8]) -> TierOutcome {
        let caps = instance.capabilities();
        if !caps.supports_simple_api {
            return TierOutcome::Unavailable;
        }
        if !caps.has_allocator || !caps.has_memory {
            debug!(slot = instance.slot_id(), "eval export present without allocator");
            return TierOutcome::Unavailable;
        }
        match Self::run(instance, input) {
            Ok(decision) => TierOutcome::Success(decision),
            Err(failure) => TierOutcome::Failed(failure),
        }
    }
}

/// Extract the allow flag from a result document.
///
/// Only a literal `true` allows: directly, as the first element of a result
/// set, or under a `result` or `allow` key.
pub fn extract_allow(value: &Value) -> bool {
    match value {
        Value::Bool(allowed) => *allowed,
        Value::Array(items) => items.first().is_some_and(extract_allow),
        Value::Object(map) => map
            .get("result")
            .or_else(|| map.get("allow"))
            .is_some_and(extract_allow),
        _ => false,
    }
}

/// Host-side rule used when the module cannot decide.
///
/// Allows iff `input.user.role` equals the privileged role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackRule {
    privileged_role: String,
}

impl FallbackRule {
    /// Create a rule allowing `privileged_role`.
    pub fn new(privileged_role: impl Into<String>) -> Self {
        Self {
            privileged_role: privileged_role.into(),
        }
    }

    /// Create a rule from configuration.
    pub fn from_config(config: &FallbackConfig) -> Self {
        Self::new(config.privileged_role.clone())
    }

    /// The role that is allowed.
    pub fn privileged_role(&self) -> &str {
        &self.privileged_role
    }

    /// Decide `input`. Missing or malformed fields deny.
    pub fn evaluate(&self, input: &Value) -> Decision {
        let role = input
            .get("user")
            .and_then(|user| user.get("role"))
            .and_then(Value::as_str);
        let allowed = role == Some(self.privileged_role.as_str());

        warn!(
            degraded = true,
            allowed,
            role = role.unwrap_or("<missing>"),
            "Policy decided by fallback rule"
        );

        Decision::new(allowed, Tier::Fallback, None)
    }
}

impl Default for FallbackRule {
    fn default() -> Self {
        Self::from_config(&FallbackConfig::default())
    }
}

/// Ordered list of protocol tiers plus the fallback rule.
pub struct ProtocolSelector {
    tiers: Vec<Box<dyn ProtocolTier>>,
    fallback: FallbackRule,
}

impl ProtocolSelector {
    /// Context tier, then simple tier, then `fallback`.
    pub fn new(fallback: FallbackRule) -> Self {
        Self::with_tiers(vec![Box::new(ContextTier), Box::new(SimpleTier)], fallback)
    }

    /// Use a custom tier order.
    pub fn with_tiers(tiers: Vec<Box<dyn ProtocolTier>>, fallback: FallbackRule) -> Self {
        Self { tiers, fallback }
    }

    /// The fallback rule.
    pub fn fallback(&self) -> &FallbackRule {
        &self.fallback
    }

    /// Evaluate `input` on `instance`.
    ///
    /// The guest heap pointer, when exposed, is restored afterwards.
    ///
    /// # Errors
    ///
    /// Returns the [`GuestFault`] that stopped the module; the caller must
    /// poison the slot.
    pub fn evaluate(
        &self,
        instance: &mut ModuleInstance,
        input: &Value,
    ) -> Result<Decision, GuestFault> {
        instance.begin_evaluation();

        let bytes = match serde_json::to_vec(input) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(slot = instance.slot_id(), error = %e, "Input could not be serialized");
                return Ok(self.fallback.evaluate(input));
            }
        };

        let heap = instance.heap_ptr()?;
        let decided = self.run_tiers(instance, &bytes)?;
        if let Some(ptr) = heap {
            instance.set_heap_ptr(ptr)?;
        }

        Ok(decided.unwrap_or_else(|| self.fallback.evaluate(input)))
    }

    fn run_tiers(
        &self,
        instance: &mut ModuleInstance,
        input: &[u8],
    ) -> Result<Option<Decision>, GuestFault> {
        for tier in &self.tiers {
            let outcome = tier.attempt(instance, input);
            let failed_builtins = instance.take_failed_builtins();

            let outcome = match outcome {
                TierOutcome::Success(_) if !failed_builtins.is_empty() => {
                    TierOutcome::Failed(TierFailure::Builtins {
                        ids: failed_builtins,
                    })
                }
                other => other,
            };

            match outcome {
                TierOutcome::Success(decision) => {
                    debug!(
                        slot = instance.slot_id(),
                        tier = %decision.tier(),
                        allowed = decision.allowed(),
                        "Policy decided"
                    );
                    return Ok(Some(decision));
                }
                TierOutcome::Unavailable => {
                    debug!(slot = instance.slot_id(), tier = %tier.tier(), "Protocol tier unavailable");
                }
                TierOutcome::Failed(failure) => {
                    if let Some(fault) = failure.guest_fault() {
                        warn!(
                            slot = instance.slot_id(),
                            tier = %tier.tier(),
                            fault = %fault,
                            "Guest fault during evaluation"
                        );
                        return Err(fault.clone());
                    }
                    warn!(
                        slot = instance.slot_id(),
                        tier = %tier.tier(),
                        error = %failure,
                        "Protocol tier failed, degrading"
                    );
                }
            }
        }
        Ok(None)
    }
}

impl std::fmt::Debug for ProtocolSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tiers: Vec<Tier> = self.tiers.iter().map(|tier| tier.tier()).collect();
        f.debug_struct("ProtocolSelector")
            .field("tiers", &tiers)
            .field("fallback", &self.fallback)
            .finish()
    }
}
