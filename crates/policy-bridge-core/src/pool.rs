//! Bounded pool of ready-to-use module instances.
//!
//! Every evaluation holds one slot exclusively from [`InstancePool::acquire`]
//! until its [`PoolHandle`] is dropped. A slot that faulted is poisoned: its
//! instance is destroyed and re-instantiated before the slot is reused. When
//! re-instantiation fails the slot stays vacant and a later `acquire` retries.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::{AbiVersion, Capabilities, InstanceFactory, ModuleInstance};
use policy_bridge_common::{EngineError, EvaluationError};

struct PoolState {
    idle: Vec<ModuleInstance>,
    vacant: Vec<usize>,
    closed: bool,
}

/// Fixed-size pool of module instances.
pub struct InstancePool {
    factory: Arc<InstanceFactory>,
    state: Mutex<PoolState>,
    available: Condvar,
    acquire_timeout: Duration,
    size: usize,
    capabilities: Capabilities,
    abi_version: Option<AbiVersion>,
    recreated: AtomicU64,
}

impl InstancePool {
    /// Eagerly instantiate `size` independent instances.
    ///
    /// # Errors
    ///
    /// Returns the first instantiation error; no partial pool is built.
    pub fn new(
        factory: Arc<InstanceFactory>,
        size: usize,
        acquire_timeout: Duration,
    ) -> Result<Self, EngineError> {
        if size == 0 {
            return Err(EngineError::invalid_config("pool size must be at least 1"));
        }

        let idle = (0..size)
            .map(|slot_id| factory.instantiate(slot_id))
            .collect::<Result<Vec<_>, _>>()?;
        let capabilities = idle
            .first()
            .map(ModuleInstance::capabilities)
            .unwrap_or_default();
        let abi_version = idle.first().and_then(ModuleInstance::abi_version);

        info!(
            size,
            acquire_timeout_ms = acquire_timeout.as_millis(),
            "Instance pool ready"
        );

        Ok(Self {
            factory,
            state: Mutex::new(PoolState {
                idle,
                vacant: Vec::new(),
                closed: false,
            }),
            available: Condvar::new(),
            acquire_timeout,
            size,
            capabilities,
            abi_version,
            recreated: AtomicU64::new(0),
        })
    }

    /// Check out an idle instance, waiting up to the acquire timeout.
    ///
    /// # Errors
    ///
    /// Returns [`EvaluationError::PoolExhausted`] when no slot becomes idle in
    /// time and [`EvaluationError::Stopped`] once the pool is closed.
    pub fn acquire(&self) -> Result<PoolHandle<'_>, EvaluationError> {
        let start = Instant::now();
        let deadline = start + self.acquire_timeout;
        let mut state = self.state.lock();

        loop {
            if state.closed {
                return Err(EvaluationError::Stopped);
            }
            if let Some(instance) = state.idle.pop() {
                return Ok(PoolHandle::new(self, instance));
            }
            if let Some(slot_id) = state.vacant.pop() {
                // Instantiate outside the lock; the slot stays reserved.
                drop(state);
                match self.factory.instantiate(slot_id) {
                    Ok(instance) => {
                        self.recreated.fetch_add(1, Ordering::Relaxed);
                        info!(slot = slot_id, "Vacant slot re-instantiated");
                        return Ok(PoolHandle::new(self, instance));
                    }
                    Err(e) => {
                        warn!(slot = slot_id, error = %e, "Vacant slot re-instantiation failed");
                        state = self.state.lock();
                        state.vacant.push(slot_id);
                    }
                }
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }

        let waited_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        if state.closed {
            return Err(EvaluationError::Stopped);
        }
        if let Some(instance) = state.idle.pop() {
            return Ok(PoolHandle::new(self, instance));
        }

        warn!(waited_ms, size = self.size, "Instance pool exhausted");
        Err(EvaluationError::PoolExhausted { waited_ms })
    }

    /// Return `instance` to the pool, recreating it first when poisoned.
    fn release(&self, instance: ModuleInstance, poisoned: bool) {
        let slot_id = instance.slot_id();

        let replacement = if poisoned {
            drop(instance);
            match self.factory.instantiate(slot_id) {
                Ok(fresh) => {
                    self.recreated.fetch_add(1, Ordering::Relaxed);
                    debug!(slot = slot_id, "Poisoned slot recreated");
                    Some(fresh)
                }
                Err(e) => {
                    warn!(slot = slot_id, error = %e, "Poisoned slot left vacant");
                    None
                }
            }
        } else {
            Some(instance)
        };

        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        match replacement {
            Some(instance) => state.idle.push(instance),
            None => state.vacant.push(slot_id),
        }
        drop(state);
        self.available.notify_one();
    }

    /// Close the pool: idle instances are destroyed and waiters fail.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        let destroyed = state.idle.len();
        state.idle.clear();
        state.vacant.clear();
        drop(state);

        self.available.notify_all();
        info!(destroyed, "Instance pool closed");
    }

    /// Configured number of slots.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of idle instances.
    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// How many times a slot was re-instantiated.
    pub fn recreated_count(&self) -> u64 {
        self.recreated.load(Ordering::Relaxed)
    }

    /// Capability descriptor shared by all slots.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// ABI version the module declared, if any.
    pub fn abi_version(&self) -> Option<AbiVersion> {
        self.abi_version
    }

    /// The factory slots are instantiated from.
    pub fn factory(&self) -> &Arc<InstanceFactory> {
        &self.factory
    }
}

impl std::fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePool")
            .field("size", &self.size)
            .field("idle", &self.idle_count())
            .field("recreated", &self.recreated_count())
            .finish_non_exhaustive()
    }
}

/// Exclusive checkout of one pool slot.
///
/// Dropping the handle releases the slot. A handle dropped while its thread
/// is panicking poisons the slot.
pub struct PoolHandle<'a> {
    pool: &'a InstancePool,
    instance: Option<ModuleInstance>,
    poisoned: bool,
}

impl std::fmt::Debug for PoolHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("slot_id", &self.slot_id())
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

impl<'a> PoolHandle<'a> {
    fn new(pool: &'a InstancePool, instance: ModuleInstance) -> Self {
        Self {
            pool,
            instance: Some(instance),
            poisoned: false,
        }
    }

    /// The checked-out instance.
    pub fn instance_mut(&mut self) -> &mut ModuleInstance {
        match self.instance.as_mut() {
            Some(instance) => instance,
            None => unreachable!("instance is present until the handle is dropped"),
        }
    }

    /// Slot the handle holds.
    pub fn slot_id(&self) -> usize {
        self.instance.as_ref().map_or(usize::MAX, ModuleInstance::slot_id)
    }

    /// Mark the slot for recreation on release.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    /// Returns `true` if the slot will be recreated on release.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}

impl Drop for PoolHandle<'_> {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            let poisoned = self.poisoned || std::thread::panicking();
            self.pool.release(instance, poisoned);
        }
    }
}
