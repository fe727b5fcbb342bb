//! Host/guest memory marshaling.
//!
//! Every byte the host hands to the guest is placed through the module's own
//! `opa_malloc`, and every allocation is returned through `opa_free` exactly
//! once. [`Arena`] scopes the allocations of one evaluation: whatever is still
//! live when it goes out of scope is freed, including on error paths.

use std::ops::Range;

use tracing::warn;
use wasmtime::{AsContext, AsContextMut, Memory};

use crate::ModuleInstance;
use policy_bridge_common::MarshalError;

/// Reinterpret a guest pointer as an unsigned offset.
#[allow(clippy::cast_sign_loss)]
fn guest_offset(addr: i32) -> u32 {
    addr as u32
}

/// Byte range `[addr, addr + len)` if it lies within `memory_size`.
pub fn checked_range(
    addr: i32,
    len: usize,
    memory_size: usize,
) -> Result<Range<usize>, MarshalError> {
    let offset = guest_offset(addr);
    let start = offset as usize;
    start
        .checked_add(len)
        .filter(|end| *end <= memory_size)
        .map(|end| start..end)
        .ok_or(MarshalError::OutOfBounds {
            addr: offset,
            len,
            memory_size,
        })
}

/// Copy exactly `len` bytes out of guest memory.
pub fn read_exact(
    store: impl AsContext,
    memory: &Memory,
    addr: i32,
    len: usize,
) -> Result<Vec<u8>, MarshalError> {
    let data = memory.data(&store);
    let range = checked_range(addr, len, data.len())?;
    Ok(data[range].to_vec())
}

/// Read a NUL-terminated string of at most `max_len` bytes.
///
/// A terminator missing from the window is a decode error; the string is
/// never silently truncated.
pub fn read_c_string(
    store: impl AsContext,
    memory: &Memory,
    addr: i32,
    max_len: usize,
) -> Result<Vec<u8>, MarshalError> {
    let data = memory.data(&store);
    let start = checked_range(addr, 0, data.len())?.start;
    let window_end = start.saturating_add(max_len.saturating_add(1)).min(data.len());
    let window = &data[start..window_end];

    match window.iter().position(|byte| *byte == 0) {
        Some(nul) => Ok(window[..nul].to_vec()),
        None => Err(MarshalError::decode(format!(
            "no NUL terminator within {max_len} bytes at {:#x}",
            guest_offset(addr)
        ))),
    }
}

/// Copy `bytes` into guest memory at `addr`.
pub fn write_exact(
    mut store: impl AsContextMut,
    memory: &Memory,
    addr: i32,
    bytes: &[u8],
) -> Result<(), MarshalError> {
    let data = memory.data_mut(&mut store);
    let range = checked_range(addr, bytes.len(), data.len())?;
    data[range].copy_from_slice(bytes);
    Ok(())
}

impl ModuleInstance {
    fn require_memory(&self) -> Result<Memory, MarshalError> {
        self.memory().ok_or(MarshalError::MissingExport { name: "memory" })
    }

    /// Allocate guest memory for `bytes` and copy them in.
    ///
    /// A null allocation fails; an allocation that does not fit inside the
    /// current memory is freed before failing.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<i32, MarshalError> {
        let len =
            i32::try_from(bytes.len()).map_err(|_| MarshalError::TooLarge { len: bytes.len() })?;
        let memory = self.require_memory()?;

        let addr = self.guest_malloc(len)?;
        if addr == 0 {
            return Err(MarshalError::AllocationFailed { len: bytes.len() });
        }

        if let Err(e) = write_exact(self.store_mut(), &memory, addr, bytes) {
            if let Err(free_err) = self.free(addr) {
                warn!(slot = self.slot_id(), error = %free_err, "Failed to free rejected allocation");
            }
            return Err(e);
        }
        Ok(addr)
    }

    /// Read exactly `len` bytes at `addr`.
    pub fn read_result(&self, addr: i32, len: usize) -> Result<Vec<u8>, MarshalError> {
        let memory = self.require_memory()?;
        read_exact(self.store(), &memory, addr, len)
    }

    /// Read a NUL-terminated string bounded by `max_result_bytes`.
    pub fn read_c_string(&self, addr: i32) -> Result<Vec<u8>, MarshalError> {
        let memory = self.require_memory()?;
        read_c_string(self.store(), &memory, addr, self.limits().max_result_bytes)
    }

    /// Return an allocation to the guest allocator.
    pub fn free(&mut self, addr: i32) -> Result<(), MarshalError> {
        self.guest_free(addr)
    }
}

/// Allocations made during one evaluation.
///
/// Dropping the arena frees every allocation that is still live.
pub struct Arena<'a> {
    instance: &'a mut ModuleInstance,
    live: Vec<i32>,
}

impl<'a> Arena<'a> {
    /// Start tracking allocations on `instance`.
    pub fn new(instance: &'a mut ModuleInstance) -> Self {
        Self {
            instance,
            live: Vec::new(),
        }
    }

    /// Write `bytes` into guest memory; freed when the arena ends.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<i32, MarshalError> {
        let addr = self.instance.write_bytes(bytes)?;
        self.live.push(addr);
        Ok(addr)
    }

    /// Free one tracked allocation now.
    pub fn free(&mut self, addr: i32) -> Result<(), MarshalError> {
        if let Some(pos) = self.live.iter().position(|live| *live == addr) {
            self.live.swap_remove(pos);
            self.instance.free(addr)?;
        }
        Ok(())
    }

    /// The instance the arena allocates on.
    pub fn instance(&mut self) -> &mut ModuleInstance {
        &mut *self.instance
    }

    /// Number of allocations still live.
    pub fn live(&self) -> usize {
        self.live.len()
    }

    /// Free everything still live and report the first failure.
    pub fn finish(mut self) -> Result<(), MarshalError> {
        let mut first_error = None;
        for addr in std::mem::take(&mut self.live) {
            if let Err(e) = self.instance.free(addr) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Arena<'_> {
    fn drop(&mut self) {
        for addr in std::mem::take(&mut self.live) {
            if let Err(e) = self.instance.free(addr) {
                warn!(slot = self.instance.slot_id(), addr, error = %e, "Failed to free guest allocation");
            }
        }
    }
}
