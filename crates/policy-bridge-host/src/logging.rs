//! Guest output logging.
//!
//! Text the guest emits through `opa_println` or `opa_abort` is stored on the
//! slot's [`GuestState`] and forwarded to `tracing`. Where it ends up is the
//! subscriber's business.

use policy_bridge_core::{GuestState, LogLevel};
use tracing::{debug, error};

/// Host implementation of guest logging.
///
/// Logs are both:
/// 1. Stored in the [`GuestState`] for the current evaluation
/// 2. Emitted via the `tracing` crate with the slot id
pub struct LoggingHost;

impl LoggingHost {
    /// Log a message at the specified level.
    pub fn log(state: &mut GuestState, level: LogLevel, message: &str) {
        state.log(level, message.to_string());

        let slot = state.slot_id;
        match level {
            LogLevel::Debug => debug!(slot, guest_log = true, "{}", message),
            LogLevel::Error => error!(slot, guest_log = true, "{}", message),
        }
    }

    /// `opa_println` output.
    pub fn println(state: &mut GuestState, message: &str) {
        Self::log(state, LogLevel::Debug, message);
    }

    /// Record an `opa_abort` message.
    pub fn abort(state: &mut GuestState, message: &str) {
        Self::log(state, LogLevel::Error, message);
        state.record_abort(message.to_string());
    }
}
