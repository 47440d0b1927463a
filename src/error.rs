//! Fault taxonomy for the exchange session layer
//!
//! Transport and auth faults are recovered (or at least survived) by the
//! session itself; stale data is the one fault that must stop the process.

use thiserror::Error;

/// Faults the session layer can raise.
#[derive(Debug, Error)]
pub enum SessionFault {
    /// Disconnects and send failures while a channel is not ready.
    /// Recovered by reconnect-and-resubscribe.
    #[error("transport fault: {0}")]
    Transport(String),

    /// The exchange rejected the websocket auth challenge.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// A cache read exceeded the freshness bound. Fatal: the process must
    /// exit rather than trade on stale data.
    #[error("{what} not updated for {age_secs}s (freshness bound {bound_secs}s)")]
    StaleData {
        what: &'static str,
        age_secs: i64,
        bound_secs: i64,
    },

    /// An order update arrived for a different identity than the tracked
    /// order. Recovered by cancel-then-adopt.
    #[error("tracked order {tracked} conflicts with incoming order {incoming}")]
    OrderConflict { tracked: String, incoming: String },

    /// The open-orders pull returned more than one live order. Recovered by
    /// cancelling all of them and clearing local tracking.
    #[error("reconciliation found {count} live orders, expected at most one")]
    ReconciliationDrift { count: usize },
}

impl SessionFault {
    /// Only stale data terminates the process; everything else is logged and
    /// survived.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionFault::StaleData { .. })
    }
}
