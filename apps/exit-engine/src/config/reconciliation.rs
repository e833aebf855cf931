//! Reconciliation loop configuration.

use serde::{Deserialize, Serialize};

/// Reconciliation loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Seconds between clean polling cycles.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Seconds to sleep after a cycle that hit an error.
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,
    /// Consecutive empty cycles required before a position is treated as
    /// genuinely closed. Guards against transient API inconsistency.
    #[serde(default = "default_close_confirm_cycles")]
    pub close_confirm_cycles: u32,
    /// Consecutive cycles a tracked limit entry may be missing from both
    /// the pending list and order history before the fallback applies.
    #[serde(default = "default_entry_miss_cycles")]
    pub entry_miss_cycles: u32,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            error_backoff_secs: default_error_backoff(),
            close_confirm_cycles: default_close_confirm_cycles(),
            entry_miss_cycles: default_entry_miss_cycles(),
        }
    }
}

const fn default_poll_interval() -> u64 {
    5
}

const fn default_error_backoff() -> u64 {
    10
}

const fn default_close_confirm_cycles() -> u32 {
    2
}

const fn default_entry_miss_cycles() -> u32 {
    3
}
