//! Engine limits and intervals (normative defaults).

use serde::{Deserialize, Serialize};

/// Normative defaults for log sizes, trigger cadence and recovery
/// timeouts. Units are explicit in the field names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Largest record body accepted in any engine log.
    pub max_record_bytes: usize,

    /// Own activity log size above which the caller should compact.
    pub activity_compact_threshold_bytes: u64,

    /// Debounce window for filesystem change notifications.
    pub watch_debounce_ms: u64,
    /// Backstop poll cadence for activity replay.
    pub activity_poll_interval_ms: u64,
    /// Backstop poll cadence for deletion replay.
    pub deletion_poll_interval_ms: u64,

    /// A non-terminal move older than this is reported stale.
    pub stale_move_timeout_ms: u64,

    /// Skipped entries older than this are expired and stepped over.
    pub skipped_entry_retention_ms: u64,

    /// Default bound for `wait_for_pending_syncs` at shutdown.
    pub drain_timeout_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_record_bytes: 16 * 1024 * 1024,
            activity_compact_threshold_bytes: 64 * 1024 * 1024,
            watch_debounce_ms: 200,
            activity_poll_interval_ms: 30_000,
            deletion_poll_interval_ms: 300_000,
            stale_move_timeout_ms: 300_000,
            skipped_entry_retention_ms: 30 * 24 * 60 * 60 * 1000,
            drain_timeout_ms: 5_000,
        }
    }
}
