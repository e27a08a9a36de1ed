//! Wall-clock time for record stamps and staleness checks.
//!
//! Records are ordered by per-writer sequence, never by clock; the
//! wall clock is for staleness/retention decisions and diagnostics.

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WallClock(pub u64);

impl WallClock {
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self(ms)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn saturating_elapsed_ms(self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.0)
    }
}
