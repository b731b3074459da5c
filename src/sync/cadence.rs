use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::SyncConfig;

/// Polling cadence of the current-slot synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Baseline,
    /// The next anchor is due and has not been observed yet.
    Elevated,
}

impl Cadence {
    /// Elevated once `now` reaches `last_anchor + interval`. No anchor seen
    /// yet (`0`) keeps the baseline.
    pub fn at(last_anchor: i64, anchor_interval: i64, now: i64) -> Self {
        if last_anchor > 0 && now >= last_anchor + anchor_interval {
            Cadence::Elevated
        } else {
            Cadence::Baseline
        }
    }

    pub fn interval(&self, config: &SyncConfig) -> Duration {
        match self {
            Cadence::Baseline => config.baseline_cadence,
            Cadence::Elevated => config.elevated_cadence,
        }
    }

    pub fn is_elevated(&self) -> bool {
        matches!(self, Cadence::Elevated)
    }
}

/// Next anchor time the synchronizer expects, or 0 when unknown.
pub fn expected_next_anchor(last_anchor: i64, anchor_interval: i64) -> i64 {
    if last_anchor > 0 {
        last_anchor + anchor_interval
    } else {
        0
    }
}
