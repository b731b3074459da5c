use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::Slot;

/// Lifecycle phase of a slot snapshot at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    /// No slot exists (zeroed record).
    Empty,
    /// Bets accepted.
    Open,
    /// Betting closed, target time not reached.
    Waiting,
    /// Past target time, settlement has not run yet.
    Ready,
    /// Terminal.
    Settled,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Empty => "empty",
            SlotStatus::Open => "open",
            SlotStatus::Waiting => "waiting",
            SlotStatus::Ready => "ready",
            SlotStatus::Settled => "settled",
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a slot snapshot. Total over all inputs; `settled` wins over any
/// timestamp so a settled slot never flips back.
pub fn derive_status(slot: &Slot, now: i64) -> SlotStatus {
    if slot.is_absent() {
        SlotStatus::Empty
    } else if slot.settled {
        SlotStatus::Settled
    } else if now < slot.betting_end_time {
        SlotStatus::Open
    } else if now < slot.target_time {
        SlotStatus::Waiting
    } else {
        SlotStatus::Ready
    }
}

/// A `Ready` slot whose settlement has not shown up for at least
/// `threshold_secs` past its target time.
pub fn is_settlement_overdue(slot: &Slot, now: i64, threshold_secs: i64) -> bool {
    derive_status(slot, now) == SlotStatus::Ready && now - slot.target_time >= threshold_secs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(settled: bool) -> Slot {
        Slot {
            start_time: 1_000,
            betting_end_time: 1_120,
            target_time: 1_180,
            settled,
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_regardless_of_time() {
        let empty = Slot {
            settled: true,
            betting_end_time: 50,
            ..Default::default()
        };
        for now in [-10, 0, 49, 50, 1_000_000] {
            assert_eq!(derive_status(&empty, now), SlotStatus::Empty);
        }
    }

    #[test]
    fn test_settled_regardless_of_time() {
        let s = slot(true);
        for now in [0, 1_000, 1_119, 1_120, 1_180, 9_999] {
            assert_eq!(derive_status(&s, now), SlotStatus::Settled);
        }
    }

    #[test]
    fn test_phase_boundaries() {
        let s = slot(false);
        assert_eq!(derive_status(&s, 1_000), SlotStatus::Open);
        assert_eq!(derive_status(&s, 1_119), SlotStatus::Open);
        assert_eq!(derive_status(&s, 1_120), SlotStatus::Waiting);
        assert_eq!(derive_status(&s, 1_179), SlotStatus::Waiting);
        assert_eq!(derive_status(&s, 1_180), SlotStatus::Ready);
        assert_eq!(derive_status(&s, 50_000), SlotStatus::Ready);
    }

    #[test]
    fn test_never_open_at_or_after_betting_end() {
        let s = slot(false);
        for now in 1_120..1_300 {
            assert_ne!(derive_status(&s, now), SlotStatus::Open);
        }
    }

    #[test]
    fn test_overdue_only_when_ready_past_threshold() {
        let s = slot(false);
        assert!(!is_settlement_overdue(&s, 1_170, 60));
        assert!(!is_settlement_overdue(&s, 1_239, 60));
        assert!(is_settlement_overdue(&s, 1_240, 60));
        assert!(!is_settlement_overdue(&slot(true), 5_000, 60));
    }
}
