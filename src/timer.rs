//! Per-slot countdown text, recomputed once per tick for presentation.

use crate::models::Slot;
use crate::status::{derive_status, SlotStatus};

/// `m:ss` until `target`, or `None` once it has passed.
pub fn time_remaining(target: i64, now: i64) -> Option<String> {
    let remaining = target - now;
    if remaining <= 0 {
        return None;
    }
    Some(format!("{}:{:02}", remaining / 60, remaining % 60))
}

/// Countdown label for a slot. `None` for the absent sentinel.
pub fn countdown_text(slot: &Slot, now: i64) -> Option<String> {
    let elapsed_min = (now - slot.start_time).max(0) / 60;

    let text = match derive_status(slot, now) {
        SlotStatus::Empty => return None,
        SlotStatus::Settled => "✅ Settled".to_string(),
        SlotStatus::Open => {
            let total_min = (slot.betting_end_time - slot.start_time) / 60;
            match time_remaining(slot.betting_end_time, now) {
                Some(left) => format!(
                    "⏱️ Betting: {}/{} min ({} left)",
                    elapsed_min, total_min, left
                ),
                None => "⏳ Closing...".to_string(),
            }
        }
        SlotStatus::Waiting => {
            let total_min = (slot.target_time - slot.start_time) / 60;
            match time_remaining(slot.target_time, now) {
                Some(left) => format!(
                    "🕐 Waiting: {}/{} min ({} left)",
                    elapsed_min, total_min, left
                ),
                None => "⏳ Settling...".to_string(),
            }
        }
        SlotStatus::Ready => "⏳ Awaiting settlement...".to_string(),
    };

    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> Slot {
        Slot {
            start_time: 10_000,
            betting_end_time: 10_120,
            target_time: 10_180,
            ..Default::default()
        }
    }

    #[test]
    fn test_time_remaining() {
        assert_eq!(time_remaining(100, 0).as_deref(), Some("1:40"));
        assert_eq!(time_remaining(100, 95).as_deref(), Some("0:05"));
        assert_eq!(time_remaining(100, 100), None);
        assert_eq!(time_remaining(100, 150), None);
    }

    #[test]
    fn test_betting_countdown() {
        assert_eq!(
            countdown_text(&slot(), 10_065).as_deref(),
            Some("⏱️ Betting: 1/2 min (0:55 left)")
        );
    }

    #[test]
    fn test_waiting_countdown() {
        assert_eq!(
            countdown_text(&slot(), 10_150).as_deref(),
            Some("🕐 Waiting: 2/3 min (0:30 left)")
        );
    }

    #[test]
    fn test_static_labels_past_terminal_time() {
        assert_eq!(
            countdown_text(&slot(), 10_500).as_deref(),
            Some("⏳ Awaiting settlement...")
        );
        let settled = Slot {
            settled: true,
            ..slot()
        };
        assert_eq!(countdown_text(&settled, 10_050).as_deref(), Some("✅ Settled"));
        assert_eq!(countdown_text(&Slot::default(), 10_050), None);
    }
}
