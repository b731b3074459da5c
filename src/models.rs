use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one symbol's betting round: (anchor time, symbol).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub anchor_time: i64,
    pub symbol: String,
}

impl SlotKey {
    pub fn new(anchor_time: i64, symbol: impl Into<String>) -> Self {
        Self {
            anchor_time,
            symbol: symbol.into(),
        }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.anchor_time, self.symbol)
    }
}

/// On-ledger slot as returned by `slots(anchor, symbol)`.
///
/// `start_time == 0` is the "absent" sentinel: the ledger returns a zeroed
/// record for slots that were never created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Slot {
    pub start_time: i64,
    pub betting_end_time: i64,
    pub target_time: i64,
    pub pool_above: U256,
    pub pool_below: U256,
    /// Oracle fixed-point (8 decimals).
    pub start_price: i128,
    /// Meaningless until `settled`.
    pub target_price: i128,
    pub settled: bool,
}

impl Slot {
    pub fn is_absent(&self) -> bool {
        self.start_time == 0
    }
}

/// One user's stake in a slot. `amount == 0` means no bet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Bet {
    pub amount: U256,
    pub bet_above: bool,
    pub claimed: bool,
}

impl Bet {
    pub fn is_absent(&self) -> bool {
        self.amount.is_zero()
    }

    pub fn direction_label(&self) -> &'static str {
        if self.bet_above {
            "above"
        } else {
            "below"
        }
    }
}

/// A tracked user's bet inside a current working-set slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBetView {
    pub user: Address,
    pub bet: Bet,
    pub did_win: bool,
    pub can_claim: bool,
    pub payout: U256,
}

/// One entry of the synchronizer's working set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotView {
    pub key: SlotKey,
    pub slot: Slot,
    pub bets: Vec<UserBetView>,
}

impl SlotView {
    pub fn bet_for(&self, user: &Address) -> Option<&UserBetView> {
        self.bets.iter().find(|b| &b.user == user)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    Claimed,
    Claimable,
    Lost,
    Pending,
}

impl ClaimState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimState::Claimed => "claimed",
            ClaimState::Claimable => "won",
            ClaimState::Lost => "lost",
            ClaimState::Pending => "pending",
        }
    }
}

/// Read-model pairing a slot with one user's bet. Recomputed on every load,
/// never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub key: SlotKey,
    pub slot: Slot,
    pub bet: Bet,
    pub settled: bool,
    pub did_win: bool,
    pub payout: U256,
}

impl ClaimRecord {
    pub fn state(&self) -> ClaimState {
        if self.bet.claimed {
            ClaimState::Claimed
        } else if self.did_win {
            ClaimState::Claimable
        } else if self.settled {
            ClaimState::Lost
        } else {
            ClaimState::Pending
        }
    }

    pub fn is_claimable(&self) -> bool {
        self.state() == ClaimState::Claimable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(settled: bool, did_win: bool, claimed: bool) -> ClaimRecord {
        ClaimRecord {
            key: SlotKey::new(1_700_000_000, "BTC"),
            slot: Slot {
                start_time: 1_700_000_000,
                settled,
                ..Default::default()
            },
            bet: Bet {
                amount: U256::from(10u64),
                bet_above: true,
                claimed,
            },
            settled,
            did_win,
            payout: U256::ZERO,
        }
    }

    #[test]
    fn test_absent_sentinels() {
        assert!(Slot::default().is_absent());
        assert!(Bet::default().is_absent());
        let bet = Bet {
            amount: U256::from(1u64),
            ..Default::default()
        };
        assert!(!bet.is_absent());
    }

    #[test]
    fn test_claim_state_precedence() {
        assert_eq!(record(false, false, false).state(), ClaimState::Pending);
        assert_eq!(record(true, false, false).state(), ClaimState::Lost);
        assert_eq!(record(true, true, false).state(), ClaimState::Claimable);
        assert_eq!(record(true, true, true).state(), ClaimState::Claimed);
    }

    #[test]
    fn test_slot_key_display() {
        assert_eq!(SlotKey::new(180, "ETH").to_string(), "180-ETH");
    }
}
