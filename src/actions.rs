//! Delegated write operations.
//!
//! Submission and signing live in the `LedgerWriter`. After a successful
//! submission the dispatcher only schedules the follow-up resync; it never
//! assumes the write is visible on the ledger yet.

use alloy_primitives::U256;
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::engine::Hint;
use crate::format::format_eth;
use crate::ledger::LedgerWriter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Deposit { amount: U256 },
    Withdraw { amount: U256 },
    PlaceBet {
        anchor_time: i64,
        symbol: String,
        bet_above: bool,
        amount: U256,
    },
    Claim { anchor_time: i64, symbol: String },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Deposit { .. } => "deposit",
            Action::Withdraw { .. } => "withdraw",
            Action::PlaceBet { .. } => "place_bet",
            Action::Claim { .. } => "claim",
        }
    }

    /// Passes to run once the write had time to land.
    pub fn resync_hints(&self) -> Vec<Hint> {
        match self {
            Action::Deposit { .. } | Action::Withdraw { .. } => vec![Hint::RefreshBalances],
            Action::PlaceBet { .. } => vec![Hint::RefreshSlots, Hint::RefreshBalances],
            Action::Claim { .. } => vec![
                Hint::RefreshSlots,
                Hint::RefreshHistory { force: true },
                Hint::RefreshBalances,
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionReceipt {
    pub action: Action,
    pub tx_hash: String,
}

pub struct ActionDispatcher {
    writer: Arc<dyn LedgerWriter>,
    config: Arc<SyncConfig>,
    hints: mpsc::Sender<Hint>,
}

impl ActionDispatcher {
    pub fn new(
        writer: Arc<dyn LedgerWriter>,
        config: Arc<SyncConfig>,
        hints: mpsc::Sender<Hint>,
    ) -> Self {
        Self {
            writer,
            config,
            hints,
        }
    }

    pub fn validate(&self, action: &Action) -> Result<()> {
        match action {
            Action::Deposit { amount } => {
                if *amount < self.config.min_deposit_wei {
                    bail!(
                        "Minimum deposit is {} ETH",
                        format_eth(self.config.min_deposit_wei, 4)
                    );
                }
            }
            Action::Withdraw { amount } => {
                if amount.is_zero() {
                    bail!("Withdraw amount must be positive");
                }
            }
            Action::PlaceBet {
                anchor_time,
                symbol,
                amount,
                ..
            } => {
                if *anchor_time <= 0 {
                    bail!("No active slot to bet on");
                }
                if !self.config.symbols.iter().any(|s| s == symbol) {
                    bail!("Untracked symbol {}", symbol);
                }
                if amount.is_zero() {
                    bail!("Bet amount must be positive");
                }
            }
            Action::Claim { anchor_time, .. } => {
                if *anchor_time <= 0 {
                    bail!("Invalid slot to claim");
                }
            }
        }
        Ok(())
    }

    /// Validate, submit through the writer, then schedule the resync.
    /// Errors go back to the caller; nothing is scheduled for a failed write.
    pub async fn submit(&self, action: Action) -> Result<ActionReceipt> {
        self.validate(&action)?;

        let tx_hash = match &action {
            Action::Deposit { amount } => self.writer.deposit(*amount).await,
            Action::Withdraw { amount } => self.writer.withdraw(*amount).await,
            Action::PlaceBet {
                anchor_time,
                symbol,
                bet_above,
                amount,
            } => {
                self.writer
                    .place_bet(*anchor_time, symbol, *bet_above, *amount)
                    .await
            }
            Action::Claim {
                anchor_time,
                symbol,
            } => self.writer.claim(*anchor_time, symbol).await,
        }
        .with_context(|| format!("{} failed", action.name()))?;

        info!(action = action.name(), tx = %tx_hash, "📤 Action submitted");
        self.schedule_resync(action.resync_hints());

        Ok(ActionReceipt { action, tx_hash })
    }

    fn schedule_resync(&self, hints: Vec<Hint>) {
        let tx = self.hints.clone();
        let delay = self.config.post_action_resync_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for hint in hints {
                if tx.send(hint).await.is_err() {
                    debug!("hint channel closed, dropping post-action resync");
                    return;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use alloy_primitives::Address;
    use chrono::Utc;
    use std::time::Duration;

    fn setup(delay: Duration) -> (Arc<MemoryLedger>, ActionDispatcher, mpsc::Receiver<Hint>) {
        let ledger = Arc::new(MemoryLedger::new(180, 120));
        let user = Address::repeat_byte(9);
        ledger.credit_wallet(user, U256::from(10u64).pow(U256::from(18u64)));
        let config = SyncConfig {
            post_action_resync_delay: delay,
            ..Default::default()
        };
        let (tx, rx) = mpsc::channel(16);
        let dispatcher =
            ActionDispatcher::new(Arc::new(ledger.wallet(user)), Arc::new(config), tx);
        (ledger, dispatcher, rx)
    }

    #[tokio::test]
    async fn test_rejects_small_deposit() {
        let (_ledger, dispatcher, mut rx) = setup(Duration::ZERO);
        let err = dispatcher
            .submit(Action::Deposit {
                amount: U256::from(1_000u64),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Minimum deposit is 0.0005 ETH"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deposit_schedules_balance_refresh() {
        let (_ledger, dispatcher, mut rx) = setup(Duration::from_millis(20));
        let receipt = dispatcher
            .submit(Action::Deposit {
                amount: U256::from(1_000_000_000_000_000u64),
            })
            .await
            .unwrap();
        assert!(receipt.tx_hash.starts_with("0x"));

        // nothing before the delay
        assert!(rx.try_recv().is_err());
        let hint = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hint, Hint::RefreshBalances);
    }

    #[tokio::test]
    async fn test_writer_failure_is_returned_without_resync() {
        let (_ledger, dispatcher, mut rx) = setup(Duration::ZERO);
        let err = dispatcher
            .submit(Action::Claim {
                anchor_time: 180,
                symbol: "BTC".into(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("claim failed"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bet_validation_and_hints() {
        let (ledger, dispatcher, mut rx) = setup(Duration::ZERO);
        let bad = Action::PlaceBet {
            anchor_time: 180,
            symbol: "DOGE".into(),
            bet_above: true,
            amount: U256::from(1u64),
        };
        assert!(dispatcher.validate(&bad).is_err());

        let now = Utc::now().timestamp();
        ledger.open_slot(now, "BTC", 100);
        dispatcher
            .submit(Action::Deposit {
                amount: U256::from(1_000_000_000_000_000u64),
            })
            .await
            .unwrap();
        dispatcher
            .submit(Action::PlaceBet {
                anchor_time: now,
                symbol: "BTC".into(),
                bet_above: false,
                amount: U256::from(1_000u64),
            })
            .await
            .unwrap();

        let mut hints = Vec::new();
        while hints.len() < 3 {
            let hint = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            hints.push(hint);
        }
        assert!(hints.contains(&Hint::RefreshSlots));
    }
}
