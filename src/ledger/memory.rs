//! In-process ledger.
//!
//! Mirrors the contract's storage layout and rules closely enough to drive the
//! sync engine without a chain: `simulate` mode runs a keeper against it, and
//! tests use its call counters and fault injection.

use alloy_primitives::{Address, U256};
use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{LedgerReader, LedgerWriter};
use crate::config::SyncConfig;
use crate::models::{Bet, Slot};
use crate::payout::{bet_won, compute_payout};

type SlotId = (i64, String);

#[derive(Debug, Default)]
struct LedgerState {
    last_anchor: i64,
    slots: HashMap<SlotId, Slot>,
    bets: HashMap<(i64, String, Address), Bet>,
    deposits: HashMap<Address, U256>,
    wallets: HashMap<Address, U256>,
}

#[derive(Debug, Default)]
struct Faults {
    anchor: bool,
    slots: HashSet<SlotId>,
    bets: HashSet<SlotId>,
}

/// Number of read calls issued, per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub anchor: usize,
    pub slot: usize,
    pub bet: usize,
    pub balance: usize,
}

#[derive(Debug, Default)]
struct CallCounters {
    anchor: AtomicUsize,
    slot: AtomicUsize,
    bet: AtomicUsize,
    balance: AtomicUsize,
}

pub struct MemoryLedger {
    anchor_interval: i64,
    betting_window: i64,
    state: RwLock<LedgerState>,
    faults: RwLock<Faults>,
    latency: RwLock<Duration>,
    calls: CallCounters,
    tx_counter: AtomicU64,
}

impl MemoryLedger {
    pub fn new(anchor_interval_secs: i64, betting_window_secs: i64) -> Self {
        Self {
            anchor_interval: anchor_interval_secs,
            betting_window: betting_window_secs,
            state: RwLock::new(LedgerState::default()),
            faults: RwLock::new(Faults::default()),
            latency: RwLock::new(Duration::ZERO),
            calls: CallCounters::default(),
            tx_counter: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.anchor_interval_secs(), config.betting_window_secs())
    }

    /// Create the slot for (anchor, symbol) with the contract's window layout.
    pub fn open_slot(&self, anchor_time: i64, symbol: &str, start_price: i128) {
        let slot = Slot {
            start_time: anchor_time,
            betting_end_time: anchor_time + self.betting_window,
            target_time: anchor_time + self.anchor_interval,
            start_price,
            ..Default::default()
        };
        self.insert_slot(anchor_time, symbol, slot);
    }

    /// Store a slot verbatim and advance the last anchor if needed.
    pub fn insert_slot(&self, anchor_time: i64, symbol: &str, slot: Slot) {
        let mut state = self.state.write();
        state.last_anchor = state.last_anchor.max(anchor_time);
        state.slots.insert((anchor_time, symbol.to_string()), slot);
    }

    pub fn insert_bet(&self, anchor_time: i64, symbol: &str, user: Address, bet: Bet) {
        self.state
            .write()
            .bets
            .insert((anchor_time, symbol.to_string(), user), bet);
    }

    pub fn set_last_anchor(&self, anchor_time: i64) {
        self.state.write().last_anchor = anchor_time;
    }

    /// Record the final price. No-op for absent or already settled slots.
    pub fn settle(&self, anchor_time: i64, symbol: &str, target_price: i128) -> bool {
        let mut state = self.state.write();
        match state.slots.get_mut(&(anchor_time, symbol.to_string())) {
            Some(slot) if !slot.settled && !slot.is_absent() => {
                slot.target_price = target_price;
                slot.settled = true;
                true
            }
            _ => false,
        }
    }

    /// One keeper upkeep: settle every due slot, then open a new anchor for
    /// every symbol once the interval has elapsed. Returns the new anchor.
    pub fn run_upkeep(&self, now: i64, prices: &HashMap<String, i128>) -> Option<i64> {
        let due: Vec<SlotId> = {
            let state = self.state.read();
            state
                .slots
                .iter()
                .filter(|(_, s)| !s.settled && now >= s.target_time)
                .map(|(k, _)| k.clone())
                .collect()
        };
        for (anchor, symbol) in due {
            if let Some(price) = prices.get(&symbol) {
                self.settle(anchor, &symbol, *price);
            }
        }

        let last = self.state.read().last_anchor;
        if last != 0 && now < last + self.anchor_interval {
            return None;
        }
        for (symbol, price) in prices {
            self.open_slot(now, symbol, *price);
        }
        debug!(anchor = now, "memory ledger opened anchor");
        Some(now)
    }

    pub fn credit_wallet(&self, user: Address, amount: U256) {
        let mut state = self.state.write();
        let entry = state.wallets.entry(user).or_insert(U256::ZERO);
        *entry = entry.saturating_add(amount);
    }

    pub fn fail_anchor_reads(&self, fail: bool) {
        self.faults.write().anchor = fail;
    }

    pub fn fail_slot(&self, anchor_time: i64, symbol: &str) {
        self.faults
            .write()
            .slots
            .insert((anchor_time, symbol.to_string()));
    }

    pub fn fail_bet(&self, anchor_time: i64, symbol: &str) {
        self.faults
            .write()
            .bets
            .insert((anchor_time, symbol.to_string()));
    }

    pub fn clear_faults(&self) {
        *self.faults.write() = Faults::default();
    }

    /// Artificial latency added to every read.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            anchor: self.calls.anchor.load(Ordering::SeqCst),
            slot: self.calls.slot.load(Ordering::SeqCst),
            bet: self.calls.bet.load(Ordering::SeqCst),
            balance: self.calls.balance.load(Ordering::SeqCst),
        }
    }

    pub fn reset_calls(&self) {
        self.calls.anchor.store(0, Ordering::SeqCst);
        self.calls.slot.store(0, Ordering::SeqCst);
        self.calls.bet.store(0, Ordering::SeqCst);
        self.calls.balance.store(0, Ordering::SeqCst);
    }

    /// Writer bound to `user`, for simulations and tests.
    pub fn wallet(self: &Arc<Self>, user: Address) -> MemoryWallet {
        MemoryWallet {
            ledger: self.clone(),
            user,
        }
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn next_tx_hash(&self) -> String {
        format!("0x{:064x}", self.tx_counter.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait::async_trait]
impl LedgerReader for MemoryLedger {
    async fn last_anchor_time(&self) -> Result<i64> {
        self.calls.anchor.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self.faults.read().anchor {
            bail!("simulated lastSlotTime failure");
        }
        Ok(self.state.read().last_anchor)
    }

    async fn slot(&self, anchor_time: i64, symbol: &str) -> Result<Slot> {
        self.calls.slot.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let id = (anchor_time, symbol.to_string());
        if self.faults.read().slots.contains(&id) {
            bail!("simulated slot failure for {}-{}", anchor_time, symbol);
        }
        Ok(self.state.read().slots.get(&id).copied().unwrap_or_default())
    }

    async fn bet(&self, anchor_time: i64, symbol: &str, user: Address) -> Result<Bet> {
        self.calls.bet.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self
            .faults
            .read()
            .bets
            .contains(&(anchor_time, symbol.to_string()))
        {
            bail!("simulated bet failure for {}-{}", anchor_time, symbol);
        }
        Ok(self
            .state
            .read()
            .bets
            .get(&(anchor_time, symbol.to_string(), user))
            .copied()
            .unwrap_or_default())
    }

    async fn deposited_balance(&self, user: Address) -> Result<U256> {
        self.calls.balance.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        Ok(self
            .state
            .read()
            .deposits
            .get(&user)
            .copied()
            .unwrap_or_default())
    }

    async fn wallet_balance(&self, user: Address) -> Result<U256> {
        self.calls.balance.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        Ok(self
            .state
            .read()
            .wallets
            .get(&user)
            .copied()
            .unwrap_or_default())
    }
}

/// `LedgerWriter` acting as one user against a [`MemoryLedger`].
#[derive(Clone)]
pub struct MemoryWallet {
    ledger: Arc<MemoryLedger>,
    user: Address,
}

impl MemoryWallet {
    pub fn user(&self) -> Address {
        self.user
    }
}

#[async_trait::async_trait]
impl LedgerWriter for MemoryWallet {
    async fn deposit(&self, amount: U256) -> Result<String> {
        {
            let mut state = self.ledger.state.write();
            let wallet = state.wallets.get(&self.user).copied().unwrap_or_default();
            if wallet < amount {
                bail!("insufficient wallet balance");
            }
            state.wallets.insert(self.user, wallet - amount);
            let dep = state.deposits.entry(self.user).or_insert(U256::ZERO);
            *dep = dep.saturating_add(amount);
        }
        Ok(self.ledger.next_tx_hash())
    }

    async fn withdraw(&self, amount: U256) -> Result<String> {
        {
            let mut state = self.ledger.state.write();
            let dep = state.deposits.get(&self.user).copied().unwrap_or_default();
            if dep < amount {
                bail!("insufficient balance");
            }
            state.deposits.insert(self.user, dep - amount);
            let wallet = state.wallets.entry(self.user).or_insert(U256::ZERO);
            *wallet = wallet.saturating_add(amount);
        }
        Ok(self.ledger.next_tx_hash())
    }

    async fn place_bet(
        &self,
        anchor_time: i64,
        symbol: &str,
        bet_above: bool,
        amount: U256,
    ) -> Result<String> {
        let now = Utc::now().timestamp();
        {
            let mut state = self.ledger.state.write();
            let id = (anchor_time, symbol.to_string());
            let slot = state
                .slots
                .get(&id)
                .copied()
                .filter(|s| !s.is_absent())
                .ok_or_else(|| anyhow!("slot {}-{} does not exist", anchor_time, symbol))?;
            if now >= slot.betting_end_time {
                bail!("betting closed");
            }
            let bet_id = (anchor_time, symbol.to_string(), self.user);
            if state.bets.get(&bet_id).is_some_and(|b| !b.is_absent()) {
                bail!("already bet");
            }
            let dep = state.deposits.get(&self.user).copied().unwrap_or_default();
            if amount.is_zero() || dep < amount {
                bail!("insufficient balance");
            }
            state.deposits.insert(self.user, dep - amount);
            if let Some(s) = state.slots.get_mut(&id) {
                if bet_above {
                    s.pool_above = s.pool_above.saturating_add(amount);
                } else {
                    s.pool_below = s.pool_below.saturating_add(amount);
                }
            }
            state.bets.insert(
                bet_id,
                Bet {
                    amount,
                    bet_above,
                    claimed: false,
                },
            );
        }
        Ok(self.ledger.next_tx_hash())
    }

    async fn claim(&self, anchor_time: i64, symbol: &str) -> Result<String> {
        {
            let mut state = self.ledger.state.write();
            let slot = state
                .slots
                .get(&(anchor_time, symbol.to_string()))
                .copied()
                .unwrap_or_default();
            if !slot.settled {
                bail!("slot not settled");
            }
            let bet_id = (anchor_time, symbol.to_string(), self.user);
            let bet = state.bets.get(&bet_id).copied().unwrap_or_default();
            if bet.is_absent() || bet.claimed {
                bail!("nothing to claim");
            }
            if !bet_won(&bet, &slot) {
                bail!("bet lost");
            }
            let payout = compute_payout(&bet, &slot);
            state.bets.insert(
                bet_id,
                Bet {
                    claimed: true,
                    ..bet
                },
            );
            let dep = state.deposits.entry(self.user).or_insert(U256::ZERO);
            *dep = dep.saturating_add(payout);
        }
        Ok(self.ledger.next_tx_hash())
    }
}
