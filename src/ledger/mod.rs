//! Remote ledger access.
//!
//! The sync core only reads: `last_anchor_time`, `slot`, `bet`, plus balances
//! for display. Writes are delegated to a [`LedgerWriter`] owned elsewhere
//! (wallet + signer); the core only reacts to their completion.

pub mod abi;
pub mod events;
pub mod memory;
pub mod rpc;

use alloy_primitives::{Address, U256};
use anyhow::Result;

use crate::models::{Bet, Slot};

pub use events::{LedgerEvent, RpcEventWatcher};
pub use memory::MemoryLedger;
pub use rpc::RpcLedger;

#[async_trait::async_trait]
pub trait LedgerReader: Send + Sync {
    /// Latest anchor time; 0 when no slot was ever created.
    async fn last_anchor_time(&self) -> Result<i64>;

    /// Slot for (anchor, symbol). Absent slots come back zeroed.
    async fn slot(&self, anchor_time: i64, symbol: &str) -> Result<Slot>;

    /// Bet for (anchor, symbol, user). Absent bets come back with `amount == 0`.
    async fn bet(&self, anchor_time: i64, symbol: &str, user: Address) -> Result<Bet>;

    /// Funds the user has deposited into the contract.
    async fn deposited_balance(&self, user: Address) -> Result<U256>;

    /// Native wallet balance.
    async fn wallet_balance(&self, user: Address) -> Result<U256>;
}

/// State-changing operations, implemented by the wallet/signing layer.
/// Each returns the submitted transaction hash.
#[async_trait::async_trait]
pub trait LedgerWriter: Send + Sync {
    async fn deposit(&self, amount: U256) -> Result<String>;

    async fn withdraw(&self, amount: U256) -> Result<String>;

    async fn place_bet(
        &self,
        anchor_time: i64,
        symbol: &str,
        bet_above: bool,
        amount: U256,
    ) -> Result<String>;

    async fn claim(&self, anchor_time: i64, symbol: &str) -> Result<String>;
}
