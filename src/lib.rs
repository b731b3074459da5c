//! Slotbet client library
//!
//! Polling state synchronization for the slot prediction market: ledger
//! access, current-slot sync, history aggregation, and the pure derivations
//! (status, payout, countdown) the presentation layer renders.

pub mod actions;
pub mod config;
pub mod engine;
pub mod format;
pub mod ledger;
pub mod models;
pub mod payout;
pub mod status;
pub mod sync;
pub mod timer;

pub use config::SyncConfig;
pub use engine::{EngineHandle, Hint, SyncEngine};
pub use models::{Bet, ClaimRecord, ClaimState, Slot, SlotKey, SlotView};
pub use status::SlotStatus;
