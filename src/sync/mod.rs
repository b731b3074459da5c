//! Polling synchronizer and history aggregator.

pub mod cadence;
pub mod current;
pub mod guard;
pub mod history;

use alloy_primitives::Address;
use anyhow::{anyhow, Result};
use std::future::Future;
use std::time::Duration;

pub use cadence::Cadence;
pub use current::{CurrentSlotSynchronizer, RefreshOutcome, SyncState, WorkingSet};
pub use history::{HistoryAggregator, HistorySnapshot, HistorySummary};

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    NewAnchor { anchor_time: i64, previous: i64 },
    AwaitingTransition(bool),
    WorkingSetUpdated { anchor_time: i64 },
    HistoryUpdated { user: Address },
    BalancesUpdated,
}

/// Run a remote read with an upper bound. Timeouts surface as ordinary errors.
pub(crate) async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("remote read timed out after {:?}", timeout)),
    }
}
