//! History aggregator.
//!
//! There is no index of a user's past bets, so a load walks back from the
//! latest anchor in `anchor_interval` steps and reads every (anchor, symbol)
//! pair. Pairs are fetched with bounded parallelism; a failed or absent pair
//! is dropped without affecting the rest of the batch.

use alloy_primitives::{Address, U256};
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::guard::InFlight;
use super::{bounded, SyncEvent};
use crate::config::SyncConfig;
use crate::ledger::LedgerReader;
use crate::models::{ClaimRecord, ClaimState, SlotKey};
use crate::payout::{bet_won, compute_payout};

/// Counts and sums over one load. Always rebuilt from the full record set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySummary {
    pub total: usize,
    pub won: usize,
    pub lost: usize,
    pub pending: usize,
    pub claimable: usize,
    pub claimed: usize,
    pub claimed_winnings: U256,
    pub unclaimed_winnings: U256,
}

impl HistorySummary {
    pub fn from_records(records: &[ClaimRecord]) -> Self {
        let mut s = HistorySummary {
            total: records.len(),
            ..Default::default()
        };
        for r in records {
            if r.did_win {
                s.won += 1;
            }
            match r.state() {
                ClaimState::Claimed => {
                    s.claimed += 1;
                    s.claimed_winnings = s.claimed_winnings.saturating_add(r.payout);
                }
                ClaimState::Claimable => {
                    s.claimable += 1;
                    s.unclaimed_winnings = s.unclaimed_winnings.saturating_add(r.payout);
                }
                ClaimState::Lost => s.lost += 1,
                ClaimState::Pending => s.pending += 1,
            }
        }
        s
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub user: Address,
    pub latest_anchor: i64,
    /// Anchor time descending, then configured symbol order.
    pub records: Vec<ClaimRecord>,
    pub summary: HistorySummary,
    /// Pairs whose slot or bet read failed in this load.
    pub failed_pairs: usize,
    pub loaded_at: i64,
}

impl HistorySnapshot {
    pub fn claimable(&self) -> impl Iterator<Item = &ClaimRecord> {
        self.records.iter().filter(|r| r.is_claimable())
    }
}

struct CachedHistory {
    snapshot: Arc<HistorySnapshot>,
    loaded: Instant,
}

pub struct HistoryAggregator {
    ledger: Arc<dyn LedgerReader>,
    config: Arc<SyncConfig>,
    in_flight: InFlight,
    cache: Mutex<HashMap<Address, CachedHistory>>,
    events: Option<broadcast::Sender<SyncEvent>>,
}

impl HistoryAggregator {
    pub fn new(ledger: Arc<dyn LedgerReader>, config: Arc<SyncConfig>) -> Self {
        Self {
            ledger,
            config,
            in_flight: InFlight::new(),
            cache: Mutex::new(HashMap::new()),
            events: None,
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<SyncEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn cached(&self, user: &Address) -> Option<Arc<HistorySnapshot>> {
        self.cache.lock().get(user).map(|c| c.snapshot.clone())
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_busy()
    }

    /// Anchors walked by a load from `latest`: newest first, strictly positive,
    /// at most `history_window` of them.
    pub fn candidate_anchors(&self, latest: i64) -> Vec<i64> {
        let step = self.config.anchor_interval_secs();
        (0..self.config.history_window as i64)
            .map(|i| latest - i * step)
            .take_while(|anchor| *anchor > 0)
            .collect()
    }

    /// Load (or reuse) the user's claim history.
    ///
    /// Non-forced calls inside the cooldown, or while another load is running,
    /// return the previous snapshot without touching the ledger. Returns
    /// `None` only when no load for this user has ever succeeded.
    pub async fn load_history(&self, user: Address, force: bool) -> Option<Arc<HistorySnapshot>> {
        if !force {
            if let Some(cached) = self.cache.lock().get(&user) {
                if cached.loaded.elapsed() < self.config.history_cooldown {
                    debug!(user = %user, "history within cooldown, reusing");
                    return Some(cached.snapshot.clone());
                }
            }
        }

        let _guard = if force {
            self.in_flight.acquire_forced()
        } else {
            match self.in_flight.try_acquire() {
                Some(guard) => guard,
                None => {
                    debug!("history load already in flight");
                    return self.cached(&user);
                }
            }
        };

        let started = Instant::now();
        let latest = match bounded(self.config.rpc_timeout, self.ledger.last_anchor_time()).await {
            Ok(anchor) => anchor,
            Err(e) => {
                warn!(error = %e, "⚠️ History load failed reading last anchor time");
                return self.cached(&user);
            }
        };

        let (records, failed_pairs, attempted) = self.fetch_records(user, latest).await;
        if attempted > 0 && failed_pairs == attempted {
            warn!(
                user = %user,
                failed = failed_pairs,
                "⚠️ Every history pair failed, keeping previous history"
            );
            return self.cached(&user);
        }
        let summary = HistorySummary::from_records(&records);
        let snapshot = Arc::new(HistorySnapshot {
            user,
            latest_anchor: latest,
            records,
            summary,
            failed_pairs,
            loaded_at: chrono::Utc::now().timestamp(),
        });

        info!(
            user = %user,
            records = snapshot.records.len(),
            claimable = summary.claimable,
            failed = failed_pairs,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "📚 History loaded"
        );

        self.cache.lock().insert(
            user,
            CachedHistory {
                snapshot: snapshot.clone(),
                loaded: Instant::now(),
            },
        );
        if let Some(events) = &self.events {
            let _ = events.send(SyncEvent::HistoryUpdated { user });
        }
        Some(snapshot)
    }

    async fn fetch_records(&self, user: Address, latest: i64) -> (Vec<ClaimRecord>, usize, usize) {
        let timeout = self.config.rpc_timeout;
        let pairs: Vec<(i64, String)> = self
            .candidate_anchors(latest)
            .into_iter()
            .flat_map(|anchor| {
                self.config
                    .symbols
                    .iter()
                    .map(move |symbol| (anchor, symbol.clone()))
            })
            .collect();
        let attempted = pairs.len();

        let ledger = self.ledger.clone();
        let results: Vec<_> = stream::iter(pairs)
            .map(move |(anchor, symbol)| {
                let ledger = ledger.clone();
                async move {
                    let (slot, bet) = tokio::join!(
                        bounded(timeout, ledger.slot(anchor, &symbol)),
                        bounded(timeout, ledger.bet(anchor, &symbol, user)),
                    );
                    (anchor, symbol, slot, bet)
                }
            })
            .buffer_unordered(self.config.history_concurrency.max(1))
            .collect()
            .await;

        let mut failed = 0usize;
        let mut records = Vec::new();
        for (anchor, symbol, slot, bet) in results {
            let (slot, bet) = match (slot, bet) {
                (Ok(slot), Ok(bet)) => (slot, bet),
                (Err(e), _) | (_, Err(e)) => {
                    debug!(anchor, symbol = %symbol, error = %e, "history pair dropped");
                    failed += 1;
                    continue;
                }
            };
            if slot.is_absent() || bet.is_absent() {
                continue;
            }
            records.push(ClaimRecord {
                key: SlotKey::new(anchor, symbol),
                slot,
                bet,
                settled: slot.settled,
                did_win: bet_won(&bet, &slot),
                payout: compute_payout(&bet, &slot),
            });
        }
        if failed > 0 {
            warn!(failed, "⚠️ Some history pairs failed, results are partial");
        }

        records.sort_by_key(|r| {
            (
                Reverse(r.key.anchor_time),
                self.config.symbol_rank(&r.key.symbol),
                r.key.symbol.clone(),
            )
        });
        (records, failed, attempted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::models::{Bet, Slot};
    use std::time::Duration;

    const LATEST: i64 = 1_000_000;

    fn user() -> Address {
        Address::repeat_byte(0x33)
    }

    fn bet(amount: u64, above: bool, claimed: bool) -> Bet {
        Bet {
            amount: U256::from(amount),
            bet_above: above,
            claimed,
        }
    }

    fn settled(anchor: i64, start: i128, target: i128) -> Slot {
        Slot {
            start_time: anchor,
            betting_end_time: anchor + 120,
            target_time: anchor + 180,
            pool_above: U256::from(1_000u64),
            pool_below: U256::from(3_000u64),
            start_price: start,
            target_price: target,
            settled: true,
        }
    }

    fn aggregator(ledger: &Arc<MemoryLedger>, config: SyncConfig) -> HistoryAggregator {
        HistoryAggregator::new(ledger.clone(), Arc::new(config))
    }

    /// 150 anchors for BTC/ETH, user bet on every 10th BTC slot.
    fn populated() -> Arc<MemoryLedger> {
        let ledger = Arc::new(MemoryLedger::new(180, 120));
        for i in 0..150 {
            let anchor = LATEST - i * 180;
            for symbol in ["BTC", "ETH"] {
                ledger.insert_slot(anchor, symbol, settled(anchor, 100, 150));
            }
            if i % 10 == 0 {
                ledger.insert_bet(anchor, "BTC", user(), bet(1_000, true, false));
            }
        }
        ledger
    }

    #[tokio::test]
    async fn test_window_bounds_remote_calls() {
        let ledger = populated();
        let agg = aggregator(&ledger, SyncConfig::default());

        let snap = agg.load_history(user(), false).await.unwrap();
        let calls = ledger.calls();
        assert_eq!(calls.anchor, 1);
        assert!(calls.slot <= 200);
        assert!(calls.bet <= 200);
        assert_eq!(calls.slot, 200);
        // bets at i = 0, 10, ..., 90 inside the 100-anchor window
        assert_eq!(snap.records.len(), 10);
        assert_eq!(snap.latest_anchor, LATEST);
        assert!(!agg.is_in_flight());
    }

    #[test]
    fn test_candidate_anchors_stop_at_zero() {
        let ledger = Arc::new(MemoryLedger::new(180, 120));
        let agg = aggregator(&ledger, SyncConfig::default());
        assert_eq!(agg.candidate_anchors(540), vec![540, 360, 180]);
        assert!(agg.candidate_anchors(0).is_empty());
        assert_eq!(agg.candidate_anchors(LATEST).len(), 100);
    }

    #[tokio::test]
    async fn test_failing_pair_does_not_block_batch() {
        let ledger = populated();
        ledger.fail_slot(LATEST, "BTC");
        ledger.fail_bet(LATEST - 1_800, "ETH");
        let agg = aggregator(&ledger, SyncConfig::default());

        let snap = agg.load_history(user(), true).await.unwrap();
        assert_eq!(snap.failed_pairs, 2);
        assert_eq!(snap.records.len(), 9);
        assert!(snap.records.iter().all(|r| r.key.anchor_time != LATEST));
    }

    #[tokio::test]
    async fn test_cooldown_reuses_previous_result() {
        let ledger = populated();
        let agg = aggregator(&ledger, SyncConfig::default());

        let first = agg.load_history(user(), false).await.unwrap();
        ledger.reset_calls();

        let again = agg.load_history(user(), false).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(ledger.calls(), Default::default());

        let forced = agg.load_history(user(), true).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &forced));
        assert_eq!(ledger.calls().slot, 200);
    }

    #[tokio::test]
    async fn test_expired_cooldown_reloads() {
        let ledger = populated();
        let config = SyncConfig {
            history_cooldown: Duration::ZERO,
            ..Default::default()
        };
        let agg = aggregator(&ledger, config);
        agg.load_history(user(), false).await;
        ledger.reset_calls();
        agg.load_history(user(), false).await;
        assert_eq!(ledger.calls().anchor, 1);
    }

    #[tokio::test]
    async fn test_sorted_newest_first_in_symbol_order() {
        let ledger = Arc::new(MemoryLedger::new(180, 120));
        for anchor in [540, 360, 180] {
            for symbol in ["BTC", "ETH"] {
                ledger.insert_slot(anchor, symbol, settled(anchor, 100, 150));
                ledger.insert_bet(anchor, symbol, user(), bet(10, true, false));
            }
        }
        let agg = aggregator(&ledger, SyncConfig::default());
        let snap = agg.load_history(user(), true).await.unwrap();

        let keys: Vec<String> = snap.records.iter().map(|r| r.key.to_string()).collect();
        assert_eq!(
            keys,
            vec!["540-BTC", "540-ETH", "360-BTC", "360-ETH", "180-BTC", "180-ETH"]
        );
    }

    #[tokio::test]
    async fn test_summary_statistics() {
        let ledger = Arc::new(MemoryLedger::new(180, 120));
        // won and claimed
        ledger.insert_slot(900, "BTC", settled(900, 100, 150));
        ledger.insert_bet(900, "BTC", user(), bet(1_000, true, true));
        // won, unclaimed
        ledger.insert_slot(720, "BTC", settled(720, 100, 150));
        ledger.insert_bet(720, "BTC", user(), bet(500, true, false));
        // lost
        ledger.insert_slot(540, "ETH", settled(540, 100, 150));
        ledger.insert_bet(540, "ETH", user(), bet(700, false, false));
        // pending
        ledger.open_slot(360, "ETH", 100);
        ledger.insert_bet(360, "ETH", user(), bet(300, true, false));
        ledger.set_last_anchor(900);

        let agg = aggregator(&ledger, SyncConfig::default());
        let snap = agg.load_history(user(), true).await.unwrap();
        let s = snap.summary;
        assert_eq!(s.total, 4);
        assert_eq!(s.won, 2);
        assert_eq!(s.lost, 1);
        assert_eq!(s.pending, 1);
        assert_eq!(s.claimable, 1);
        assert_eq!(s.claimed, 1);
        assert_eq!(s.claimed_winnings, U256::from(4_000u64));
        assert_eq!(s.unclaimed_winnings, U256::from(2_000u64));
        assert_eq!(snap.claimable().count(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_load_returns_previous() {
        let ledger = populated();
        ledger.set_latency(Duration::from_millis(30));
        let agg = aggregator(&ledger, SyncConfig::default());

        let (a, b) = tokio::join!(agg.load_history(user(), true), agg.load_history(user(), false));
        assert!(a.is_some());
        assert!(b.is_none());
        assert!(!agg.is_in_flight());
    }

    #[tokio::test]
    async fn test_total_outage_keeps_previous_history() {
        let ledger = populated();
        let agg = aggregator(&ledger, SyncConfig::default());
        let first = agg.load_history(user(), true).await.unwrap();
        assert_eq!(first.records.len(), 10);

        for i in 0..100 {
            for symbol in ["BTC", "ETH"] {
                ledger.fail_slot(LATEST - i * 180, symbol);
            }
        }
        let during = agg.load_history(user(), true).await.unwrap();
        assert!(Arc::ptr_eq(&first, &during));
        assert_eq!(agg.cached(&user()).unwrap().records.len(), 10);

        // cooldown still counts from the first load
        ledger.clear_faults();
        let after = agg.load_history(user(), false).await.unwrap();
        assert_eq!(after.records.len(), 10);
        assert!(!agg.is_in_flight());
    }

    #[tokio::test]
    async fn test_total_outage_without_cache_returns_none() {
        let ledger = populated();
        for i in 0..100 {
            for symbol in ["BTC", "ETH"] {
                ledger.fail_slot(LATEST - i * 180, symbol);
            }
        }
        let agg = aggregator(&ledger, SyncConfig::default());
        assert!(agg.load_history(user(), true).await.is_none());
        assert!(agg.cached(&user()).is_none());
    }

    #[tokio::test]
    async fn test_anchor_failure_keeps_previous() {
        let ledger = populated();
        let agg = aggregator(&ledger, SyncConfig::default());
        let first = agg.load_history(user(), true).await.unwrap();

        ledger.fail_anchor_reads(true);
        let again = agg.load_history(user(), true).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(!agg.is_in_flight());
    }
}
