//! Current-slot synchronizer.
//!
//! Keeps one `SlotView` per tracked symbol for the latest anchor. Each pass
//! reads `last_anchor_time` first and only refetches slots and bets when the
//! anchor moved, the pass is forced, the previous set was incomplete, or the
//! next anchor is already due. Results are fenced so a slow pass can never
//! overwrite a newer one, and published with a single `ArcSwap` store.

use alloy_primitives::Address;
use arc_swap::ArcSwap;
use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::cadence::{expected_next_anchor, Cadence};
use super::guard::{InFlight, PassFence};
use super::{bounded, SyncEvent};
use crate::config::SyncConfig;
use crate::ledger::LedgerReader;
use crate::models::{Slot, SlotKey, SlotView, UserBetView};
use crate::payout::{bet_won, compute_payout};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingSet {
    pub anchor_time: i64,
    /// In configured symbol order. Failed or absent symbols are omitted.
    pub slots: Vec<SlotView>,
    /// False when any slot or bet read of the producing pass failed or came
    /// back absent; the next pass refetches.
    pub complete: bool,
}

impl WorkingSet {
    pub fn slot(&self, symbol: &str) -> Option<&SlotView> {
        self.slots.iter().find(|v| v.key.symbol == symbol)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub last_anchor: i64,
    pub expected_next_anchor: i64,
    pub awaiting_transition: bool,
    /// Wall-clock seconds of the last committed pass.
    pub last_success: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Another pass was in flight.
    Skipped,
    Unchanged,
    Updated,
    /// A newer pass committed first; this result was dropped.
    Superseded,
    Failed,
}

pub struct CurrentSlotSynchronizer {
    ledger: Arc<dyn LedgerReader>,
    config: Arc<SyncConfig>,
    users: Vec<Address>,
    state: Mutex<SyncState>,
    working_set: ArcSwap<WorkingSet>,
    in_flight: InFlight,
    fence: PassFence,
    events: broadcast::Sender<SyncEvent>,
}

impl CurrentSlotSynchronizer {
    pub fn new(ledger: Arc<dyn LedgerReader>, config: Arc<SyncConfig>, users: Vec<Address>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            ledger,
            config,
            users,
            state: Mutex::new(SyncState::default()),
            working_set: ArcSwap::from_pointee(WorkingSet::default()),
            in_flight: InFlight::new(),
            fence: PassFence::new(),
            events,
        }
    }

    /// Publish on a shared channel instead of a private one.
    pub fn with_events(mut self, events: broadcast::Sender<SyncEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn working_set(&self) -> Arc<WorkingSet> {
        self.working_set.load_full()
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_busy()
    }

    pub fn cadence_at(&self, now: i64) -> Cadence {
        let last = self.state.lock().last_anchor;
        Cadence::at(last, self.config.anchor_interval_secs(), now)
    }

    pub async fn refresh(&self, force: bool) -> RefreshOutcome {
        self.refresh_at(force, Utc::now().timestamp()).await
    }

    /// One synchronization pass evaluated at `now` (unix seconds).
    pub async fn refresh_at(&self, force: bool, now: i64) -> RefreshOutcome {
        let _guard = if force {
            self.in_flight.acquire_forced()
        } else {
            match self.in_flight.try_acquire() {
                Some(guard) => guard,
                None => {
                    debug!("sync pass already in flight, skipping");
                    return RefreshOutcome::Skipped;
                }
            }
        };
        let seq = self.fence.issue();
        let outcome = self.run_pass(seq, force, now).await;
        self.update_transition_flag(now);
        outcome
    }

    async fn run_pass(&self, seq: u64, force: bool, now: i64) -> RefreshOutcome {
        let timeout = self.config.rpc_timeout;
        let anchor = match bounded(timeout, self.ledger.last_anchor_time()).await {
            Ok(anchor) => anchor,
            Err(e) => {
                warn!(error = %e, "⚠️ Failed to read last anchor time");
                return RefreshOutcome::Failed;
            }
        };

        let previous = self.state.lock().last_anchor;
        if anchor < previous {
            debug!(anchor, previous, "lagging anchor read ignored");
            return RefreshOutcome::Unchanged;
        }

        let (current_anchor, current_complete) = {
            let current = self.working_set.load();
            (current.anchor_time, current.complete)
        };
        let transition_due =
            Cadence::at(previous, self.config.anchor_interval_secs(), now).is_elevated();
        let refetch = force
            || anchor != previous
            || current_anchor != anchor
            || !current_complete
            || transition_due;

        let next = if !refetch {
            None
        } else if anchor == 0 {
            Some(WorkingSet {
                anchor_time: 0,
                slots: Vec::new(),
                complete: true,
            })
        } else {
            match self.fetch_working_set(anchor).await {
                Some(set) => Some(set),
                None => return RefreshOutcome::Failed,
            }
        };

        if !self.fence.try_commit(seq) {
            debug!(seq, "superseded sync pass discarded");
            return RefreshOutcome::Superseded;
        }

        let changed = match next {
            Some(set) if **self.working_set.load() != set => {
                self.working_set.store(Arc::new(set));
                true
            }
            _ => false,
        };

        {
            let mut state = self.state.lock();
            state.last_anchor = anchor;
            state.expected_next_anchor =
                expected_next_anchor(anchor, self.config.anchor_interval_secs());
            state.last_success = Some(now);
        }

        if anchor != previous {
            info!(anchor, previous, "🆕 New anchor detected");
            let _ = self.events.send(SyncEvent::NewAnchor {
                anchor_time: anchor,
                previous,
            });
        }

        if changed {
            let _ = self
                .events
                .send(SyncEvent::WorkingSetUpdated { anchor_time: anchor });
            RefreshOutcome::Updated
        } else {
            RefreshOutcome::Unchanged
        }
    }

    /// Slots per symbol in parallel, then every tracked user's bet in
    /// parallel. `None` only when no slot read succeeded at all.
    async fn fetch_working_set(&self, anchor: i64) -> Option<WorkingSet> {
        let timeout = self.config.rpc_timeout;
        let slot_reads = self.config.symbols.iter().map(|symbol| async move {
            (symbol, bounded(timeout, self.ledger.slot(anchor, symbol)).await)
        });
        let slot_results = join_all(slot_reads).await;

        let mut complete = true;
        let mut any_ok = false;
        let mut present: Vec<(&String, Slot)> = Vec::new();
        for (symbol, result) in slot_results {
            match result {
                Ok(slot) => {
                    any_ok = true;
                    if slot.is_absent() {
                        debug!(symbol = %symbol, anchor, "slot not created yet");
                        complete = false;
                    } else {
                        present.push((symbol, slot));
                    }
                }
                Err(e) => {
                    warn!(symbol = %symbol, anchor, error = %e, "⚠️ Slot fetch failed");
                    complete = false;
                }
            }
        }
        if !any_ok {
            warn!(anchor, "⚠️ Every slot fetch failed, keeping previous working set");
            return None;
        }

        let bet_reads = present.iter().flat_map(|(symbol, _)| {
            self.users.iter().map(move |user| async move {
                let result = bounded(timeout, self.ledger.bet(anchor, symbol, *user)).await;
                (*symbol, *user, result)
            })
        });
        let bet_results = join_all(bet_reads).await;

        let mut slots: Vec<SlotView> = present
            .iter()
            .map(|(symbol, slot)| SlotView {
                key: SlotKey::new(anchor, symbol.as_str()),
                slot: *slot,
                bets: Vec::new(),
            })
            .collect();

        for (symbol, user, result) in bet_results {
            let bet = match result {
                Ok(bet) => bet,
                Err(e) => {
                    warn!(symbol = %symbol, anchor, user = %user, error = %e, "⚠️ Bet fetch failed");
                    complete = false;
                    continue;
                }
            };
            if bet.is_absent() {
                continue;
            }
            if let Some(view) = slots.iter_mut().find(|v| &v.key.symbol == symbol) {
                let did_win = bet_won(&bet, &view.slot);
                view.bets.push(UserBetView {
                    user,
                    bet,
                    did_win,
                    can_claim: did_win && !bet.claimed,
                    payout: compute_payout(&bet, &view.slot),
                });
            }
        }

        Some(WorkingSet {
            anchor_time: anchor,
            slots,
            complete,
        })
    }

    fn update_transition_flag(&self, now: i64) {
        let flipped = {
            let mut state = self.state.lock();
            let awaiting = Cadence::at(state.last_anchor, self.config.anchor_interval_secs(), now)
                .is_elevated();
            let flipped = state.awaiting_transition != awaiting;
            state.awaiting_transition = awaiting;
            flipped.then_some(awaiting)
        };

        if let Some(awaiting) = flipped {
            if awaiting {
                info!("⏳ Next anchor due, polling at elevated cadence");
            } else {
                info!("✅ Anchor transition observed, back to baseline cadence");
            }
            let _ = self.events.send(SyncEvent::AwaitingTransition(awaiting));
        }
    }
}
