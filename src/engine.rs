//! Tick-driven runtime.
//!
//! Spawns the synchronizer loop, the per-second timer loop, periodic history
//! and balance loops, and a hint router. Hints (contract events, completed
//! actions) wake the synchronizer loop for an immediate forced pass and
//! trigger extra history or balance loads; the poll cadence continues from there.

use alloy_primitives::{Address, U256};
use arc_swap::ArcSwap;
use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::actions::ActionDispatcher;
use crate::config::SyncConfig;
use crate::ledger::{LedgerEvent, LedgerReader, LedgerWriter};
use crate::models::SlotKey;
use crate::status::{derive_status, is_settlement_overdue, SlotStatus};
use crate::sync::{
    bounded, CurrentSlotSynchronizer, HistoryAggregator, SyncEvent, WorkingSet,
};
use crate::timer::countdown_text;

const HINT_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

/// Request for an out-of-band pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Hint {
    /// Forced synchronizer refresh.
    RefreshSlots,
    RefreshHistory { force: bool },
    RefreshBalances,
}

impl Hint {
    /// Passes triggered by a contract event.
    pub fn from_event(event: &LedgerEvent) -> Vec<Hint> {
        match event {
            LedgerEvent::SlotCreated { .. } | LedgerEvent::BetPlaced { .. } => {
                vec![Hint::RefreshSlots]
            }
            LedgerEvent::SlotSettled { .. } => vec![
                Hint::RefreshSlots,
                Hint::RefreshHistory { force: false },
            ],
            LedgerEvent::Claimed { .. } => vec![
                Hint::RefreshSlots,
                Hint::RefreshHistory { force: true },
            ],
            LedgerEvent::Deposit { .. } | LedgerEvent::Withdraw { .. } => {
                vec![Hint::RefreshBalances]
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotTimer {
    pub key: SlotKey,
    pub status: SlotStatus,
    pub countdown: Option<String>,
    /// `ready` for longer than `settlement_overdue_after`.
    pub overdue: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerBoard {
    pub now: i64,
    pub awaiting_transition: bool,
    pub slots: Vec<SlotTimer>,
}

impl TimerBoard {
    pub fn build(set: &WorkingSet, now: i64, awaiting_transition: bool, overdue_secs: i64) -> Self {
        let slots = set
            .slots
            .iter()
            .map(|view| SlotTimer {
                key: view.key.clone(),
                status: derive_status(&view.slot, now),
                countdown: countdown_text(&view.slot, now),
                overdue: is_settlement_overdue(&view.slot, now, overdue_secs),
            })
            .collect();
        Self {
            now,
            awaiting_transition,
            slots,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBalance {
    pub user: Address,
    /// Funds held by the contract for betting.
    pub deposited: U256,
    pub wallet: U256,
}

pub struct SyncEngine {
    config: Arc<SyncConfig>,
    ledger: Arc<dyn LedgerReader>,
    users: Vec<Address>,
    events: broadcast::Sender<SyncEvent>,
    sync: Arc<CurrentSlotSynchronizer>,
    history: Arc<HistoryAggregator>,
    ledger_events: Option<mpsc::Receiver<LedgerEvent>>,
}

impl SyncEngine {
    pub fn new(config: Arc<SyncConfig>, ledger: Arc<dyn LedgerReader>, users: Vec<Address>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let sync = Arc::new(
            CurrentSlotSynchronizer::new(ledger.clone(), config.clone(), users.clone())
                .with_events(events.clone()),
        );
        let history = Arc::new(
            HistoryAggregator::new(ledger.clone(), config.clone()).with_events(events.clone()),
        );
        Self {
            config,
            ledger,
            users,
            events,
            sync,
            history,
            ledger_events: None,
        }
    }

    /// Contract events to turn into hints (see [`Hint::from_event`]).
    pub fn with_ledger_events(mut self, rx: mpsc::Receiver<LedgerEvent>) -> Self {
        self.ledger_events = Some(rx);
        self
    }

    pub fn spawn(self) -> EngineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (hint_tx, hint_rx) = mpsc::channel(HINT_CAPACITY);
        let shared = Arc::new(Shared {
            config: self.config,
            ledger: self.ledger,
            users: self.users,
            events: self.events,
            sync: self.sync,
            history: self.history,
            timers: ArcSwap::from_pointee(TimerBoard::default()),
            balances: ArcSwap::from_pointee(Vec::new()),
            slot_wake: Notify::new(),
        });

        info!(
            users = shared.users.len(),
            symbols = ?shared.config.symbols,
            "🚀 Starting sync engine"
        );

        let mut tasks = vec![
            tokio::spawn(sync_loop(shared.clone(), shutdown_rx.clone())),
            tokio::spawn(timer_loop(shared.clone(), shutdown_rx.clone())),
            tokio::spawn(history_loop(shared.clone(), shutdown_rx.clone())),
            tokio::spawn(balance_loop(shared.clone(), shutdown_rx.clone())),
            tokio::spawn(hint_router(shared.clone(), hint_rx, shutdown_rx.clone())),
        ];
        if let Some(rx) = self.ledger_events {
            tasks.push(tokio::spawn(forward_ledger_events(
                rx,
                hint_tx.clone(),
                shutdown_rx,
            )));
        }

        EngineHandle {
            shared,
            hints: hint_tx,
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

struct Shared {
    config: Arc<SyncConfig>,
    ledger: Arc<dyn LedgerReader>,
    users: Vec<Address>,
    events: broadcast::Sender<SyncEvent>,
    sync: Arc<CurrentSlotSynchronizer>,
    history: Arc<HistoryAggregator>,
    timers: ArcSwap<TimerBoard>,
    balances: ArcSwap<Vec<UserBalance>>,
    /// Cuts the synchronizer loop's cadence sleep short.
    slot_wake: Notify,
}

impl Shared {
    fn primary_user(&self) -> Option<Address> {
        self.users.first().copied()
    }

    async fn refresh_history(&self, force: bool) {
        if let Some(user) = self.primary_user() {
            self.history.load_history(user, force).await;
        }
    }

    async fn refresh_balances(&self) {
        let timeout = self.config.rpc_timeout;
        let previous = self.balances.load_full();
        let prev = &previous;
        let reads = self.users.iter().map(|user| async move {
            let (deposited, wallet) = tokio::join!(
                bounded(timeout, self.ledger.deposited_balance(*user)),
                bounded(timeout, self.ledger.wallet_balance(*user)),
            );
            match (deposited, wallet) {
                (Ok(deposited), Ok(wallet)) => Some(UserBalance {
                    user: *user,
                    deposited,
                    wallet,
                }),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(user = %user, error = %e, "⚠️ Balance fetch failed");
                    prev.iter().find(|b| b.user == *user).copied()
                }
            }
        });
        let next: Vec<UserBalance> = join_all(reads).await.into_iter().flatten().collect();

        if *previous != next {
            self.balances.store(Arc::new(next));
            let _ = self.events.send(SyncEvent::BalancesUpdated);
        }
    }
}

pub struct EngineHandle {
    shared: Arc<Shared>,
    hints: mpsc::Sender<Hint>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn synchronizer(&self) -> Arc<CurrentSlotSynchronizer> {
        self.shared.sync.clone()
    }

    pub fn history(&self) -> Arc<HistoryAggregator> {
        self.shared.history.clone()
    }

    pub fn working_set(&self) -> Arc<WorkingSet> {
        self.shared.sync.working_set()
    }

    pub fn timers(&self) -> Arc<TimerBoard> {
        self.shared.timers.load_full()
    }

    pub fn balances(&self) -> Arc<Vec<UserBalance>> {
        self.shared.balances.load_full()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    pub async fn hint(&self, hint: Hint) {
        if self.hints.send(hint).await.is_err() {
            debug!(?hint, "engine stopped, hint dropped");
        }
    }

    /// Dispatcher whose completed writes resync this engine.
    pub fn dispatcher(&self, writer: Arc<dyn LedgerWriter>) -> ActionDispatcher {
        ActionDispatcher::new(writer, self.shared.config.clone(), self.hints.clone())
    }

    /// Stop every loop and wait for them to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "engine task ended abnormally");
            }
        }
        info!("🛑 Sync engine stopped");
    }
}

async fn sync_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut force = false;
    loop {
        shared.sync.refresh(force).await;

        let wait = shared
            .sync
            .cadence_at(Utc::now().timestamp())
            .interval(&shared.config);
        force = tokio::select! {
            _ = sleep(wait) => false,
            _ = shared.slot_wake.notified() => true,
            _ = shutdown.changed() => break,
        };
    }
}

async fn timer_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(shared.config.timer_tick);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut warned: HashSet<SlotKey> = HashSet::new();

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => break,
        }

        let now = Utc::now().timestamp();
        let set = shared.sync.working_set();
        let board = TimerBoard::build(
            &set,
            now,
            shared.sync.state().awaiting_transition,
            shared.config.settlement_overdue_secs(),
        );

        warned.retain(|key| board.slots.iter().any(|t| &t.key == key && t.overdue));
        for t in board.slots.iter().filter(|t| t.overdue) {
            if warned.insert(t.key.clone()) {
                warn!(slot = %t.key, "⚠️ Settlement overdue");
            }
        }

        shared.timers.store(Arc::new(board));
    }
}

async fn history_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    if shared.primary_user().is_none() {
        return;
    }
    let mut tick = interval(shared.config.history_refresh);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => break,
        }
        shared.refresh_history(false).await;
    }
}

async fn balance_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    if shared.users.is_empty() {
        return;
    }
    let mut tick = interval(shared.config.balance_poll);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => break,
        }
        shared.refresh_balances().await;
    }
}

async fn hint_router(
    shared: Arc<Shared>,
    mut hints: mpsc::Receiver<Hint>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let hint = tokio::select! {
            hint = hints.recv() => match hint {
                Some(hint) => hint,
                None => break,
            },
            _ = shutdown.changed() => break,
        };
        debug!(?hint, "hint received");

        match hint {
            Hint::RefreshSlots => shared.slot_wake.notify_one(),
            Hint::RefreshHistory { force } => {
                // history loads are long; don't hold up slot hints behind them
                let shared = shared.clone();
                tokio::spawn(async move { shared.refresh_history(force).await });
            }
            Hint::RefreshBalances => shared.refresh_balances().await,
        }
    }
}

async fn forward_ledger_events(
    mut rx: mpsc::Receiver<LedgerEvent>,
    hints: mpsc::Sender<Hint>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.changed() => break,
        };
        debug!(event = event.name(), "contract event hint");
        for hint in Hint::from_event(&event) {
            if hints.send(hint).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::models::{Slot, SlotView};
    use std::time::Duration;

    fn view(symbol: &str, slot: Slot) -> SlotView {
        SlotView {
            key: SlotKey::new(slot.start_time, symbol),
            slot,
            bets: Vec::new(),
        }
    }

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
    fn test_event_hint_mapping() {
        let settled = LedgerEvent::SlotSettled {
            anchor_time: 1,
            symbol: "BTC".into(),
            target_price: 1,
        };
        assert_eq!(
            Hint::from_event(&settled),
            vec![Hint::RefreshSlots, Hint::RefreshHistory { force: false }]
        );

        let claimed = LedgerEvent::Claimed {
            anchor_time: 1,
            symbol: "BTC".into(),
            user: Address::ZERO,
            payout: U256::ZERO,
        };
        assert!(Hint::from_event(&claimed).contains(&Hint::RefreshHistory { force: true }));

        let deposit = LedgerEvent::Deposit {
            user: Address::ZERO,
            amount: U256::ZERO,
        };
        assert_eq!(Hint::from_event(&deposit), vec![Hint::RefreshBalances]);
    }

    #[test]
    fn test_timer_board_flags_overdue() {
        let set = WorkingSet {
            anchor_time: 1_000,
            slots: vec![view("BTC", slot(false)), view("ETH", slot(true))],
            complete: true,
        };

        let board = TimerBoard::build(&set, 1_060, false, 120);
        assert_eq!(board.slots[0].status, SlotStatus::Open);
        assert!(board.slots[0].countdown.is_some());
        assert!(!board.slots[0].overdue);

        let board = TimerBoard::build(&set, 1_300, true, 120);
        assert_eq!(board.slots[0].status, SlotStatus::Ready);
        assert!(board.slots[0].overdue);
        assert_eq!(board.slots[1].status, SlotStatus::Settled);
        assert!(!board.slots[1].overdue);
        assert!(board.awaiting_transition);
    }

    #[tokio::test]
    async fn test_slot_hint_wakes_poll_loop() {
        let hour = Duration::from_secs(3600);
        let anchor = Utc::now().timestamp() - 10;
        let ledger = Arc::new(MemoryLedger::new(180, 120));
        ledger.open_slot(anchor, "BTC", 100);
        ledger.open_slot(anchor, "ETH", 200);
        let config = SyncConfig {
            baseline_cadence: hour,
            elevated_cadence: hour,
            ..Default::default()
        };
        let handle = SyncEngine::new(Arc::new(config), ledger.clone(), Vec::new()).spawn();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while handle.working_set().anchor_time != anchor {
            assert!(tokio::time::Instant::now() < deadline, "no first pass");
            sleep(Duration::from_millis(10)).await;
        }
        let before = ledger.calls().slot;

        // same anchor and an hour-long cadence: only the hint can cause a refetch
        handle.hint(Hint::RefreshSlots).await;
        while ledger.calls().slot < before + 2 {
            assert!(tokio::time::Instant::now() < deadline, "hint did not wake the loop");
            sleep(Duration::from_millis(10)).await;
        }

        handle.shutdown().await;
    }
}
