//! slotbet - client-side sync engine for the slot prediction market
//!
//! Usage:
//!   slotbet watch --rpc-url https://sepolia.base.org --user 0xabc...
//!   slotbet history --rpc-url https://sepolia.base.org --user 0xabc...
//!   slotbet simulate --duration-secs 120
//!
//! Environment Variables:
//!   SLOTBET_RPC_URL  - JSON-RPC endpoint
//!   SLOTBET_CONTRACT - Contract address (default: reference deployment)
//!   SLOTBET_USER     - Tracked user address(es), comma separated
//!   SLOTBET_CONFIG   - Path to TOML config file
//!   RUST_LOG         - Log filter (default: slotbet_client=info)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use rand::Rng;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use slotbet_client::actions::Action;
use slotbet_client::format::{
    format_address, format_eth, format_price, format_time, parse_ether,
};
use slotbet_client::ledger::rpc::DEFAULT_CONTRACT_ADDRESS;
use slotbet_client::ledger::{MemoryLedger, RpcEventWatcher, RpcLedger};
use slotbet_client::status::derive_status;
use slotbet_client::sync::{HistoryAggregator, HistorySnapshot, SyncEvent};
use slotbet_client::timer::countdown_text;
use slotbet_client::{EngineHandle, SyncConfig, SyncEngine};

#[derive(Parser, Debug)]
#[command(name = "slotbet")]
#[command(about = "Polling sync engine for the slot prediction market")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "SLOTBET_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow the live market and log every state change
    Watch {
        #[arg(long, env = "SLOTBET_RPC_URL")]
        rpc_url: String,

        #[arg(long, env = "SLOTBET_CONTRACT", default_value = DEFAULT_CONTRACT_ADDRESS)]
        contract: String,

        /// Tracked users
        #[arg(long = "user", env = "SLOTBET_USER", value_delimiter = ',')]
        users: Vec<String>,

        /// Poll only; ignore contract events
        #[arg(long)]
        no_events: bool,
    },
    /// One forced history load for a user
    History {
        #[arg(long, env = "SLOTBET_RPC_URL")]
        rpc_url: String,

        #[arg(long, env = "SLOTBET_CONTRACT", default_value = DEFAULT_CONTRACT_ADDRESS)]
        contract: String,

        #[arg(long, env = "SLOTBET_USER")]
        user: String,
    },
    /// Run the engine against an in-process ledger with a simulated keeper
    Simulate {
        #[arg(long, default_value_t = 30)]
        anchor_interval_secs: u64,

        #[arg(long, default_value_t = 20)]
        betting_window_secs: u64,

        /// Stop after this long
        #[arg(long, default_value_t = 150)]
        duration_secs: u64,

        /// Stake per simulated bet, in ETH
        #[arg(long, default_value = "0.001")]
        stake: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();
    let config = SyncConfig::load(args.config.as_deref())?;

    match args.command {
        Command::Watch {
            rpc_url,
            contract,
            users,
            no_events,
        } => {
            let users = parse_users(&users)?;
            run_watch(config, rpc_url, &contract, users, no_events).await
        }
        Command::History {
            rpc_url,
            contract,
            user,
        } => {
            let user = parse_users(&[user])?
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("--user is required"))?;
            run_history(config, rpc_url, &contract, user).await
        }
        Command::Simulate {
            anchor_interval_secs,
            betting_window_secs,
            duration_secs,
            stake,
        } => {
            let mut config = config;
            config.anchor_interval = Duration::from_secs(anchor_interval_secs);
            config.betting_window = Duration::from_secs(betting_window_secs);
            config.post_action_resync_delay = Duration::from_secs(1);
            config.validate()?;
            let stake = parse_ether(&stake)?;
            run_simulation(config, Duration::from_secs(duration_secs), stake).await
        }
    }
}

fn parse_users(raw: &[String]) -> Result<Vec<Address>> {
    raw.iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Address>()
                .map_err(|e| anyhow!("invalid address {s}: {e}"))
        })
        .collect()
}

fn parse_contract(contract: &str) -> Result<Address> {
    contract
        .parse::<Address>()
        .map_err(|e| anyhow!("invalid contract address {contract}: {e}"))
}

async fn run_watch(
    config: SyncConfig,
    rpc_url: String,
    contract: &str,
    users: Vec<Address>,
    no_events: bool,
) -> Result<()> {
    let config = Arc::new(config);
    let ledger = Arc::new(
        RpcLedger::new(rpc_url, parse_contract(contract)?, config.rpc_timeout)
            .context("failed to create RPC ledger")?,
    );
    info!(
        contract = %ledger.contract(),
        users = users.len(),
        "👀 Watching slot market"
    );

    let mut engine = SyncEngine::new(config.clone(), ledger.clone(), users.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut watcher_task = None;
    if !no_events {
        let (event_tx, event_rx) = mpsc::channel(256);
        let watcher = RpcEventWatcher::new(ledger.clone(), users, config.event_poll);
        watcher_task = Some(tokio::spawn(watcher.run(event_tx, shutdown_rx)));
        engine = engine.with_ledger_events(event_rx);
    }
    let handle = engine.spawn();

    let reporter = tokio::spawn(report_events(handle.subscribe(), handle_view(&handle)));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutting down...");

    let _ = shutdown_tx.send(true);
    if let Some(task) = watcher_task {
        if let Ok(Err(e)) = task.await {
            warn!(error = %e, "event watcher exited with error");
        }
    }
    handle.shutdown().await;
    reporter.abort();
    Ok(())
}

async fn run_history(
    config: SyncConfig,
    rpc_url: String,
    contract: &str,
    user: Address,
) -> Result<()> {
    let config = Arc::new(config);
    let ledger = Arc::new(RpcLedger::new(
        rpc_url,
        parse_contract(contract)?,
        config.rpc_timeout,
    )?);
    let aggregator = HistoryAggregator::new(ledger, config);
    let snapshot = aggregator
        .load_history(user, true)
        .await
        .ok_or_else(|| anyhow!("history load failed"))?;
    print_history(&snapshot);
    Ok(())
}

fn print_history(snapshot: &HistorySnapshot) {
    println!(
        "History for {} ({} bets, latest anchor {})",
        format_address(&snapshot.user),
        snapshot.records.len(),
        format_time(snapshot.latest_anchor)
    );
    for r in &snapshot.records {
        println!(
            "  {} {:<4} {:>5} {:>10} ETH  {} -> {}  {:<8} payout {} ETH",
            format_time(r.key.anchor_time),
            r.key.symbol,
            r.bet.direction_label(),
            format_eth(r.bet.amount, 4),
            format_price(r.slot.start_price, 2),
            if r.settled {
                format_price(r.slot.target_price, 2)
            } else {
                "-".to_string()
            },
            r.state().as_str(),
            format_eth(r.payout, 4),
        );
    }
    let s = &snapshot.summary;
    println!(
        "Total {} | won {} | lost {} | pending {} | claimable {} ({} ETH) | claimed {} ETH",
        s.total,
        s.won,
        s.lost,
        s.pending,
        s.claimable,
        format_eth(s.unclaimed_winnings, 4),
        format_eth(s.claimed_winnings, 4),
    );
    if snapshot.failed_pairs > 0 {
        println!("({} slot reads failed; results are partial)", snapshot.failed_pairs);
    }
}

/// Read-only pieces of the engine needed by the event reporter.
struct EngineView {
    sync: Arc<slotbet_client::sync::CurrentSlotSynchronizer>,
    history: Arc<HistoryAggregator>,
}

fn handle_view(handle: &EngineHandle) -> EngineView {
    EngineView {
        sync: handle.synchronizer(),
        history: handle.history(),
    }
}

async fn report_events(mut events: broadcast::Receiver<SyncEvent>, view: EngineView) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "event reporter lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        match event {
            SyncEvent::WorkingSetUpdated { anchor_time } => {
                let now = Utc::now().timestamp();
                let set = view.sync.working_set();
                for v in &set.slots {
                    info!(
                        anchor = anchor_time,
                        symbol = %v.key.symbol,
                        status = %derive_status(&v.slot, now),
                        start_price = %format_price(v.slot.start_price, 2),
                        above = %format_eth(v.slot.pool_above, 4),
                        below = %format_eth(v.slot.pool_below, 4),
                        timer = %countdown_text(&v.slot, now).unwrap_or_default(),
                        bets = v.bets.len(),
                        "🎰 Slot"
                    );
                }
            }
            SyncEvent::HistoryUpdated { user } => {
                if let Some(snap) = view.history.cached(&user) {
                    info!(
                        user = %format_address(&user),
                        total = snap.summary.total,
                        claimable = snap.summary.claimable,
                        unclaimed = %format_eth(snap.summary.unclaimed_winnings, 4),
                        "📚 History"
                    );
                }
            }
            SyncEvent::AwaitingTransition(awaiting) => {
                info!(awaiting, "⏳ Awaiting next anchor")
            }
            SyncEvent::NewAnchor { .. } | SyncEvent::BalancesUpdated => {}
        }
    }
}

async fn run_simulation(config: SyncConfig, duration: Duration, stake: U256) -> Result<()> {
    let config = Arc::new(config);
    let ledger = Arc::new(MemoryLedger::from_config(&config));
    let user = Address::repeat_byte(0x11);
    ledger.credit_wallet(user, U256::from(10u64).pow(U256::from(18u64)));

    let handle = SyncEngine::new(config.clone(), ledger.clone(), vec![user]).spawn();
    let dispatcher = handle.dispatcher(Arc::new(ledger.wallet(user)));
    let mut events = handle.subscribe();
    let reporter = tokio::spawn(report_events(handle.subscribe(), handle_view(&handle)));

    info!(
        user = %format_address(&user),
        anchor_interval = config.anchor_interval_secs(),
        "🧪 Simulation started"
    );
    dispatcher
        .submit(Action::Deposit {
            amount: stake.saturating_mul(U256::from(50u64)),
        })
        .await?;

    let mut prices: HashMap<String, i128> = config
        .symbols
        .iter()
        .enumerate()
        .map(|(i, s)| (s.clone(), 60_000_00000000i128 / (i as i128 + 1)))
        .collect();

    let mut keeper = interval(Duration::from_secs(1));
    keeper.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = keeper.tick() => {
                random_walk(&mut prices);
                ledger.run_upkeep(Utc::now().timestamp(), &prices);
            }
            event = events.recv() => match event {
                Ok(SyncEvent::NewAnchor { anchor_time, .. }) => {
                    for symbol in config.symbols.iter() {
                        let bet_above = rand::thread_rng().gen_bool(0.5);
                        let action = Action::PlaceBet {
                            anchor_time,
                            symbol: symbol.clone(),
                            bet_above,
                            amount: stake,
                        };
                        if let Err(e) = dispatcher.submit(action).await {
                            warn!(error = %e, "simulated bet rejected");
                        }
                    }
                }
                Ok(SyncEvent::HistoryUpdated { user }) => {
                    claim_winnings(&handle, &dispatcher, user).await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    if let Some(snapshot) = handle.history().load_history(user, true).await {
        print_history(&snapshot);
    }
    handle.shutdown().await;
    reporter.abort();
    Ok(())
}

async fn claim_winnings(
    handle: &EngineHandle,
    dispatcher: &slotbet_client::actions::ActionDispatcher,
    user: Address,
) {
    let Some(snapshot) = handle.history().cached(&user) else {
        return;
    };
    for record in snapshot.claimable() {
        let action = Action::Claim {
            anchor_time: record.key.anchor_time,
            symbol: record.key.symbol.clone(),
        };
        match dispatcher.submit(action).await {
            Ok(receipt) => info!(
                slot = %record.key,
                payout = %format_eth(record.payout, 4),
                tx = %receipt.tx_hash,
                "💰 Claimed"
            ),
            Err(e) => warn!(slot = %record.key, error = %e, "claim rejected"),
        }
    }
}

/// ±0.2% per step.
fn random_walk(prices: &mut HashMap<String, i128>) {
    let mut rng = rand::thread_rng();
    for price in prices.values_mut() {
        let bps: i128 = rng.gen_range(-20..=20);
        *price += *price * bps / 10_000;
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "slotbet_client=info,slotbet=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // 1) Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // 2) Also try the crate root .env when running from elsewhere
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}
