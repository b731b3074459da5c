//! Contract event polling.
//!
//! Events are only hints: they wake the synchronizer early but never carry
//! state into the working set. Missing one costs at most one poll interval.

use alloy_primitives::{Address, U256};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::abi;
use super::rpc::RpcLedger;

const SIG_BET_PLACED: &str = "BetPlaced(uint256,string,address,uint256,bool)";
const SIG_CLAIMED: &str = "Claimed(uint256,string,address,uint256)";
const SIG_DEPOSIT: &str = "Deposit(address,uint256)";
const SIG_WITHDRAW: &str = "Withdraw(address,uint256)";
const SIG_SLOT_CREATED: &str = "SlotCreated(uint256,string,int256)";
const SIG_SLOT_SETTLED: &str = "SlotSettled(uint256,string,int256)";

/// Remembered slot events used for per-anchor de-duplication.
const SEEN_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    BetPlaced {
        anchor_time: i64,
        symbol: String,
        user: Address,
        amount: U256,
        above: bool,
    },
    Claimed {
        anchor_time: i64,
        symbol: String,
        user: Address,
        payout: U256,
    },
    Deposit {
        user: Address,
        amount: U256,
    },
    Withdraw {
        user: Address,
        amount: U256,
    },
    SlotCreated {
        anchor_time: i64,
        symbol: String,
        start_price: i128,
    },
    SlotSettled {
        anchor_time: i64,
        symbol: String,
        target_price: i128,
    },
}

impl LedgerEvent {
    pub fn user(&self) -> Option<Address> {
        match self {
            LedgerEvent::BetPlaced { user, .. }
            | LedgerEvent::Claimed { user, .. }
            | LedgerEvent::Deposit { user, .. }
            | LedgerEvent::Withdraw { user, .. } => Some(*user),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LedgerEvent::BetPlaced { .. } => "bet_placed",
            LedgerEvent::Claimed { .. } => "claimed",
            LedgerEvent::Deposit { .. } => "deposit",
            LedgerEvent::Withdraw { .. } => "withdraw",
            LedgerEvent::SlotCreated { .. } => "slot_created",
            LedgerEvent::SlotSettled { .. } => "slot_settled",
        }
    }
}

/// Decode one log. Unknown topics yield `Ok(None)`.
pub fn decode_log(topics: &[Vec<u8>], data: &[u8]) -> Result<Option<LedgerEvent>> {
    let Some(topic0) = topics.first() else {
        return Ok(None);
    };
    let topic = |i: usize| -> Result<&[u8]> {
        topics
            .get(i)
            .map(|t| t.as_slice())
            .ok_or_else(|| anyhow!("missing topic {}", i))
    };

    let event = if topic0.as_slice() == abi::event_topic(SIG_BET_PLACED) {
        LedgerEvent::BetPlaced {
            anchor_time: abi::topic_to_i64(topic(1)?)?,
            user: abi::topic_to_address(topic(2)?)?,
            symbol: abi::read_string(data, 0)?,
            amount: abi::read_u256(data, 1)?,
            above: abi::read_bool(data, 2)?,
        }
    } else if topic0.as_slice() == abi::event_topic(SIG_CLAIMED) {
        LedgerEvent::Claimed {
            anchor_time: abi::topic_to_i64(topic(1)?)?,
            user: abi::topic_to_address(topic(2)?)?,
            symbol: abi::read_string(data, 0)?,
            payout: abi::read_u256(data, 1)?,
        }
    } else if topic0.as_slice() == abi::event_topic(SIG_DEPOSIT) {
        LedgerEvent::Deposit {
            user: abi::topic_to_address(topic(1)?)?,
            amount: abi::read_u256(data, 0)?,
        }
    } else if topic0.as_slice() == abi::event_topic(SIG_WITHDRAW) {
        LedgerEvent::Withdraw {
            user: abi::topic_to_address(topic(1)?)?,
            amount: abi::read_u256(data, 0)?,
        }
    } else if topic0.as_slice() == abi::event_topic(SIG_SLOT_CREATED) {
        LedgerEvent::SlotCreated {
            anchor_time: abi::topic_to_i64(topic(1)?)?,
            symbol: abi::read_string(data, 0)?,
            start_price: abi::read_i128(data, 1)?,
        }
    } else if topic0.as_slice() == abi::event_topic(SIG_SLOT_SETTLED) {
        LedgerEvent::SlotSettled {
            anchor_time: abi::topic_to_i64(topic(1)?)?,
            symbol: abi::read_string(data, 0)?,
            target_price: abi::read_i128(data, 1)?,
        }
    } else {
        return Ok(None);
    };

    Ok(Some(event))
}

/// Drops events for untracked users and repeats of a slot event for an
/// anchor already reported (all symbols of one anchor move together).
#[derive(Debug, Default)]
pub struct EventFilter {
    users: Vec<Address>,
    seen: HashSet<(&'static str, i64)>,
    order: VecDeque<(&'static str, i64)>,
}

impl EventFilter {
    pub fn new(users: Vec<Address>) -> Self {
        Self {
            users,
            ..Default::default()
        }
    }

    pub fn accept(&mut self, event: &LedgerEvent) -> bool {
        if let Some(user) = event.user() {
            return self.users.contains(&user);
        }

        let key = match event {
            LedgerEvent::SlotCreated { anchor_time, .. }
            | LedgerEvent::SlotSettled { anchor_time, .. } => (event.name(), *anchor_time),
            _ => return true,
        };
        if !self.seen.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > SEEN_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

#[derive(Debug, Deserialize)]
struct RpcLog {
    topics: Vec<String>,
    data: String,
}

/// Polls `eth_getLogs` on the contract and forwards accepted events.
pub struct RpcEventWatcher {
    ledger: Arc<RpcLedger>,
    filter: EventFilter,
    poll_interval: Duration,
}

impl RpcEventWatcher {
    pub fn new(ledger: Arc<RpcLedger>, users: Vec<Address>, poll_interval: Duration) -> Self {
        Self {
            ledger,
            filter: EventFilter::new(users),
            poll_interval,
        }
    }

    async fn fetch_logs(&self, from: u64, to: u64) -> Result<Vec<LedgerEvent>> {
        let result = self
            .ledger
            .request(
                "eth_getLogs",
                json!([{
                    "address": self.ledger.contract().to_string(),
                    "fromBlock": format!("0x{:x}", from),
                    "toBlock": format!("0x{:x}", to),
                }]),
            )
            .await?;
        let logs: Vec<RpcLog> =
            serde_json::from_value(result).context("failed to parse eth_getLogs result")?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            let topics = log
                .topics
                .iter()
                .map(|t| abi::from_hex(t))
                .collect::<Result<Vec<_>>>()?;
            let data = abi::from_hex(&log.data)?;
            match decode_log(&topics, &data) {
                Ok(Some(ev)) => events.push(ev),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "skipping undecodable log"),
            }
        }
        Ok(events)
    }

    /// Runs until `shutdown` flips or the receiver side is dropped.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<LedgerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut tick = interval(self.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut next_block: Option<u64> = None;

        info!("📡 Contract event watcher started");

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => return Ok(()),
            }

            let latest = match self.ledger.block_number().await {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "eth_blockNumber failed");
                    continue;
                }
            };

            // First tick: only watch from here on.
            let from = match next_block {
                Some(b) => b,
                None => {
                    next_block = Some(latest + 1);
                    continue;
                }
            };
            if from > latest {
                continue;
            }

            match self.fetch_logs(from, latest).await {
                Ok(events) => {
                    next_block = Some(latest + 1);
                    for ev in events {
                        if !self.filter.accept(&ev) {
                            continue;
                        }
                        debug!(event = ev.name(), "contract event");
                        if tx.send(ev).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Err(e) => warn!(error = %e, from, to = latest, "eth_getLogs failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uint_word(v: u64) -> Vec<u8> {
        U256::from(v).to_be_bytes::<32>().to_vec()
    }

    fn addr_word(a: Address) -> Vec<u8> {
        let mut w = vec![0u8; 32];
        w[12..].copy_from_slice(a.as_slice());
        w
    }

    fn string_tail(s: &str) -> Vec<u8> {
        let mut out = uint_word(s.len() as u64);
        let mut bytes = s.as_bytes().to_vec();
        bytes.resize(32, 0);
        out.extend(bytes);
        out
    }

    #[test]
    fn test_decode_bet_placed() {
        let user = Address::repeat_byte(0xaa);
        let topics = vec![
            abi::event_topic(SIG_BET_PLACED).to_vec(),
            uint_word(1_800),
            addr_word(user),
        ];
        let mut data = uint_word(96);
        data.extend(uint_word(5_000));
        data.extend(uint_word(1));
        data.extend(string_tail("BTC"));

        let ev = decode_log(&topics, &data).unwrap().unwrap();
        assert_eq!(
            ev,
            LedgerEvent::BetPlaced {
                anchor_time: 1_800,
                symbol: "BTC".into(),
                user,
                amount: U256::from(5_000u64),
                above: true,
            }
        );
    }

    #[test]
    fn test_decode_unknown_topic() {
        let topics = vec![vec![0u8; 32]];
        assert_eq!(decode_log(&topics, &[]).unwrap(), None);
        assert_eq!(decode_log(&[], &[]).unwrap(), None);
    }

    #[test]
    fn test_filter_user_and_dedupe() {
        let me = Address::repeat_byte(1);
        let other = Address::repeat_byte(2);
        let mut filter = EventFilter::new(vec![me]);

        let deposit = |user| LedgerEvent::Deposit {
            user,
            amount: U256::from(1u64),
        };
        assert!(filter.accept(&deposit(me)));
        assert!(!filter.accept(&deposit(other)));

        let created = |symbol: &str| LedgerEvent::SlotCreated {
            anchor_time: 360,
            symbol: symbol.into(),
            start_price: 1,
        };
        assert!(filter.accept(&created("BTC")));
        assert!(!filter.accept(&created("ETH")));

        let settled = LedgerEvent::SlotSettled {
            anchor_time: 360,
            symbol: "BTC".into(),
            target_price: 2,
        };
        assert!(filter.accept(&settled));
    }

    #[test]
    fn test_filter_forgets_old_anchors() {
        let mut filter = EventFilter::new(vec![]);
        for anchor in 0..(SEEN_CAPACITY as i64 + 1) {
            assert!(filter.accept(&LedgerEvent::SlotCreated {
                anchor_time: anchor,
                symbol: "BTC".into(),
                start_price: 0,
            }));
        }
        assert!(filter.accept(&LedgerEvent::SlotCreated {
            anchor_time: 0,
            symbol: "BTC".into(),
            start_price: 0,
        }));
    }
}
