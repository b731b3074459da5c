//! JSON-RPC `LedgerReader` over `eth_call`.
//!
//! The slot contract exposes public mappings:
//! - `lastSlotTime()` → uint256
//! - `slots(uint256,string)` → (startTime, endTime, targetTime, poolAbove,
//!   poolBelow, startPrice:int256, targetPrice:int256, settled)
//! - `bets(uint256,string,address)` → (amount, betAbove, claimed)
//! - `balances(address)` → uint256

use alloy_primitives::{Address, U256};
use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use super::abi::{self, Token};
use super::LedgerReader;
use crate::models::{Bet, Slot};

/// Reference deployment (Base Sepolia).
pub const DEFAULT_CONTRACT_ADDRESS: &str = "0x75447B88BCd68b10E5776d5883aE10BCfe322D4C";

const SIG_LAST_SLOT_TIME: &str = "lastSlotTime()";
const SIG_SLOTS: &str = "slots(uint256,string)";
const SIG_BETS: &str = "bets(uint256,string,address)";
const SIG_BALANCES: &str = "balances(address)";

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<Value>,
}

pub struct RpcLedger {
    client: Client,
    rpc_url: String,
    contract: Address,
    next_id: AtomicU64,
}

impl RpcLedger {
    pub fn new(rpc_url: String, contract: Address, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            rpc_url,
            contract,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn contract(&self) -> Address {
        self.contract
    }

    /// Raw JSON-RPC request; returns the `result` field.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let response: JsonRpcResponse = self
            .client
            .post(&self.rpc_url)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("{method} request failed"))?
            .error_for_status()
            .with_context(|| format!("{method} status"))?
            .json()
            .await
            .with_context(|| format!("failed to parse {method} response"))?;

        if let Some(err) = response.error {
            return Err(anyhow!("RPC error on {}: {}", method, err));
        }

        response
            .result
            .ok_or_else(|| anyhow!("no result in {} response", method))
    }

    async fn eth_call(&self, signature: &str, args: &[Token]) -> Result<Vec<u8>> {
        let data = abi::to_hex(&abi::encode_call(signature, args));
        let result = self
            .request(
                "eth_call",
                json!([{ "to": self.contract.to_string(), "data": data }, "latest"]),
            )
            .await?;

        let hex_str = result
            .as_str()
            .ok_or_else(|| anyhow!("eth_call result is not a string"))?;
        let bytes = abi::from_hex(hex_str).with_context(|| format!("decoding {signature}"))?;
        debug!(call = signature, bytes = bytes.len(), "eth_call ok");
        Ok(bytes)
    }

    pub async fn block_number(&self) -> Result<u64> {
        let result = self.request("eth_blockNumber", json!([])).await?;
        parse_quantity(&result)
    }
}

/// Hex quantity (`"0x1a"`) → u64.
pub fn parse_quantity(value: &Value) -> Result<u64> {
    let s = value
        .as_str()
        .ok_or_else(|| anyhow!("quantity is not a string: {}", value))?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| anyhow!("invalid quantity {s}: {e}"))
}

pub fn decode_slot(data: &[u8]) -> Result<Slot> {
    Ok(Slot {
        start_time: abi::read_i64(data, 0)?,
        betting_end_time: abi::read_i64(data, 1)?,
        target_time: abi::read_i64(data, 2)?,
        pool_above: abi::read_u256(data, 3)?,
        pool_below: abi::read_u256(data, 4)?,
        start_price: abi::read_i128(data, 5)?,
        target_price: abi::read_i128(data, 6)?,
        settled: abi::read_bool(data, 7)?,
    })
}

pub fn decode_bet(data: &[u8]) -> Result<Bet> {
    Ok(Bet {
        amount: abi::read_u256(data, 0)?,
        bet_above: abi::read_bool(data, 1)?,
        claimed: abi::read_bool(data, 2)?,
    })
}

fn anchor_token(anchor_time: i64) -> Result<Token> {
    if anchor_time < 0 {
        return Err(anyhow!("negative anchor time {}", anchor_time));
    }
    Ok(Token::Uint(U256::from(anchor_time as u64)))
}

#[async_trait::async_trait]
impl LedgerReader for RpcLedger {
    async fn last_anchor_time(&self) -> Result<i64> {
        let data = self.eth_call(SIG_LAST_SLOT_TIME, &[]).await?;
        abi::read_i64(&data, 0)
    }

    async fn slot(&self, anchor_time: i64, symbol: &str) -> Result<Slot> {
        let data = self
            .eth_call(
                SIG_SLOTS,
                &[anchor_token(anchor_time)?, Token::String(symbol.to_string())],
            )
            .await?;
        decode_slot(&data)
    }

    async fn bet(&self, anchor_time: i64, symbol: &str, user: Address) -> Result<Bet> {
        let data = self
            .eth_call(
                SIG_BETS,
                &[
                    anchor_token(anchor_time)?,
                    Token::String(symbol.to_string()),
                    Token::Address(user),
                ],
            )
            .await?;
        decode_bet(&data)
    }

    async fn deposited_balance(&self, user: Address) -> Result<U256> {
        let data = self
            .eth_call(SIG_BALANCES, &[Token::Address(user)])
            .await?;
        abi::read_u256(&data, 0)
    }

    async fn wallet_balance(&self, user: Address) -> Result<U256> {
        let result = self
            .request("eth_getBalance", json!([user.to_string(), "latest"]))
            .await?;
        let s = result
            .as_str()
            .ok_or_else(|| anyhow!("eth_getBalance result is not a string"))?;
        U256::from_str_radix(s.trim_start_matches("0x"), 16)
            .map_err(|e| anyhow!("invalid balance {s}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(values: &[[u8; 32]]) -> Vec<u8> {
        values.iter().flat_map(|w| w.iter().copied()).collect()
    }

    fn uint(v: u64) -> [u8; 32] {
        U256::from(v).to_be_bytes::<32>()
    }

    fn int(v: i128) -> [u8; 32] {
        let fill = if v < 0 { 0xff } else { 0x00 };
        let mut w = [fill; 32];
        w[16..].copy_from_slice(&v.to_be_bytes());
        w
    }

    #[test]
    fn test_decode_slot_words() {
        let data = words(&[
            uint(1_700_000_000),
            uint(1_700_000_120),
            uint(1_700_000_180),
            uint(1_000),
            uint(3_000),
            int(6_500_000_000_000),
            int(-1),
            uint(1),
        ]);
        let slot = decode_slot(&data).unwrap();
        assert_eq!(slot.start_time, 1_700_000_000);
        assert_eq!(slot.betting_end_time, 1_700_000_120);
        assert_eq!(slot.target_time, 1_700_000_180);
        assert_eq!(slot.pool_above, U256::from(1_000u64));
        assert_eq!(slot.pool_below, U256::from(3_000u64));
        assert_eq!(slot.start_price, 6_500_000_000_000);
        assert_eq!(slot.target_price, -1);
        assert!(slot.settled);
    }

    #[test]
    fn test_decode_truncated_slot_fails() {
        let data = words(&[uint(1), uint(2), uint(3)]);
        assert!(decode_slot(&data).is_err());
    }

    #[test]
    fn test_decode_absent_bet() {
        let data = words(&[uint(0), uint(0), uint(0)]);
        let bet = decode_bet(&data).unwrap();
        assert!(bet.is_absent());
        assert!(!bet.bet_above);
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity(&json!("0x1a")).unwrap(), 26);
        assert!(parse_quantity(&json!(26)).is_err());
    }
}
