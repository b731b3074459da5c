//! Minimal Solidity ABI support for the handful of contract reads we issue.
//!
//! Calls: 4-byte selector + head/tail encoded arguments (static words inline,
//! `string` as an offset into the tail). Returns: fixed 32-byte words.

use alloy_primitives::{keccak256, Address, U256};
use anyhow::{anyhow, bail, Result};

const WORD: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Uint(U256),
    Address(Address),
    Bool(bool),
    String(String),
}

impl Token {
    fn is_dynamic(&self) -> bool {
        matches!(self, Token::String(_))
    }
}

/// First four bytes of keccak256 of the canonical signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Full 32-byte event topic for an event signature.
pub fn event_topic(signature: &str) -> [u8; 32] {
    keccak256(signature.as_bytes()).0
}

fn static_word(token: &Token) -> [u8; 32] {
    let mut w = [0u8; WORD];
    match token {
        Token::Uint(v) => w = v.to_be_bytes::<32>(),
        Token::Address(a) => w[12..].copy_from_slice(a.as_slice()),
        Token::Bool(b) => w[31] = u8::from(*b),
        Token::String(_) => {}
    }
    w
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(WORD) * WORD
}

/// Encode a call to `signature` with `args`.
pub fn encode_call(signature: &str, args: &[Token]) -> Vec<u8> {
    let head_len = args.len() * WORD;
    let mut head = Vec::with_capacity(head_len);
    let mut tail: Vec<u8> = Vec::new();

    for arg in args {
        if arg.is_dynamic() {
            let offset = U256::from(head_len + tail.len());
            head.extend_from_slice(&offset.to_be_bytes::<32>());
            if let Token::String(s) = arg {
                let bytes = s.as_bytes();
                tail.extend_from_slice(&U256::from(bytes.len()).to_be_bytes::<32>());
                let start = tail.len();
                tail.extend_from_slice(bytes);
                tail.resize(start + padded_len(bytes.len()), 0);
            }
        } else {
            head.extend_from_slice(&static_word(arg));
        }
    }

    let mut out = Vec::with_capacity(4 + head.len() + tail.len());
    out.extend_from_slice(&selector(signature));
    out.extend_from_slice(&head);
    out.extend_from_slice(&tail);
    out
}

/// `0x`-prefixed hex of `data`.
pub fn to_hex(data: &[u8]) -> String {
    format!("0x{}", hex::encode(data))
}

pub fn from_hex(s: &str) -> Result<Vec<u8>> {
    hex::decode(s.trim().trim_start_matches("0x")).map_err(|e| anyhow!("invalid hex: {e}"))
}

/// The `index`-th 32-byte word of `data`.
pub fn word(data: &[u8], index: usize) -> Result<&[u8]> {
    let start = index * WORD;
    data.get(start..start + WORD).ok_or_else(|| {
        anyhow!(
            "response too short: need word {} but got {} bytes",
            index,
            data.len()
        )
    })
}

pub fn read_u256(data: &[u8], index: usize) -> Result<U256> {
    Ok(U256::from_be_slice(word(data, index)?))
}

/// uint256 that must fit an i64 (timestamps).
pub fn read_i64(data: &[u8], index: usize) -> Result<i64> {
    let w = word(data, index)?;
    if w[..24].iter().any(|b| *b != 0) || w[24] & 0x80 != 0 {
        bail!("word {} does not fit i64", index);
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&w[24..]);
    Ok(i64::from_be_bytes(buf))
}

/// int256 that must fit an i128 (oracle prices).
pub fn read_i128(data: &[u8], index: usize) -> Result<i128> {
    let w = word(data, index)?;
    let negative = w[16] & 0x80 != 0;
    let fill = if negative { 0xff } else { 0x00 };
    if w[..16].iter().any(|b| *b != fill) {
        bail!("word {} does not fit i128", index);
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&w[16..]);
    Ok(i128::from_be_bytes(buf))
}

pub fn read_bool(data: &[u8], index: usize) -> Result<bool> {
    let w = word(data, index)?;
    Ok(w.iter().any(|b| *b != 0))
}

pub fn read_address(data: &[u8], index: usize) -> Result<Address> {
    Ok(Address::from_slice(&word(data, index)?[12..]))
}

/// Topics carry indexed args as a single word.
pub fn topic_to_i64(topic: &[u8]) -> Result<i64> {
    read_i64(topic, 0)
}

pub fn topic_to_address(topic: &[u8]) -> Result<Address> {
    read_address(topic, 0)
}

/// Dynamic `string` whose offset sits in word `index`.
pub fn read_string(data: &[u8], index: usize) -> Result<String> {
    let offset = read_i64(data, index)? as usize;
    let len_word = data
        .get(offset..offset + WORD)
        .ok_or_else(|| anyhow!("string offset {} out of range", offset))?;
    let len = read_i64(len_word, 0)? as usize;
    let start = offset + WORD;
    let bytes = data
        .get(start..start + len)
        .ok_or_else(|| anyhow!("string of {} bytes out of range", len))?;
    String::from_utf8(bytes.to_vec()).map_err(|e| anyhow!("invalid utf-8 string: {e}"))
}
