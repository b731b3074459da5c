//! Display helpers for wei amounts, oracle prices, timestamps and addresses.

use alloy_primitives::{Address, U256};
use anyhow::{anyhow, bail, Result};
use chrono::{TimeZone, Utc};

pub const WEI_DECIMALS: u32 = 18;
pub const PRICE_DECIMALS: u32 = 8;

fn pow10(exp: u32) -> U256 {
    U256::from(10u64).pow(U256::from(exp))
}

/// Render a wei amount as ETH with `decimals` fractional digits (truncated).
pub fn format_eth(wei: U256, decimals: u32) -> String {
    let decimals = decimals.min(WEI_DECIMALS);
    let unit = pow10(WEI_DECIMALS);
    let whole = wei / unit;
    if decimals == 0 {
        return whole.to_string();
    }
    let frac = (wei % unit) / pow10(WEI_DECIMALS - decimals);
    format!("{}.{:0>width$}", whole, frac.to_string(), width = decimals as usize)
}

/// Render an 8-decimal oracle price with `decimals` fractional digits.
pub fn format_price(price: i128, decimals: u32) -> String {
    let decimals = decimals.min(PRICE_DECIMALS);
    let unit = 10i128.pow(PRICE_DECIMALS);
    let sign = if price < 0 { "-" } else { "" };
    let abs = price.unsigned_abs();
    let whole = abs / unit as u128;
    if decimals == 0 {
        return format!("{}{}", sign, whole);
    }
    let frac = (abs % unit as u128) / 10u128.pow(PRICE_DECIMALS - decimals);
    format!(
        "{}{}.{:0>width$}",
        sign,
        whole,
        frac,
        width = decimals as usize
    )
}

/// `HH:MM` in UTC.
pub fn format_time(ts: i64) -> String {
    match Utc.timestamp_opt(ts, 0).single() {
        Some(dt) => dt.format("%H:%M").to_string(),
        None => "--:--".to_string(),
    }
}

/// `0x1234...abcd`.
pub fn format_address(address: &Address) -> String {
    let full = address.to_string();
    format!("{}...{}", &full[..6], &full[full.len() - 4..])
}

/// Parse a decimal ETH string ("0.01") into wei without going through floats.
/// Digits past 18 decimals are truncated.
pub fn parse_ether(input: &str) -> Result<U256> {
    let s = input.trim();
    if s.is_empty() {
        bail!("empty amount");
    }
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        bail!("invalid amount: {}", input);
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        bail!("invalid amount: {}", input);
    }

    let whole_wei = if whole.is_empty() {
        U256::ZERO
    } else {
        let w = U256::from_str_radix(whole, 10).map_err(|e| anyhow!("invalid amount: {e}"))?;
        w.checked_mul(pow10(WEI_DECIMALS))
            .ok_or_else(|| anyhow!("amount too large: {}", input))?
    };

    let frac = &frac[..frac.len().min(WEI_DECIMALS as usize)];
    let frac_wei = if frac.is_empty() {
        U256::ZERO
    } else {
        let f = U256::from_str_radix(frac, 10).map_err(|e| anyhow!("invalid amount: {e}"))?;
        f * pow10(WEI_DECIMALS - frac.len() as u32)
    };

    Ok(whole_wei + frac_wei)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_eth() {
        let one_and_half = U256::from(1_500_000_000_000_000_000u128);
        assert_eq!(format_eth(one_and_half, 4), "1.5000");
        assert_eq!(format_eth(U256::from(123_456_789_000_000u64), 4), "0.0001");
        assert_eq!(format_eth(U256::ZERO, 2), "0.00");
        assert_eq!(format_eth(one_and_half, 0), "1");
    }

    #[test]
    fn test_format_price() {
        assert_eq!(format_price(6_512_345_678_900, 2), "65123.45");
        assert_eq!(format_price(-150_000_000, 2), "-1.50");
        assert_eq!(format_price(0, 2), "0.00");
    }

    #[test]
    fn test_format_time_utc() {
        assert_eq!(format_time(3_600 * 13 + 60 * 7), "13:07");
    }

    #[test]
    fn test_format_address() {
        let addr: Address = "0x75447B88BCd68b10E5776d5883aE10BCfe322D4C"
            .parse()
            .unwrap();
        let short = format_address(&addr);
        assert!(short.starts_with("0x7544"));
        assert!(short.to_lowercase().ends_with("2d4c"));
        assert_eq!(short.len(), 13);
    }

    #[test]
    fn test_parse_ether() {
        assert_eq!(
            parse_ether("0.0005").unwrap(),
            U256::from(500_000_000_000_000u64)
        );
        assert_eq!(
            parse_ether("2").unwrap(),
            U256::from(2_000_000_000_000_000_000u128)
        );
        assert_eq!(parse_ether(".5").unwrap(), U256::from(500_000_000_000_000_000u128));
        assert!(parse_ether("").is_err());
        assert!(parse_ether("1e3").is_err());
        assert!(parse_ether("-1").is_err());
        assert!(parse_ether(".").is_err());
    }
}
