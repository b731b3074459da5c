//! Parimutuel payout calculation.
//!
//! Winners split the combined pool in proportion to their stake on the
//! winning side. Equal start/target prices are a loss for both directions.

use alloy_primitives::{U256, U512};

use crate::models::{Bet, Slot};

/// Strict inequality both ways: a flat price never wins.
pub fn did_win(bet_above: bool, start_price: i128, target_price: i128) -> bool {
    if bet_above {
        target_price > start_price
    } else {
        target_price < start_price
    }
}

/// Payout for a bet against raw pool/price values. Does not look at the
/// settled flag; callers must only use it on settled data.
pub fn parimutuel_payout(
    amount: U256,
    bet_above: bool,
    pool_above: U256,
    pool_below: U256,
    start_price: i128,
    target_price: i128,
) -> U256 {
    if !did_win(bet_above, start_price, target_price) {
        return U256::ZERO;
    }

    let (user_pool, opposite_pool) = if bet_above {
        (pool_above, pool_below)
    } else {
        (pool_below, pool_above)
    };
    let total_pool = user_pool.saturating_add(opposite_pool);

    // Undefined pool math pays back the stake.
    if user_pool.is_zero() || total_pool.is_zero() {
        return amount;
    }

    // 512-bit intermediate; amount * total_pool may not fit in 256 bits
    let payout = U512::from(amount) * U512::from(total_pool) / U512::from(user_pool);
    U256::saturating_from(payout)
}

/// Payout owed for `bet` in `slot`. Zero for losing bets and for any slot
/// that is not settled yet.
pub fn compute_payout(bet: &Bet, slot: &Slot) -> U256 {
    if !slot.settled || bet.is_absent() {
        return U256::ZERO;
    }
    parimutuel_payout(
        bet.amount,
        bet.bet_above,
        slot.pool_above,
        slot.pool_below,
        slot.start_price,
        slot.target_price,
    )
}

/// Whether `bet` won `slot`. Always false before settlement.
pub fn bet_won(bet: &Bet, slot: &Slot) -> bool {
    slot.settled && did_win(bet.bet_above, slot.start_price, slot.target_price)
}
