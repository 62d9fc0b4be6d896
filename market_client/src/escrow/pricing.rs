//! Fixed-point pricing and settlement arithmetic.
//!
//! Prices are stored as integers scaled by [`PRICE_PRECISION`]: with a 6-decimal
//! token a price of `5000` is $5 per million tokens. All divisions truncate,
//! matching the marketplace contract.

use ethers::types::U256;

pub const PRICE_PRECISION: u64 = 1000;

/// Share of a settled claim paid to the host, in percent
pub const HOST_SHARE_PERCENT: u64 = 90;

/// Share of a settled claim paid to the treasury, in percent
pub const TREASURY_SHARE_PERCENT: u64 = 100 - HOST_SHARE_PERCENT;

/// `floor(price_per_token * proof_interval / PRICE_PRECISION)`
pub fn actual_cost(price_per_token: U256, proof_interval: u64) -> U256 {
    price_per_token.saturating_mul(U256::from(proof_interval)) / U256::from(PRICE_PRECISION)
}

/// Cost of `tokens` at `price_per_token`, same truncation as [`actual_cost`]
pub fn token_cost(price_per_token: U256, tokens: u64) -> U256 {
    actual_cost(price_per_token, tokens)
}

/// How a settled claim is divided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementSplit {
    pub host: U256,
    pub treasury: U256,
    pub refund: U256,
}

/// Split a claim against an escrowed deposit.
///
/// The claim is capped at the deposit. The treasury share is truncated and the
/// host receives the remainder so no unit is lost to rounding.
pub fn split_settlement(deposit: U256, claimed_cost: U256) -> SettlementSplit {
    let payable = claimed_cost.min(deposit);
    let treasury = payable * U256::from(TREASURY_SHARE_PERCENT) / U256::from(100u64);
    let host = payable - treasury;
    SettlementSplit {
        host,
        treasury,
        refund: deposit - payable,
    }
}
