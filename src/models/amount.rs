//! Conversions between human-readable decimal amounts and on-chain token units.

use crate::error::{CommerceError, Result};
use ethers::types::U256;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;

/// USDC and the other supported stablecoins use 6 decimals.
pub const TOKEN_DECIMALS: u32 = 6;

/// Parses `"$1,000.50"`-style input into a non-negative decimal.
pub fn parse_usd(input: &str) -> Result<Decimal> {
    let cleaned = input.trim().trim_start_matches('$').replace(',', "");
    let amount = Decimal::from_str(&cleaned)
        .map_err(|_| CommerceError::InvalidAmount(format!("Invalid USD amount: {}", input)))?;
    if amount.is_sign_negative() {
        return Err(CommerceError::InvalidAmount(format!(
            "Negative amount: {}",
            input
        )));
    }
    Ok(amount)
}

/// Converts a decimal amount to integer token units, rejecting precision the
/// token cannot represent.
pub fn to_token_units(amount: Decimal, decimals: u32) -> Result<U256> {
    if amount.is_sign_negative() {
        return Err(CommerceError::InvalidAmount(format!("Negative amount: {}", amount)));
    }
    if amount.normalize().scale() > decimals {
        return Err(CommerceError::InvalidAmount(format!(
            "{} has more than {} decimal places",
            amount, decimals
        )));
    }
    let units = amount
        .checked_mul(Decimal::from(10u64.pow(decimals)))
        .and_then(|scaled| scaled.trunc().to_u128())
        .ok_or_else(|| CommerceError::InvalidAmount(format!("Amount out of range: {}", amount)))?;
    Ok(U256::from(units))
}

/// Converts integer token units back to a decimal amount.
pub fn from_token_units(units: U256, decimals: u32) -> Result<Decimal> {
    // Decimal mantissas are 96 bits wide.
    if units.bits() > 96 {
        return Err(CommerceError::InvalidAmount(format!(
            "Token amount out of range: {}",
            units
        )));
    }
    Decimal::try_from_i128_with_scale(units.as_u128() as i128, decimals)
        .map(|d| d.normalize())
        .map_err(|e| CommerceError::InvalidAmount(e.to_string()))
}
