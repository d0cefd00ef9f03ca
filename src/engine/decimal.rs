//! Scale-18 Monetary Arithmetic
//!
//! All monetary values in the engine are `rust_decimal::Decimal` renormalized
//! to 18 fractional digits. Addition and subtraction are exact; products and
//! quotients are rounded half-up back to scale 18 so results are bit-identical
//! across platforms.

use rust_decimal::{Decimal, RoundingStrategy};

use super::error::EngineError;

/// Working scale for every monetary field.
pub const SCALE: u32 = 18;

/// Smallest representable step at the working scale (10^-18).
pub fn epsilon() -> Decimal {
    Decimal::new(1, SCALE)
}

/// Renormalize a value to scale 18, rounding half-up.
pub fn normalize(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Multiply and renormalize to scale 18 (half-up).
pub fn mul(a: Decimal, b: Decimal) -> Decimal {
    normalize(a * b)
}

/// Divide to scale 18 with half-up rounding.
pub fn div(a: Decimal, b: Decimal) -> Result<Decimal, EngineError> {
    if b.is_zero() {
        return Err(EngineError::DivisionByZero);
    }
    Ok(normalize(a / b))
}

/// Divide to scale 18 rounding toward zero.
///
/// Used for the quote-budget to base-amount conversion in market buys: the
/// half-up quotient can overshoot by one ulp, and `m * price` must never
/// exceed the remaining quote budget the buyer has locked.
pub fn div_floor(a: Decimal, b: Decimal) -> Result<Decimal, EngineError> {
    if b.is_zero() {
        return Err(EngineError::DivisionByZero);
    }
    Ok((a / b).round_dp_with_strategy(SCALE, RoundingStrategy::ToZero))
}

/// `a - b >= -10^-18`.
///
/// Balance-sufficiency checks tolerate one ulp of representational noise
/// accumulated across chained mul/div. Matching-amount computations never use
/// this; trades stay exact.
pub fn is_non_negative_after_epsilon(a: Decimal, b: Decimal) -> bool {
    a - b >= -epsilon()
}
