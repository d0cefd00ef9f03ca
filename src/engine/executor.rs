//! Execution
//!
//! Applies one match result to the balance store: quote moves from the
//! buyer's locked funds to the seller's available funds, base moves from the
//! seller's locked funds to the buyer's available funds. Both legs draw on
//! funds locked at submission, so a failure here means the lock invariant
//! was breached upstream and the pair loop must halt.

use super::balance::{AccountView, BalanceStore};
use super::decimal;
use super::error::BalanceError;
use super::types::MatchResult;

/// Post-state account views produced by settling one fill, in mutation
/// order. The pair loop turns these into `balance_changed` events.
#[derive(Debug)]
pub struct SettledFill {
    pub buyer_quote: AccountView,
    pub seller_quote: AccountView,
    pub seller_base: AccountView,
    pub buyer_base: AccountView,
}

/// Settle one fill against the balance store.
pub fn apply(balances: &BalanceStore, fill: &MatchResult) -> Result<SettledFill, BalanceError> {
    let total_quote = decimal::mul(fill.price, fill.amount);

    let (buyer_quote, seller_quote) = balances.transfer_locked(
        fill.buyer_id,
        fill.seller_id,
        &fill.pair.quote,
        total_quote,
    )?;
    let (seller_base, buyer_base) = balances.transfer_locked(
        fill.seller_id,
        fill.buyer_id,
        &fill.pair.base,
        fill.amount,
    )?;

    Ok(SettledFill {
        buyer_quote,
        seller_quote,
        seller_base,
        buyer_base,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::TradingPair;
    use rust_decimal_macros::dec;

    fn fill(price: rust_decimal::Decimal, amount: rust_decimal::Decimal) -> MatchResult {
        MatchResult {
            buy_order_id: 1,
            sell_order_id: 2,
            buyer_id: 10,
            seller_id: 20,
            pair: TradingPair::new("SOL", "USDT"),
            price,
            amount,
        }
    }

    #[test]
    fn test_apply_moves_both_legs() {
        let balances = BalanceStore::new();
        balances.set(10, "USDT", dec!(0), dec!(1000));
        balances.set(20, "SOL", dec!(0), dec!(10));

        let settled = apply(&balances, &fill(dec!(100), dec!(10))).unwrap();
        assert_eq!(settled.buyer_quote.locked, dec!(0));
        assert_eq!(settled.seller_quote.available, dec!(1000));
        assert_eq!(settled.seller_base.locked, dec!(0));
        assert_eq!(settled.buyer_base.available, dec!(10));

        // supply conserved on both assets
        assert_eq!(balances.total_supply("USDT"), dec!(1000));
        assert_eq!(balances.total_supply("SOL"), dec!(10));
    }

    #[test]
    fn test_apply_fails_on_missing_lock() {
        let balances = BalanceStore::new();
        balances.set(10, "USDT", dec!(1000), dec!(0)); // available, not locked
        balances.set(20, "SOL", dec!(0), dec!(10));

        let err = apply(&balances, &fill(dec!(100), dec!(10))).unwrap_err();
        assert!(matches!(err, BalanceError::InsufficientLocked { .. }));
    }
}
