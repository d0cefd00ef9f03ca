//! Matching
//!
//! Pure price-time-priority matching of one incoming order against a book.
//! The matcher mutates residuals on the incoming entry and on resting
//! entries, removes filled entries and emptied price levels, and returns the
//! fills plus the resting entries it completed. Balance movement is the
//! executor's job; the matcher itself cannot fail.

use rust_decimal::Decimal;

use super::book::OrderBook;
use super::decimal;
use super::error::EngineError;
use super::types::{MatchResult, OrderEntry, OrderKind, Side, SubmitOrder};

/// Everything one matching pass produced.
#[derive(Debug, Default)]
pub struct MatchOutcome {
    /// Fills in execution order, priced at the maker's level.
    pub fills: Vec<MatchResult>,
    /// Resting entries fully filled by this pass, in fill order. The engine
    /// releases any buy-side price-improvement surplus for these.
    pub completed: Vec<OrderEntry>,
}

/// Shape validation for an incoming submit.
///
/// Limit orders need a positive price and a positive base amount. Market
/// buys are quote-denominated only; market sells are base-denominated only.
/// A quote-mode sell is undefined in this engine.
pub fn validate(order: &SubmitOrder) -> Result<(), EngineError> {
    let positive = |v: Option<Decimal>| v.is_some_and(|d| d > Decimal::ZERO);

    match order.kind {
        OrderKind::Limit => {
            if !positive(order.price) {
                return Err(EngineError::InvalidOrder(
                    "limit order requires a positive price".to_string(),
                ));
            }
            if !positive(order.amount) {
                return Err(EngineError::InvalidOrder(
                    "limit order requires a positive amount".to_string(),
                ));
            }
            if order.quote_amount.is_some() {
                return Err(EngineError::InvalidOrder(
                    "limit order cannot carry a quote budget".to_string(),
                ));
            }
        }
        OrderKind::Market => {
            if order.price.is_some() {
                return Err(EngineError::InvalidOrder(
                    "market order cannot carry a price".to_string(),
                ));
            }
            match order.side {
                Side::Buy => {
                    if !positive(order.quote_amount) || order.amount.is_some() {
                        return Err(EngineError::InvalidOrder(
                            "market buy requires a positive quote amount and no base amount"
                                .to_string(),
                        ));
                    }
                }
                Side::Sell => {
                    if !positive(order.amount) || order.quote_amount.is_some() {
                        return Err(EngineError::InvalidOrder(
                            "market sell requires a positive base amount and no quote amount"
                                .to_string(),
                        ));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Match `incoming` against the opposite side of `book`.
pub fn match_incoming(incoming: &mut OrderEntry, book: &mut OrderBook) -> MatchOutcome {
    let mut outcome = MatchOutcome::default();
    let maker_side = incoming.side.opposite();
    let quote_mode = incoming.is_quote_mode();

    'levels: while !incoming.is_satisfied() {
        let Some(level_key) = book.best_key(maker_side) else {
            break;
        };
        let level_price = level_key.to_decimal();

        // A limit taker never crosses past its own price.
        if incoming.kind == OrderKind::Limit {
            let crossed = match incoming.side {
                Side::Buy => incoming.price.is_some_and(|p| p >= level_price),
                Side::Sell => incoming.price.is_some_and(|p| p <= level_price),
            };
            if !crossed {
                break;
            }
        }

        // Self-trade prevention rotates own orders to the back of the queue,
        // bounded so a level holding only the taker's orders terminates.
        let rotation_bound = 2 * book.queue_len_at(maker_side, level_key);
        let mut rotations = 0usize;

        loop {
            if incoming.is_satisfied() {
                break 'levels;
            }
            let Some(mut resting) = book.pop_front_at(maker_side, level_key) else {
                break;
            };

            if resting.user_id == incoming.user_id {
                rotations += 1;
                if rotations > rotation_bound {
                    // Nothing matchable left here; matching a deeper level
                    // instead would violate price priority.
                    book.push_front_at(maker_side, level_key, resting);
                    break 'levels;
                }
                book.push_back_at(maker_side, level_key, resting);
                continue;
            }

            let amount = if quote_mode {
                // Floor keeps amount * price within the remaining budget.
                let max_by_quote = decimal::div_floor(
                    incoming.remaining_quote_amount,
                    level_price,
                )
                .unwrap_or(Decimal::ZERO);
                max_by_quote.min(resting.remaining_amount)
            } else {
                incoming.remaining_amount.min(resting.remaining_amount)
            };

            if amount <= Decimal::ZERO {
                // Residual budget too small for any fill at this price.
                book.push_front_at(maker_side, level_key, resting);
                break 'levels;
            }

            let quote_value = decimal::mul(amount, level_price);
            let (buy_order_id, sell_order_id, buyer_id, seller_id) = match incoming.side {
                Side::Buy => (incoming.id, resting.id, incoming.user_id, resting.user_id),
                Side::Sell => (resting.id, incoming.id, resting.user_id, incoming.user_id),
            };
            outcome.fills.push(MatchResult {
                buy_order_id,
                sell_order_id,
                buyer_id,
                seller_id,
                pair: incoming.pair.clone(),
                price: level_price,
                amount,
            });

            resting.filled_amount += amount;
            resting.remaining_amount -= amount;
            resting.filled_quote_amount += quote_value;
            if resting.remaining_amount > Decimal::ZERO {
                book.push_front_at(maker_side, level_key, resting);
            } else {
                outcome.completed.push(resting);
            }

            incoming.filled_amount += amount;
            incoming.filled_quote_amount += quote_value;
            if quote_mode {
                incoming.remaining_quote_amount -= quote_value;
                incoming.amount += amount;
                incoming.remaining_amount = Decimal::ZERO;
            } else {
                incoming.remaining_amount -= amount;
            }
        }

        book.prune_level(maker_side, level_key);
    }

    // The loop can exit while the best level sits drained behind it.
    if let Some(key) = book.best_key(maker_side) {
        book.prune_level(maker_side, key);
    }

    outcome
}
