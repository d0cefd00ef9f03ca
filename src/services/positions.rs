//! Position & P&L Projector
//!
//! Derives per-user per-pair spot positions from the trade stream: buys
//! update the weighted-average entry price, sells realize
//! `(trade_price - avg_entry) * sold`, with the position clamped at zero.
//! Unrealized P&L is derived on demand from the price feed, never stored.

use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::engine::decimal;
use crate::engine::types::TradingPair;
use crate::events::{EventEnvelope, ExchangeEvent, TradeExecutedPayload};

use super::price_feed::PriceFeed;

/// Spot position for one user on one pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Position {
    pub position_amount: Decimal,
    pub avg_entry_price: Decimal,
    pub realized_pnl: Decimal,
}

pub struct PositionBook {
    positions: DashMap<(i64, TradingPair), Position>,
    prices: Arc<PriceFeed>,
}

impl PositionBook {
    pub fn new(prices: Arc<PriceFeed>) -> Self {
        Self {
            positions: DashMap::new(),
            prices,
        }
    }

    pub fn get(&self, user_id: i64, pair: &TradingPair) -> Option<Position> {
        self.positions
            .get(&(user_id, pair.clone()))
            .map(|p| p.value().clone())
    }

    /// `(market_price - avg_entry) * position`, or `None` without a price.
    pub fn unrealized_pnl(&self, user_id: i64, pair: &TradingPair) -> Option<Decimal> {
        let position = self.get(user_id, pair)?;
        if position.position_amount.is_zero() {
            return Some(Decimal::ZERO);
        }
        let market = self.prices.latest(pair)?;
        Some(decimal::mul(
            market - position.avg_entry_price,
            position.position_amount,
        ))
    }

    /// Fold one trade into both parties' positions.
    pub fn apply_trade(&self, trade: &TradeExecutedPayload) {
        self.apply_buy(trade.buyer_id, &trade.pair, trade.price, trade.amount);
        self.apply_sell(trade.seller_id, &trade.pair, trade.price, trade.amount);
    }

    fn apply_buy(&self, user_id: i64, pair: &TradingPair, price: Decimal, amount: Decimal) {
        let mut position = self
            .positions
            .entry((user_id, pair.clone()))
            .or_default();
        let new_amount = position.position_amount + amount;
        if new_amount > Decimal::ZERO {
            let cost = decimal::mul(position.avg_entry_price, position.position_amount)
                + decimal::mul(price, amount);
            position.avg_entry_price = decimal::div(cost, new_amount).unwrap_or(price);
        }
        position.position_amount = new_amount;
    }

    fn apply_sell(&self, user_id: i64, pair: &TradingPair, price: Decimal, amount: Decimal) {
        let mut position = self
            .positions
            .entry((user_id, pair.clone()))
            .or_default();
        // Only the held amount realizes P&L; a sale beyond the tracked
        // position (e.g. deposited inventory) carries no entry price.
        let sold = amount.min(position.position_amount);
        if sold > Decimal::ZERO {
            let pnl_delta = decimal::mul(price - position.avg_entry_price, sold);
            position.realized_pnl += pnl_delta;
            position.position_amount -= sold;
        }
        if position.position_amount.is_zero() {
            position.avg_entry_price = Decimal::ZERO;
        }
    }

    /// Project positions from the event spine.
    pub async fn run(self: Arc<Self>, mut rx: broadcast::Receiver<EventEnvelope>) {
        info!("Position projector started");
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if let ExchangeEvent::TradeExecuted(trade) = &envelope.event {
                        self.apply_trade(trade);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Position projector lagged {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Event channel closed, stopping position projector");
                    break;
                }
            }
        }
    }
}
