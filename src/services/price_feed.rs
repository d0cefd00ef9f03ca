//! Price Feed
//!
//! Last-known market price per pair. Prices refresh from the engine's own
//! trade stream; an external market-data source can override them through
//! [`PriceFeed::set_price`], which is the pluggable ingestion point.

use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::engine::types::TradingPair;
use crate::events::{EventEnvelope, ExchangeEvent};

#[derive(Default)]
pub struct PriceFeed {
    prices: DashMap<TradingPair, Decimal>,
}

impl PriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self, pair: &TradingPair) -> Option<Decimal> {
        self.prices.get(pair).map(|p| *p)
    }

    /// Externally sourced price (market-data ingestion is out of scope;
    /// whatever feeds it lands here).
    pub fn set_price(&self, pair: TradingPair, price: Decimal) {
        self.prices.insert(pair, price);
    }

    fn update_from_trade(&self, pair: &TradingPair, price: Decimal) {
        self.prices.insert(pair.clone(), price);
    }

    /// Track last-trade prices from the event spine.
    pub async fn run(self: std::sync::Arc<Self>, mut rx: broadcast::Receiver<EventEnvelope>) {
        info!("Price feed worker started");
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if let ExchangeEvent::TradeExecuted(trade) = &envelope.event {
                        self.update_from_trade(&trade.pair, trade.price);
                        debug!("Price updated from trade: {} @ {}", trade.pair, trade.price);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Price feed lagged {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Event channel closed, stopping price feed");
                    break;
                }
            }
        }
    }
}
