use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::engine::types::{OrderEntry, OrderKind, OrderStatus, Side, TradingPair};

/// Durable order row, maintained by the trade consumer.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: i64,
    pub user_id: i64,
    pub order_type: OrderKind,
    pub order_side: Side,
    pub base_mint: String,
    pub quote_mint: String,
    pub price: Option<Decimal>,
    pub amount: Decimal,
    pub quote_amount: Option<Decimal>,
    pub filled_amount: Decimal,
    pub filled_quote_amount: Decimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn pair(&self) -> TradingPair {
        TradingPair::new(self.base_mint.clone(), self.quote_mint.clone())
    }

    pub fn remaining_amount(&self) -> Decimal {
        self.amount - self.filled_amount
    }

    /// In-book view of an open limit order, for recovery replay.
    pub fn to_entry(&self) -> OrderEntry {
        OrderEntry {
            id: self.id,
            user_id: self.user_id,
            side: self.order_side,
            kind: self.order_type,
            pair: self.pair(),
            price: self.price,
            amount: self.amount,
            quote_amount: self.quote_amount,
            filled_amount: self.filled_amount,
            filled_quote_amount: self.filled_quote_amount,
            remaining_amount: self.remaining_amount(),
            remaining_quote_amount: Decimal::ZERO,
            created_at: self.created_at.timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderResponse {
    pub order_id: i64,
    pub pair: String,
    pub side: Side,
    pub order_type: OrderKind,
    pub price: Option<Decimal>,
    pub amount: Decimal,
    pub filled_amount: Decimal,
    pub remaining_amount: Decimal,
    pub status: OrderStatus,
    pub created_at: i64,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        Self {
            order_id: order.id,
            pair: order.pair().to_string(),
            side: order.order_side,
            order_type: order.order_type,
            price: order.price,
            amount: order.amount,
            filled_amount: order.filled_amount,
            remaining_amount: order.remaining_amount(),
            status: order.status,
            created_at: order.created_at.timestamp_millis(),
        }
    }
}
