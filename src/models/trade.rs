use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::services::fees::FeeType;

/// Durable trade row; immutable once appended. The engine-assigned id is
/// the consumer's idempotence key.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Trade {
    pub id: i64,
    pub buy_order_id: i64,
    pub sell_order_id: i64,
    pub buyer_id: i64,
    pub seller_id: i64,
    pub base_mint: String,
    pub quote_mint: String,
    pub price: Decimal,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

/// One side's fee for one trade; two rows per trade.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TradeFee {
    pub id: i64,
    pub trade_id: i64,
    pub user_id: i64,
    pub fee_type: FeeType,
    pub fee_rate: Decimal,
    pub fee_amount: Decimal,
    pub fee_mint: String,
    pub trade_value: Decimal,
    pub created_at: DateTime<Utc>,
}
