//! Engine Types
//!
//! Shared value types for the matching core: sides, kinds, statuses, trading
//! pairs, in-book order entries, and the command/response values consumed at
//! the engine boundary.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use super::decimal::{self, SCALE};

// ============================================================================
// Price Key
// ============================================================================

/// Integer price level at the working scale, for exact ordered-map keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PriceKey(i128);

impl PriceKey {
    /// Create a key from a decimal price.
    pub fn from_decimal(price: Decimal) -> Self {
        let p = decimal::normalize(price);
        let shift = SCALE - p.scale();
        PriceKey(p.mantissa() * 10i128.pow(shift))
    }

    /// Convert back to a decimal, trailing zeros stripped.
    pub fn to_decimal(&self) -> Decimal {
        Decimal::from_i128_with_scale(self.0, SCALE).normalize()
    }

    /// Raw scaled value.
    pub fn raw(&self) -> i128 {
        self.0
    }
}

impl Ord for PriceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for PriceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ============================================================================
// Order Enums
// ============================================================================

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_side", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The side a taker on this side matches against.
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Order kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Limit,
    Market,
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderKind::Limit => write!(f, "limit"),
            OrderKind::Market => write!(f, "market"),
        }
    }
}

/// Order status. Monotone `pending -> partial -> filled`; `cancelled` and
/// `rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "pending"),
            OrderStatus::Partial => write!(f, "partial"),
            OrderStatus::Filled => write!(f, "filled"),
            OrderStatus::Cancelled => write!(f, "cancelled"),
            OrderStatus::Rejected => write!(f, "rejected"),
        }
    }
}

// ============================================================================
// Trading Pair
// ============================================================================

/// Ordered `(base, quote)` asset pair. Assets compare by exact equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TradingPair {
    pub base: String,
    pub quote: String,
}

impl TradingPair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            quote: quote.into(),
        }
    }

    /// Parse `"SOL/USDT"`.
    pub fn parse(s: &str) -> Option<Self> {
        let (base, quote) = s.split_once('/')?;
        if base.is_empty() || quote.is_empty() {
            return None;
        }
        Some(Self::new(base.trim(), quote.trim()))
    }

    /// Partition / topic suffix, e.g. `sol-usdt`.
    pub fn slug(&self) -> String {
        format!(
            "{}-{}",
            self.base.to_lowercase(),
            self.quote.to_lowercase()
        )
    }
}

impl fmt::Display for TradingPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

// ============================================================================
// Order Entry (in-book resting view)
// ============================================================================

/// The subset of an order the book needs while it rests or matches.
///
/// Quote-mode market buys carry their budget in `remaining_quote_amount` and
/// accumulate `amount` from fills; everything else is base-denominated.
#[derive(Debug, Clone)]
pub struct OrderEntry {
    pub id: i64,
    pub user_id: i64,
    pub side: Side,
    pub kind: OrderKind,
    pub pair: TradingPair,
    pub price: Option<Decimal>,
    pub amount: Decimal,
    pub quote_amount: Option<Decimal>,
    pub filled_amount: Decimal,
    pub filled_quote_amount: Decimal,
    pub remaining_amount: Decimal,
    pub remaining_quote_amount: Decimal,
    pub created_at: i64,
}

impl OrderEntry {
    /// True when this order consumes a quote budget instead of a base amount.
    pub fn is_quote_mode(&self) -> bool {
        self.kind == OrderKind::Market && self.side == Side::Buy
    }

    /// True when no further match is possible for this order.
    pub fn is_satisfied(&self) -> bool {
        if self.is_quote_mode() {
            self.remaining_quote_amount <= Decimal::ZERO
        } else {
            self.remaining_amount <= Decimal::ZERO
        }
    }
}

// ============================================================================
// Match Result
// ============================================================================

/// One fill produced by the matcher. Price is the resting (maker) price.
#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub buy_order_id: i64,
    pub sell_order_id: i64,
    pub buyer_id: i64,
    pub seller_id: i64,
    pub pair: TradingPair,
    pub price: Decimal,
    pub amount: Decimal,
}

// ============================================================================
// Engine Boundary Commands & Responses
// ============================================================================

/// Submit command value. The HTTP/gRPC front-end translates wire requests
/// into this; the engine assigns `id` when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOrder {
    pub id: Option<i64>,
    pub user_id: i64,
    pub side: Side,
    pub kind: OrderKind,
    pub pair: TradingPair,
    pub price: Option<Decimal>,
    pub amount: Option<Decimal>,
    pub quote_amount: Option<Decimal>,
    pub created_at: Option<i64>,
}

/// Synchronous response to a submit.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitAck {
    pub order_id: i64,
    pub matches: Vec<MatchResult>,
    pub status: OrderStatus,
}

/// Synchronous response to a cancel.
#[derive(Debug, Clone, Serialize)]
pub struct CancelAck {
    pub order_id: i64,
    pub released_asset: String,
    pub released_amount: Decimal,
}

/// Aggregated top-of-book snapshot; price/amount pairs as decimal strings,
/// bids descending and asks ascending.
#[derive(Debug, Clone, Serialize)]
pub struct BookSnapshot {
    pub pair: TradingPair,
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_key_roundtrip() {
        let price = dec!(97500.123456789012345678);
        let key = PriceKey::from_decimal(price);
        assert_eq!(key.to_decimal(), price);
    }

    #[test]
    fn test_price_key_ordering() {
        let lo = PriceKey::from_decimal(dec!(100));
        let hi = PriceKey::from_decimal(dec!(100.000000000000000001));
        assert!(lo < hi);
    }

    #[test]
    fn test_price_key_scale_insensitive() {
        assert_eq!(
            PriceKey::from_decimal(dec!(100)),
            PriceKey::from_decimal(dec!(100.00))
        );
    }

    #[test]
    fn test_pair_parse_and_slug() {
        let pair = TradingPair::parse("SOL/USDT").unwrap();
        assert_eq!(pair.base, "SOL");
        assert_eq!(pair.quote, "USDT");
        assert_eq!(pair.slug(), "sol-usdt");
        assert!(TradingPair::parse("SOLUSDT").is_none());
    }

    #[test]
    fn test_status_terminal() {
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Partial.is_terminal());
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
    }
}
