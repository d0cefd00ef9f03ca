//! Durable Event Log Contract
//!
//! Every engine mutation appends one or more events. Events for one
//! partition (a pair slug, or the shared `balances` partition) carry strictly
//! monotonic offsets and reach consumers in append order via an in-process
//! broadcast spine; the Redis Streams publisher mirrors each envelope to its
//! durable topic with at-least-once semantics.
//!
//! Monetary payload fields serialize as decimal strings, never binary
//! floats.

mod publisher;

pub use publisher::{EventPublisher, PublishError};

use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::engine::types::{OrderKind, OrderStatus, Side, TradingPair};

/// Partition carrying balance post-state events.
pub const BALANCES_PARTITION: &str = "balances";

/// Partition receiving events that exhausted consumer retries.
pub const DEAD_LETTER_PARTITION: &str = "dead-letter";

/// Wire envelope; `offset` is monotonic per partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub schema_version: u32,
    pub engine_instance_id: Uuid,
    pub partition: String,
    pub offset: u64,
    pub created_at: i64,
    #[serde(flatten)]
    pub event: ExchangeEvent,
}

/// Event kinds emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExchangeEvent {
    OrderAccepted(OrderAcceptedPayload),
    TradeExecuted(TradeExecutedPayload),
    OrderCancelled(OrderCancelledPayload),
    OrderDone(OrderDonePayload),
    BalanceChanged(BalanceChangedPayload),
    DepthSnapshot(DepthSnapshotPayload),
}

impl ExchangeEvent {
    /// Stable kind string used in topic names.
    pub fn kind(&self) -> &'static str {
        match self {
            ExchangeEvent::OrderAccepted(_) => "order-accepted",
            ExchangeEvent::TradeExecuted(_) => "trade-executed",
            ExchangeEvent::OrderCancelled(_) => "order-cancelled",
            ExchangeEvent::OrderDone(_) => "order-done",
            ExchangeEvent::BalanceChanged(_) => "balance-changed",
            ExchangeEvent::DepthSnapshot(_) => "depth-snapshot",
        }
    }
}

/// Initial, pre-fill state of a submitted order (or its rejection).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAcceptedPayload {
    pub order_id: i64,
    pub user_id: i64,
    pub side: Side,
    pub order_kind: OrderKind,
    pub pair: TradingPair,
    pub price: Option<Decimal>,
    pub amount: Decimal,
    pub quote_amount: Option<Decimal>,
    pub status: OrderStatus,
    pub created_at: i64,
}

/// One executed trade at the maker's price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeExecutedPayload {
    pub trade_id: i64,
    pub buy_order_id: i64,
    pub sell_order_id: i64,
    pub buyer_id: i64,
    pub seller_id: i64,
    pub pair: TradingPair,
    pub price: Decimal,
    pub amount: Decimal,
    pub created_at: i64,
}

/// A resting order left the book by cancellation; `released_*` is the lock
/// residual returned to the owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCancelledPayload {
    pub order_id: i64,
    pub user_id: i64,
    pub pair: TradingPair,
    pub released_asset: String,
    pub released_amount: Decimal,
    pub created_at: i64,
}

/// Terminal state for an order that never rests (market orders).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDonePayload {
    pub order_id: i64,
    pub user_id: i64,
    pub pair: TradingPair,
    pub status: OrderStatus,
    pub amount: Decimal,
    pub filled_amount: Decimal,
    pub filled_quote_amount: Decimal,
    pub released_asset: Option<String>,
    pub released_amount: Option<Decimal>,
    pub created_at: i64,
}

/// Why a balance account changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceChangeReason {
    Deposit,
    Withdraw,
    Sync,
    OrderLock,
    OrderRelease,
    TradeSettlement,
}

/// Post-state snapshot of one account. `version` increases with every
/// mutation of the account, which makes the durable projection idempotent
/// and tolerant of reordering across partitions. `delta` is set for external
/// boundary movements (deposit / withdraw / sync) so downstream settlement
/// can attribute supply changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceChangedPayload {
    pub user_id: i64,
    pub asset: String,
    pub available: Decimal,
    pub locked: Decimal,
    pub version: u64,
    pub reason: BalanceChangeReason,
    pub delta: Option<Decimal>,
    pub created_at: i64,
}

/// Periodic aggregated depth view published by the pair loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthSnapshotPayload {
    pub pair: TradingPair,
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
    pub created_at: i64,
}

struct Partition {
    next_offset: u64,
}

/// In-process ordered event log with broadcast fan-out.
///
/// Offset assignment and broadcast send happen under the partition lock so
/// subscribers observe each partition in offset order.
pub struct EventLog {
    instance_id: Uuid,
    partitions: DashMap<String, Mutex<Partition>>,
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventLog {
    pub fn new(instance_id: Uuid, buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            instance_id,
            partitions: DashMap::new(),
            tx,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Append an event to `partition`, assigning the next offset.
    pub fn append(&self, partition: &str, event: ExchangeEvent) -> EventEnvelope {
        let slot = self
            .partitions
            .entry(partition.to_string())
            .or_insert_with(|| Mutex::new(Partition { next_offset: 0 }));
        let mut guard = slot.lock();
        let envelope = EventEnvelope {
            schema_version: 1,
            engine_instance_id: self.instance_id,
            partition: partition.to_string(),
            offset: guard.next_offset,
            created_at: chrono::Utc::now().timestamp_millis(),
            event,
        };
        guard.next_offset += 1;
        // No subscribers yet is fine; recovery runs before consumers attach.
        let _ = self.tx.send(envelope.clone());
        envelope
    }

    /// Durable topic name for an envelope, e.g. `trade-executed-sol-usdt`.
    pub fn topic(envelope: &EventEnvelope) -> String {
        format!("{}-{}", envelope.event.kind(), envelope.partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn balance_event(version: u64) -> ExchangeEvent {
        ExchangeEvent::BalanceChanged(BalanceChangedPayload {
            user_id: 1,
            asset: "USDT".to_string(),
            available: dec!(10),
            locked: dec!(0),
            version,
            reason: BalanceChangeReason::Deposit,
            delta: Some(dec!(10)),
            created_at: 0,
        })
    }

    #[test]
    fn test_offsets_monotonic_per_partition() {
        let log = EventLog::new(Uuid::new_v4(), 64);
        let a0 = log.append("sol-usdt", balance_event(1));
        let a1 = log.append("sol-usdt", balance_event(2));
        let b0 = log.append("eth-usdt", balance_event(3));
        assert_eq!(a0.offset, 0);
        assert_eq!(a1.offset, 1);
        assert_eq!(b0.offset, 0);
    }

    #[test]
    fn test_subscribers_see_append_order() {
        let log = EventLog::new(Uuid::new_v4(), 64);
        let mut rx = log.subscribe();
        log.append("sol-usdt", balance_event(1));
        log.append("sol-usdt", balance_event(2));
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(first.offset < second.offset);
    }

    #[test]
    fn test_monetary_fields_serialize_as_strings() {
        let log = EventLog::new(Uuid::new_v4(), 4);
        let envelope = log.append(BALANCES_PARTITION, balance_event(1));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["kind"], "balance_changed");
        assert!(json["available"].is_string());
    }

    #[test]
    fn test_topic_names() {
        let log = EventLog::new(Uuid::new_v4(), 4);
        let trade = log.append(
            "sol-usdt",
            ExchangeEvent::TradeExecuted(TradeExecutedPayload {
                trade_id: 1,
                buy_order_id: 1,
                sell_order_id: 2,
                buyer_id: 1,
                seller_id: 2,
                pair: TradingPair::new("SOL", "USDT"),
                price: dec!(100),
                amount: dec!(1),
                created_at: 0,
            }),
        );
        assert_eq!(EventLog::topic(&trade), "trade-executed-sol-usdt");
    }
}
