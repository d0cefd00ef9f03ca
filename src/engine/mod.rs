//! Matching Engine Core
//!
//! In-memory spot-exchange core: order books, price-time matching, and
//! double-entry balance accounting.
//!
//! # Architecture
//!
//! ```text
//! SubmitOrder / CancelOrder / SnapshotBook
//!   ↓  (bounded mpsc per pair)
//! PairWorker (one task per pair)
//!   ├→ Matcher   (pure price-time matching)
//!   ├→ Executor  (locked-balance settlement)
//!   └→ EventLog  (ordered per-partition envelopes)
//! Deposit / Withdraw / SyncAvailable
//!   ↓  (direct, per-account locking)
//! BalanceStore (shared across pairs)
//! ```
//!
//! Commands for one pair are processed strictly in submission order; a
//! trade's balance transfers and event emissions complete before the next
//! command is dequeued. The balance store is the only cross-pair resource.

pub mod balance;
pub mod book;
pub mod decimal;
pub mod error;
pub mod executor;
pub mod matcher;
pub mod types;
mod worker;

pub use balance::{AccountView, BalanceStore};
pub use error::{BalanceError, EngineError};

use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::events::{
    BalanceChangeReason, BalanceChangedPayload, EventLog, ExchangeEvent, BALANCES_PARTITION,
};

use types::{BookSnapshot, CancelAck, OrderEntry, SubmitAck, SubmitOrder, TradingPair};
use worker::{now_millis, PairCommand, PairWorker};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bounded depth of each pair's command queue.
    pub command_queue_depth: usize,
    /// How long a sender waits on a full queue before `Overloaded`.
    pub submit_timeout: Duration,
    /// Publish a depth snapshot event every N mutations; 0 disables.
    pub depth_publish_every: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_queue_depth: 1024,
            submit_timeout: Duration::from_millis(500),
            depth_publish_every: 16,
        }
    }
}

/// What startup recovery replayed.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryStats {
    pub balances: usize,
    pub orders: usize,
}

/// The authoritative in-memory engine instance.
pub struct Engine {
    config: EngineConfig,
    balances: Arc<BalanceStore>,
    events: Arc<EventLog>,
    pairs: DashMap<TradingPair, mpsc::Sender<PairCommand>>,
    order_ids: Arc<AtomicI64>,
    trade_ids: Arc<AtomicI64>,
}

impl Engine {
    pub fn new(config: EngineConfig, balances: Arc<BalanceStore>, events: Arc<EventLog>) -> Self {
        Self {
            config,
            balances,
            events,
            pairs: DashMap::new(),
            order_ids: Arc::new(AtomicI64::new(0)),
            trade_ids: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn balances(&self) -> &BalanceStore {
        &self.balances
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    fn sender_for(&self, pair: &TradingPair) -> mpsc::Sender<PairCommand> {
        self.pairs
            .entry(pair.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.config.command_queue_depth);
                let pworker = PairWorker::new(
                    pair.clone(),
                    Arc::clone(&self.balances),
                    Arc::clone(&self.events),
                    Arc::clone(&self.order_ids),
                    Arc::clone(&self.trade_ids),
                    self.config.depth_publish_every,
                );
                tokio::spawn(pworker.run(rx));
                tx
            })
            .clone()
    }

    async fn dispatch<T>(
        &self,
        pair: &TradingPair,
        command: PairCommand,
        reply: oneshot::Receiver<T>,
    ) -> Result<T, EngineError> {
        let sender = self.sender_for(pair);
        sender
            .send_timeout(command, self.config.submit_timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => EngineError::Overloaded,
                mpsc::error::SendTimeoutError::Closed(_) => EngineError::Unavailable,
            })?;
        reply.await.map_err(|_| EngineError::Unavailable)
    }

    /// Lock funds, match, settle fills, rest or release the residual.
    pub async fn submit_order(&self, order: SubmitOrder) -> Result<SubmitAck, EngineError> {
        let pair = order.pair.clone();
        let (tx, rx) = oneshot::channel();
        self.dispatch(&pair, PairCommand::Submit { order, reply: tx }, rx)
            .await?
    }

    /// Remove a resting order and release its lock residual.
    pub async fn cancel_order(
        &self,
        pair: &TradingPair,
        order_id: i64,
        user_id: i64,
    ) -> Result<CancelAck, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(
            pair,
            PairCommand::Cancel {
                order_id,
                user_id,
                reply: tx,
            },
            rx,
        )
        .await?
    }

    /// Aggregated top-n depth for one pair.
    pub async fn snapshot_book(
        &self,
        pair: &TradingPair,
        depth: usize,
    ) -> Result<BookSnapshot, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(pair, PairCommand::Snapshot { depth, reply: tx }, rx)
            .await
    }

    /// Credit external funds into `available`.
    pub fn deposit(
        &self,
        user_id: i64,
        asset: &str,
        amount: Decimal,
    ) -> Result<AccountView, EngineError> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::InvalidOrder(
                "deposit amount must be positive".to_string(),
            ));
        }
        let amount = decimal::normalize(amount);
        let view = self.balances.credit_available(user_id, asset, amount)?;
        self.emit_balance(&view, BalanceChangeReason::Deposit, Some(amount));
        Ok(view)
    }

    /// Debit external funds from `available`.
    pub fn withdraw(
        &self,
        user_id: i64,
        asset: &str,
        amount: Decimal,
    ) -> Result<AccountView, EngineError> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::InvalidOrder(
                "withdraw amount must be positive".to_string(),
            ));
        }
        let amount = decimal::normalize(amount);
        let view = self.balances.debit_available(user_id, asset, amount)?;
        self.emit_balance(&view, BalanceChangeReason::Withdraw, Some(-amount));
        Ok(view)
    }

    /// Apply an externally computed available-balance delta (out-of-band
    /// credit, post-restart reconciliation). Hard error below zero.
    pub fn sync_available(
        &self,
        user_id: i64,
        asset: &str,
        delta: Decimal,
    ) -> Result<AccountView, EngineError> {
        let delta = decimal::normalize(delta);
        let view = self.balances.apply_available_delta(user_id, asset, delta)?;
        self.emit_balance(&view, BalanceChangeReason::Sync, Some(delta));
        Ok(view)
    }

    fn emit_balance(&self, view: &AccountView, reason: BalanceChangeReason, delta: Option<Decimal>) {
        self.events.append(
            BALANCES_PARTITION,
            ExchangeEvent::BalanceChanged(BalanceChangedPayload {
                user_id: view.user_id,
                asset: view.asset.clone(),
                available: view.available,
                locked: view.locked,
                version: view.version,
                reason,
                delta,
                created_at: now_millis(),
            }),
        );
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Replay durable state after a restart.
    ///
    /// Balances load via `set` (the durable rows are authoritative), open
    /// limit orders re-seat through the lock-skipping path because the
    /// `locked` column already reflects them, and the id allocators resume
    /// above the highest persisted ids.
    pub async fn recover(
        &self,
        balances: Vec<AccountView>,
        mut open_orders: Vec<OrderEntry>,
        max_order_id: i64,
        max_trade_id: i64,
    ) -> Result<RecoveryStats, EngineError> {
        let mut stats = RecoveryStats::default();

        for row in balances {
            self.balances
                .set(row.user_id, &row.asset, row.available, row.locked);
            stats.balances += 1;
        }

        self.order_ids.fetch_max(max_order_id, AtomicOrdering::SeqCst);
        self.trade_ids.fetch_max(max_trade_id, AtomicOrdering::SeqCst);

        // Time priority is queue order, so replay oldest first.
        open_orders.sort_by_key(|o| (o.created_at, o.id));
        for entry in open_orders {
            let pair = entry.pair.clone();
            let (tx, rx) = oneshot::channel();
            self.dispatch(&pair, PairCommand::Restore { entry, reply: tx }, rx)
                .await??;
            stats.orders += 1;
        }

        info!(
            "Recovery replayed {} balance rows and {} open orders",
            stats.balances, stats.orders
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::types::{OrderKind, OrderStatus, Side};
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn test_engine() -> Engine {
        Engine::new(
            EngineConfig {
                depth_publish_every: 0,
                ..EngineConfig::default()
            },
            Arc::new(BalanceStore::new()),
            Arc::new(EventLog::new(Uuid::new_v4(), 4096)),
        )
    }

    fn pair() -> TradingPair {
        TradingPair::new("SOL", "USDT")
    }

    fn limit(user_id: i64, side: Side, price: Decimal, amount: Decimal) -> SubmitOrder {
        SubmitOrder {
            id: None,
            user_id,
            side,
            kind: OrderKind::Limit,
            pair: pair(),
            price: Some(price),
            amount: Some(amount),
            quote_amount: None,
            created_at: None,
        }
    }

    #[tokio::test]
    async fn test_submit_and_cancel_through_channels() {
        let engine = test_engine();
        engine.deposit(1, "USDT", dec!(1000)).unwrap();

        let ack = engine
            .submit_order(limit(1, Side::Buy, dec!(100), dec!(5)))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Pending);
        assert_eq!(engine.balances().get(1, "USDT").locked, dec!(500));

        let cancel = engine.cancel_order(&pair(), ack.order_id, 1).await.unwrap();
        assert_eq!(cancel.released_amount, dec!(500));
        assert_eq!(engine.balances().get(1, "USDT").locked, dec!(0));

        assert!(matches!(
            engine.cancel_order(&pair(), ack.order_id, 1).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_commands_for_one_pair_are_serialized() {
        let engine = Arc::new(test_engine());
        engine.deposit(1, "SOL", dec!(100)).unwrap();
        engine.deposit(2, "USDT", dec!(100000)).unwrap();

        let seller = Arc::clone(&engine);
        let sells = tokio::spawn(async move {
            for _ in 0..50 {
                seller
                    .submit_order(limit(1, Side::Sell, dec!(100), dec!(1)))
                    .await
                    .unwrap();
            }
        });
        let buyer = Arc::clone(&engine);
        let buys = tokio::spawn(async move {
            for _ in 0..50 {
                let _ = buyer
                    .submit_order(limit(2, Side::Buy, dec!(100), dec!(1)))
                    .await
                    .unwrap();
            }
        });
        sells.await.unwrap();
        buys.await.unwrap();

        // whatever interleaving occurred, nothing was minted or destroyed
        assert_eq!(engine.balances().total_supply("SOL"), dec!(100));
        assert_eq!(engine.balances().total_supply("USDT"), dec!(100000));
    }

    #[tokio::test]
    async fn test_snapshot_book_depth() {
        let engine = test_engine();
        engine.deposit(1, "USDT", dec!(10000)).unwrap();
        engine
            .submit_order(limit(1, Side::Buy, dec!(99), dec!(2)))
            .await
            .unwrap();
        engine
            .submit_order(limit(1, Side::Buy, dec!(100), dec!(1)))
            .await
            .unwrap();

        let snapshot = engine.snapshot_book(&pair(), 1).await.unwrap();
        assert_eq!(snapshot.bids.len(), 1);
        assert_eq!(snapshot.bids[0][0], "100");
        assert!(snapshot.asks.is_empty());
    }

    #[tokio::test]
    async fn test_deposit_withdraw_sync() {
        let engine = test_engine();
        let view = engine.deposit(1, "USDT", dec!(100)).unwrap();
        assert_eq!(view.available, dec!(100));

        assert!(matches!(
            engine.deposit(1, "USDT", dec!(0)),
            Err(EngineError::InvalidOrder(_))
        ));

        let view = engine.withdraw(1, "USDT", dec!(30)).unwrap();
        assert_eq!(view.available, dec!(70));
        assert!(matches!(
            engine.withdraw(1, "USDT", dec!(1000)),
            Err(EngineError::InsufficientAvailable { .. })
        ));

        let view = engine.sync_available(1, "USDT", dec!(-70)).unwrap();
        assert_eq!(view.available, dec!(0));
        assert!(matches!(
            engine.sync_available(1, "USDT", dec!(-1)),
            Err(EngineError::InsufficientAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_recovery_reseats_open_orders() {
        let engine = test_engine();

        let balances = vec![
            AccountView {
                user_id: 1,
                asset: "USDT".to_string(),
                available: dec!(500),
                locked: dec!(500),
                version: 0,
            },
            AccountView {
                user_id: 2,
                asset: "SOL".to_string(),
                available: dec!(0),
                locked: dec!(10),
                version: 0,
            },
        ];
        let open_orders = vec![
            OrderEntry {
                id: 7,
                user_id: 1,
                side: Side::Buy,
                kind: OrderKind::Limit,
                pair: pair(),
                price: Some(dec!(100)),
                amount: dec!(5),
                quote_amount: None,
                filled_amount: Decimal::ZERO,
                filled_quote_amount: Decimal::ZERO,
                remaining_amount: dec!(5),
                remaining_quote_amount: Decimal::ZERO,
                created_at: 1,
            },
            OrderEntry {
                id: 9,
                user_id: 2,
                side: Side::Sell,
                kind: OrderKind::Limit,
                pair: pair(),
                price: Some(dec!(110)),
                amount: dec!(10),
                quote_amount: None,
                filled_amount: Decimal::ZERO,
                filled_quote_amount: Decimal::ZERO,
                remaining_amount: dec!(10),
                remaining_quote_amount: Decimal::ZERO,
                created_at: 2,
            },
        ];

        let stats = engine.recover(balances, open_orders, 9, 3).await.unwrap();
        assert_eq!(stats.balances, 2);
        assert_eq!(stats.orders, 2);

        // replay must not touch balances: locked already reflects the orders
        assert_eq!(engine.balances().get(1, "USDT").locked, dec!(500));
        assert_eq!(engine.balances().get(2, "SOL").locked, dec!(10));

        let snapshot = engine.snapshot_book(&pair(), 10).await.unwrap();
        assert_eq!(snapshot.bids[0], ["100".to_string(), "5".to_string()]);
        assert_eq!(snapshot.asks[0], ["110".to_string(), "10".to_string()]);

        // fresh ids continue above the replayed maximum
        engine.deposit(3, "USDT", dec!(1000)).unwrap();
        let ack = engine
            .submit_order(limit(3, Side::Buy, dec!(90), dec!(1)))
            .await
            .unwrap();
        assert!(ack.order_id > 9);
    }

    // ========================================================================
    // Property tests (engine invariants)
    // ========================================================================

    #[derive(Debug, Clone)]
    enum Op {
        LimitOrder { user: i64, buy: bool, price: u32, amount: u32 },
        MarketSell { user: i64, amount: u32 },
        MarketBuy { user: i64, quote: u32 },
        Cancel { user: i64, nth: usize },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1i64..=4, any::<bool>(), 1u32..=20, 1u32..=10).prop_map(
                |(user, buy, price, amount)| Op::LimitOrder {
                    user,
                    buy,
                    price,
                    amount
                }
            ),
            (1i64..=4, 1u32..=10).prop_map(|(user, amount)| Op::MarketSell { user, amount }),
            (1i64..=4, 1u32..=200).prop_map(|(user, quote)| Op::MarketBuy { user, quote }),
            (1i64..=4, 0usize..8).prop_map(|(user, nth)| Op::Cancel { user, nth }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_engine_invariants(ops in prop::collection::vec(op_strategy(), 1..40)) {
            let balances = Arc::new(BalanceStore::new());
            let events = Arc::new(EventLog::new(Uuid::new_v4(), 8192));
            let mut w = worker::PairWorker::new(
                pair(),
                Arc::clone(&balances),
                events,
                Arc::new(AtomicI64::new(0)),
                Arc::new(AtomicI64::new(0)),
                0,
            );

            for user in 1..=4 {
                balances.set(user, "USDT", dec!(100000), Decimal::ZERO);
                balances.set(user, "SOL", dec!(1000), Decimal::ZERO);
            }

            let mut resting: Vec<(i64, i64)> = Vec::new(); // (order_id, user)
            for op in ops {
                match op {
                    Op::LimitOrder { user, buy, price, amount } => {
                        let side = if buy { Side::Buy } else { Side::Sell };
                        let order = limit(user, side, Decimal::from(price), Decimal::from(amount));
                        if let Ok(ack) = w.handle_submit(order) {
                            for fill in &ack.matches {
                                prop_assert_ne!(fill.buyer_id, fill.seller_id);
                            }
                            if matches!(ack.status, OrderStatus::Pending | OrderStatus::Partial) {
                                resting.push((ack.order_id, user));
                            }
                        }
                    }
                    Op::MarketSell { user, amount } => {
                        let order = SubmitOrder {
                            id: None,
                            user_id: user,
                            side: Side::Sell,
                            kind: OrderKind::Market,
                            pair: pair(),
                            price: None,
                            amount: Some(Decimal::from(amount)),
                            quote_amount: None,
                            created_at: None,
                        };
                        if let Ok(ack) = w.handle_submit(order) {
                            for fill in &ack.matches {
                                prop_assert_ne!(fill.buyer_id, fill.seller_id);
                            }
                            prop_assert!(ack.status.is_terminal());
                        }
                    }
                    Op::MarketBuy { user, quote } => {
                        let order = SubmitOrder {
                            id: None,
                            user_id: user,
                            side: Side::Buy,
                            kind: OrderKind::Market,
                            pair: pair(),
                            price: None,
                            amount: None,
                            quote_amount: Some(Decimal::from(quote)),
                            created_at: None,
                        };
                        if let Ok(ack) = w.handle_submit(order) {
                            for fill in &ack.matches {
                                prop_assert_ne!(fill.buyer_id, fill.seller_id);
                            }
                            prop_assert!(ack.status.is_terminal());
                        }
                    }
                    Op::Cancel { user, nth } => {
                        if let Some(&(order_id, owner)) = resting.get(nth) {
                            match w.handle_cancel(order_id, user) {
                                Ok(_) => {
                                    prop_assert_eq!(owner, user);
                                    resting.retain(|&(id, _)| id != order_id);
                                }
                                Err(EngineError::Forbidden(_)) => prop_assert_ne!(owner, user),
                                Err(EngineError::NotFound(_)) => {
                                    // already filled in the meantime
                                    resting.retain(|&(id, _)| id != order_id);
                                }
                                Err(e) => prop_assert!(false, "unexpected cancel error: {}", e),
                            }
                        }
                    }
                }
            }

            // mass conservation: no deposits or withdrawals happened above
            prop_assert_eq!(balances.total_supply("USDT"), dec!(400000));
            prop_assert_eq!(balances.total_supply("SOL"), dec!(4000));

            // no account ever goes negative
            for view in balances.snapshot_all() {
                prop_assert!(view.available >= Decimal::ZERO);
                prop_assert!(view.locked >= Decimal::ZERO);
            }
        }
    }
}
