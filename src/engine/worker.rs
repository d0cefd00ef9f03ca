//! Pair Loop
//!
//! Each trading pair is served by one task consuming a bounded command
//! channel. The loop owns the pair's order book outright; matching,
//! execution, and book mutation never suspend, so commands for a pair are
//! strictly serialized and a trade's side effects are complete before the
//! next command is dequeued. The shared balance store is the only cross-pair
//! resource.

use rust_decimal::Decimal;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::events::{
    BalanceChangeReason, BalanceChangedPayload, DepthSnapshotPayload, EventLog, ExchangeEvent,
    OrderAcceptedPayload, OrderCancelledPayload, OrderDonePayload, TradeExecutedPayload,
    BALANCES_PARTITION,
};
use crate::metrics::{labels, names};

use super::balance::{AccountView, BalanceStore};
use super::book::OrderBook;
use super::decimal;
use super::error::{BalanceError, EngineError};
use super::executor;
use super::matcher;
use super::types::{
    BookSnapshot, CancelAck, OrderEntry, OrderKind, OrderStatus, Side, SubmitAck, SubmitOrder,
    TradingPair,
};

/// Depth levels included in periodic snapshot events.
const DEPTH_EVENT_LEVELS: usize = 20;

/// Commands a pair loop consumes.
pub(crate) enum PairCommand {
    Submit {
        order: SubmitOrder,
        reply: oneshot::Sender<Result<SubmitAck, EngineError>>,
    },
    /// Re-seat an order during recovery, skipping the balance lock: the
    /// durable `locked` column already reflects it.
    Restore {
        entry: OrderEntry,
        reply: oneshot::Sender<Result<SubmitAck, EngineError>>,
    },
    Cancel {
        order_id: i64,
        user_id: i64,
        reply: oneshot::Sender<Result<CancelAck, EngineError>>,
    },
    Snapshot {
        depth: usize,
        reply: oneshot::Sender<BookSnapshot>,
    },
}

pub(crate) struct PairWorker {
    book: OrderBook,
    balances: Arc<BalanceStore>,
    events: Arc<EventLog>,
    order_ids: Arc<AtomicI64>,
    trade_ids: Arc<AtomicI64>,
    depth_publish_every: u64,
    mutations: u64,
    halted: bool,
}

impl PairWorker {
    pub fn new(
        pair: TradingPair,
        balances: Arc<BalanceStore>,
        events: Arc<EventLog>,
        order_ids: Arc<AtomicI64>,
        trade_ids: Arc<AtomicI64>,
        depth_publish_every: u64,
    ) -> Self {
        Self {
            book: OrderBook::new(pair),
            balances,
            events,
            order_ids,
            trade_ids,
            depth_publish_every,
            mutations: 0,
            halted: false,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<PairCommand>) {
        let pair = self.book.pair.clone();
        info!("Pair loop started for {}", pair);

        while let Some(command) = rx.recv().await {
            match command {
                PairCommand::Submit { order, reply } => {
                    let result = self.handle_submit(order);
                    let _ = reply.send(result);
                }
                PairCommand::Restore { entry, reply } => {
                    let result = self.handle_restore(entry);
                    let _ = reply.send(result);
                }
                PairCommand::Cancel {
                    order_id,
                    user_id,
                    reply,
                } => {
                    let result = self.handle_cancel(order_id, user_id);
                    let _ = reply.send(result);
                }
                PairCommand::Snapshot { depth, reply } => {
                    let _ = reply.send(self.book.snapshot(depth, now_millis()));
                }
            }

            if self.halted {
                // A settlement transfer found less locked than the engine
                // reserved. Continuing would cascade double-spends; the loop
                // stops and the operator must intervene.
                error!(
                    "Pair loop for {} halted on a locked-balance invariant breach",
                    pair
                );
                metrics::counter!(names::PAIR_LOOPS_HALTED_TOTAL).increment(1);
                break;
            }
        }

        info!("Pair loop stopped for {}", pair);
    }

    // ========================================================================
    // Submit
    // ========================================================================

    pub(crate) fn handle_submit(&mut self, order: SubmitOrder) -> Result<SubmitAck, EngineError> {
        matcher::validate(&order)?;

        let order_id = order
            .id
            .unwrap_or_else(|| self.order_ids.fetch_add(1, AtomicOrdering::SeqCst) + 1);
        let created_at = order.created_at.unwrap_or_else(now_millis);
        let price = order.price.map(decimal::normalize);
        let amount = order.amount.map(decimal::normalize).unwrap_or(Decimal::ZERO);
        let quote_amount = order.quote_amount.map(decimal::normalize);

        let entry = OrderEntry {
            id: order_id,
            user_id: order.user_id,
            side: order.side,
            kind: order.kind,
            pair: self.book.pair.clone(),
            price,
            amount,
            quote_amount,
            filled_amount: Decimal::ZERO,
            filled_quote_amount: Decimal::ZERO,
            remaining_amount: amount,
            remaining_quote_amount: quote_amount.unwrap_or(Decimal::ZERO),
            created_at,
        };

        let (lock_asset, lock_amount) = required_lock(&entry);
        match self.balances.lock(entry.user_id, &lock_asset, lock_amount) {
            Ok(view) => self.emit_balance(view, BalanceChangeReason::OrderLock, None),
            Err(BalanceError::InsufficientAvailable { user_id, asset }) => {
                self.emit_accepted(&entry, OrderStatus::Rejected);
                metrics::counter!(names::ORDERS_REJECTED_TOTAL).increment(1);
                return Err(EngineError::InsufficientAvailable { user_id, asset });
            }
            Err(e) => return Err(e.into()),
        }

        self.emit_accepted(&entry, OrderStatus::Pending);
        self.process(entry)
    }

    fn handle_restore(&mut self, entry: OrderEntry) -> Result<SubmitAck, EngineError> {
        if entry.kind != OrderKind::Limit || entry.price.is_none() {
            return Err(EngineError::InvalidOrder(
                "only limit orders can be restored".to_string(),
            ));
        }
        // No lock, no accepted event: both already durable.
        self.process(entry)
    }

    /// Shared post-lock pipeline: match, settle fills, release surplus,
    /// rest or finalize the residual.
    fn process(&mut self, mut entry: OrderEntry) -> Result<SubmitAck, EngineError> {
        let pair = self.book.pair.clone();
        let slug = pair.slug();
        let order_id = entry.id;

        let match_started = std::time::Instant::now();
        let outcome = matcher::match_incoming(&mut entry, &mut self.book);
        metrics::histogram!(names::ORDER_MATCH_DURATION_SECONDS)
            .record(match_started.elapsed().as_secs_f64());

        let mut matches = Vec::with_capacity(outcome.fills.len());
        for fill in outcome.fills {
            let settled = match executor::apply(&self.balances, &fill) {
                Ok(settled) => settled,
                Err(e) => {
                    self.halted = true;
                    error!("Fatal settlement failure for {}: {}", pair, e);
                    return Err(e.into());
                }
            };
            for view in [
                settled.buyer_quote,
                settled.seller_quote,
                settled.seller_base,
                settled.buyer_base,
            ] {
                self.emit_balance(view, BalanceChangeReason::TradeSettlement, None);
            }

            let trade_id = self.trade_ids.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            self.events.append(
                &slug,
                ExchangeEvent::TradeExecuted(TradeExecutedPayload {
                    trade_id,
                    buy_order_id: fill.buy_order_id,
                    sell_order_id: fill.sell_order_id,
                    buyer_id: fill.buyer_id,
                    seller_id: fill.seller_id,
                    pair: pair.clone(),
                    price: fill.price,
                    amount: fill.amount,
                    created_at: now_millis(),
                }),
            );
            metrics::counter!(names::TRADES_EXECUTED_TOTAL, labels::PAIR => slug.clone())
                .increment(1);
            matches.push(fill);
        }

        for completed in &outcome.completed {
            self.release_buy_surplus(completed)?;
        }

        let status = match entry.kind {
            OrderKind::Limit => {
                if entry.remaining_amount > Decimal::ZERO {
                    let status = if entry.filled_amount > Decimal::ZERO {
                        OrderStatus::Partial
                    } else {
                        OrderStatus::Pending
                    };
                    self.book.insert(entry);
                    status
                } else {
                    self.release_buy_surplus(&entry)?;
                    OrderStatus::Filled
                }
            }
            OrderKind::Market => {
                // Market orders never rest: the unmatched portion of the
                // lock goes straight back to available.
                let (asset, residual) = if entry.is_quote_mode() {
                    (pair.quote.clone(), entry.remaining_quote_amount)
                } else {
                    (pair.base.clone(), entry.remaining_amount)
                };
                let released = if residual > Decimal::ZERO {
                    self.unlock_or_halt(entry.user_id, &asset, residual)?;
                    Some(residual)
                } else {
                    None
                };
                let status = if entry.filled_amount > Decimal::ZERO {
                    OrderStatus::Filled
                } else {
                    OrderStatus::Cancelled
                };
                self.events.append(
                    &slug,
                    ExchangeEvent::OrderDone(OrderDonePayload {
                        order_id: entry.id,
                        user_id: entry.user_id,
                        pair: pair.clone(),
                        status,
                        amount: entry.amount,
                        filled_amount: entry.filled_amount,
                        filled_quote_amount: entry.filled_quote_amount,
                        released_asset: released.map(|_| asset),
                        released_amount: released,
                        created_at: now_millis(),
                    }),
                );
                status
            }
        };

        metrics::counter!(names::ORDERS_SUBMITTED_TOTAL, labels::PAIR => slug.clone())
            .increment(1);
        self.after_mutation();

        Ok(SubmitAck {
            order_id,
            matches,
            status,
        })
    }

    // ========================================================================
    // Cancel
    // ========================================================================

    pub(crate) fn handle_cancel(&mut self, order_id: i64, user_id: i64) -> Result<CancelAck, EngineError> {
        let Some(owner) = self.book.get(order_id).map(|e| e.user_id) else {
            return Err(EngineError::NotFound(order_id));
        };
        if owner != user_id {
            warn!(
                "User {} attempted to cancel order {} owned by {}",
                user_id, order_id, owner
            );
            return Err(EngineError::Forbidden(order_id));
        }

        let entry = self
            .book
            .remove(order_id)
            .ok_or(EngineError::NotFound(order_id))?;

        let (asset, residual) = locked_residual(&entry);
        if residual > Decimal::ZERO {
            self.unlock_or_halt(entry.user_id, &asset, residual)?;
        }

        self.events.append(
            &self.book.pair.slug(),
            ExchangeEvent::OrderCancelled(OrderCancelledPayload {
                order_id,
                user_id,
                pair: self.book.pair.clone(),
                released_asset: asset.clone(),
                released_amount: residual,
                created_at: now_millis(),
            }),
        );
        metrics::counter!(names::ORDERS_CANCELLED_TOTAL).increment(1);
        self.after_mutation();

        Ok(CancelAck {
            order_id,
            released_asset: asset,
            released_amount: residual,
        })
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// A buy limit locks `price * amount`, but taker-phase fills can execute
    /// below the limit; the difference stays locked until the order leaves
    /// the book. Release it on completion.
    fn release_buy_surplus(&mut self, entry: &OrderEntry) -> Result<(), EngineError> {
        if entry.side != Side::Buy || entry.kind != OrderKind::Limit {
            return Ok(());
        }
        let Some(price) = entry.price else {
            return Ok(());
        };
        let surplus = decimal::mul(price, entry.amount) - entry.filled_quote_amount;
        if surplus > Decimal::ZERO {
            self.unlock_or_halt(entry.user_id, &entry.pair.quote, surplus)?;
        }
        Ok(())
    }

    fn unlock_or_halt(
        &mut self,
        user_id: i64,
        asset: &str,
        amount: Decimal,
    ) -> Result<(), EngineError> {
        match self.balances.unlock(user_id, asset, amount) {
            Ok(view) => {
                self.emit_balance(view, BalanceChangeReason::OrderRelease, None);
                Ok(())
            }
            Err(e) => {
                // Anything short here means the lock ledger and the book
                // disagree, the same invariant breach as a failed transfer.
                self.halted = true;
                error!(
                    "Fatal release failure for user {} asset {}: {}",
                    user_id, asset, e
                );
                Err(e.into())
            }
        }
    }

    fn emit_accepted(&self, entry: &OrderEntry, status: OrderStatus) {
        self.events.append(
            &entry.pair.slug(),
            ExchangeEvent::OrderAccepted(OrderAcceptedPayload {
                order_id: entry.id,
                user_id: entry.user_id,
                side: entry.side,
                order_kind: entry.kind,
                pair: entry.pair.clone(),
                price: entry.price,
                amount: entry.amount,
                quote_amount: entry.quote_amount,
                status,
                created_at: entry.created_at,
            }),
        );
    }

    fn emit_balance(
        &self,
        view: AccountView,
        reason: BalanceChangeReason,
        delta: Option<Decimal>,
    ) {
        self.events.append(
            BALANCES_PARTITION,
            ExchangeEvent::BalanceChanged(BalanceChangedPayload {
                user_id: view.user_id,
                asset: view.asset,
                available: view.available,
                locked: view.locked,
                version: view.version,
                reason,
                delta,
                created_at: now_millis(),
            }),
        );
    }

    fn after_mutation(&mut self) {
        self.mutations += 1;
        if self.depth_publish_every > 0 && self.mutations % self.depth_publish_every == 0 {
            let snapshot = self.book.snapshot(DEPTH_EVENT_LEVELS, now_millis());
            self.events.append(
                &self.book.pair.slug(),
                ExchangeEvent::DepthSnapshot(DepthSnapshotPayload {
                    pair: snapshot.pair,
                    bids: snapshot.bids,
                    asks: snapshot.asks,
                    created_at: snapshot.timestamp,
                }),
            );
        }
    }
}

/// Asset and amount a fresh submit must lock.
fn required_lock(entry: &OrderEntry) -> (String, Decimal) {
    match (entry.side, entry.kind) {
        (Side::Buy, OrderKind::Limit) => (
            entry.pair.quote.clone(),
            decimal::mul(entry.price.unwrap_or(Decimal::ZERO), entry.amount),
        ),
        (Side::Buy, OrderKind::Market) => (
            entry.pair.quote.clone(),
            entry.quote_amount.unwrap_or(Decimal::ZERO),
        ),
        (Side::Sell, _) => (entry.pair.base.clone(), entry.amount),
    }
}

/// Lock residual still held for a resting entry.
fn locked_residual(entry: &OrderEntry) -> (String, Decimal) {
    match entry.side {
        Side::Sell => (entry.pair.base.clone(), entry.remaining_amount),
        Side::Buy => {
            let price = entry.price.unwrap_or(Decimal::ZERO);
            (
                entry.pair.quote.clone(),
                decimal::mul(price, entry.amount) - entry.filled_quote_amount,
            )
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
