//! Trade Consumer
//!
//! Projects engine events into the durable `orders` / `trades` /
//! `trade_fees` tables. Delivery is at-least-once, so every application is
//! idempotent: trades key on the engine-assigned trade id, order rows upsert
//! with `ON CONFLICT DO NOTHING`, and terminal statuses never regress.
//!
//! Failures retry with capped exponential backoff; an event that exhausts
//! its retries goes to the dead-letter partition and alerts rather than
//! being dropped.

use rust_decimal::Decimal;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::engine::decimal;
use crate::engine::types::{OrderKind, OrderStatus};
use crate::events::{
    EventEnvelope, EventLog, ExchangeEvent, OrderAcceptedPayload, OrderCancelledPayload,
    OrderDonePayload, TradeExecutedPayload, DEAD_LETTER_PARTITION,
};
use crate::metrics::names;
use crate::services::fees::{FeeCalculator, FeeType};

use super::backoff::BackoffPolicy;

/// One order row's fill-relevant columns, as read under the row lock.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct OrderFillState {
    pub id: i64,
    pub amount: Decimal,
    pub filled_amount: Decimal,
    pub filled_quote_amount: Decimal,
    pub status: OrderStatus,
    pub order_type: OrderKind,
    pub quote_amount: Option<Decimal>,
}

impl OrderFillState {
    /// True for quote-denominated market buys, whose `amount` accumulates
    /// from fills.
    pub fn is_quote_mode(&self) -> bool {
        self.order_type == OrderKind::Market && self.quote_amount.is_some()
    }
}

/// Pure fill application: accumulate fills and step the status machine.
/// Terminal statuses never regress; quote-mode orders only reach `filled`
/// via their `order_done` event.
pub fn apply_fill(state: &OrderFillState, fill_amount: Decimal, fill_quote: Decimal) -> OrderFillState {
    let mut next = state.clone();
    next.filled_amount += fill_amount;
    next.filled_quote_amount += fill_quote;
    if next.is_quote_mode() {
        next.amount += fill_amount;
    }

    next.status = if !next.is_quote_mode()
        && decimal::is_non_negative_after_epsilon(next.filled_amount, next.amount)
    {
        OrderStatus::Filled
    } else if next.status == OrderStatus::Pending {
        OrderStatus::Partial
    } else {
        next.status
    };
    next
}

/// Applies order/trade events to Postgres.
pub struct TradeConsumer {
    pool: PgPool,
    fees: Arc<FeeCalculator>,
    backoff: BackoffPolicy,
    events: Arc<EventLog>,
}

impl TradeConsumer {
    pub fn new(
        pool: PgPool,
        fees: Arc<FeeCalculator>,
        backoff: BackoffPolicy,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            pool,
            fees,
            backoff,
            events,
        }
    }

    /// Consume the event spine until the engine shuts down.
    pub async fn run(self, mut rx: broadcast::Receiver<EventEnvelope>) {
        info!("Trade consumer started");
        loop {
            match rx.recv().await {
                Ok(envelope) => self.apply_with_retry(envelope).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Trade consumer lagged {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Event channel closed, stopping trade consumer");
                    break;
                }
            }
        }
    }

    async fn apply_with_retry(&self, envelope: EventEnvelope) {
        if !matches!(
            envelope.event,
            ExchangeEvent::OrderAccepted(_)
                | ExchangeEvent::TradeExecuted(_)
                | ExchangeEvent::OrderCancelled(_)
                | ExchangeEvent::OrderDone(_)
        ) {
            return;
        }

        for attempt in 0..self.backoff.max_retries {
            match self.apply(&envelope.event).await {
                Ok(()) => {
                    metrics::counter!(names::CONSUMER_EVENTS_APPLIED_TOTAL).increment(1);
                    return;
                }
                Err(e) => {
                    warn!(
                        "Applying {} offset={} failed (attempt {}/{}): {}",
                        envelope.partition,
                        envelope.offset,
                        attempt + 1,
                        self.backoff.max_retries,
                        e
                    );
                    metrics::counter!(names::CONSUMER_RETRIES_TOTAL).increment(1);
                    tokio::time::sleep(self.backoff.delay(attempt)).await;
                }
            }
        }

        error!(
            "Event {} offset={} exhausted retries, dead-lettering",
            envelope.partition, envelope.offset
        );
        metrics::counter!(names::CONSUMER_DEAD_LETTERED_TOTAL).increment(1);
        self.events
            .append(DEAD_LETTER_PARTITION, envelope.event.clone());
    }

    async fn apply(&self, event: &ExchangeEvent) -> Result<(), sqlx::Error> {
        match event {
            ExchangeEvent::OrderAccepted(p) => self.apply_accepted(p).await,
            ExchangeEvent::TradeExecuted(p) => self.apply_trade(p).await,
            ExchangeEvent::OrderCancelled(p) => self.apply_cancelled(p).await,
            ExchangeEvent::OrderDone(p) => self.apply_done(p).await,
            _ => Ok(()),
        }
    }

    /// Create the order row in its initial (or rejected) state.
    async fn apply_accepted(&self, p: &OrderAcceptedPayload) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO orders
                (id, user_id, order_type, order_side, base_mint, quote_mint,
                 price, amount, quote_amount, filled_amount, filled_quote_amount,
                 status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, 0, $10,
                    to_timestamp($11::double precision / 1000), NOW())
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(p.order_id)
        .bind(p.user_id)
        .bind(p.order_kind)
        .bind(p.side)
        .bind(&p.pair.base)
        .bind(&p.pair.quote)
        .bind(p.price)
        .bind(p.amount)
        .bind(p.quote_amount)
        .bind(p.status)
        .bind(p.created_at as f64)
        .execute(&self.pool)
        .await?;

        debug!("Projected order {} as {}", p.order_id, p.status);
        Ok(())
    }

    /// Insert the trade and roll both orders forward, all in one
    /// transaction under per-order row locks taken in ascending id order.
    async fn apply_trade(&self, p: &TradeExecutedPayload) -> Result<(), sqlx::Error> {
        let fill_quote = decimal::mul(p.price, p.amount);
        let mut ids = [p.buy_order_id, p.sell_order_id];
        ids.sort_unstable();

        let mut tx = self.pool.begin().await?;

        let locked: Vec<OrderFillState> = sqlx::query_as(
            r#"
            SELECT id, amount, filled_amount, filled_quote_amount, status,
                   order_type, quote_amount
            FROM orders
            WHERE id = ANY($1)
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(&ids[..])
        .fetch_all(&mut *tx)
        .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO trades
                (id, buy_order_id, sell_order_id, buyer_id, seller_id,
                 base_mint, quote_mint, price, amount, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9,
                    to_timestamp($10::double precision / 1000))
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(p.trade_id)
        .bind(p.buy_order_id)
        .bind(p.sell_order_id)
        .bind(p.buyer_id)
        .bind(p.seller_id)
        .bind(&p.pair.base)
        .bind(&p.pair.quote)
        .bind(p.price)
        .bind(p.amount)
        .bind(p.created_at as f64)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            // Redelivery: the trade id is the idempotence key.
            tx.commit().await?;
            debug!("Trade {} already applied, skipping", p.trade_id);
            return Ok(());
        }

        for state in &locked {
            let next = apply_fill(state, p.amount, fill_quote);
            sqlx::query(
                r#"
                UPDATE orders
                SET amount = $2,
                    filled_amount = $3,
                    filled_quote_amount = $4,
                    status = $5,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(state.id)
            .bind(next.amount)
            .bind(next.filled_amount)
            .bind(next.filled_quote_amount)
            .bind(next.status)
            .execute(&mut *tx)
            .await?;
        }

        for (user_id, fee_type) in [(p.buyer_id, FeeType::Buyer), (p.seller_id, FeeType::Seller)] {
            let fee = self.fees.fee_for(&p.pair, fee_type, fill_quote);
            sqlx::query(
                r#"
                INSERT INTO trade_fees
                    (trade_id, user_id, fee_type, fee_rate, fee_amount,
                     fee_mint, trade_value, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7,
                        to_timestamp($8::double precision / 1000))
                "#,
            )
            .bind(p.trade_id)
            .bind(user_id)
            .bind(fee_type)
            .bind(fee.rate)
            .bind(fee.amount)
            .bind(&p.pair.quote)
            .bind(fill_quote)
            .bind(p.created_at as f64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            "Applied trade {} ({} @ {} on {})",
            p.trade_id, p.amount, p.price, p.pair
        );
        Ok(())
    }

    /// Terminal cancel; already-terminal orders are left untouched.
    async fn apply_cancelled(&self, p: &OrderCancelledPayload) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE orders
            SET status = 'cancelled', updated_at = NOW()
            WHERE id = $1
              AND status NOT IN ('cancelled', 'filled', 'rejected')
            "#,
        )
        .bind(p.order_id)
        .execute(&self.pool)
        .await?;

        debug!("Projected cancel for order {}", p.order_id);
        Ok(())
    }

    /// Terminal state for market orders (filled or cancelled).
    async fn apply_done(&self, p: &OrderDonePayload) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, updated_at = NOW()
            WHERE id = $1
              AND status NOT IN ('cancelled', 'filled', 'rejected')
            "#,
        )
        .bind(p.order_id)
        .bind(p.status)
        .execute(&self.pool)
        .await?;

        debug!("Projected terminal {} for order {}", p.status, p.order_id);
        Ok(())
    }
}
