//! Balance Projector
//!
//! Mirrors `balance_changed` post-state snapshots into the durable
//! `user_balances` table. Each event carries the account's mutation version,
//! so the upsert is idempotent and tolerant of redelivery: stale versions
//! never overwrite newer state. Recovery reads this table back via
//! `BalanceStore::set`.

use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::events::{BalanceChangedPayload, EventEnvelope, ExchangeEvent};
use crate::metrics::names;

use super::backoff::BackoffPolicy;

pub struct BalanceProjector {
    pool: PgPool,
    backoff: BackoffPolicy,
}

impl BalanceProjector {
    pub fn new(pool: PgPool, backoff: BackoffPolicy) -> Self {
        Self { pool, backoff }
    }

    pub async fn run(self, mut rx: broadcast::Receiver<EventEnvelope>) {
        info!("Balance projector started");
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if let ExchangeEvent::BalanceChanged(payload) = &envelope.event {
                        self.apply_with_retry(payload).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Balance projector lagged {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Event channel closed, stopping balance projector");
                    break;
                }
            }
        }
    }

    async fn apply_with_retry(&self, payload: &BalanceChangedPayload) {
        for attempt in 0..self.backoff.max_retries {
            match self.upsert(payload).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(
                        "Balance upsert for user {} {} failed (attempt {}/{}): {}",
                        payload.user_id,
                        payload.asset,
                        attempt + 1,
                        self.backoff.max_retries,
                        e
                    );
                    metrics::counter!(names::CONSUMER_RETRIES_TOTAL).increment(1);
                    tokio::time::sleep(self.backoff.delay(attempt)).await;
                }
            }
        }
        // The next event for this account carries a fresher snapshot, so the
        // row heals on its own; still alert loudly.
        error!(
            "Balance upsert for user {} {} exhausted retries",
            payload.user_id, payload.asset
        );
        metrics::counter!(names::CONSUMER_DEAD_LETTERED_TOTAL).increment(1);
    }

    async fn upsert(&self, p: &BalanceChangedPayload) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO user_balances (user_id, mint_address, available, locked, version, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (user_id, mint_address) DO UPDATE SET
                available = EXCLUDED.available,
                locked = EXCLUDED.locked,
                version = EXCLUDED.version,
                updated_at = NOW()
            WHERE user_balances.version < EXCLUDED.version
            "#,
        )
        .bind(p.user_id)
        .bind(&p.asset)
        .bind(p.available)
        .bind(p.locked)
        .bind(p.version as i64)
        .execute(&self.pool)
        .await?;

        debug!(
            "Projected balance user={} asset={} available={} locked={} v{}",
            p.user_id, p.asset, p.available, p.locked, p.version
        );
        Ok(())
    }
}
