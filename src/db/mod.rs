//! Database access: pool management, migrations, and the recovery reads the
//! engine replays at startup.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::models::{Order, UserBalance};

pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    /// All durable balances, for engine bootstrap.
    pub async fn load_balances(&self) -> Result<Vec<UserBalance>, sqlx::Error> {
        sqlx::query_as(
            "SELECT user_id, mint_address, available, locked, version, updated_at
             FROM user_balances",
        )
        .fetch_all(&self.pool)
        .await
    }

    /// Open limit orders to re-seat in the books. Market orders never rest,
    /// so only limit orders can be open across a restart.
    pub async fn load_open_orders(&self) -> Result<Vec<Order>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT id, user_id, order_type, order_side, base_mint, quote_mint,
                   price, amount, quote_amount, filled_amount,
                   filled_quote_amount, status, created_at, updated_at
            FROM orders
            WHERE status IN ('pending', 'partial') AND order_type = 'limit'
            ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn max_order_id(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM orders")
            .fetch_one(&self.pool)
            .await
    }

    pub async fn max_trade_id(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM trades")
            .fetch_one(&self.pool)
            .await
    }
}
