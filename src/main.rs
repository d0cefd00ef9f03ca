use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use exchange_core::config::AppConfig;
use exchange_core::consumers::{BalanceProjector, TradeConsumer};
use exchange_core::db::Database;
use exchange_core::engine::{BalanceStore, Engine};
use exchange_core::events::{EventLog, EventPublisher};
use exchange_core::metrics;
use exchange_core::services::fees::FeeCalculator;
use exchange_core::services::positions::PositionBook;
use exchange_core::services::price_feed::PriceFeed;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "exchange_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    tracing::info!("Starting exchange-core v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {}", config.environment);

    if let Err(e) = metrics::init_metrics(config.metrics_port) {
        tracing::warn!("Metrics exporter unavailable: {}", e);
    } else {
        tracing::info!("Metrics exporter listening on :{}", config.metrics_port);
    }

    // Initialize database
    let db = Database::connect(&config.database_url).await?;
    db.migrate().await?;
    tracing::info!("Database connected");

    // Build the engine around the shared balance store and event log
    let instance_id = Uuid::new_v4();
    let events = Arc::new(EventLog::new(instance_id, config.event_buffer));
    let balances = Arc::new(BalanceStore::new());
    let engine = Arc::new(Engine::new(
        config.engine(),
        balances,
        Arc::clone(&events),
    ));
    tracing::info!(
        "Engine instance {} initialized for {:?}",
        instance_id,
        config.pairs()
    );

    // Recover durable state before any consumer attaches: balances are
    // authoritative, open limit orders re-seat without touching locks.
    let balance_rows = db.load_balances().await?;
    let open_orders = db.load_open_orders().await?;
    let max_order_id = db.max_order_id().await?;
    let max_trade_id = db.max_trade_id().await?;
    let stats = engine
        .recover(
            balance_rows.iter().map(|row| row.to_view()).collect(),
            open_orders.iter().map(|row| row.to_entry()).collect(),
            max_order_id,
            max_trade_id,
        )
        .await?;
    if stats.orders > 0 || stats.balances > 0 {
        tracing::info!(
            "Recovered {} balance rows and {} open orders",
            stats.balances,
            stats.orders
        );
    } else {
        tracing::info!("No durable state to recover, starting clean");
    }

    // Fee-config loading is owned by the settlement pipeline; the engine
    // starts on the default schedule until rows are pushed.
    let fees = Arc::new(FeeCalculator::default());
    let backoff = config.backoff();

    // Start the trade consumer (orders/trades/fees projection)
    let trade_consumer = TradeConsumer::new(
        db.pool.clone(),
        Arc::clone(&fees),
        backoff.clone(),
        Arc::clone(&events),
    );
    tokio::spawn(trade_consumer.run(events.subscribe()));
    tracing::info!("Trade consumer spawned");

    // Start the balance projector (user_balances post-state mirror)
    let projector = BalanceProjector::new(db.pool.clone(), backoff.clone());
    tokio::spawn(projector.run(events.subscribe()));
    tracing::info!("Balance projector spawned");

    // Price feed and position projection from the trade stream
    let prices = Arc::new(PriceFeed::new());
    tokio::spawn(Arc::clone(&prices).run(events.subscribe()));
    let positions = Arc::new(PositionBook::new(Arc::clone(&prices)));
    tokio::spawn(Arc::clone(&positions).run(events.subscribe()));
    tracing::info!("Price feed and position projector spawned");

    // Durable event publishing to Redis Streams
    match EventPublisher::connect(&config.redis_url, backoff.clone()).await {
        Ok(publisher) => {
            tokio::spawn(publisher.run(events.subscribe()));
            tracing::info!("Event publisher spawned");
        }
        Err(e) => {
            tracing::warn!(
                "Redis unavailable, events stay in-process only: {}",
                e
            );
        }
    }

    // The front-end process drives the engine from here on.
    tracing::info!("exchange-core ready");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    Ok(())
}
