//! Event Consumers
//!
//! Async projections of the engine's event spine into durable storage.
//! Consumers assume at-least-once delivery and are individually idempotent;
//! they never block the pair loops.

pub mod backoff;
pub mod balance_projector;
pub mod trade_consumer;

pub use backoff::BackoffPolicy;
pub use balance_projector::BalanceProjector;
pub use trade_consumer::TradeConsumer;
