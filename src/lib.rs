//! Centralized spot-exchange core.
//!
//! The in-memory matching engine and balance-accounting subsystem, the
//! ordered event log connecting them to durable storage, and the consumer
//! pipeline projecting trades, orders, balances, fees, and positions.
//!
//! The HTTP/gRPC front-end, authentication, and market-data ingestion live
//! in sibling services; they drive this crate through [`engine::Engine`]'s
//! command values and the [`events`] spine.

pub mod config;
pub mod consumers;
pub mod db;
pub mod engine;
pub mod events;
pub mod metrics;
pub mod models;
pub mod services;
