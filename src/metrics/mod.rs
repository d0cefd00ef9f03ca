//! Metrics Module
//!
//! Prometheus-compatible metrics for the engine core and its consumers:
//! order flow counters, match latency, event publishing, and consumer retry
//! behavior.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;

/// Metric names as constants for consistency
pub mod names {
    // Engine
    pub const ORDERS_SUBMITTED_TOTAL: &str = "orders_submitted_total";
    pub const ORDERS_REJECTED_TOTAL: &str = "orders_rejected_total";
    pub const ORDERS_CANCELLED_TOTAL: &str = "orders_cancelled_total";
    pub const TRADES_EXECUTED_TOTAL: &str = "trades_executed_total";
    pub const ORDER_MATCH_DURATION_SECONDS: &str = "order_match_duration_seconds";
    pub const PAIR_LOOPS_HALTED_TOTAL: &str = "pair_loops_halted_total";

    // Event log / publisher
    pub const EVENTS_PUBLISHED_TOTAL: &str = "events_published_total";
    pub const EVENT_PUBLISH_RETRIES_TOTAL: &str = "event_publish_retries_total";
    pub const EVENTS_DEAD_LETTERED_TOTAL: &str = "events_dead_lettered_total";

    // Consumers
    pub const CONSUMER_EVENTS_APPLIED_TOTAL: &str = "consumer_events_applied_total";
    pub const CONSUMER_RETRIES_TOTAL: &str = "consumer_retries_total";
    pub const CONSUMER_DEAD_LETTERED_TOTAL: &str = "consumer_dead_lettered_total";
}

/// Label keys
pub mod labels {
    pub const PAIR: &str = "pair";
    pub const ORDER_SIDE: &str = "side";
    pub const ORDER_TYPE: &str = "order_type";
    pub const EVENT_KIND: &str = "kind";
}

/// Install the Prometheus exporter with its built-in HTTP listener.
pub fn init_metrics(port: u16) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new()
        .with_http_listener(addr)
        // Matching should sit well under a millisecond
        .set_buckets_for_metric(
            Matcher::Full(names::ORDER_MATCH_DURATION_SECONDS.to_string()),
            &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5],
        )?
        .install()?;
    Ok(())
}
