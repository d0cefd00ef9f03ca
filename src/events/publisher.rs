//! Redis Streams Publisher
//!
//! Mirrors every in-process event envelope to its durable topic
//! (`XADD <topic> * payload <json>`). Delivery is at-least-once: failures
//! retry with capped exponential backoff, and envelopes that exhaust the
//! retry budget land on a dead-letter stream instead of being dropped.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::consumers::backoff::BackoffPolicy;

use super::{EventEnvelope, EventLog};

/// Dead-letter stream for envelopes that exhausted publish retries.
const DEAD_LETTER_STREAM: &str = "events-dead-letter";

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Publishes event envelopes to Redis Streams.
pub struct EventPublisher {
    connection: ConnectionManager,
    backoff: BackoffPolicy,
}

impl EventPublisher {
    pub async fn connect(redis_url: &str, backoff: BackoffPolicy) -> Result<Self, PublishError> {
        let client = redis::Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;
        info!("Event publisher connected to {}", redis_url);
        Ok(Self {
            connection,
            backoff,
        })
    }

    /// Consume the broadcast spine until the engine shuts down.
    pub async fn run(mut self, mut rx: broadcast::Receiver<EventEnvelope>) {
        info!("Event publisher worker started");
        loop {
            match rx.recv().await {
                Ok(envelope) => self.publish_with_retry(&envelope).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event publisher lagged {} envelopes", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Event channel closed, stopping publisher");
                    break;
                }
            }
        }
    }

    async fn publish_with_retry(&mut self, envelope: &EventEnvelope) {
        let topic = EventLog::topic(envelope);
        for attempt in 0..self.backoff.max_retries {
            match self.xadd(&topic, envelope).await {
                Ok(id) => {
                    tracing::debug!(
                        "Published {} offset={} as {}",
                        topic,
                        envelope.offset,
                        id
                    );
                    metrics::counter!(crate::metrics::names::EVENTS_PUBLISHED_TOTAL).increment(1);
                    return;
                }
                Err(e) => {
                    warn!(
                        "Publish to {} failed (attempt {}/{}): {}",
                        topic,
                        attempt + 1,
                        self.backoff.max_retries,
                        e
                    );
                    metrics::counter!(crate::metrics::names::EVENT_PUBLISH_RETRIES_TOTAL)
                        .increment(1);
                    tokio::time::sleep(self.backoff.delay(attempt)).await;
                }
            }
        }

        error!(
            "Publish to {} exhausted retries, dead-lettering offset={}",
            topic, envelope.offset
        );
        metrics::counter!(crate::metrics::names::EVENTS_DEAD_LETTERED_TOTAL).increment(1);
        if let Err(e) = self.xadd(DEAD_LETTER_STREAM, envelope).await {
            // Never drop silently: the envelope stays in the process log and
            // the error is surfaced for the operator.
            error!(
                "Dead-letter write failed for {} offset={}: {}",
                topic, envelope.offset, e
            );
        }
    }

    async fn xadd(&mut self, stream: &str, envelope: &EventEnvelope) -> Result<String, PublishError> {
        let payload = serde_json::to_string(envelope)?;
        let offset = envelope.offset.to_string();
        let fields = [
            ("partition", envelope.partition.as_str()),
            ("offset", offset.as_str()),
            ("payload", payload.as_str()),
        ];
        let id: String = self
            .connection
            .xadd(stream, "*", &fields)
            .await?;
        Ok(id)
    }
}
