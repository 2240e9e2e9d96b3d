//! Outbound event publishing
//!
//! Delivery is best-effort: managers publish after their state change has
//! been committed, and a failed publish is logged and counted, never
//! propagated back to the caller.

use crate::amqp::messages::MessageEnvelope;
use crate::error::{MatchmakingError, Result};
use crate::metrics::MetricsCollector;
use crate::types::{ActionSubmitted, EngineEvent, MatchFound, MatchStatusChanged};
use amqprs::{
    channel::{BasicPublishArguments, Channel, ExchangeDeclareArguments},
    BasicProperties,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Trait for publishing engine events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_match_found(&self, event: MatchFound) -> Result<()>;

    async fn publish_match_status_changed(&self, event: MatchStatusChanged) -> Result<()>;

    async fn publish_action_submitted(&self, event: ActionSubmitted) -> Result<()>;
}

/// Dispatch an event to the matching publisher method, logging and counting failures
pub async fn publish_best_effort(
    publisher: &dyn EventPublisher,
    metrics: &MetricsCollector,
    event: EngineEvent,
) {
    let name = event.name();
    let timer = metrics.start_timer();
    let result = match event {
        EngineEvent::MatchFound(e) => publisher.publish_match_found(e).await,
        EngineEvent::MatchStatusChanged(e) => publisher.publish_match_status_changed(e).await,
        EngineEvent::ActionSubmitted(e) => publisher.publish_action_submitted(e).await,
    };

    let success = result.is_ok();
    metrics.record_event_published(name, success, timer.stop());
    if let Err(e) = result {
        warn!(event = name, error = %e, "Event publish failed; state change already committed");
    }
}

/// Configuration for event publishing
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub exchange_name: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            exchange_name: crate::amqp::messages::DEFAULT_EVENTS_EXCHANGE.to_string(),
            max_retries: 3,
            retry_delay_ms: 500,
        }
    }
}

/// AMQP-based event publisher implementation
pub struct AmqpEventPublisher {
    channel: Channel,
    config: PublisherConfig,
}

impl AmqpEventPublisher {
    /// Create a publisher and declare its exchange
    pub async fn new(channel: Channel, config: PublisherConfig) -> Result<Self> {
        let publisher = Self { channel, config };
        publisher.setup_exchange().await?;
        Ok(publisher)
    }

    async fn setup_exchange(&self) -> Result<()> {
        let args = ExchangeDeclareArguments::new(&self.config.exchange_name, "topic")
            .durable(true)
            .finish();
        self.channel.exchange_declare(args).await.map_err(|e| {
            MatchmakingError::AmqpConnectionFailed {
                message: format!(
                    "Failed to declare exchange {}: {}",
                    self.config.exchange_name, e
                ),
            }
        })?;

        info!(exchange = %self.config.exchange_name, "Declared events exchange");
        Ok(())
    }

    /// Publish with exponential backoff between attempts
    async fn publish_with_retry(&self, envelope: &MessageEnvelope<EngineEvent>) -> Result<()> {
        let mut retry_count = 0;
        let mut delay = Duration::from_millis(self.config.retry_delay_ms);

        loop {
            match self.try_publish(envelope).await {
                Ok(()) => {
                    debug!(
                        "Published message {} with routing key {}",
                        envelope.correlation_id, envelope.routing_key
                    );
                    return Ok(());
                }
                Err(e) => {
                    retry_count += 1;
                    if retry_count > self.config.max_retries {
                        error!(
                            "Failed to publish message {} after {} retries: {}",
                            envelope.correlation_id, self.config.max_retries, e
                        );
                        return Err(e);
                    }

                    warn!(
                        "Publish attempt {} failed for message {}: {}. Retrying in {:?}",
                        retry_count, envelope.correlation_id, e, delay
                    );

                    sleep(delay).await;
                    delay = Duration::from_millis((delay.as_millis() as u64 * 2).min(5000));
                }
            }
        }
    }

    async fn try_publish(&self, envelope: &MessageEnvelope<EngineEvent>) -> Result<()> {
        let payload = envelope.to_bytes()?;

        let args = BasicPublishArguments::new(&self.config.exchange_name, &envelope.routing_key);
        let mut properties = BasicProperties::default();
        properties
            .with_message_id(&envelope.correlation_id)
            .with_timestamp(envelope.timestamp.timestamp() as u64)
            .with_content_type("application/json")
            .with_message_type(envelope.payload.name());

        self.channel
            .basic_publish(properties, payload, args)
            .await
            .map_err(|e| MatchmakingError::AmqpConnectionFailed {
                message: format!("Failed to publish message: {}", e),
            })?;

        Ok(())
    }
}

#[async_trait]
impl EventPublisher for AmqpEventPublisher {
    async fn publish_match_found(&self, event: MatchFound) -> Result<()> {
        let envelope = MessageEnvelope::for_event(EngineEvent::MatchFound(event));
        self.publish_with_retry(&envelope).await
    }

    async fn publish_match_status_changed(&self, event: MatchStatusChanged) -> Result<()> {
        let envelope = MessageEnvelope::for_event(EngineEvent::MatchStatusChanged(event));
        self.publish_with_retry(&envelope).await
    }

    async fn publish_action_submitted(&self, event: ActionSubmitted) -> Result<()> {
        let envelope = MessageEnvelope::for_event(EngineEvent::ActionSubmitted(event));
        self.publish_with_retry(&envelope).await
    }
}

/// Publisher used when AMQP is disabled; events only reach the log
#[derive(Debug, Default)]
pub struct LogEventPublisher;

#[async_trait]
impl EventPublisher for LogEventPublisher {
    async fn publish_match_found(&self, event: MatchFound) -> Result<()> {
        info!(
            game_id = %event.game_id,
            match_id = %event.match_id,
            queue = %event.queue_name,
            players = ?event.participants,
            source = event.source.as_str(),
            "Match found"
        );
        Ok(())
    }

    async fn publish_match_status_changed(&self, event: MatchStatusChanged) -> Result<()> {
        info!(
            game_id = %event.game_id,
            match_id = %event.match_id,
            from = %event.from,
            to = %event.to,
            phase = ?event.phase,
            reason = ?event.reason,
            "Match status changed"
        );
        Ok(())
    }

    async fn publish_action_submitted(&self, event: ActionSubmitted) -> Result<()> {
        debug!(
            game_id = %event.game_id,
            match_id = %event.match_id,
            player_id = %event.player_id,
            action_type = %event.action_type,
            sequence = event.sequence,
            "Action submitted"
        );
        Ok(())
    }
}

/// Mock event publisher for testing
#[derive(Debug, Default)]
pub struct MockEventPublisher {
    published_events: std::sync::Mutex<Vec<EngineEvent>>,
    fail: AtomicBool,
}

impl MockEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail without recording
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.published_events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Names of all published events, in order
    pub fn event_names(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.name()).collect()
    }

    pub fn status_changes(&self) -> Vec<MatchStatusChanged> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::MatchStatusChanged(change) => Some(change),
                _ => None,
            })
            .collect()
    }

    pub fn clear_events(&self) {
        if let Ok(mut events) = self.published_events.lock() {
            events.clear();
        }
    }

    fn record(&self, event: EngineEvent) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MatchmakingError::AmqpConnectionFailed {
                message: "mock publisher set to fail".to_string(),
            }
            .into());
        }
        if let Ok(mut events) = self.published_events.lock() {
            events.push(event);
        }
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for MockEventPublisher {
    async fn publish_match_found(&self, event: MatchFound) -> Result<()> {
        self.record(EngineEvent::MatchFound(event))
    }

    async fn publish_match_status_changed(&self, event: MatchStatusChanged) -> Result<()> {
        self.record(EngineEvent::MatchStatusChanged(event))
    }

    async fn publish_action_submitted(&self, event: ActionSubmitted) -> Result<()> {
        self.record(EngineEvent::ActionSubmitted(event))
    }
}
