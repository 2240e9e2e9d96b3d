//! AMQP integration for the matchmaking engine
//!
//! This module handles the broker connection and publishes match lifecycle
//! events to a topic exchange.

pub mod connection;
pub mod messages;
pub mod publisher;

pub use connection::{AmqpConfig, AmqpConnection};
pub use messages::*;
pub use publisher::{
    publish_best_effort, AmqpEventPublisher, EventPublisher, LogEventPublisher,
    MockEventPublisher, PublisherConfig,
};
