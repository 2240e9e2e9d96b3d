//! Metrics and monitoring for the matchforge service
//!
//! This module provides Prometheus metrics collection and the HTTP health
//! endpoints that expose them.

pub mod collector;
pub mod health;

pub use collector::{
    MatchMetrics, MetricsCollector, MetricsTimer, SchedulerMetrics, ServiceMetrics, TicketMetrics,
};
pub use health::{HealthServer, HealthServerConfig};
