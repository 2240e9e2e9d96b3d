//! Metrics collection using Prometheus
//!
//! This module provides metrics collection for the matchmaking engine:
//! service health, ticket flow, match lifecycle and scheduler behaviour.

use crate::matching::scheduler::SchedulerStats;
use crate::session::state::MatchStatus;
use crate::session::SessionStats;
use crate::ticket::TicketStatus;
use crate::types::MatchSource;
use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the engine
#[derive(Clone)]
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Arc<Registry>,

    service_metrics: ServiceMetrics,
    ticket_metrics: TicketMetrics,
    match_metrics: MatchMetrics,
    scheduler_metrics: SchedulerMetrics,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: IntGauge,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    /// Component health status
    pub component_health: IntGaugeVec,

    /// Outbound events by name and delivery status
    pub events_published_total: IntCounterVec,

    /// Event publish latency
    pub publish_duration: HistogramVec,
}

/// Ticket flow metrics
#[derive(Clone)]
pub struct TicketMetrics {
    pub tickets_enqueued_total: IntCounter,

    /// Transitions by target status
    pub ticket_transitions_total: IntCounterVec,

    /// Time from enqueue to being placed in a match
    pub ticket_wait_seconds: Histogram,

    /// Queued tickets seen by the latest passes
    pub tickets_waiting: IntGauge,
}

/// Match lifecycle metrics
#[derive(Clone)]
pub struct MatchMetrics {
    /// Matches created, by grouping strategy
    pub matches_created_total: IntCounterVec,

    /// Matches reaching a terminal status
    pub matches_ended_total: IntCounterVec,

    pub actions_total: IntCounter,

    /// Matches not yet terminal
    pub active_matches: IntGauge,
}

/// Scheduler metrics
#[derive(Clone)]
pub struct SchedulerMetrics {
    /// Passes by outcome (committed, idle, skipped, failed)
    pub passes_total: IntCounterVec,

    pub pass_duration: Histogram,

    /// Tickets lost to a concurrent claim during commit
    pub claim_conflicts_total: IntCounter,

    pub external_failures_total: IntCounter,

    /// Custom matchmaker groups rejected as invalid
    pub groups_discarded_total: IntCounter,
}

impl MetricsCollector {
    /// Create a new metrics collector with default registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        Self::with_registry(registry)
    }

    /// Create a new metrics collector with custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let service_metrics = ServiceMetrics::new(&registry)?;
        let ticket_metrics = TicketMetrics::new(&registry)?;
        let match_metrics = MatchMetrics::new(&registry)?;
        let scheduler_metrics = SchedulerMetrics::new(&registry)?;

        Ok(Self {
            registry,
            service_metrics,
            ticket_metrics,
            match_metrics,
            scheduler_metrics,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    pub fn tickets(&self) -> &TicketMetrics {
        &self.ticket_metrics
    }

    pub fn matches(&self) -> &MatchMetrics {
        &self.match_metrics
    }

    pub fn scheduler(&self) -> &SchedulerMetrics {
        &self.scheduler_metrics
    }

    pub fn record_ticket_enqueued(&self) {
        self.ticket_metrics.tickets_enqueued_total.inc();
        self.record_ticket_transition(TicketStatus::Queued, 1);
    }

    pub fn record_ticket_transition(&self, status: TicketStatus, count: usize) {
        self.ticket_metrics
            .ticket_transitions_total
            .with_label_values(&[status.as_str()])
            .inc_by(count as u64);
    }

    pub fn record_ticket_wait(&self, wait: Duration) {
        self.ticket_metrics
            .ticket_wait_seconds
            .observe(wait.as_secs_f64());
    }

    pub fn record_match_created(&self, source: MatchSource) {
        self.match_metrics
            .matches_created_total
            .with_label_values(&[source.as_str()])
            .inc();
        self.match_metrics.active_matches.inc();
    }

    pub fn record_match_ended(&self, status: MatchStatus) {
        self.match_metrics
            .matches_ended_total
            .with_label_values(&[status.as_str()])
            .inc();
        self.match_metrics.active_matches.dec();
    }

    pub fn record_action(&self) {
        self.match_metrics.actions_total.inc();
    }

    /// Record one scheduling pass over a queue
    pub fn record_pass(&self, outcome: &str, duration: Duration) {
        self.scheduler_metrics
            .passes_total
            .with_label_values(&[outcome])
            .inc();
        self.scheduler_metrics
            .pass_duration
            .observe(duration.as_secs_f64());
    }

    pub fn record_claim_conflicts(&self, count: usize) {
        self.scheduler_metrics
            .claim_conflicts_total
            .inc_by(count as u64);
    }

    pub fn record_external_failure(&self) {
        self.scheduler_metrics.external_failures_total.inc();
    }

    pub fn record_groups_discarded(&self, count: usize) {
        self.scheduler_metrics
            .groups_discarded_total
            .inc_by(count as u64);
    }

    pub fn record_event_published(&self, event: &str, success: bool, duration: Duration) {
        let status = if success { "success" } else { "error" };

        self.service_metrics
            .events_published_total
            .with_label_values(&[event, status])
            .inc();

        self.service_metrics
            .publish_duration
            .with_label_values(&[event])
            .observe(duration.as_secs_f64());
    }

    /// Resynchronise gauges from manager snapshots
    pub fn update_from_stats(&self, scheduler: &SchedulerStats, sessions: &SessionStats) {
        self.ticket_metrics
            .tickets_waiting
            .set(scheduler.tickets_waiting as i64);
        self.match_metrics
            .active_matches
            .set(sessions.active_matches as i64);
    }

    pub fn set_uptime(&self, uptime: Duration) {
        self.service_metrics
            .uptime_seconds
            .set(uptime.as_secs() as i64);
    }

    /// Update health status
    pub fn update_health_status(&self, status: u8) {
        self.service_metrics.health_status.set(status as i64);
    }

    /// Update component health
    pub fn update_component_health(&self, component: &str, healthy: bool) {
        let status = if healthy { 1 } else { 0 };
        self.service_metrics
            .component_health
            .with_label_values(&[component])
            .set(status);
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return the duration
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds =
            IntGauge::new("matchforge_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let health_status = IntGauge::new(
            "matchforge_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new("matchforge_component_health", "Component health status"),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        let events_published_total = IntCounterVec::new(
            Opts::new(
                "matchforge_events_published_total",
                "Outbound events by delivery status",
            ),
            &["event", "status"],
        )?;
        registry.register(Box::new(events_published_total.clone()))?;

        let publish_duration = HistogramVec::new(
            HistogramOpts::new(
                "matchforge_event_publish_duration_seconds",
                "Event publish latency",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["event"],
        )?;
        registry.register(Box::new(publish_duration.clone()))?;

        Ok(Self {
            uptime_seconds,
            health_status,
            component_health,
            events_published_total,
            publish_duration,
        })
    }
}

impl TicketMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let tickets_enqueued_total =
            IntCounter::new("matchforge_tickets_enqueued_total", "Total tickets enqueued")?;
        registry.register(Box::new(tickets_enqueued_total.clone()))?;

        let ticket_transitions_total = IntCounterVec::new(
            Opts::new(
                "matchforge_ticket_transitions_total",
                "Ticket status transitions by target status",
            ),
            &["status"],
        )?;
        registry.register(Box::new(ticket_transitions_total.clone()))?;

        let ticket_wait_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "matchforge_ticket_wait_seconds",
                "Time tickets spend queued before a match is found",
            )
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        )?;
        registry.register(Box::new(ticket_wait_seconds.clone()))?;

        let tickets_waiting = IntGauge::new(
            "matchforge_tickets_waiting",
            "Queued tickets seen by the latest scheduling passes",
        )?;
        registry.register(Box::new(tickets_waiting.clone()))?;

        Ok(Self {
            tickets_enqueued_total,
            ticket_transitions_total,
            ticket_wait_seconds,
            tickets_waiting,
        })
    }
}

impl MatchMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let matches_created_total = IntCounterVec::new(
            Opts::new("matchforge_matches_created_total", "Total matches created"),
            &["source"],
        )?;
        registry.register(Box::new(matches_created_total.clone()))?;

        let matches_ended_total = IntCounterVec::new(
            Opts::new(
                "matchforge_matches_ended_total",
                "Matches reaching a terminal status",
            ),
            &["status"],
        )?;
        registry.register(Box::new(matches_ended_total.clone()))?;

        let actions_total =
            IntCounter::new("matchforge_actions_total", "Total player actions accepted")?;
        registry.register(Box::new(actions_total.clone()))?;

        let active_matches = IntGauge::new("matchforge_active_matches", "Matches not yet ended")?;
        registry.register(Box::new(active_matches.clone()))?;

        Ok(Self {
            matches_created_total,
            matches_ended_total,
            actions_total,
            active_matches,
        })
    }
}

impl SchedulerMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let passes_total = IntCounterVec::new(
            Opts::new(
                "matchforge_scheduler_passes_total",
                "Scheduling passes by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(passes_total.clone()))?;

        let pass_duration = Histogram::with_opts(
            HistogramOpts::new(
                "matchforge_scheduler_pass_duration_seconds",
                "Duration of a single queue pass",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(pass_duration.clone()))?;

        let claim_conflicts_total = IntCounter::new(
            "matchforge_claim_conflicts_total",
            "Tickets lost to a concurrent claim",
        )?;
        registry.register(Box::new(claim_conflicts_total.clone()))?;

        let external_failures_total = IntCounter::new(
            "matchforge_external_matchmaker_failures_total",
            "Custom matchmaker calls that failed or timed out",
        )?;
        registry.register(Box::new(external_failures_total.clone()))?;

        let groups_discarded_total = IntCounter::new(
            "matchforge_groups_discarded_total",
            "Custom matchmaker groups rejected as invalid",
        )?;
        registry.register(Box::new(groups_discarded_total.clone()))?;

        Ok(Self {
            passes_total,
            pass_duration,
            claim_conflicts_total,
            external_failures_total,
            groups_discarded_total,
        })
    }
}
