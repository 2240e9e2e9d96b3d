//! Test fixtures and mock implementations for integration testing

#![allow(dead_code)]

use async_trait::async_trait;
use matchforge::amqp::MockEventPublisher;
use matchforge::cache::InMemoryMatchStateCache;
use matchforge::error::{MatchmakingError, Result};
use matchforge::matching::{
    CustomMatchRequest, CustomMatchmaker, GreedyGroupFormer, MatchScheduler,
};
use matchforge::metrics::MetricsCollector;
use matchforge::queue::{CustomMatchmakerRef, QueueDefinition, QueueRegistry};
use matchforge::session::{SessionManager, SessionSettings};
use matchforge::storage::InMemoryStore;
use matchforge::ticket::{Ticket, TicketManager};
use matchforge::types::{AttributeSnapshot, TenantContext, TicketId};
use matchforge::utils::{Clock, ManualClock};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Custom matchmaker that groups the whole pool in reverse arrival order
#[derive(Debug, Default)]
pub struct ReversePoolMatchmaker {
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl ReversePoolMatchmaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CustomMatchmaker for ReversePoolMatchmaker {
    async fn request_groups(
        &self,
        reference: &CustomMatchmakerRef,
        request: &CustomMatchRequest,
    ) -> Result<Vec<Vec<TicketId>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(MatchmakingError::ExternalMatchmakerFailure {
                reason: format!("{} unreachable", reference.url),
            }
            .into());
        }

        let mut group: Vec<TicketId> = request.pool.iter().map(|t| t.ticket_id).collect();
        group.reverse();
        group.truncate(request.queue.max_players);
        Ok(vec![group])
    }
}

/// Fully wired engine over in-memory storage and a manual clock
pub struct TestEngine {
    pub store: Arc<InMemoryStore>,
    pub clock: Arc<ManualClock>,
    pub publisher: Arc<MockEventPublisher>,
    pub metrics: Arc<MetricsCollector>,
    pub custom: Arc<ReversePoolMatchmaker>,
    pub queues: Arc<QueueRegistry>,
    pub tickets: Arc<TicketManager>,
    pub sessions: Arc<SessionManager>,
    pub scheduler: Arc<MatchScheduler>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_settings(SessionSettings::default())
    }

    pub fn with_settings(settings: SessionSettings) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let publisher = Arc::new(MockEventPublisher::new());
        let metrics = Arc::new(MetricsCollector::new().expect("Failed to create collector"));
        let custom = Arc::new(ReversePoolMatchmaker::new());
        let cache = Arc::new(InMemoryMatchStateCache::new(clock.clone()));

        let queues = Arc::new(QueueRegistry::new(
            store.clone(),
            store.clone(),
            store.clone(),
            clock.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            store.clone(),
            store.clone(),
            cache,
            publisher.clone(),
            metrics.clone(),
            clock.clone(),
            settings,
        ));
        let tickets = Arc::new(TicketManager::new(
            store.clone(),
            queues.clone(),
            sessions.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let scheduler = Arc::new(MatchScheduler::new(
            queues.clone(),
            store.clone(),
            sessions.clone(),
            Arc::new(GreedyGroupFormer::new()),
            custom.clone(),
            metrics.clone(),
        ));

        Self {
            store,
            clock,
            publisher,
            metrics,
            custom,
            queues,
            tickets,
            sessions,
            scheduler,
        }
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    pub fn advance_minutes(&self, minutes: i64) {
        self.clock.advance(chrono::Duration::minutes(minutes));
    }

    pub fn advance_seconds(&self, seconds: i64) {
        self.clock.advance(chrono::Duration::seconds(seconds));
    }

    pub async fn create_queue(&self, tenant: &TenantContext, definition: QueueDefinition) {
        self.queues
            .create_queue(tenant, definition)
            .await
            .expect("Failed to create queue");
    }

    /// Enqueue one ticket per player, advancing the clock a second between each
    pub async fn enqueue_all(
        &self,
        tenant: &TenantContext,
        queue_name: &str,
        players: &[(&str, AttributeSnapshot)],
    ) -> Vec<Ticket> {
        let mut tickets = Vec::new();
        for (player, attributes) in players {
            let ticket = self
                .tickets
                .enqueue(tenant, player, queue_name, attributes.clone())
                .await
                .expect("Failed to enqueue");
            tickets.push(ticket);
            self.advance_seconds(1);
        }
        tickets
    }
}

pub fn tenant(game_id: &str) -> TenantContext {
    TenantContext::new(game_id)
}

pub fn no_attributes() -> AttributeSnapshot {
    AttributeSnapshot::new()
}

pub fn skill(value: u64) -> AttributeSnapshot {
    let mut attributes = AttributeSnapshot::new();
    attributes.insert("skill".to_string(), json!(value));
    attributes
}
