//! Scheduling passes
//!
//! A pass reads one queue's active pool, proposes groups (built-in formation
//! or the queue's custom matchmaker) and commits each group by claiming its
//! tickets through conditional status updates. Passes over the same queue
//! are serialized by a per-queue lock; passes over different queues are
//! independent, and one queue failing never stops the others.

use crate::error::{MatchmakingError, Result};
use crate::matching::custom::{validate_groups, CustomMatchRequest, CustomMatchmaker};
use crate::matching::formation::{GroupFormer, TicketGroup};
use crate::metrics::MetricsCollector;
use crate::queue::{Queue, QueueRegistry};
use crate::session::SessionManager;
use crate::storage::TicketStore;
use crate::ticket::{Ticket, TicketStatus};
use crate::types::{GameId, MatchId, MatchSource, TenantContext, TicketId};
use crate::utils::generate_match_id;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

type QueueKey = (GameId, String);

/// Statistics about scheduling passes
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    /// Total passes run
    pub passes_run: u64,
    /// Total groups committed as matches
    pub groups_committed: u64,
    /// Total tickets placed into matches
    pub tickets_matched: u64,
    /// Total tickets lost to a concurrent status change during commit
    pub claim_conflicts: u64,
    /// Total passes skipped because the custom matchmaker failed
    pub external_failures: u64,
    /// Total custom matchmaker groups rejected as invalid
    pub groups_discarded: u64,
    /// Tickets left waiting after the latest pass of each queue
    pub tickets_waiting: usize,
}

/// Report of one pass over one queue
#[derive(Debug, Clone, Serialize)]
pub struct PassOutcome {
    pub game_id: GameId,
    pub queue_name: String,
    pub source: MatchSource,
    pub pool_size: usize,
    pub matches: Vec<MatchId>,
    pub tickets_matched: usize,
    /// Tickets dropped from a group because they moved on during commit
    pub tickets_skipped: usize,
    pub groups_discarded: usize,
    pub skipped_external_failure: bool,
    pub error: Option<String>,
}

impl PassOutcome {
    fn new(queue: &Queue) -> Self {
        Self {
            game_id: queue.game_id.clone(),
            queue_name: queue.name.clone(),
            source: if queue.uses_custom_matchmaker() {
                MatchSource::Custom
            } else {
                MatchSource::BuiltIn
            },
            pool_size: 0,
            matches: Vec::new(),
            tickets_matched: 0,
            tickets_skipped: 0,
            groups_discarded: 0,
            skipped_external_failure: false,
            error: None,
        }
    }

    pub fn groups_committed(&self) -> usize {
        self.matches.len()
    }

    fn label(&self) -> &'static str {
        if self.error.is_some() {
            "failed"
        } else if self.skipped_external_failure {
            "external_failure"
        } else if self.matches.is_empty() {
            "idle"
        } else {
            "committed"
        }
    }
}

pub struct MatchScheduler {
    queues: Arc<QueueRegistry>,
    tickets: Arc<dyn TicketStore>,
    sessions: Arc<SessionManager>,
    group_former: Arc<dyn GroupFormer>,
    custom_matchmaker: Arc<dyn CustomMatchmaker>,
    metrics_collector: Arc<MetricsCollector>,
    queue_locks: Mutex<HashMap<QueueKey, Arc<tokio::sync::Mutex<()>>>>,
    waiting: RwLock<HashMap<QueueKey, usize>>,
    stats: RwLock<SchedulerStats>,
}

impl MatchScheduler {
    pub fn new(
        queues: Arc<QueueRegistry>,
        tickets: Arc<dyn TicketStore>,
        sessions: Arc<SessionManager>,
        group_former: Arc<dyn GroupFormer>,
        custom_matchmaker: Arc<dyn CustomMatchmaker>,
        metrics_collector: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            queues,
            tickets,
            sessions,
            group_former,
            custom_matchmaker,
            metrics_collector,
            queue_locks: Mutex::new(HashMap::new()),
            waiting: RwLock::new(HashMap::new()),
            stats: RwLock::new(SchedulerStats::default()),
        }
    }

    fn queue_lock(&self, tenant: &TenantContext, queue_name: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .queue_locks
            .lock()
            .map_err(|_| MatchmakingError::lock_poisoned("queue locks"))?;
        Ok(locks
            .entry((tenant.game_id.clone(), queue_name.to_string()))
            .or_default()
            .clone())
    }

    /// Run one pass over every enabled queue of every tenant
    pub async fn run_all_passes(&self, now: DateTime<Utc>) -> Vec<PassOutcome> {
        let queues = match self.queues.enabled_queues().await {
            Ok(queues) => queues,
            Err(e) => {
                error!(error = %e, "Could not list queues for scheduling");
                return Vec::new();
            }
        };

        let mut outcomes = Vec::with_capacity(queues.len());
        for queue in queues {
            let tenant = TenantContext::new(queue.game_id.clone());
            match self.run_pass(&tenant, &queue.name, now).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!(
                        game_id = %tenant.game_id,
                        queue = %queue.name,
                        error = %e,
                        "Scheduling pass failed"
                    );
                    let mut outcome = PassOutcome::new(&queue);
                    outcome.error = Some(e.to_string());
                    self.metrics_collector
                        .record_pass(outcome.label(), std::time::Duration::ZERO);
                    outcomes.push(outcome);
                }
            }
        }
        outcomes
    }

    /// Run one pass over a single queue
    pub async fn run_pass(
        &self,
        tenant: &TenantContext,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> Result<PassOutcome> {
        let lock = self.queue_lock(tenant, queue_name)?;
        let _guard = lock.lock().await;
        let timer = self.metrics_collector.start_timer();

        let queue = self.queues.get_queue(tenant, queue_name).await?;
        let mut outcome = PassOutcome::new(&queue);
        if !queue.enabled {
            return Ok(outcome);
        }

        let pool = self.tickets.active_pool(tenant, queue_name, now).await?;
        outcome.pool_size = pool.len();

        let groups = if pool.len() < queue.min_players {
            Vec::new()
        } else if let Some(reference) = &queue.custom_matchmaker {
            let request = CustomMatchRequest::new(&queue, &pool);
            match self
                .custom_matchmaker
                .request_groups(reference, &request)
                .await
            {
                Ok(ids) => {
                    let (groups, discarded) = validate_groups(&queue, &pool, ids);
                    outcome.groups_discarded = discarded;
                    self.metrics_collector.record_groups_discarded(discarded);
                    groups
                }
                Err(e) => {
                    warn!(
                        game_id = %tenant.game_id,
                        queue = queue_name,
                        error = %e,
                        "Custom matchmaker failed; skipping queue this pass"
                    );
                    self.metrics_collector.record_external_failure();
                    outcome.skipped_external_failure = true;
                    Vec::new()
                }
            }
        } else {
            self.group_former.form_groups(&queue, &pool, now)
        };

        for group in groups {
            self.commit_group(tenant, &queue, group, now, &mut outcome)
                .await?;
        }

        self.metrics_collector
            .record_pass(outcome.label(), timer.stop());
        self.record_outcome(&outcome);

        if outcome.matches.is_empty() {
            debug!(
                game_id = %tenant.game_id,
                queue = queue_name,
                pool = outcome.pool_size,
                "Pass produced no groups"
            );
        } else {
            info!(
                game_id = %tenant.game_id,
                queue = queue_name,
                pool = outcome.pool_size,
                matches = outcome.matches.len(),
                tickets = outcome.tickets_matched,
                skipped = outcome.tickets_skipped,
                "Pass committed groups"
            );
        }
        Ok(outcome)
    }

    /// Claim a group's tickets and turn them into a match
    ///
    /// Tickets that changed status since the pool was read are dropped from
    /// the group; if that leaves it short, the survivors are put back.
    async fn commit_group(
        &self,
        tenant: &TenantContext,
        queue: &Queue,
        group: TicketGroup,
        now: DateTime<Utc>,
        outcome: &mut PassOutcome,
    ) -> Result<()> {
        let ids: Vec<TicketId> = group.iter().map(|t| t.id).collect();

        let claimed = self
            .tickets
            .bulk_transition(tenant, &ids, &[TicketStatus::Queued], TicketStatus::Matching, None, now)
            .await?;
        self.note_conflicts(queue, &claimed.rejected, outcome);

        if claimed.applied.len() < queue.min_players {
            self.put_back(tenant, &claimed.applied, TicketStatus::Matching, now)
                .await?;
            return Ok(());
        }

        let match_id = generate_match_id();
        let claimed_ids: Vec<TicketId> = claimed.applied.iter().map(|t| t.id).collect();
        let found = self
            .tickets
            .bulk_transition(
                tenant,
                &claimed_ids,
                &[TicketStatus::Matching],
                TicketStatus::MatchFound,
                Some(match_id),
                now,
            )
            .await?;
        self.note_conflicts(queue, &found.rejected, outcome);

        if found.applied.len() < queue.min_players {
            self.put_back(tenant, &found.applied, TicketStatus::MatchFound, now)
                .await?;
            return Ok(());
        }

        if let Err(e) = self
            .sessions
            .create_match(tenant, queue, match_id, &found.applied, outcome.source)
            .await
        {
            self.put_back(tenant, &found.applied, TicketStatus::MatchFound, now)
                .await?;
            return Err(e);
        }

        self.metrics_collector
            .record_ticket_transition(TicketStatus::MatchFound, found.applied.len());
        for ticket in &found.applied {
            if let Ok(wait) = (now - ticket.created_at).to_std() {
                self.metrics_collector.record_ticket_wait(wait);
            }
        }

        outcome.tickets_matched += found.applied.len();
        outcome.matches.push(match_id);
        Ok(())
    }

    fn note_conflicts(&self, queue: &Queue, rejected: &[TicketId], outcome: &mut PassOutcome) {
        if rejected.is_empty() {
            return;
        }
        for id in rejected {
            warn!(queue = %queue.name, ticket_id = %id, "Ticket no longer available; dropped from group");
        }
        outcome.tickets_skipped += rejected.len();
        self.metrics_collector.record_claim_conflicts(rejected.len());
    }

    /// Return claimed tickets to the pool after an aborted commit
    async fn put_back(
        &self,
        tenant: &TenantContext,
        tickets: &[Ticket],
        from: TicketStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if tickets.is_empty() {
            return Ok(());
        }
        let ids: Vec<TicketId> = tickets.iter().map(|t| t.id).collect();
        let restored = self
            .tickets
            .bulk_transition(tenant, &ids, &[from], TicketStatus::Queued, None, now)
            .await?;
        debug!(
            game_id = %tenant.game_id,
            restored = restored.applied.len(),
            "Group fell short; tickets returned to the pool"
        );
        Ok(())
    }

    fn record_outcome(&self, outcome: &PassOutcome) {
        if let Ok(mut waiting) = self.waiting.write() {
            waiting.insert(
                (outcome.game_id.clone(), outcome.queue_name.clone()),
                outcome.pool_size.saturating_sub(outcome.tickets_matched),
            );
        }
        if let Ok(mut stats) = self.stats.write() {
            stats.passes_run += 1;
            stats.groups_committed += outcome.matches.len() as u64;
            stats.tickets_matched += outcome.tickets_matched as u64;
            stats.claim_conflicts += outcome.tickets_skipped as u64;
            stats.groups_discarded += outcome.groups_discarded as u64;
            if outcome.skipped_external_failure {
                stats.external_failures += 1;
            }
        }
    }

    pub fn get_stats(&self) -> Result<SchedulerStats> {
        let mut stats = self
            .stats
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("scheduler stats read"))?
            .clone();
        stats.tickets_waiting = self
            .waiting
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("scheduler waiting read"))?
            .values()
            .sum();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::publisher::MockEventPublisher;
    use crate::cache::InMemoryMatchStateCache;
    use crate::error::{error_kind, ErrorKind};
    use crate::matching::formation::GreedyGroupFormer;
    use crate::queue::{Criterion, CustomMatchmakerRef, QueueDefinition};
    use crate::session::{MatchStatus, SessionSettings};
    use crate::storage::InMemoryStore;
    use crate::ticket::TicketManager;
    use crate::types::AttributeSnapshot;
    use crate::utils::{Clock, ManualClock};
    use async_trait::async_trait;
    use chrono::Duration;
    use serde_json::json;

    /// Custom matchmaker answering from a fixed script
    enum Scripted {
        AllInOne,
        Fail,
        /// Cancel one ticket mid-call, then propose the whole pool
        CancelFirst(Arc<InMemoryStore>),
    }

    #[async_trait]
    impl CustomMatchmaker for Scripted {
        async fn request_groups(
            &self,
            _reference: &CustomMatchmakerRef,
            request: &CustomMatchRequest,
        ) -> Result<Vec<Vec<TicketId>>> {
            let ids: Vec<TicketId> = request.pool.iter().map(|t| t.ticket_id).collect();
            match self {
                Scripted::AllInOne => Ok(vec![ids]),
                Scripted::Fail => Err(MatchmakingError::ExternalMatchmakerFailure {
                    reason: "scripted failure".to_string(),
                }
                .into()),
                Scripted::CancelFirst(store) => {
                    let tenant = TenantContext::new(request.game_id.clone());
                    store
                        .transition(
                            &tenant,
                            ids[0],
                            &[TicketStatus::Queued],
                            TicketStatus::Cancelled,
                            None,
                            Utc::now(),
                        )
                        .await?;
                    Ok(vec![ids])
                }
            }
        }
    }

    struct Harness {
        scheduler: MatchScheduler,
        tickets: TicketManager,
        queues: Arc<QueueRegistry>,
        sessions: Arc<SessionManager>,
        publisher: Arc<MockEventPublisher>,
        clock: Arc<ManualClock>,
        tenant: TenantContext,
    }

    fn harness_with(custom: impl FnOnce(Arc<InMemoryStore>) -> Scripted) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let publisher = Arc::new(MockEventPublisher::new());
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
            Arc::new(InMemoryMatchStateCache::new(clock.clone())),
            publisher.clone(),
            metrics.clone(),
            clock.clone(),
            SessionSettings::default(),
        ));
        let tickets = TicketManager::new(
            store.clone(),
            queues.clone(),
            sessions.clone(),
            clock.clone(),
            metrics.clone(),
        );
        let scheduler = MatchScheduler::new(
            queues.clone(),
            store.clone(),
            sessions.clone(),
            Arc::new(GreedyGroupFormer::new()),
            Arc::new(custom(store)),
            metrics,
        );
        Harness {
            scheduler,
            tickets,
            queues,
            sessions,
            publisher,
            clock,
            tenant: TenantContext::new("chess"),
        }
    }

    fn harness() -> Harness {
        harness_with(|_| Scripted::AllInOne)
    }

    fn skill(value: i64) -> AttributeSnapshot {
        let mut attrs = AttributeSnapshot::new();
        attrs.insert("skill".to_string(), json!(value));
        attrs
    }

    fn custom_queue(name: &str) -> QueueDefinition {
        QueueDefinition::new(name, 2, 3).with_custom_matchmaker(CustomMatchmakerRef {
            url: "http://matchmaker.invalid/run".to_string(),
            timeout_ms: Some(100),
        })
    }

    async fn enqueue_all(h: &Harness, queue: &str, players: &[&str]) -> Vec<Ticket> {
        let mut tickets = Vec::new();
        for player in players {
            tickets.push(
                h.tickets
                    .enqueue(&h.tenant, player, queue, AttributeSnapshot::new())
                    .await
                    .unwrap(),
            );
        }
        tickets
    }

    #[tokio::test]
    async fn test_criteria_less_pass_groups_in_order() {
        let h = harness();
        h.queues
            .create_queue(&h.tenant, QueueDefinition::new("casual", 2, 4))
            .await
            .unwrap();
        enqueue_all(&h, "casual", &["A", "B", "C", "D"]).await;

        let outcome = h
            .scheduler
            .run_pass(&h.tenant, "casual", h.clock.now())
            .await
            .unwrap();
        assert_eq!(outcome.groups_committed(), 1);
        assert_eq!(outcome.tickets_matched, 4);

        let record = h
            .sessions
            .get_match(&h.tenant, outcome.matches[0])
            .await
            .unwrap();
        assert_eq!(record.participants, vec!["A", "B", "C", "D"]);
        assert_eq!(record.status, MatchStatus::Created);
        assert_eq!(record.source, MatchSource::BuiltIn);

        for id in &record.ticket_ids {
            let ticket = h.tickets.get_ticket(&h.tenant, *id).await.unwrap();
            assert_eq!(ticket.status, TicketStatus::MatchFound);
            assert_eq!(ticket.match_id, Some(record.id));
        }
        assert_eq!(h.publisher.event_names(), vec!["match_found"]);
    }

    #[tokio::test]
    async fn test_range_tolerance_widens_with_wait() {
        let h = harness();
        h.queues
            .create_queue(
                &h.tenant,
                QueueDefinition::new("ranked", 2, 2)
                    .with_criteria(vec![Criterion::range("skill", 10.0)])
                    .with_ticket_ttl(3600),
            )
            .await
            .unwrap();
        h.tickets
            .enqueue(&h.tenant, "a", "ranked", skill(100))
            .await
            .unwrap();
        h.tickets
            .enqueue(&h.tenant, "b", "ranked", skill(112))
            .await
            .unwrap();

        let outcome = h
            .scheduler
            .run_pass(&h.tenant, "ranked", h.clock.now())
            .await
            .unwrap();
        assert_eq!(outcome.groups_committed(), 0);
        assert_eq!(outcome.pool_size, 2);

        // wait factor 1.3 allows a difference of 13
        h.clock.advance(Duration::minutes(3));
        let outcome = h
            .scheduler
            .run_pass(&h.tenant, "ranked", h.clock.now())
            .await
            .unwrap();
        assert_eq!(outcome.groups_committed(), 1);
    }

    #[tokio::test]
    async fn test_unknown_queue_is_not_found() {
        let h = harness();
        let err = h
            .scheduler
            .run_pass(&h.tenant, "missing", h.clock.now())
            .await
            .unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_custom_matchmaker_groups_committed() {
        let h = harness();
        h.queues
            .create_queue(&h.tenant, custom_queue("custom"))
            .await
            .unwrap();
        enqueue_all(&h, "custom", &["a", "b", "c"]).await;

        let outcome = h
            .scheduler
            .run_pass(&h.tenant, "custom", h.clock.now())
            .await
            .unwrap();
        assert_eq!(outcome.groups_committed(), 1);
        assert_eq!(outcome.source, MatchSource::Custom);

        let record = h
            .sessions
            .get_match(&h.tenant, outcome.matches[0])
            .await
            .unwrap();
        assert_eq!(record.source, MatchSource::Custom);
        assert_eq!(record.participants.len(), 3);
    }

    #[tokio::test]
    async fn test_external_failure_skips_queue_without_fallback() {
        let h = harness_with(|_| Scripted::Fail);
        h.queues
            .create_queue(&h.tenant, custom_queue("custom"))
            .await
            .unwrap();
        h.queues
            .create_queue(&h.tenant, QueueDefinition::new("casual", 2, 2))
            .await
            .unwrap();
        enqueue_all(&h, "custom", &["a", "b"]).await;
        enqueue_all(&h, "casual", &["c", "d"]).await;

        let outcomes = h.scheduler.run_all_passes(h.clock.now()).await;
        assert_eq!(outcomes.len(), 2);

        let custom = outcomes.iter().find(|o| o.queue_name == "custom").unwrap();
        assert!(custom.skipped_external_failure);
        assert_eq!(custom.groups_committed(), 0);
        let casual = outcomes.iter().find(|o| o.queue_name == "casual").unwrap();
        assert_eq!(casual.groups_committed(), 1);

        let pool = h
            .tickets
            .active_pool(&h.tenant, "custom", h.clock.now())
            .await
            .unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(h.scheduler.get_stats().unwrap().external_failures, 1);
    }

    #[tokio::test]
    async fn test_claim_conflict_drops_ticket() {
        let h = harness_with(Scripted::CancelFirst);
        h.queues
            .create_queue(&h.tenant, custom_queue("custom"))
            .await
            .unwrap();
        let tickets = enqueue_all(&h, "custom", &["a", "b", "c"]).await;

        let outcome = h
            .scheduler
            .run_pass(&h.tenant, "custom", h.clock.now())
            .await
            .unwrap();
        assert_eq!(outcome.tickets_skipped, 1);
        assert_eq!(outcome.groups_committed(), 1);

        let record = h
            .sessions
            .get_match(&h.tenant, outcome.matches[0])
            .await
            .unwrap();
        assert_eq!(record.participants, vec!["b", "c"]);

        let cancelled = h.tickets.get_ticket(&h.tenant, tickets[0].id).await.unwrap();
        assert_eq!(cancelled.status, TicketStatus::Cancelled);
        assert!(cancelled.match_id.is_none());
    }

    #[tokio::test]
    async fn test_short_group_is_put_back() {
        let h = harness_with(Scripted::CancelFirst);
        h.queues
            .create_queue(&h.tenant, custom_queue("custom"))
            .await
            .unwrap();
        let tickets = enqueue_all(&h, "custom", &["a", "b"]).await;

        let outcome = h
            .scheduler
            .run_pass(&h.tenant, "custom", h.clock.now())
            .await
            .unwrap();
        assert_eq!(outcome.groups_committed(), 0);
        assert_eq!(outcome.tickets_skipped, 1);

        let survivor = h.tickets.get_ticket(&h.tenant, tickets[1].id).await.unwrap();
        assert_eq!(survivor.status, TicketStatus::Queued);
        assert!(survivor.match_id.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_passes_never_double_claim() {
        let h = harness();
        h.queues
            .create_queue(&h.tenant, QueueDefinition::new("casual", 2, 2))
            .await
            .unwrap();
        let players: Vec<String> = (0..6).map(|i| format!("p{}", i)).collect();
        let names: Vec<&str> = players.iter().map(String::as_str).collect();
        enqueue_all(&h, "casual", &names).await;

        let now = h.clock.now();
        let (first, second) = tokio::join!(
            h.scheduler.run_pass(&h.tenant, "casual", now),
            h.scheduler.run_pass(&h.tenant, "casual", now),
        );
        let first = first.unwrap();
        let second = second.unwrap();

        // each pass takes one group of the oldest two
        assert_eq!(first.tickets_matched + second.tickets_matched, 4);
        assert_eq!(first.tickets_skipped + second.tickets_skipped, 0);

        let stats = h.scheduler.get_stats().unwrap();
        assert_eq!(stats.passes_run, 2);
        assert_eq!(stats.tickets_waiting, 2);
    }
}
