//! Ticket lifecycle manager
//!
//! Creates tickets, expires them, and applies the player-facing transitions
//! (cancel, accept, decline). Claiming tickets for a group is the scheduler's
//! job; both go through the store's conditional transition, so whichever
//! lands first wins.

use crate::error::{MatchmakingError, Result};
use crate::metrics::MetricsCollector;
use crate::queue::QueueRegistry;
use crate::session::SessionManager;
use crate::storage::TicketStore;
use crate::ticket::{Ticket, TicketStatus};
use crate::types::{AttributeSnapshot, GameId, TenantContext, TicketId};
use crate::utils::{generate_ticket_id, Clock};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct TicketManager {
    store: Arc<dyn TicketStore>,
    queues: Arc<QueueRegistry>,
    sessions: Arc<SessionManager>,
    clock: Arc<dyn Clock>,
    metrics_collector: Arc<MetricsCollector>,
}

fn lost_race(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<MatchmakingError>(),
        Some(MatchmakingError::TicketNoLongerAvailable { .. })
    )
}

impl TicketManager {
    pub fn new(
        store: Arc<dyn TicketStore>,
        queues: Arc<QueueRegistry>,
        sessions: Arc<SessionManager>,
        clock: Arc<dyn Clock>,
        metrics_collector: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store,
            queues,
            sessions,
            clock,
            metrics_collector,
        }
    }

    /// Put a player into a queue's pool
    pub async fn enqueue(
        &self,
        tenant: &TenantContext,
        player_id: &str,
        queue_name: &str,
        attributes: AttributeSnapshot,
    ) -> Result<Ticket> {
        if player_id.trim().is_empty() {
            return Err(MatchmakingError::validation("Player id cannot be empty").into());
        }

        let queue = self.queues.get_queue(tenant, queue_name).await?;
        if !queue.enabled {
            return Err(MatchmakingError::QueueNotFound {
                queue_name: queue_name.to_string(),
            }
            .into());
        }

        let ticket = Ticket::new(
            generate_ticket_id(),
            tenant.game_id.clone(),
            player_id,
            queue_name,
            attributes,
            self.clock.now(),
            queue.ticket_ttl(),
        );
        if let Some(existing) = self.store.insert_ticket_if_no_live(ticket.clone()).await? {
            return Err(MatchmakingError::validation(format!(
                "Player {} already holds ticket {} in queue '{}'",
                player_id, existing.id, queue_name
            ))
            .into());
        }
        self.metrics_collector.record_ticket_enqueued();

        info!(
            game_id = %tenant.game_id,
            ticket_id = %ticket.id,
            player_id,
            queue = queue_name,
            expires_at = %ticket.expires_at,
            "Ticket enqueued"
        );
        Ok(ticket)
    }

    pub async fn get_ticket(&self, tenant: &TenantContext, ticket_id: TicketId) -> Result<Ticket> {
        self.store
            .get_ticket(tenant, ticket_id)
            .await?
            .ok_or_else(|| {
                MatchmakingError::TicketNotFound {
                    ticket_id: ticket_id.to_string(),
                }
                .into()
            })
    }

    /// Queued, unexpired tickets of a queue, oldest first
    pub async fn active_pool(
        &self,
        tenant: &TenantContext,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Ticket>> {
        self.store.active_pool(tenant, queue_name, now).await
    }

    /// Withdraw a ticket that has not been grouped yet
    ///
    /// From any other status this is a no-op returning the ticket as it stands.
    pub async fn cancel(&self, tenant: &TenantContext, ticket_id: TicketId) -> Result<Ticket> {
        let ticket = self.get_ticket(tenant, ticket_id).await?;
        if !matches!(ticket.status, TicketStatus::Queued | TicketStatus::Matching) {
            debug!(ticket_id = %ticket_id, status = %ticket.status, "Cancel ignored");
            return Ok(ticket);
        }

        match self
            .store
            .transition(
                tenant,
                ticket_id,
                &[TicketStatus::Queued, TicketStatus::Matching],
                TicketStatus::Cancelled,
                None,
                self.clock.now(),
            )
            .await
        {
            Ok(cancelled) => {
                self.metrics_collector
                    .record_ticket_transition(TicketStatus::Cancelled, 1);
                info!(game_id = %tenant.game_id, ticket_id = %ticket_id, "Ticket cancelled");
                Ok(cancelled)
            }
            // moved on concurrently; report where it landed
            Err(e) if lost_race(&e) => self.get_ticket(tenant, ticket_id).await,
            Err(e) => Err(e),
        }
    }

    /// Confirm a found match
    pub async fn accept_ticket(&self, tenant: &TenantContext, ticket_id: TicketId) -> Result<Ticket> {
        let ticket = self
            .respond(tenant, ticket_id, TicketStatus::Accepted)
            .await?;
        info!(ticket_id = %ticket_id, match_id = ?ticket.match_id, "Ticket accepted");
        Ok(ticket)
    }

    /// Refuse a found match; the match is cancelled if it has not started
    pub async fn decline_ticket(&self, tenant: &TenantContext, ticket_id: TicketId) -> Result<Ticket> {
        let ticket = self
            .respond(tenant, ticket_id, TicketStatus::Declined)
            .await?;
        info!(ticket_id = %ticket_id, match_id = ?ticket.match_id, "Ticket declined");

        if let Some(match_id) = ticket.match_id {
            let record = self.sessions.get_match(tenant, match_id).await?;
            if record.status.is_pre_start() {
                if let Err(e) = self
                    .sessions
                    .cancel_match(tenant, match_id, "ticket declined")
                    .await
                {
                    warn!(match_id = %match_id, error = %e, "Could not cancel declined match");
                }
            }
        }

        Ok(ticket)
    }

    async fn respond(
        &self,
        tenant: &TenantContext,
        ticket_id: TicketId,
        to: TicketStatus,
    ) -> Result<Ticket> {
        let ticket = self.get_ticket(tenant, ticket_id).await?;
        let invalid = || {
            MatchmakingError::invalid_state(format!(
                "Ticket {} cannot move from {} to {}",
                ticket_id, ticket.status, to
            ))
        };

        if ticket.status != TicketStatus::MatchFound {
            return Err(invalid().into());
        }

        let updated = self
            .store
            .transition(
                tenant,
                ticket_id,
                &[TicketStatus::MatchFound],
                to,
                None,
                self.clock.now(),
            )
            .await
            .map_err(|e| if lost_race(&e) { invalid().into() } else { e })?;

        self.metrics_collector.record_ticket_transition(to, 1);
        Ok(updated)
    }

    /// Expire every queued ticket past its deadline, across all tenants
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self.store.expired_tickets(now).await?;
        if expired.is_empty() {
            return Ok(0);
        }

        let mut by_tenant: HashMap<GameId, Vec<TicketId>> = HashMap::new();
        for ticket in expired {
            by_tenant.entry(ticket.game_id).or_default().push(ticket.id);
        }

        let mut total = 0;
        for (game_id, ids) in by_tenant {
            let tenant = TenantContext::new(game_id);
            let outcome = self
                .store
                .bulk_transition(
                    &tenant,
                    &ids,
                    &[TicketStatus::Queued],
                    TicketStatus::Expired,
                    None,
                    now,
                )
                .await?;
            total += outcome.applied.len();
            if !outcome.rejected.is_empty() {
                debug!(
                    game_id = %tenant.game_id,
                    skipped = outcome.rejected.len(),
                    "Tickets left the pool before expiry"
                );
            }
        }

        self.metrics_collector
            .record_ticket_transition(TicketStatus::Expired, total);
        if total > 0 {
            info!(expired = total, "Expired stale tickets");
        }
        Ok(total)
    }
}
