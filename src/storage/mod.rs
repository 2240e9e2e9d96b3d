//! Persistence interfaces for queues, tickets, matches and actions
//!
//! Every call takes the tenant explicitly; stores never infer it. The
//! conditional updates here ([`TicketStore::transition`],
//! [`TicketStore::insert_ticket_if_no_live`], [`MatchStore::update_match_with`])
//! are the engine's only guard against racing passes and concurrent player
//! calls, so implementations must apply them atomically.

pub mod memory;

pub use memory::InMemoryStore;

use crate::error::Result;
use crate::queue::Queue;
use crate::session::state::{Action, Match, MatchStatus};
use crate::ticket::{Ticket, TicketStatus};
use crate::types::{MatchId, TenantContext, TicketId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Outcome of a bulk conditional ticket update
#[derive(Debug, Clone, Default)]
pub struct BulkTransition {
    /// Tickets that were in an expected status and now carry the new one
    pub applied: Vec<Ticket>,
    /// Tickets that were missing or had already moved on
    pub rejected: Vec<TicketId>,
}

/// Records committed in the same versioned write as a match update
#[derive(Debug, Clone, Default)]
pub struct MatchWrite {
    /// Appended to the match's action log; the store assigns its sequence
    pub action: Option<Action>,
    /// Archived together with the updated match record
    pub final_state: Option<serde_json::Value>,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a new queue; fails with `QueueAlreadyExists` on a name clash within the tenant
    async fn insert_queue(&self, queue: Queue) -> Result<()>;

    async fn get_queue(&self, tenant: &TenantContext, name: &str) -> Result<Option<Queue>>;

    async fn list_queues(&self, tenant: &TenantContext) -> Result<Vec<Queue>>;

    /// Enabled queues of every tenant, for the scheduler
    async fn list_enabled_queues(&self) -> Result<Vec<Queue>>;

    /// Replace an existing queue; fails with `QueueNotFound` if absent
    async fn update_queue(&self, queue: Queue) -> Result<()>;

    async fn delete_queue(&self, tenant: &TenantContext, name: &str) -> Result<bool>;
}

#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn insert_ticket(&self, ticket: Ticket) -> Result<()>;

    async fn get_ticket(&self, tenant: &TenantContext, id: TicketId) -> Result<Option<Ticket>>;

    /// Queued tickets of a queue with `expires_at > now`, oldest first
    async fn active_pool(
        &self,
        tenant: &TenantContext,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Ticket>>;

    /// Insert `ticket` unless its player already holds a non-terminal ticket in the same queue
    ///
    /// The check and the insert happen under one lock. Returns the blocking
    /// ticket when nothing was inserted.
    async fn insert_ticket_if_no_live(&self, ticket: Ticket) -> Result<Option<Ticket>>;

    async fn tickets_for_match(
        &self,
        tenant: &TenantContext,
        match_id: MatchId,
    ) -> Result<Vec<Ticket>>;

    /// Queued tickets of every tenant with `expires_at <= now`
    async fn expired_tickets(&self, now: DateTime<Utc>) -> Result<Vec<Ticket>>;

    /// Count of non-terminal tickets referencing a queue
    async fn count_live(&self, tenant: &TenantContext, queue_name: &str) -> Result<usize>;

    /// Move one ticket to `to` only if its current status is in `from`
    ///
    /// Moving to `MatchFound` attaches `match_id`; moving back to `Queued`
    /// detaches it. Fails with `TicketNoLongerAvailable` when the status
    /// check fails and `TicketNotFound` when the ticket is unknown.
    async fn transition(
        &self,
        tenant: &TenantContext,
        id: TicketId,
        from: &[TicketStatus],
        to: TicketStatus,
        match_id: Option<MatchId>,
        now: DateTime<Utc>,
    ) -> Result<Ticket>;

    /// Apply [`TicketStore::transition`] to many tickets under one lock
    async fn bulk_transition(
        &self,
        tenant: &TenantContext,
        ids: &[TicketId],
        from: &[TicketStatus],
        to: TicketStatus,
        match_id: Option<MatchId>,
        now: DateTime<Utc>,
    ) -> Result<BulkTransition>;
}

#[async_trait]
pub trait MatchStore: Send + Sync {
    async fn insert_match(&self, record: Match) -> Result<()>;

    async fn get_match(&self, tenant: &TenantContext, id: MatchId) -> Result<Option<Match>>;

    /// Replace the record if its stored version equals `record.version`
    ///
    /// Returns the stored record with its version bumped. Fails with
    /// `ConcurrentModification` when another writer got there first.
    async fn update_match(&self, record: Match) -> Result<Match> {
        let (record, _) = self.update_match_with(record, MatchWrite::default()).await?;
        Ok(record)
    }

    /// [`MatchStore::update_match`] plus the records in `write`, all or nothing
    ///
    /// Returns the stored record and the appended action, if one was given.
    async fn update_match_with(
        &self,
        record: Match,
        write: MatchWrite,
    ) -> Result<(Match, Option<Action>)>;

    /// Matches of every tenant currently in one of `statuses`
    async fn list_by_status(&self, statuses: &[MatchStatus]) -> Result<Vec<Match>>;

    /// Non-terminal matches created from a queue
    async fn count_active(&self, tenant: &TenantContext, queue_name: &str) -> Result<usize>;

    /// Snapshot archived when the match completed
    async fn archived_snapshot(
        &self,
        tenant: &TenantContext,
        id: MatchId,
    ) -> Result<Option<serde_json::Value>>;
}

/// Read side of the action log; appends go through [`MatchStore::update_match_with`]
#[async_trait]
pub trait ActionStore: Send + Sync {
    /// Full log in append order
    async fn list_actions(&self, tenant: &TenantContext, match_id: MatchId)
        -> Result<Vec<Action>>;
}
