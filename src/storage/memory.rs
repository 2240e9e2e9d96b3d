//! In-memory store backing all four persistence interfaces

use super::{ActionStore, BulkTransition, MatchStore, MatchWrite, QueueStore, TicketStore};
use crate::error::{MatchmakingError, Result};
use crate::queue::Queue;
use crate::session::state::{Action, Match, MatchStatus};
use crate::ticket::{Ticket, TicketStatus};
use crate::types::{GameId, MatchId, TenantContext, TicketId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone)]
struct StoredTicket {
    /// Insertion order, breaks `created_at` ties in the pool
    seq: u64,
    ticket: Ticket,
}

#[derive(Debug, Default)]
struct TicketTable {
    next_seq: u64,
    rows: HashMap<TicketId, StoredTicket>,
}

/// Process-local store; tenant isolation is enforced on every lookup
#[derive(Debug, Default)]
pub struct InMemoryStore {
    queues: RwLock<HashMap<(GameId, String), Queue>>,
    tickets: RwLock<TicketTable>,
    matches: RwLock<HashMap<MatchId, Match>>,
    actions: RwLock<HashMap<MatchId, Vec<Action>>>,
    archives: RwLock<HashMap<MatchId, (GameId, serde_json::Value)>>,
}

fn read<'a, T>(lock: &'a RwLock<T>, what: &str) -> Result<RwLockReadGuard<'a, T>> {
    lock.read()
        .map_err(|_| MatchmakingError::lock_poisoned(what).into())
}

fn write<'a, T>(lock: &'a RwLock<T>, what: &str) -> Result<RwLockWriteGuard<'a, T>> {
    lock.write()
        .map_err(|_| MatchmakingError::lock_poisoned(what).into())
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply_transition(
        row: &mut StoredTicket,
        from: &[TicketStatus],
        to: TicketStatus,
        match_id: Option<MatchId>,
        now: DateTime<Utc>,
    ) -> bool {
        if !from.contains(&row.ticket.status) {
            return false;
        }
        row.ticket.status = to;
        row.ticket.updated_at = now;
        match to {
            TicketStatus::MatchFound => row.ticket.match_id = match_id,
            TicketStatus::Queued => row.ticket.match_id = None,
            _ => {}
        }
        true
    }
}

#[async_trait]
impl QueueStore for InMemoryStore {
    async fn insert_queue(&self, queue: Queue) -> Result<()> {
        let mut queues = write(&self.queues, "queues write")?;
        let key = (queue.game_id.clone(), queue.name.clone());
        if queues.contains_key(&key) {
            return Err(MatchmakingError::QueueAlreadyExists {
                queue_name: queue.name,
            }
            .into());
        }
        queues.insert(key, queue);
        Ok(())
    }

    async fn get_queue(&self, tenant: &TenantContext, name: &str) -> Result<Option<Queue>> {
        let queues = read(&self.queues, "queues read")?;
        Ok(queues
            .get(&(tenant.game_id.clone(), name.to_string()))
            .cloned())
    }

    async fn list_queues(&self, tenant: &TenantContext) -> Result<Vec<Queue>> {
        let queues = read(&self.queues, "queues read")?;
        let mut result: Vec<Queue> = queues
            .values()
            .filter(|q| q.game_id == tenant.game_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    async fn list_enabled_queues(&self) -> Result<Vec<Queue>> {
        let queues = read(&self.queues, "queues read")?;
        let mut result: Vec<Queue> = queues.values().filter(|q| q.enabled).cloned().collect();
        result.sort_by(|a, b| (&a.game_id, &a.name).cmp(&(&b.game_id, &b.name)));
        Ok(result)
    }

    async fn update_queue(&self, queue: Queue) -> Result<()> {
        let mut queues = write(&self.queues, "queues write")?;
        let key = (queue.game_id.clone(), queue.name.clone());
        match queues.get_mut(&key) {
            Some(existing) => {
                *existing = queue;
                Ok(())
            }
            None => Err(MatchmakingError::QueueNotFound {
                queue_name: queue.name,
            }
            .into()),
        }
    }

    async fn delete_queue(&self, tenant: &TenantContext, name: &str) -> Result<bool> {
        let mut queues = write(&self.queues, "queues write")?;
        Ok(queues
            .remove(&(tenant.game_id.clone(), name.to_string()))
            .is_some())
    }
}

#[async_trait]
impl TicketStore for InMemoryStore {
    async fn insert_ticket(&self, ticket: Ticket) -> Result<()> {
        let mut table = write(&self.tickets, "tickets write")?;
        let seq = table.next_seq;
        table.next_seq += 1;
        table.rows.insert(ticket.id, StoredTicket { seq, ticket });
        Ok(())
    }

    async fn get_ticket(&self, tenant: &TenantContext, id: TicketId) -> Result<Option<Ticket>> {
        let table = read(&self.tickets, "tickets read")?;
        Ok(table
            .rows
            .get(&id)
            .filter(|row| row.ticket.game_id == tenant.game_id)
            .map(|row| row.ticket.clone()))
    }

    async fn active_pool(
        &self,
        tenant: &TenantContext,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Ticket>> {
        let table = read(&self.tickets, "tickets read")?;
        let mut pool: Vec<&StoredTicket> = table
            .rows
            .values()
            .filter(|row| {
                row.ticket.game_id == tenant.game_id
                    && row.ticket.queue_name == queue_name
                    && row.ticket.is_eligible(now)
            })
            .collect();
        pool.sort_by(|a, b| {
            a.ticket
                .created_at
                .cmp(&b.ticket.created_at)
                .then(a.seq.cmp(&b.seq))
        });
        Ok(pool.into_iter().map(|row| row.ticket.clone()).collect())
    }

    async fn insert_ticket_if_no_live(&self, ticket: Ticket) -> Result<Option<Ticket>> {
        let mut table = write(&self.tickets, "tickets write")?;
        let existing = table
            .rows
            .values()
            .map(|row| &row.ticket)
            .find(|t| {
                t.game_id == ticket.game_id
                    && t.queue_name == ticket.queue_name
                    && t.player_id == ticket.player_id
                    && t.status.is_live()
            })
            .cloned();
        if existing.is_some() {
            return Ok(existing);
        }

        let seq = table.next_seq;
        table.next_seq += 1;
        table.rows.insert(ticket.id, StoredTicket { seq, ticket });
        Ok(None)
    }

    async fn tickets_for_match(
        &self,
        tenant: &TenantContext,
        match_id: MatchId,
    ) -> Result<Vec<Ticket>> {
        let table = read(&self.tickets, "tickets read")?;
        let mut result: Vec<&StoredTicket> = table
            .rows
            .values()
            .filter(|row| {
                row.ticket.game_id == tenant.game_id && row.ticket.match_id == Some(match_id)
            })
            .collect();
        result.sort_by_key(|row| row.seq);
        Ok(result.into_iter().map(|row| row.ticket.clone()).collect())
    }

    async fn expired_tickets(&self, now: DateTime<Utc>) -> Result<Vec<Ticket>> {
        let table = read(&self.tickets, "tickets read")?;
        Ok(table
            .rows
            .values()
            .filter(|row| row.ticket.is_expired_at(now))
            .map(|row| row.ticket.clone())
            .collect())
    }

    async fn count_live(&self, tenant: &TenantContext, queue_name: &str) -> Result<usize> {
        let table = read(&self.tickets, "tickets read")?;
        Ok(table
            .rows
            .values()
            .filter(|row| {
                row.ticket.game_id == tenant.game_id
                    && row.ticket.queue_name == queue_name
                    && row.ticket.status.is_live()
            })
            .count())
    }

    async fn transition(
        &self,
        tenant: &TenantContext,
        id: TicketId,
        from: &[TicketStatus],
        to: TicketStatus,
        match_id: Option<MatchId>,
        now: DateTime<Utc>,
    ) -> Result<Ticket> {
        let mut table = write(&self.tickets, "tickets write")?;
        let row = table
            .rows
            .get_mut(&id)
            .filter(|row| row.ticket.game_id == tenant.game_id)
            .ok_or_else(|| MatchmakingError::TicketNotFound {
                ticket_id: id.to_string(),
            })?;

        if !Self::apply_transition(row, from, to, match_id, now) {
            return Err(MatchmakingError::TicketNoLongerAvailable {
                ticket_id: id.to_string(),
            }
            .into());
        }
        Ok(row.ticket.clone())
    }

    async fn bulk_transition(
        &self,
        tenant: &TenantContext,
        ids: &[TicketId],
        from: &[TicketStatus],
        to: TicketStatus,
        match_id: Option<MatchId>,
        now: DateTime<Utc>,
    ) -> Result<BulkTransition> {
        let mut table = write(&self.tickets, "tickets write")?;
        let mut outcome = BulkTransition::default();

        for id in ids {
            let applied = table
                .rows
                .get_mut(id)
                .filter(|row| row.ticket.game_id == tenant.game_id)
                .and_then(|row| {
                    Self::apply_transition(row, from, to, match_id, now)
                        .then(|| row.ticket.clone())
                });
            match applied {
                Some(ticket) => outcome.applied.push(ticket),
                None => outcome.rejected.push(*id),
            }
        }

        Ok(outcome)
    }
}

#[async_trait]
impl MatchStore for InMemoryStore {
    async fn insert_match(&self, record: Match) -> Result<()> {
        let mut matches = write(&self.matches, "matches write")?;
        if matches.contains_key(&record.id) {
            return Err(MatchmakingError::InternalError {
                message: format!("Match {} already exists", record.id),
            }
            .into());
        }
        matches.insert(record.id, record);
        Ok(())
    }

    async fn get_match(&self, tenant: &TenantContext, id: MatchId) -> Result<Option<Match>> {
        let matches = read(&self.matches, "matches read")?;
        Ok(matches
            .get(&id)
            .filter(|m| m.game_id == tenant.game_id)
            .cloned())
    }

    async fn update_match_with(
        &self,
        mut record: Match,
        update: MatchWrite,
    ) -> Result<(Match, Option<Action>)> {
        let mut matches = write(&self.matches, "matches write")?;
        let stored = matches
            .get_mut(&record.id)
            .filter(|m| m.game_id == record.game_id)
            .ok_or_else(|| MatchmakingError::MatchNotFound {
                match_id: record.id.to_string(),
            })?;

        if stored.version != record.version {
            return Err(MatchmakingError::ConcurrentModification {
                entity: format!("match {}", record.id),
            }
            .into());
        }

        // take every lock before touching anything so a failure leaves no partial write
        let mut actions = write(&self.actions, "actions write")?;
        let mut archives = write(&self.archives, "archives write")?;

        record.version += 1;
        let appended = update.action.map(|mut action| {
            let log = actions.entry(record.id).or_default();
            action.sequence = log.len() as u64 + 1;
            log.push(action.clone());
            action
        });
        if let Some(final_state) = update.final_state {
            archives.insert(
                record.id,
                (record.game_id.clone(), record.archive_snapshot(final_state)),
            );
        }

        *stored = record.clone();
        Ok((record, appended))
    }

    async fn list_by_status(&self, statuses: &[MatchStatus]) -> Result<Vec<Match>> {
        let matches = read(&self.matches, "matches read")?;
        let mut result: Vec<Match> = matches
            .values()
            .filter(|m| statuses.contains(&m.status))
            .cloned()
            .collect();
        result.sort_by_key(|m| m.created_at);
        Ok(result)
    }

    async fn count_active(&self, tenant: &TenantContext, queue_name: &str) -> Result<usize> {
        let matches = read(&self.matches, "matches read")?;
        Ok(matches
            .values()
            .filter(|m| {
                m.game_id == tenant.game_id
                    && m.queue_name == queue_name
                    && !m.status.is_terminal()
            })
            .count())
    }

    async fn archived_snapshot(
        &self,
        tenant: &TenantContext,
        id: MatchId,
    ) -> Result<Option<serde_json::Value>> {
        let archives = read(&self.archives, "archives read")?;
        Ok(archives
            .get(&id)
            .filter(|(game_id, _)| *game_id == tenant.game_id)
            .map(|(_, snapshot)| snapshot.clone()))
    }
}

#[async_trait]
impl ActionStore for InMemoryStore {
    async fn list_actions(
        &self,
        tenant: &TenantContext,
        match_id: MatchId,
    ) -> Result<Vec<Action>> {
        let actions = read(&self.actions, "actions read")?;
        Ok(actions
            .get(&match_id)
            .map(|log| {
                log.iter()
                    .filter(|a| a.game_id == tenant.game_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
