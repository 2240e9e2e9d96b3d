//! Match session manager
//!
//! This module owns every match after group formation commits it: readiness,
//! start, presence, turn order, the action log and terminal transitions.
//! Each mutation is a read-modify-write against the durable record guarded by
//! its version, so a timeout sweep and a player call racing on the same match
//! can never both apply. Session state is mirrored into the cache after each
//! committed write and dropped once the match ends.

use crate::amqp::publisher::{publish_best_effort, EventPublisher};
use crate::cache::{MatchStateCache, SessionState};
use crate::error::{MatchmakingError, Result};
use crate::metrics::MetricsCollector;
use crate::queue::Queue;
use crate::session::state::{
    Action, Match, MatchPhase, MatchStatus, Presence, PresenceMode, PresenceStatus,
    TurnTimeoutAction,
};
use crate::storage::{ActionStore, MatchStore, MatchWrite, TicketStore};
use crate::ticket::{Ticket, TicketStatus};
use crate::types::{
    ActionSubmitted, EngineEvent, MatchFound, MatchId, MatchSource, MatchStatusChanged,
    TenantContext,
};
use crate::utils::{generate_action_id, saturating_add, seconds_to_duration, Clock};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Attempts at a versioned match update before the conflict is surfaced
const MAX_UPDATE_ATTEMPTS: usize = 3;

const NON_TERMINAL: [MatchStatus; 4] = [
    MatchStatus::Created,
    MatchStatus::Ready,
    MatchStatus::InProgress,
    MatchStatus::WaitingTurn,
];

/// Session defaults applied when a queue leaves them unset
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub default_turn_timeout_seconds: u64,
    pub default_match_timeout_seconds: u64,
    /// Lifetime of cached session state
    pub cache_ttl: Duration,
    /// Start every match as soon as all participants are ready
    pub auto_start_when_ready: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_turn_timeout_seconds: 60,
            default_match_timeout_seconds: 300,
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            auto_start_when_ready: false,
        }
    }
}

/// Statistics about session manager operations
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Total matches created
    pub matches_created: u64,
    /// Total matches that reached a terminal status
    pub matches_ended: u64,
    /// Total actions appended
    pub actions_recorded: u64,
    /// Total turn deadlines handled by the sweep
    pub turns_timed_out: u64,
    /// Current number of non-terminal matches
    pub active_matches: usize,
}

/// Result of one versioned update
struct Committed {
    record: Match,
    changes: Vec<MatchStatusChanged>,
    written: bool,
    /// Action appended by the same write
    action: Option<Action>,
}

pub struct SessionManager {
    matches: Arc<dyn MatchStore>,
    actions: Arc<dyn ActionStore>,
    tickets: Arc<dyn TicketStore>,
    cache: Arc<dyn MatchStateCache>,
    event_publisher: Arc<dyn EventPublisher>,
    metrics_collector: Arc<MetricsCollector>,
    clock: Arc<dyn Clock>,
    settings: SessionSettings,
    stats: RwLock<SessionStats>,
}

/// Apply a status change and queue the matching event
fn change_status(
    record: &mut Match,
    to: MatchStatus,
    phase: MatchPhase,
    reason: Option<&str>,
    now: DateTime<Utc>,
    changes: &mut Vec<MatchStatusChanged>,
) -> Result<()> {
    let from = record.transition(to, phase, reason.map(str::to_string))?;
    if to.is_terminal() {
        record.completed_at = Some(now);
        record.next_action_deadline = None;
    }
    changes.push(MatchStatusChanged {
        game_id: record.game_id.clone(),
        match_id: record.id,
        from,
        to,
        phase,
        reason: reason.map(str::to_string),
        timestamp: now,
    });
    Ok(())
}

/// Ready -> InProgress, handing out the first turn when order is enforced
fn begin(record: &mut Match, now: DateTime<Utc>, changes: &mut Vec<MatchStatusChanged>) -> Result<()> {
    change_status(record, MatchStatus::InProgress, MatchPhase::Starting, None, now, changes)?;
    record.started_at = Some(now);
    record.turn_number = 1;
    record.next_action_deadline = Some(saturating_add(now, record.turn_timeout()));

    if record.turn_policy.enforce_turn_order {
        record.current_turn = record.next_turn_holder(None);
        change_status(record, MatchStatus::WaitingTurn, MatchPhase::Starting, None, now, changes)?;
    }
    Ok(())
}

/// Hand the turn to the next eligible participant and restart the clock
fn advance_turn(record: &mut Match, now: DateTime<Utc>) {
    record.current_turn = record.next_turn_holder(record.current_turn.as_deref());
    record.turn_number += 1;
    record.next_action_deadline = Some(saturating_add(now, record.turn_timeout()));
}

fn upsert_presence(
    record: &mut Match,
    player_id: &str,
    session_id: Option<&str>,
    status: PresenceStatus,
    meta: Option<Value>,
    now: DateTime<Utc>,
) -> Result<()> {
    if let Some(presence) = record
        .presences
        .iter_mut()
        .find(|p| p.player_id == player_id)
    {
        presence.status = status;
        presence.last_seen = now;
        if let Some(session_id) = session_id {
            presence.session_id = session_id.to_string();
        }
        if let Some(meta) = meta {
            presence.meta = meta;
        }
        return Ok(());
    }

    let mode = if record.is_participant(player_id) {
        PresenceMode::Player
    } else if status == PresenceStatus::Spectating {
        PresenceMode::Spectator
    } else {
        return Err(MatchmakingError::validation(format!(
            "Player {} is not a participant of match {}",
            player_id, record.id
        ))
        .into());
    };

    record.presences.push(Presence {
        player_id: player_id.to_string(),
        session_id: session_id.unwrap_or_default().to_string(),
        status,
        mode,
        joined_at: now,
        last_seen: now,
        meta: meta.unwrap_or(Value::Null),
    });
    Ok(())
}

/// Abandonment and pause rules that follow any presence change
fn apply_presence_rules(
    record: &mut Match,
    now: DateTime<Utc>,
    changes: &mut Vec<MatchStatusChanged>,
) -> Result<()> {
    if record.status.is_terminal() {
        return Ok(());
    }

    let active = record.active_participants(now).len();
    if active < record.min_players {
        let reason = "not enough active participants";
        if record.status.is_playing() {
            change_status(record, MatchStatus::Abandoned, MatchPhase::Cleanup, Some(reason), now, changes)?;
        } else {
            change_status(record, MatchStatus::Cancelled, MatchPhase::Cleanup, Some(reason), now, changes)?;
        }
        return Ok(());
    }

    if record.status.is_playing() {
        if record.has_disconnected_participant() {
            record.set_phase(MatchPhase::Paused)?;
        } else if record.phase == MatchPhase::Paused {
            record.set_phase(MatchPhase::Playing)?;
        }
    } else if record.status == MatchStatus::Created && record.phase == MatchPhase::Initialization {
        record.set_phase(MatchPhase::WaitingPlayers)?;
    }
    Ok(())
}

fn is_version_conflict(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<MatchmakingError>(),
        Some(MatchmakingError::ConcurrentModification { .. })
    )
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        matches: Arc<dyn MatchStore>,
        actions: Arc<dyn ActionStore>,
        tickets: Arc<dyn TicketStore>,
        cache: Arc<dyn MatchStateCache>,
        event_publisher: Arc<dyn EventPublisher>,
        metrics_collector: Arc<MetricsCollector>,
        clock: Arc<dyn Clock>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            matches,
            actions,
            tickets,
            cache,
            event_publisher,
            metrics_collector,
            clock,
            settings,
            stats: RwLock::new(SessionStats::default()),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Persist a freshly committed group as a new match and announce it
    pub async fn create_match(
        &self,
        tenant: &TenantContext,
        queue: &Queue,
        match_id: MatchId,
        tickets: &[Ticket],
        source: MatchSource,
    ) -> Result<Match> {
        if queue.game_id != tenant.game_id {
            return Err(MatchmakingError::QueueNotFound {
                queue_name: queue.name.clone(),
            }
            .into());
        }
        if tickets.len() < queue.min_players || tickets.len() > queue.max_players {
            return Err(MatchmakingError::validation(format!(
                "Group of {} does not fit queue '{}' bounds {}..={}",
                tickets.len(),
                queue.name,
                queue.min_players,
                queue.max_players
            ))
            .into());
        }

        let now = self.clock.now();
        let timeouts = (
            queue
                .turn_timeout_seconds
                .unwrap_or(self.settings.default_turn_timeout_seconds),
            queue
                .match_timeout_seconds
                .unwrap_or(self.settings.default_match_timeout_seconds),
        );
        let mut record = Match::new(
            match_id,
            queue,
            tickets.iter().map(|t| t.player_id.clone()).collect(),
            tickets.iter().map(|t| t.id).collect(),
            source,
            timeouts,
            now,
        );
        record.auto_start_when_ready |= self.settings.auto_start_when_ready;

        self.matches.insert_match(record.clone()).await?;
        self.refresh_cache(&record).await;

        self.metrics_collector.record_match_created(source);
        if let Ok(mut stats) = self.stats.write() {
            stats.matches_created += 1;
        }

        info!(
            game_id = %tenant.game_id,
            match_id = %record.id,
            queue = %queue.name,
            players = record.participants.len(),
            source = source.as_str(),
            "Match created"
        );

        let event = MatchFound {
            game_id: record.game_id.clone(),
            match_id: record.id,
            queue_name: record.queue_name.clone(),
            participants: record.participants.clone(),
            ticket_ids: record.ticket_ids.clone(),
            source,
            timestamp: now,
        };
        publish_best_effort(
            self.event_publisher.as_ref(),
            &self.metrics_collector,
            EngineEvent::MatchFound(event),
        )
        .await;

        Ok(record)
    }

    pub async fn get_match(&self, tenant: &TenantContext, match_id: MatchId) -> Result<Match> {
        self.matches
            .get_match(tenant, match_id)
            .await?
            .ok_or_else(|| {
                MatchmakingError::MatchNotFound {
                    match_id: match_id.to_string(),
                }
                .into()
            })
    }

    /// Record a participant as ready; the last one moves the match to Ready
    pub async fn mark_ready(
        &self,
        tenant: &TenantContext,
        match_id: MatchId,
        player_id: &str,
    ) -> Result<Match> {
        let committed = self
            .update_with(tenant, match_id, |record, now, changes| {
                if !record.is_participant(player_id) {
                    return Err(MatchmakingError::validation(format!(
                        "Player {} is not a participant of match {}",
                        player_id, record.id
                    ))
                    .into());
                }
                match record.status {
                    MatchStatus::Created => {}
                    MatchStatus::Ready => return Ok(false),
                    status => {
                        return Err(MatchmakingError::invalid_state(format!(
                            "Cannot mark ready while match is {}",
                            status
                        ))
                        .into())
                    }
                }

                record.ready_players.insert(player_id.to_string());
                if record.phase == MatchPhase::Initialization {
                    record.set_phase(MatchPhase::WaitingPlayers)?;
                }

                if record.all_ready() {
                    change_status(record, MatchStatus::Ready, MatchPhase::ReadyCheck, None, now, changes)?;
                    if record.auto_start_when_ready {
                        begin(record, now, changes)?;
                    }
                }
                Ok(true)
            })
            .await?;

        debug!(match_id = %match_id, player_id, "Player ready");
        Ok(self.finish(committed).await)
    }

    /// Begin play for a match whose participants are all ready
    pub async fn start_match(&self, tenant: &TenantContext, match_id: MatchId) -> Result<Match> {
        let committed = self
            .update_with(tenant, match_id, |record, now, changes| {
                if record.status != MatchStatus::Ready {
                    return Err(MatchmakingError::invalid_state(format!(
                        "Cannot start match {} from {}",
                        record.id, record.status
                    ))
                    .into());
                }
                begin(record, now, changes)?;
                Ok(true)
            })
            .await?;

        Ok(self.finish(committed).await)
    }

    /// Upsert a presence entry and apply pause and abandonment rules
    pub async fn update_presence(
        &self,
        tenant: &TenantContext,
        match_id: MatchId,
        player_id: &str,
        session_id: &str,
        status: PresenceStatus,
        meta: Option<Value>,
    ) -> Result<Match> {
        let committed = self
            .update_with(tenant, match_id, |record, now, changes| {
                if record.status.is_terminal() {
                    return Err(MatchmakingError::invalid_state(format!(
                        "Match {} has ended",
                        record.id
                    ))
                    .into());
                }
                upsert_presence(record, player_id, Some(session_id), status, meta.clone(), now)?;
                if status == PresenceStatus::Left {
                    Self::pass_turn_if_holder(record, player_id, now);
                }
                apply_presence_rules(record, now, changes)?;
                Ok(true)
            })
            .await?;

        debug!(match_id = %match_id, player_id, status = ?status, "Presence updated");
        Ok(self.finish(committed).await)
    }

    /// Mark the player's presence as Left
    pub async fn leave_match(
        &self,
        tenant: &TenantContext,
        match_id: MatchId,
        player_id: &str,
    ) -> Result<Match> {
        let committed = self
            .update_with(tenant, match_id, |record, now, changes| {
                if record.status.is_terminal() {
                    return Err(MatchmakingError::invalid_state(format!(
                        "Match {} has ended",
                        record.id
                    ))
                    .into());
                }
                if !record.is_participant(player_id) && record.presence(player_id).is_none() {
                    return Err(MatchmakingError::validation(format!(
                        "Player {} is not part of match {}",
                        player_id, record.id
                    ))
                    .into());
                }
                upsert_presence(record, player_id, None, PresenceStatus::Left, None, now)?;
                Self::pass_turn_if_holder(record, player_id, now);
                apply_presence_rules(record, now, changes)?;
                Ok(true)
            })
            .await?;

        info!(match_id = %match_id, player_id, status = %committed.record.status, "Player left match");
        Ok(self.finish(committed).await)
    }

    fn pass_turn_if_holder(record: &mut Match, player_id: &str, now: DateTime<Utc>) {
        if record.status.is_playing()
            && record.turn_policy.enforce_turn_order
            && record.current_turn.as_deref() == Some(player_id)
        {
            advance_turn(record, now);
        }
    }

    /// Validate and append a player action
    ///
    /// The turn advance and the log append commit as one versioned write. If
    /// that write loses to a timeout sweep or an `end_match`, the action is
    /// re-checked against the new state, so a late action is rejected and the
    /// log is left untouched.
    pub async fn submit_action(
        &self,
        tenant: &TenantContext,
        match_id: MatchId,
        player_id: &str,
        action_type: &str,
        payload: Value,
    ) -> Result<Action> {
        let committed = self
            .write_with(tenant, match_id, |record, now, _changes| {
                if !record.status.is_playing() {
                    return Err(MatchmakingError::invalid_state(format!(
                        "Match {} is {}; actions are not accepted",
                        record.id, record.status
                    ))
                    .into());
                }
                if !record.is_participant(player_id) {
                    return Err(MatchmakingError::validation(format!(
                        "Player {} is not a participant of match {}",
                        player_id, record.id
                    ))
                    .into());
                }
                if record
                    .presence(player_id)
                    .is_some_and(|p| p.status == PresenceStatus::Left)
                {
                    return Err(MatchmakingError::invalid_state(format!(
                        "Player {} has left match {}",
                        player_id, record.id
                    ))
                    .into());
                }
                if let Some(deadline) = record.next_action_deadline {
                    if deadline < now {
                        return Err(MatchmakingError::invalid_state(format!(
                            "Turn deadline for match {} has passed",
                            record.id
                        ))
                        .into());
                    }
                }
                if record.turn_policy.enforce_turn_order
                    && record.current_turn.as_deref() != Some(player_id)
                {
                    return Err(MatchmakingError::NotPlayersTurn {
                        player_id: player_id.to_string(),
                    }
                    .into());
                }

                let action = Action {
                    id: generate_action_id(),
                    game_id: record.game_id.clone(),
                    match_id,
                    player_id: player_id.to_string(),
                    action_type: action_type.to_string(),
                    payload: payload.clone(),
                    timestamp: now,
                    sequence: 0,
                    turn_number: record.turn_number,
                };
                record.last_action_at = Some(now);
                if record.phase == MatchPhase::Starting {
                    record.set_phase(MatchPhase::Playing)?;
                }
                if record.turn_policy.enforce_turn_order {
                    advance_turn(record, now);
                } else {
                    record.turn_number += 1;
                    record.next_action_deadline = Some(saturating_add(now, record.turn_timeout()));
                }
                Ok(Some(MatchWrite {
                    action: Some(action),
                    ..MatchWrite::default()
                }))
            })
            .await?;

        let action = committed.action.clone().ok_or_else(|| MatchmakingError::InternalError {
            message: format!("Store did not return the action appended to match {}", match_id),
        })?;

        self.metrics_collector.record_action();
        if let Ok(mut stats) = self.stats.write() {
            stats.actions_recorded += 1;
        }

        let record = self.finish(committed).await;
        debug!(
            match_id = %match_id,
            player_id,
            action_type,
            sequence = action.sequence,
            "Action recorded"
        );

        let event = ActionSubmitted {
            game_id: action.game_id.clone(),
            match_id,
            action_id: action.id,
            player_id: action.player_id.clone(),
            action_type: action.action_type.clone(),
            sequence: action.sequence,
            next_turn_holder: record.current_turn.clone(),
            timestamp: action.timestamp,
        };
        publish_best_effort(
            self.event_publisher.as_ref(),
            &self.metrics_collector,
            EngineEvent::ActionSubmitted(event),
        )
        .await;

        Ok(action)
    }

    /// Complete a match and archive its final state
    ///
    /// The status change and the archived snapshot commit together, so a
    /// completed match always has its snapshot before the cache entry goes.
    pub async fn end_match(
        &self,
        tenant: &TenantContext,
        match_id: MatchId,
        player_id: &str,
        final_state: Value,
    ) -> Result<Match> {
        let committed = self
            .write_with(tenant, match_id, |record, now, changes| {
                if !record.status.is_playing() {
                    return Err(MatchmakingError::invalid_state(format!(
                        "Cannot end match {} from {}",
                        record.id, record.status
                    ))
                    .into());
                }
                if !record.is_participant(player_id) {
                    return Err(MatchmakingError::validation(format!(
                        "Player {} is not a participant of match {}",
                        player_id, record.id
                    ))
                    .into());
                }
                change_status(record, MatchStatus::Completed, MatchPhase::GameOver, None, now, changes)?;
                Ok(Some(MatchWrite {
                    final_state: Some(final_state.clone()),
                    ..MatchWrite::default()
                }))
            })
            .await?;

        info!(game_id = %tenant.game_id, match_id = %match_id, ended_by = player_id, "Match completed");
        Ok(self.finish(committed).await)
    }

    /// Cancel a match that has not started
    pub async fn cancel_match(
        &self,
        tenant: &TenantContext,
        match_id: MatchId,
        reason: &str,
    ) -> Result<Match> {
        let committed = self
            .update_with(tenant, match_id, |record, now, changes| {
                if !record.status.is_pre_start() {
                    return Err(MatchmakingError::invalid_state(format!(
                        "Cannot cancel match {} from {}",
                        record.id, record.status
                    ))
                    .into());
                }
                change_status(record, MatchStatus::Cancelled, MatchPhase::Cleanup, Some(reason), now, changes)?;
                Ok(true)
            })
            .await?;

        info!(match_id = %match_id, reason, "Match cancelled");
        Ok(self.finish(committed).await)
    }

    /// Apply each playing match's turn policy once its deadline has passed
    pub async fn process_turn_timeouts(&self, now: DateTime<Utc>) -> Result<usize> {
        let candidates = self
            .matches
            .list_by_status(&[MatchStatus::InProgress, MatchStatus::WaitingTurn])
            .await?;

        let mut handled = 0;
        for candidate in candidates {
            if !candidate.next_action_deadline.is_some_and(|d| d < now) {
                continue;
            }

            let tenant = TenantContext::new(candidate.game_id.clone());
            let result = self
                .update_with(&tenant, candidate.id, |record, _, changes| {
                    let expired = record.status.is_playing()
                        && record.next_action_deadline.is_some_and(|d| d < now);
                    if !expired {
                        return Ok(false);
                    }
                    Self::apply_turn_timeout(record, now, changes)?;
                    Ok(true)
                })
                .await;

            match result {
                Ok(committed) => {
                    if committed.written {
                        handled += 1;
                        if let Ok(mut stats) = self.stats.write() {
                            stats.turns_timed_out += 1;
                        }
                        warn!(
                            match_id = %committed.record.id,
                            status = %committed.record.status,
                            turn_holder = ?committed.record.current_turn,
                            "Turn deadline passed"
                        );
                    }
                    self.finish(committed).await;
                }
                Err(e) => error!(match_id = %candidate.id, error = %e, "Turn timeout handling failed"),
            }
        }

        Ok(handled)
    }

    fn apply_turn_timeout(
        record: &mut Match,
        now: DateTime<Utc>,
        changes: &mut Vec<MatchStatusChanged>,
    ) -> Result<()> {
        let reason = Some("turn deadline passed");
        match record.turn_policy.on_timeout {
            TurnTimeoutAction::SkipTurn if record.turn_policy.enforce_turn_order => {
                advance_turn(record, now);
                if record.current_turn.is_none() {
                    change_status(record, MatchStatus::Abandoned, MatchPhase::Cleanup, reason, now, changes)?;
                }
                Ok(())
            }
            TurnTimeoutAction::SkipTurn | TurnTimeoutAction::Expire => {
                change_status(record, MatchStatus::Expired, MatchPhase::Cleanup, reason, now, changes)
            }
            TurnTimeoutAction::Abandon => {
                change_status(record, MatchStatus::Abandoned, MatchPhase::Cleanup, reason, now, changes)
            }
            TurnTimeoutAction::Error => {
                change_status(record, MatchStatus::Error, MatchPhase::Cleanup, reason, now, changes)
            }
        }
    }

    /// Cancel stale ready checks and abandon matches whose players are gone
    pub async fn process_presence_timeouts(&self, now: DateTime<Utc>) -> Result<usize> {
        let candidates = self.matches.list_by_status(&NON_TERMINAL).await?;

        let mut handled = 0;
        for candidate in candidates {
            let tenant = TenantContext::new(candidate.game_id.clone());
            let result = self
                .update_with(&tenant, candidate.id, |record, _, changes| {
                    if record.status.is_terminal() {
                        return Ok(false);
                    }

                    let limit = seconds_to_duration(record.match_timeout_seconds);
                    if record.status.is_pre_start() && now - record.created_at > limit {
                        change_status(
                            record,
                            MatchStatus::Cancelled,
                            MatchPhase::Cleanup,
                            Some("ready check timed out"),
                            now,
                            changes,
                        )?;
                        return Ok(true);
                    }

                    if record.active_participants(now).len() < record.min_players {
                        apply_presence_rules(record, now, changes)?;
                        return Ok(true);
                    }
                    Ok(false)
                })
                .await;

            match result {
                Ok(committed) => {
                    if committed.written {
                        handled += 1;
                    }
                    self.finish(committed).await;
                }
                Err(e) => error!(match_id = %candidate.id, error = %e, "Presence timeout handling failed"),
            }
        }

        Ok(handled)
    }

    /// Action log ordered by timestamp, ties broken by append order
    pub async fn list_actions(&self, tenant: &TenantContext, match_id: MatchId) -> Result<Vec<Action>> {
        self.get_match(tenant, match_id).await?;
        let mut actions = self.actions.list_actions(tenant, match_id).await?;
        actions.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.sequence.cmp(&b.sequence)));
        Ok(actions)
    }

    /// Cached session state, falling back to the durable record
    pub async fn session_state(
        &self,
        tenant: &TenantContext,
        match_id: MatchId,
    ) -> Result<SessionState> {
        match self.cache.get(match_id).await {
            Ok(Some(state)) if state.game_id == tenant.game_id => return Ok(state),
            Ok(_) => {}
            Err(e) => warn!(match_id = %match_id, error = %e, "Session cache read failed"),
        }

        let record = self.get_match(tenant, match_id).await?;
        if !record.status.is_terminal() {
            self.refresh_cache(&record).await;
        }
        Ok(SessionState::from(&record))
    }

    /// Final archived snapshot of a completed match
    pub async fn archived_snapshot(
        &self,
        tenant: &TenantContext,
        match_id: MatchId,
    ) -> Result<Option<Value>> {
        self.matches.archived_snapshot(tenant, match_id).await
    }

    pub async fn get_stats(&self) -> Result<SessionStats> {
        let active = self.matches.list_by_status(&NON_TERMINAL).await?.len();
        let mut stats = self
            .stats
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("session stats read"))?
            .clone();
        stats.active_matches = active;
        Ok(stats)
    }

    /// Load, mutate and conditionally write a match, retrying on version conflicts
    ///
    /// `apply` returns whether the record changed; unchanged records are not written.
    async fn update_with<F>(
        &self,
        tenant: &TenantContext,
        match_id: MatchId,
        mut apply: F,
    ) -> Result<Committed>
    where
        F: FnMut(&mut Match, DateTime<Utc>, &mut Vec<MatchStatusChanged>) -> Result<bool> + Send,
    {
        self.write_with(tenant, match_id, |record, now, changes| {
            Ok(apply(record, now, changes)?.then(MatchWrite::default))
        })
        .await
    }

    /// Like `update_with`, but `apply` may attach records that commit in the same write
    ///
    /// `None` means the record did not change.
    async fn write_with<F>(
        &self,
        tenant: &TenantContext,
        match_id: MatchId,
        mut apply: F,
    ) -> Result<Committed>
    where
        F: FnMut(&mut Match, DateTime<Utc>, &mut Vec<MatchStatusChanged>) -> Result<Option<MatchWrite>>
            + Send,
    {
        let mut attempt = 1;
        loop {
            let mut record = self.get_match(tenant, match_id).await?;
            let now = self.clock.now();
            let mut changes = Vec::new();

            let Some(extra) = apply(&mut record, now, &mut changes)? else {
                return Ok(Committed {
                    record,
                    changes,
                    written: false,
                    action: None,
                });
            };

            match self.matches.update_match_with(record, extra).await {
                Ok((record, action)) => {
                    return Ok(Committed {
                        record,
                        changes,
                        written: true,
                        action,
                    })
                }
                Err(e) if is_version_conflict(&e) && attempt < MAX_UPDATE_ATTEMPTS => {
                    debug!(match_id = %match_id, attempt, "Match changed underneath update; retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Side effects of a committed write: cache, tickets, metrics, events
    async fn finish(&self, committed: Committed) -> Match {
        let Committed {
            record,
            changes,
            written,
            ..
        } = committed;
        if !written {
            return record;
        }

        if record.status.is_terminal() {
            if let Err(e) = self.cache.remove(record.id).await {
                warn!(match_id = %record.id, error = %e, "Failed to drop cached session state");
            }
        } else {
            self.refresh_cache(&record).await;
        }

        for change in changes {
            match change.to {
                MatchStatus::InProgress => self.settle_tickets(&record).await,
                MatchStatus::Cancelled => self.release_tickets(&record).await,
                _ => {}
            }
            if change.to.is_terminal() {
                self.metrics_collector.record_match_ended(change.to);
                if let Ok(mut stats) = self.stats.write() {
                    stats.matches_ended += 1;
                }
                info!(
                    match_id = %record.id,
                    from = %change.from,
                    to = %change.to,
                    reason = ?change.reason,
                    "Match ended"
                );
            }
            publish_best_effort(
                self.event_publisher.as_ref(),
                &self.metrics_collector,
                EngineEvent::MatchStatusChanged(change),
            )
            .await;
        }

        record
    }

    async fn refresh_cache(&self, record: &Match) {
        if let Err(e) = self
            .cache
            .set(SessionState::from(record), self.settings.cache_ttl)
            .await
        {
            warn!(match_id = %record.id, error = %e, "Failed to cache session state");
        }
    }

    /// Member tickets still in MatchFound become Matched once play starts
    async fn settle_tickets(&self, record: &Match) {
        let tenant = TenantContext::new(record.game_id.clone());
        let result = self
            .tickets
            .bulk_transition(
                &tenant,
                &record.ticket_ids,
                &[TicketStatus::MatchFound],
                TicketStatus::Matched,
                None,
                self.clock.now(),
            )
            .await;

        match result {
            Ok(outcome) => self
                .metrics_collector
                .record_ticket_transition(TicketStatus::Matched, outcome.applied.len()),
            Err(e) => warn!(match_id = %record.id, error = %e, "Failed to settle match tickets"),
        }
    }

    /// MatchFound tickets of a cancelled match go back to the pool; accepted ones are final
    async fn release_tickets(&self, record: &Match) {
        let tenant = TenantContext::new(record.game_id.clone());
        let result = self
            .tickets
            .bulk_transition(
                &tenant,
                &record.ticket_ids,
                &[TicketStatus::MatchFound],
                TicketStatus::Queued,
                None,
                self.clock.now(),
            )
            .await;

        match result {
            Ok(outcome) if !outcome.applied.is_empty() => {
                self.metrics_collector
                    .record_ticket_transition(TicketStatus::Queued, outcome.applied.len());
                debug!(
                    match_id = %record.id,
                    requeued = outcome.applied.len(),
                    "Returned tickets of cancelled match to the pool"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(match_id = %record.id, error = %e, "Failed to release match tickets"),
        }
    }
}
