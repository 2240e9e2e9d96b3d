//! Match, presence and action records
//!
//! A match carries two orthogonal state axes: the coarse [`MatchStatus`]
//! lifecycle and the finer-grained [`MatchPhase`]. Only certain
//! combinations are legal; see [`MatchStatus::allows_phase`].

use crate::error::{MatchmakingError, Result};
use crate::queue::Queue;
use crate::types::{ActionId, GameId, MatchId, MatchSource, PlayerId, TicketId};
use crate::utils::seconds_to_duration;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Coarse match lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchStatus {
    Created,
    Ready,
    InProgress,
    WaitingTurn,
    Completed,
    Abandoned,
    Expired,
    Error,
    Cancelled,
}

impl MatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MatchStatus::Completed
                | MatchStatus::Abandoned
                | MatchStatus::Expired
                | MatchStatus::Error
                | MatchStatus::Cancelled
        )
    }

    /// Created or Ready: players matched but play has not begun
    pub fn is_pre_start(&self) -> bool {
        matches!(self, MatchStatus::Created | MatchStatus::Ready)
    }

    /// InProgress or WaitingTurn: actions are accepted
    pub fn is_playing(&self) -> bool {
        matches!(self, MatchStatus::InProgress | MatchStatus::WaitingTurn)
    }

    pub fn can_transition_to(&self, to: MatchStatus) -> bool {
        use MatchStatus::*;
        match (self, to) {
            (Created, Ready) | (Created, Cancelled) | (Created, Error) => true,
            (Ready, InProgress) | (Ready, Cancelled) | (Ready, Error) => true,
            (InProgress, WaitingTurn) | (WaitingTurn, InProgress) => true,
            (InProgress | WaitingTurn, Completed | Abandoned | Expired | Error) => true,
            _ => false,
        }
    }

    /// Phases that may accompany this status
    pub fn allows_phase(&self, phase: MatchPhase) -> bool {
        use MatchPhase::*;
        match self {
            MatchStatus::Created => matches!(phase, Initialization | WaitingPlayers),
            MatchStatus::Ready => matches!(phase, ReadyCheck),
            MatchStatus::InProgress | MatchStatus::WaitingTurn => {
                matches!(phase, Starting | Playing | Paused)
            }
            _ => matches!(phase, GameOver | Cleanup),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Created => "created",
            MatchStatus::Ready => "ready",
            MatchStatus::InProgress => "in_progress",
            MatchStatus::WaitingTurn => "waiting_turn",
            MatchStatus::Completed => "completed",
            MatchStatus::Abandoned => "abandoned",
            MatchStatus::Expired => "expired",
            MatchStatus::Error => "error",
            MatchStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fine-grained match phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchPhase {
    Initialization,
    WaitingPlayers,
    ReadyCheck,
    Starting,
    Playing,
    Paused,
    GameOver,
    Cleanup,
}

/// What happens when a turn deadline passes without an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TurnTimeoutAction {
    /// Hand the turn to the next participant; matches without turn order expire instead
    #[default]
    SkipTurn,
    Abandon,
    Expire,
    Error,
}

/// Turn handling inherited by every match created from a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TurnPolicy {
    #[serde(default)]
    pub enforce_turn_order: bool,
    #[serde(default)]
    pub on_timeout: TurnTimeoutAction,
}

impl TurnPolicy {
    pub fn turn_based() -> Self {
        Self {
            enforce_turn_order: true,
            on_timeout: TurnTimeoutAction::SkipTurn,
        }
    }
}

/// Connection state reported by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PresenceStatus {
    Connected,
    Disconnected,
    Joining,
    Left,
    Spectating,
    Away,
}

/// Whether the presence belongs to a participant or an observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PresenceMode {
    Player,
    Spectator,
}

/// Per-player connection entry for a match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub player_id: PlayerId,
    pub session_id: String,
    pub status: PresenceStatus,
    pub mode: PresenceMode,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl Presence {
    /// Whether this presence keeps a participant counted toward the match
    pub fn is_active(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        match self.status {
            PresenceStatus::Left => false,
            PresenceStatus::Disconnected => now - self.last_seen <= grace,
            _ => true,
        }
    }
}

/// Immutable entry in a match's action log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub game_id: GameId,
    pub match_id: MatchId,
    pub player_id: PlayerId,
    pub action_type: String,
    pub payload: serde_json::Value,
    /// Server receipt time
    pub timestamp: DateTime<Utc>,
    /// Position in the log, assigned on append; breaks timestamp ties
    pub sequence: u64,
    pub turn_number: u64,
}

/// An active or finished game instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: MatchId,
    pub game_id: GameId,
    pub queue_name: String,
    pub participants: Vec<PlayerId>,
    pub ticket_ids: Vec<TicketId>,
    pub source: MatchSource,
    pub status: MatchStatus,
    pub phase: MatchPhase,
    pub presences: Vec<Presence>,
    pub ready_players: BTreeSet<PlayerId>,
    pub min_players: usize,
    pub turn_policy: TurnPolicy,
    pub auto_start_when_ready: bool,
    pub turn_timeout_seconds: u64,
    pub match_timeout_seconds: u64,
    pub current_turn: Option<PlayerId>,
    pub turn_number: u64,
    pub next_action_deadline: Option<DateTime<Utc>>,
    pub last_action_at: Option<DateTime<Utc>>,
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Bumped by the store on every successful update
    pub version: u64,
}

impl Match {
    /// Build a freshly committed match from its queue and participant list
    pub fn new(
        id: MatchId,
        queue: &Queue,
        participants: Vec<PlayerId>,
        ticket_ids: Vec<TicketId>,
        source: MatchSource,
        timeouts: (u64, u64),
        now: DateTime<Utc>,
    ) -> Self {
        let (turn_timeout_seconds, match_timeout_seconds) = timeouts;
        Self {
            id,
            game_id: queue.game_id.clone(),
            queue_name: queue.name.clone(),
            participants,
            ticket_ids,
            source,
            status: MatchStatus::Created,
            phase: MatchPhase::Initialization,
            presences: Vec::new(),
            ready_players: BTreeSet::new(),
            min_players: queue.min_players,
            turn_policy: queue.turn_policy,
            auto_start_when_ready: queue.auto_start_when_ready,
            turn_timeout_seconds,
            match_timeout_seconds,
            current_turn: None,
            turn_number: 0,
            next_action_deadline: None,
            last_action_at: None,
            status_reason: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            version: 0,
        }
    }

    pub fn is_participant(&self, player_id: &str) -> bool {
        self.participants.iter().any(|p| p == player_id)
    }

    pub fn presence(&self, player_id: &str) -> Option<&Presence> {
        self.presences.iter().find(|p| p.player_id == player_id)
    }

    /// Move to a new status/phase pair, rejecting illegal combinations
    pub fn transition(
        &mut self,
        to: MatchStatus,
        phase: MatchPhase,
        reason: Option<String>,
    ) -> Result<MatchStatus> {
        if !self.status.can_transition_to(to) {
            return Err(MatchmakingError::invalid_state(format!(
                "Match {} cannot move from {} to {}",
                self.id, self.status, to
            ))
            .into());
        }
        if !to.allows_phase(phase) {
            return Err(MatchmakingError::invalid_state(format!(
                "Phase {:?} is not valid for status {}",
                phase, to
            ))
            .into());
        }

        let from = self.status;
        self.status = to;
        self.phase = phase;
        if reason.is_some() {
            self.status_reason = reason;
        }
        Ok(from)
    }

    /// Change phase without touching status
    pub fn set_phase(&mut self, phase: MatchPhase) -> Result<()> {
        if !self.status.allows_phase(phase) {
            return Err(MatchmakingError::invalid_state(format!(
                "Phase {:?} is not valid for status {}",
                phase, self.status
            ))
            .into());
        }
        self.phase = phase;
        Ok(())
    }

    /// Participants still counted toward the match at `now`
    ///
    /// Players without a presence entry have not reported yet and count as active.
    pub fn active_participants(&self, now: DateTime<Utc>) -> Vec<PlayerId> {
        let grace = seconds_to_duration(self.match_timeout_seconds);
        self.participants
            .iter()
            .filter(|player| match self.presence(player) {
                Some(presence) => presence.is_active(now, grace),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Whether any participant is currently disconnected
    pub fn has_disconnected_participant(&self) -> bool {
        self.presences.iter().any(|p| {
            p.mode == PresenceMode::Player && p.status == PresenceStatus::Disconnected
        })
    }

    /// Next participant in order after `current`, skipping players who left
    pub fn next_turn_holder(&self, current: Option<&str>) -> Option<PlayerId> {
        let eligible = |player: &PlayerId| {
            self.presence(player)
                .map(|p| p.status != PresenceStatus::Left)
                .unwrap_or(true)
        };

        let start = current
            .and_then(|c| self.participants.iter().position(|p| p == c))
            .map(|idx| idx + 1)
            .unwrap_or(0);

        let len = self.participants.len();
        (0..len)
            .map(|offset| &self.participants[(start + offset) % len])
            .find(|player| eligible(player))
            .cloned()
    }

    pub fn turn_timeout(&self) -> Duration {
        seconds_to_duration(self.turn_timeout_seconds)
    }

    /// Document kept once the match leaves the cache
    pub fn archive_snapshot(&self, final_state: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "match": self,
            "final_state": final_state,
        })
    }

    pub fn all_ready(&self) -> bool {
        self.participants
            .iter()
            .all(|player| self.ready_players.contains(player))
    }
}
