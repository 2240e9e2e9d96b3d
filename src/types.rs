//! Common types used throughout the matchmaking engine

use crate::session::state::{MatchPhase, MatchStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Tenant (game) identifier scoping every queue, ticket and match
pub type GameId = String;

/// Unique identifier for players
pub type PlayerId = String;

/// Unique identifier for match tickets
pub type TicketId = Uuid;

/// Unique identifier for matches
pub type MatchId = Uuid;

/// Unique identifier for recorded actions
pub type ActionId = Uuid;

/// Player attributes captured at enqueue time and used for scoring
pub type AttributeSnapshot = BTreeMap<String, serde_json::Value>;

/// Per-request tenant scope, threaded explicitly through every store call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantContext {
    pub game_id: GameId,
}

impl TenantContext {
    pub fn new(game_id: impl Into<GameId>) -> Self {
        Self {
            game_id: game_id.into(),
        }
    }
}

impl std::fmt::Display for TenantContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.game_id)
    }
}

/// Which strategy produced a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchSource {
    BuiltIn,
    Custom,
}

impl MatchSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchSource::BuiltIn => "builtin",
            MatchSource::Custom => "custom",
        }
    }
}

/// Event emitted when a group has been committed as a new match
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchFound {
    pub game_id: GameId,
    pub match_id: MatchId,
    pub queue_name: String,
    pub participants: Vec<PlayerId>,
    pub ticket_ids: Vec<TicketId>,
    pub source: MatchSource,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted on every match status transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchStatusChanged {
    pub game_id: GameId,
    pub match_id: MatchId,
    pub from: MatchStatus,
    pub to: MatchStatus,
    pub phase: MatchPhase,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted when a player action has been appended to the log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSubmitted {
    pub game_id: GameId,
    pub match_id: MatchId,
    pub action_id: ActionId,
    pub player_id: PlayerId,
    pub action_type: String,
    pub sequence: u64,
    pub next_turn_holder: Option<PlayerId>,
    pub timestamp: DateTime<Utc>,
}

/// Union type for all outbound events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    MatchFound(MatchFound),
    MatchStatusChanged(MatchStatusChanged),
    ActionSubmitted(ActionSubmitted),
}

impl EngineEvent {
    /// Short event name used for routing and metrics labels
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::MatchFound(_) => "match_found",
            EngineEvent::MatchStatusChanged(_) => "match_status_changed",
            EngineEvent::ActionSubmitted(_) => "action_submitted",
        }
    }
}
