//! Match state cache interface and the in-memory TTL implementation

use crate::error::{MatchmakingError, Result};
use crate::session::state::{Match, MatchPhase, MatchStatus, Presence};
use crate::types::{GameId, MatchId, PlayerId};
use crate::utils::{saturating_add, Clock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Read-optimised view of a live match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub match_id: MatchId,
    pub game_id: GameId,
    pub status: MatchStatus,
    pub phase: MatchPhase,
    pub participants: Vec<PlayerId>,
    pub presences: Vec<Presence>,
    pub current_turn: Option<PlayerId>,
    pub turn_number: u64,
    pub next_action_deadline: Option<DateTime<Utc>>,
    pub version: u64,
}

impl From<&Match> for SessionState {
    fn from(record: &Match) -> Self {
        Self {
            match_id: record.id,
            game_id: record.game_id.clone(),
            status: record.status,
            phase: record.phase,
            participants: record.participants.clone(),
            presences: record.presences.clone(),
            current_turn: record.current_turn.clone(),
            turn_number: record.turn_number,
            next_action_deadline: record.next_action_deadline,
            version: record.version,
        }
    }
}

/// Key-value cache for session state
#[async_trait]
pub trait MatchStateCache: Send + Sync {
    async fn get(&self, match_id: MatchId) -> Result<Option<SessionState>>;

    /// Store the state, replacing any previous entry and resetting its TTL
    async fn set(&self, state: SessionState, ttl: Duration) -> Result<()>;

    async fn remove(&self, match_id: MatchId) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    state: SessionState,
    expires_at: DateTime<Utc>,
}

/// Process-local cache; entries lapse lazily when read past their TTL
pub struct InMemoryMatchStateCache {
    entries: RwLock<HashMap<MatchId, CacheEntry>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryMatchStateCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Entries currently held, including lapsed ones not yet read
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MatchStateCache for InMemoryMatchStateCache {
    async fn get(&self, match_id: MatchId) -> Result<Option<SessionState>> {
        let now = self.clock.now();
        let mut entries = self
            .entries
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("cache write"))?;

        match entries.get(&match_id) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.state.clone())),
            Some(_) => {
                entries.remove(&match_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, state: SessionState, ttl: Duration) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| MatchmakingError::InternalError {
            message: format!("Invalid cache TTL: {}", e),
        })?;
        let expires_at = saturating_add(self.clock.now(), ttl);
        let mut entries = self
            .entries
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("cache write"))?;
        entries.insert(state.match_id, CacheEntry { state, expires_at });
        Ok(())
    }

    async fn remove(&self, match_id: MatchId) -> Result<bool> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("cache write"))?;
        Ok(entries.remove(&match_id).is_some())
    }
}
