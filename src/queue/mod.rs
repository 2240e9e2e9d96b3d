//! Queue definitions and the per-tenant queue registry
//!
//! A queue names a matchmaking pool inside a tenant, with its group size
//! bounds, ticket lifetime, compatibility criteria, optional external
//! matchmaker and the turn rules inherited by the matches it produces.

pub mod criteria;
pub mod registry;

pub use criteria::{Criterion, CriterionOperator};
pub use registry::QueueRegistry;

use crate::error::{MatchmakingError, Result};
use crate::session::state::TurnPolicy;
use crate::types::GameId;
use crate::utils::{seconds_to_duration, MAX_TIMEOUT_SECONDS};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn default_ticket_ttl() -> u64 {
    300
}

fn default_enabled() -> bool {
    true
}

/// Reference to an external grouping service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomMatchmakerRef {
    pub url: String,
    /// Per-call timeout; falls back to the service default when unset
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Caller-supplied queue configuration, as found in config files and admin requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDefinition {
    pub name: String,
    pub min_players: usize,
    pub max_players: usize,
    #[serde(default = "default_ticket_ttl")]
    pub ticket_ttl_seconds: u64,
    #[serde(default)]
    pub turn_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub match_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub criteria: Vec<Criterion>,
    #[serde(default)]
    pub custom_matchmaker: Option<CustomMatchmakerRef>,
    #[serde(default)]
    pub turn_policy: TurnPolicy,
    #[serde(default)]
    pub auto_start_when_ready: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl QueueDefinition {
    pub fn new(name: impl Into<String>, min_players: usize, max_players: usize) -> Self {
        Self {
            name: name.into(),
            min_players,
            max_players,
            ticket_ttl_seconds: default_ticket_ttl(),
            turn_timeout_seconds: None,
            match_timeout_seconds: None,
            criteria: Vec::new(),
            custom_matchmaker: None,
            turn_policy: TurnPolicy::default(),
            auto_start_when_ready: false,
            enabled: true,
        }
    }

    pub fn with_criteria(mut self, criteria: Vec<Criterion>) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn with_ticket_ttl(mut self, seconds: u64) -> Self {
        self.ticket_ttl_seconds = seconds;
        self
    }

    pub fn with_turn_policy(mut self, policy: TurnPolicy, turn_timeout_seconds: u64) -> Self {
        self.turn_policy = policy;
        self.turn_timeout_seconds = Some(turn_timeout_seconds);
        self
    }

    pub fn with_match_timeout(mut self, seconds: u64) -> Self {
        self.match_timeout_seconds = Some(seconds);
        self
    }

    pub fn with_custom_matchmaker(mut self, reference: CustomMatchmakerRef) -> Self {
        self.custom_matchmaker = Some(reference);
        self
    }

    pub fn with_auto_start(mut self) -> Self {
        self.auto_start_when_ready = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MatchmakingError::validation("Queue name cannot be empty").into());
        }

        if self.min_players < 1 {
            return Err(MatchmakingError::validation(format!(
                "Queue '{}' must require at least one player",
                self.name
            ))
            .into());
        }

        if self.min_players > self.max_players {
            return Err(MatchmakingError::validation(format!(
                "Queue '{}' has min_players {} greater than max_players {}",
                self.name, self.min_players, self.max_players
            ))
            .into());
        }

        if self.ticket_ttl_seconds == 0 {
            return Err(MatchmakingError::validation(format!(
                "Queue '{}' must have a positive ticket TTL",
                self.name
            ))
            .into());
        }

        if self.turn_timeout_seconds == Some(0) || self.match_timeout_seconds == Some(0) {
            return Err(MatchmakingError::validation(format!(
                "Queue '{}' timeouts must be positive when set",
                self.name
            ))
            .into());
        }

        let timeouts = [
            Some(self.ticket_ttl_seconds),
            self.turn_timeout_seconds,
            self.match_timeout_seconds,
        ];
        if timeouts.into_iter().flatten().any(|t| t > MAX_TIMEOUT_SECONDS) {
            return Err(MatchmakingError::validation(format!(
                "Queue '{}' timeouts cannot exceed {} seconds",
                self.name, MAX_TIMEOUT_SECONDS
            ))
            .into());
        }

        if let Some(reference) = &self.custom_matchmaker {
            if reference.url.trim().is_empty() {
                return Err(MatchmakingError::validation(format!(
                    "Queue '{}' custom matchmaker URL cannot be empty",
                    self.name
                ))
                .into());
            }
        }

        criteria::validate_criteria(&self.criteria)
    }

    /// Validate and bind the definition to a tenant
    pub fn into_queue(self, game_id: impl Into<GameId>, now: DateTime<Utc>) -> Result<Queue> {
        self.validate()?;
        Ok(Queue {
            game_id: game_id.into(),
            name: self.name,
            min_players: self.min_players,
            max_players: self.max_players,
            ticket_ttl_seconds: self.ticket_ttl_seconds,
            turn_timeout_seconds: self.turn_timeout_seconds,
            match_timeout_seconds: self.match_timeout_seconds,
            criteria: self.criteria,
            custom_matchmaker: self.custom_matchmaker,
            turn_policy: self.turn_policy,
            auto_start_when_ready: self.auto_start_when_ready,
            enabled: self.enabled,
            created_at: now,
            updated_at: now,
        })
    }
}

/// A named matchmaking pool inside a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Queue {
    pub game_id: GameId,
    pub name: String,
    pub min_players: usize,
    pub max_players: usize,
    pub ticket_ttl_seconds: u64,
    pub turn_timeout_seconds: Option<u64>,
    pub match_timeout_seconds: Option<u64>,
    pub criteria: Vec<Criterion>,
    pub custom_matchmaker: Option<CustomMatchmakerRef>,
    pub turn_policy: TurnPolicy,
    pub auto_start_when_ready: bool,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Queue {
    pub fn ticket_ttl(&self) -> chrono::Duration {
        seconds_to_duration(self.ticket_ttl_seconds)
    }

    pub fn uses_custom_matchmaker(&self) -> bool {
        self.custom_matchmaker.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_validation() {
        assert!(QueueDefinition::new("ranked", 2, 4).validate().is_ok());
        assert!(QueueDefinition::new("ranked", 0, 4).validate().is_err());
        assert!(QueueDefinition::new("ranked", 5, 4).validate().is_err());
        assert!(QueueDefinition::new("", 2, 2).validate().is_err());
        assert!(QueueDefinition::new("ranked", 2, 2)
            .with_ticket_ttl(0)
            .validate()
            .is_err());
        assert!(QueueDefinition::new("ranked", 2, 2)
            .with_criteria(vec![Criterion::new("skill", CriterionOperator::Range)])
            .validate()
            .is_err());
    }

    #[test]
    fn test_out_of_range_timeouts_rejected() {
        let err = QueueDefinition::new("long", 2, 2)
            .with_ticket_ttl(u64::MAX / 2)
            .validate()
            .unwrap_err();
        assert_eq!(
            crate::error::error_kind(&err),
            Some(crate::error::ErrorKind::Validation)
        );

        assert!(QueueDefinition::new("long", 2, 2)
            .with_match_timeout(u64::MAX)
            .validate()
            .is_err());
        assert!(QueueDefinition::new("long", 2, 2)
            .with_turn_policy(TurnPolicy::default(), MAX_TIMEOUT_SECONDS + 1)
            .validate()
            .is_err());
        assert!(QueueDefinition::new("long", 2, 2)
            .with_ticket_ttl(MAX_TIMEOUT_SECONDS)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_into_queue_binds_tenant() {
        let now = Utc::now();
        let queue = QueueDefinition::new("ranked", 2, 4)
            .with_criteria(vec![Criterion::equal("region")])
            .into_queue("game-1", now)
            .unwrap();

        assert_eq!(queue.game_id, "game-1");
        assert_eq!(queue.criteria.len(), 1);
        assert_eq!(queue.created_at, now);
        assert!(queue.enabled);
        assert!(!queue.uses_custom_matchmaker());
    }

    #[test]
    fn test_definition_from_toml() {
        let definition: QueueDefinition = toml::from_str(
            r#"
            name = "duel"
            min_players = 2
            max_players = 2

            [[criteria]]
            key = "skill"
            operator = "range"
            expansion_rate = 50.0

            [turn_policy]
            enforce_turn_order = true
            on_timeout = "abandon"
            "#,
        )
        .unwrap();

        assert_eq!(definition.ticket_ttl_seconds, 300);
        assert!(definition.turn_policy.enforce_turn_order);
        assert_eq!(
            definition.turn_policy.on_timeout,
            crate::session::state::TurnTimeoutAction::Abandon
        );
        assert!(definition.validate().is_ok());
    }
}
