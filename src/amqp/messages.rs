//! AMQP message definitions and serialization

use crate::error::{MatchmakingError, Result};
use crate::session::state::MatchStatus;
use crate::types::{EngineEvent, GameId};

/// Topic exchange used when configuration names none
pub const DEFAULT_EVENTS_EXCHANGE: &str = "matchforge.events";

/// Routing keys for events
pub const MATCH_FOUND_ROUTING_KEY: &str = "match.found";
pub const ACTION_SUBMITTED_ROUTING_KEY: &str = "match.action";

/// `match.status.<status>`, so consumers can bind to a single transition target
pub fn status_routing_key(status: MatchStatus) -> String {
    format!("match.status.{}", status.as_str())
}

/// Routing key for any engine event
pub fn routing_key_for(event: &EngineEvent) -> String {
    match event {
        EngineEvent::MatchFound(_) => MATCH_FOUND_ROUTING_KEY.to_string(),
        EngineEvent::MatchStatusChanged(e) => status_routing_key(e.to),
        EngineEvent::ActionSubmitted(_) => ACTION_SUBMITTED_ROUTING_KEY.to_string(),
    }
}

fn game_id_of(event: &EngineEvent) -> &GameId {
    match event {
        EngineEvent::MatchFound(e) => &e.game_id,
        EngineEvent::MatchStatusChanged(e) => &e.game_id,
        EngineEvent::ActionSubmitted(e) => &e.game_id,
    }
}

/// Message envelope with metadata
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MessageEnvelope<T> {
    pub payload: T,
    pub correlation_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub routing_key: String,
    /// Tenant the payload belongs to, duplicated here for header-based filtering
    pub game_id: GameId,
}

impl<T> MessageEnvelope<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    pub fn new(payload: T, routing_key: String, game_id: GameId) -> Self {
        Self {
            payload,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            routing_key,
            game_id,
        }
    }

    /// Serialize the envelope to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            MatchmakingError::InternalError {
                message: format!("Failed to serialize message: {}", e),
            }
            .into()
        })
    }

    /// Deserialize envelope from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            MatchmakingError::validation(format!("Failed to deserialize message: {}", e)).into()
        })
    }
}

impl MessageEnvelope<EngineEvent> {
    /// Wrap an engine event with its routing key and tenant
    pub fn for_event(event: EngineEvent) -> Self {
        let routing_key = routing_key_for(&event);
        let game_id = game_id_of(&event).clone();
        Self::new(event, routing_key, game_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::state::MatchPhase;
    use crate::types::{MatchFound, MatchSource, MatchStatusChanged};
    use chrono::Utc;

    fn status_event() -> EngineEvent {
        EngineEvent::MatchStatusChanged(MatchStatusChanged {
            game_id: "chess".to_string(),
            match_id: crate::utils::generate_match_id(),
            from: MatchStatus::Ready,
            to: MatchStatus::InProgress,
            phase: MatchPhase::Starting,
            reason: None,
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn test_routing_keys() {
        assert_eq!(routing_key_for(&status_event()), "match.status.in_progress");

        let found = EngineEvent::MatchFound(MatchFound {
            game_id: "chess".to_string(),
            match_id: crate::utils::generate_match_id(),
            queue_name: "blitz".to_string(),
            participants: vec!["a".to_string(), "b".to_string()],
            ticket_ids: vec![],
            source: MatchSource::BuiltIn,
            timestamp: Utc::now(),
        });
        assert_eq!(routing_key_for(&found), MATCH_FOUND_ROUTING_KEY);
    }

    #[test]
    fn test_envelope_bytes() {
        let envelope = MessageEnvelope::for_event(status_event());
        assert_eq!(envelope.game_id, "chess");
        assert!(!envelope.correlation_id.is_empty());

        let bytes = envelope.to_bytes().unwrap();
        let decoded = MessageEnvelope::<EngineEvent>::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.correlation_id, envelope.correlation_id);
        assert_eq!(decoded.payload.name(), "match_status_changed");

        assert!(MessageEnvelope::<EngineEvent>::from_bytes(b"not json").is_err());
    }
}
