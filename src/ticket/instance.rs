//! Ticket record and its status machine

use crate::types::{AttributeSnapshot, GameId, MatchId, PlayerId, TicketId};
use crate::utils::saturating_add;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a matchmaking request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketStatus {
    Queued,
    /// Claimed by a matchmaking pass; visible to no other pass
    Matching,
    MatchFound,
    Accepted,
    Declined,
    Cancelled,
    Expired,
    Matched,
    Error,
}

impl TicketStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TicketStatus::Accepted
                | TicketStatus::Declined
                | TicketStatus::Cancelled
                | TicketStatus::Expired
                | TicketStatus::Matched
                | TicketStatus::Error
        )
    }

    /// Live tickets block a second enqueue for the same player and queue
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    /// Lifecycle edges a caller may request; rollbacks of a failed commit are handled by the store
    pub fn can_transition_to(&self, to: TicketStatus) -> bool {
        use TicketStatus::*;
        if to == Error {
            return !self.is_terminal();
        }
        matches!(
            (self, to),
            (Queued, Matching)
                | (Queued, Cancelled)
                | (Queued, Expired)
                | (Matching, MatchFound)
                | (MatchFound, Accepted)
                | (MatchFound, Declined)
                | (MatchFound, Matched)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Queued => "queued",
            TicketStatus::Matching => "matching",
            TicketStatus::MatchFound => "match_found",
            TicketStatus::Accepted => "accepted",
            TicketStatus::Declined => "declined",
            TicketStatus::Cancelled => "cancelled",
            TicketStatus::Expired => "expired",
            TicketStatus::Matched => "matched",
            TicketStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A player's request to be matched in a queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub game_id: GameId,
    pub player_id: PlayerId,
    pub queue_name: String,
    pub attributes: AttributeSnapshot,
    pub status: TicketStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub match_id: Option<MatchId>,
}

impl Ticket {
    pub fn new(
        id: TicketId,
        game_id: impl Into<GameId>,
        player_id: impl Into<PlayerId>,
        queue_name: impl Into<String>,
        attributes: AttributeSnapshot,
        created_at: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            id,
            game_id: game_id.into(),
            player_id: player_id.into(),
            queue_name: queue_name.into(),
            attributes,
            status: TicketStatus::Queued,
            created_at,
            expires_at: saturating_add(created_at, ttl),
            updated_at: created_at,
            match_id: None,
        }
    }

    /// Queued and not yet past its expiry
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == TicketStatus::Queued && self.expires_at > now
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == TicketStatus::Queued && self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ticket(now: DateTime<Utc>) -> Ticket {
        Ticket::new(
            crate::utils::generate_ticket_id(),
            "game",
            "player",
            "queue",
            AttributeSnapshot::new(),
            now,
            Duration::seconds(60),
        )
    }

    #[test]
    fn test_new_ticket_is_queued() {
        let now = Utc::now();
        let t = ticket(now);
        assert_eq!(t.status, TicketStatus::Queued);
        assert_eq!(t.expires_at, now + Duration::seconds(60));
        assert!(t.match_id.is_none());
    }

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now();
        let t = ticket(now);
        assert!(t.is_eligible(now + Duration::seconds(59)));
        assert!(!t.is_eligible(now + Duration::seconds(60)));
        assert!(t.is_expired_at(now + Duration::seconds(60)));
    }

    #[test]
    fn test_status_edges() {
        use TicketStatus::*;
        assert!(Queued.can_transition_to(Matching));
        assert!(Matching.can_transition_to(MatchFound));
        assert!(MatchFound.can_transition_to(Matched));
        assert!(Queued.can_transition_to(Error));

        assert!(MatchFound.can_transition_to(Accepted));
        assert!(!Accepted.can_transition_to(Matched));
        assert!(!Accepted.can_transition_to(Queued));
        assert!(!Accepted.is_live());

        assert!(!Cancelled.can_transition_to(Queued));
        assert!(!Matched.can_transition_to(Error));
        assert!(!Queued.can_transition_to(MatchFound));
    }
}
