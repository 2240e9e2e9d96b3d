//! Error types for the matchmaking engine
//!
//! This module defines all error types using anyhow for consistent error handling
//! throughout the application. Callers that need to branch on a failure class
//! downcast to [`MatchmakingError`] and inspect [`MatchmakingError::kind`].

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Coarse failure classes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    Conflict,
    Validation,
    ExternalMatchmaker,
    Internal,
}

/// Custom error types for specific matchmaking scenarios
#[derive(Debug, thiserror::Error)]
pub enum MatchmakingError {
    #[error("No tenant registered for the supplied API key")]
    TenantNotFound,

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Ticket not found: {ticket_id}")]
    TicketNotFound { ticket_id: String },

    #[error("Match not found: {match_id}")]
    MatchNotFound { match_id: String },

    #[error("Queue already exists: {queue_name}")]
    QueueAlreadyExists { queue_name: String },

    #[error("Queue {queue_name} is still referenced by active tickets or matches")]
    QueueInUse { queue_name: String },

    #[error("Invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("Ticket no longer available: {ticket_id}")]
    TicketNoLongerAvailable { ticket_id: String },

    #[error("Concurrent modification of {entity}")]
    ConcurrentModification { entity: String },

    #[error("Not player's turn: {player_id}")]
    NotPlayersTurn { player_id: String },

    #[error("Validation failed: {reason}")]
    ValidationError { reason: String },

    #[error("Custom matchmaker failed: {reason}")]
    ExternalMatchmakerFailure { reason: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("AMQP connection failed: {message}")]
    AmqpConnectionFailed { message: String },

    #[error("Internal service error: {message}")]
    InternalError { message: String },
}

impl MatchmakingError {
    /// Map the error onto its failure class
    pub fn kind(&self) -> ErrorKind {
        match self {
            MatchmakingError::TenantNotFound
            | MatchmakingError::QueueNotFound { .. }
            | MatchmakingError::TicketNotFound { .. }
            | MatchmakingError::MatchNotFound { .. } => ErrorKind::NotFound,
            MatchmakingError::QueueInUse { .. }
            | MatchmakingError::InvalidState { .. }
            | MatchmakingError::NotPlayersTurn { .. } => ErrorKind::InvalidState,
            MatchmakingError::QueueAlreadyExists { .. }
            | MatchmakingError::TicketNoLongerAvailable { .. }
            | MatchmakingError::ConcurrentModification { .. } => ErrorKind::Conflict,
            MatchmakingError::ValidationError { .. } | MatchmakingError::ConfigurationError { .. } => {
                ErrorKind::Validation
            }
            MatchmakingError::ExternalMatchmakerFailure { .. } => ErrorKind::ExternalMatchmaker,
            MatchmakingError::AmqpConnectionFailed { .. } | MatchmakingError::InternalError { .. } => {
                ErrorKind::Internal
            }
        }
    }

    pub(crate) fn invalid_state(reason: impl Into<String>) -> Self {
        MatchmakingError::InvalidState {
            reason: reason.into(),
        }
    }

    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        MatchmakingError::ValidationError {
            reason: reason.into(),
        }
    }

    pub(crate) fn lock_poisoned(what: &str) -> Self {
        MatchmakingError::InternalError {
            message: format!("Failed to acquire {} lock", what),
        }
    }
}

/// Failure class of an arbitrary error, if it originated in this crate
pub fn error_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    err.downcast_ref::<MatchmakingError>().map(|e| e.kind())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = MatchmakingError::TicketNoLongerAvailable {
            ticket_id: "t1".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err = MatchmakingError::NotPlayersTurn {
            player_id: "p1".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_error_kind_through_anyhow() {
        let err: anyhow::Error = MatchmakingError::QueueNotFound {
            queue_name: "ranked".to_string(),
        }
        .into();
        assert_eq!(error_kind(&err), Some(ErrorKind::NotFound));

        let foreign = anyhow::anyhow!("something else");
        assert_eq!(error_kind(&foreign), None);
    }
}
