//! Match sessions: lifecycle, presence, turns and the action log

pub mod manager;
pub mod state;

pub use manager::{SessionManager, SessionSettings, SessionStats};
pub use state::{
    Action, Match, MatchPhase, MatchStatus, Presence, PresenceMode, PresenceStatus, TurnPolicy,
    TurnTimeoutAction,
};
