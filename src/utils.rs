//! Utility functions for the matchmaking engine

use chrono::{DateTime, Duration, Utc};
use std::sync::RwLock;
use uuid::Uuid;

/// Generate a new unique ticket ID
pub fn generate_ticket_id() -> Uuid {
    Uuid::new_v4()
}

/// Generate a new unique match ID
pub fn generate_match_id() -> Uuid {
    Uuid::new_v4()
}

/// Generate a new unique action ID
pub fn generate_action_id() -> Uuid {
    Uuid::new_v4()
}

/// Get the current UTC timestamp
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Minutes elapsed between two instants, never negative
pub fn minutes_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    let millis = later.signed_duration_since(earlier).num_milliseconds();
    (millis.max(0) as f64) / 60_000.0
}

/// Longest ticket, turn or match timeout accepted anywhere in the engine
pub const MAX_TIMEOUT_SECONDS: u64 = 365 * 24 * 60 * 60;

/// Convert a configured number of seconds into a duration, capped at `MAX_TIMEOUT_SECONDS`
pub fn seconds_to_duration(seconds: u64) -> Duration {
    i64::try_from(seconds.min(MAX_TIMEOUT_SECONDS))
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or_else(|| Duration::days(365))
}

/// `start + offset`, saturating at the latest representable instant
pub fn saturating_add(start: DateTime<Utc>, offset: Duration) -> DateTime<Utc> {
    start
        .checked_add_signed(offset)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Source of "now" for everything that compares against deadlines
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        current_timestamp()
    }
}

/// Clock that only moves when told to; used for simulations and tests
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.write() {
            *now += by;
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.write() {
            *now = to;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(current_timestamp())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
            .read()
            .map(|now| *now)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }
}
