//! Hot match state for low-latency reads
//!
//! The cache is a projection of the authoritative match record, keyed by
//! match id. It is rewritten after every session mutation and dropped once
//! the match reaches a terminal status.

pub mod gateway;

pub use gateway::{InMemoryMatchStateCache, MatchStateCache, SessionState};
