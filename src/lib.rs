//! Matchforge - multi-tenant matchmaking and match-session engine
//!
//! This crate pools player tickets per game and queue, forms compatible
//! groups with a widening-tolerance scorer or an external matchmaker, and
//! runs the resulting matches through their turn-based or real-time
//! lifecycle, publishing engine events over AMQP.

pub mod amqp;
pub mod cache;
pub mod config;
pub mod error;
pub mod matching;
pub mod metrics;
pub mod queue;
pub mod service;
pub mod session;
pub mod storage;
pub mod tenant;
pub mod ticket;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{ErrorKind, MatchmakingError, Result};
pub use types::*;

// Re-export key components
pub use amqp::publisher::EventPublisher;
pub use matching::MatchScheduler;
pub use queue::{QueueDefinition, QueueRegistry};
pub use session::SessionManager;
pub use tenant::{StaticTenantResolver, TenantResolver};
pub use ticket::TicketManager;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
