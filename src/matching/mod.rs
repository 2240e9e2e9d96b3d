//! Matching: compatibility scoring, group formation and scheduling passes

pub mod custom;
pub mod formation;
pub mod scheduler;
pub mod scorer;

pub use custom::{
    validate_groups, CustomMatchRequest, CustomMatchResponse, CustomMatchmaker,
    HttpCustomMatchmaker,
};
pub use formation::{GreedyGroupFormer, GroupFormer, TicketGroup};
pub use scheduler::{MatchScheduler, PassOutcome, SchedulerStats};
pub use scorer::{allowed_tolerance, score, wait_factor};
