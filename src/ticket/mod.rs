//! Matchmaking tickets

pub mod instance;
pub mod manager;

pub use instance::{Ticket, TicketStatus};
pub use manager::TicketManager;
