//! Configuration management for the matchforge service
//!
//! This module handles configuration loading from TOML files and environment
//! variables, validation, and default values for the matchmaking service.

pub mod app;

// Re-export commonly used types
pub use app::{
    validate_config, AmqpSettings, AppConfig, BootstrapQueue, MatchmakingSettings,
    ServiceSettings,
};
