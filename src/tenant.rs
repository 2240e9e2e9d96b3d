//! Tenant resolution
//!
//! Callers authenticate with an API key; the resolver maps it to the game
//! whose queues, tickets and matches the request may touch.

use crate::error::{MatchmakingError, Result};
use crate::types::{GameId, TenantContext};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tenant entry as declared in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantDefinition {
    pub game_id: GameId,
    pub api_key: String,
}

#[async_trait]
pub trait TenantResolver: Send + Sync {
    /// Resolve an API key into a tenant context; unknown keys are `NotFound`
    async fn resolve(&self, api_key: &str) -> Result<TenantContext>;
}

/// Resolver over a fixed key table
#[derive(Debug, Clone, Default)]
pub struct StaticTenantResolver {
    keys: HashMap<String, GameId>,
}

impl StaticTenantResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definitions(definitions: &[TenantDefinition]) -> Result<Self> {
        let mut resolver = Self::new();
        for definition in definitions {
            resolver.register(definition.api_key.clone(), definition.game_id.clone())?;
        }
        Ok(resolver)
    }

    pub fn register(&mut self, api_key: impl Into<String>, game_id: impl Into<GameId>) -> Result<()> {
        let api_key = api_key.into();
        let game_id = game_id.into();
        if api_key.is_empty() || game_id.is_empty() {
            return Err(MatchmakingError::ConfigurationError {
                message: "Tenant API key and game id must be non-empty".to_string(),
            }
            .into());
        }
        if self.keys.contains_key(&api_key) {
            return Err(MatchmakingError::ConfigurationError {
                message: format!("API key registered twice (game {})", game_id),
            }
            .into());
        }
        self.keys.insert(api_key, game_id);
        Ok(())
    }

    pub fn tenant_count(&self) -> usize {
        let mut games: Vec<&GameId> = self.keys.values().collect();
        games.sort();
        games.dedup();
        games.len()
    }
}

#[async_trait]
impl TenantResolver for StaticTenantResolver {
    async fn resolve(&self, api_key: &str) -> Result<TenantContext> {
        self.keys
            .get(api_key)
            .map(TenantContext::new)
            .ok_or_else(|| MatchmakingError::TenantNotFound.into())
    }
}
