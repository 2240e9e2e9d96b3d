//! Queue registry
//!
//! Owns queue CRUD for every tenant. Criteria are fixed at creation so that
//! tickets already waiting are never scored against rules they were not
//! enqueued under.

use super::{Queue, QueueDefinition};
use crate::error::{MatchmakingError, Result};
use crate::storage::{MatchStore, QueueStore, TicketStore};
use crate::types::TenantContext;
use crate::utils::Clock;
use std::sync::Arc;
use tracing::{debug, info};

pub struct QueueRegistry {
    store: Arc<dyn QueueStore>,
    tickets: Arc<dyn TicketStore>,
    matches: Arc<dyn MatchStore>,
    clock: Arc<dyn Clock>,
}

impl QueueRegistry {
    pub fn new(
        store: Arc<dyn QueueStore>,
        tickets: Arc<dyn TicketStore>,
        matches: Arc<dyn MatchStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            tickets,
            matches,
            clock,
        }
    }

    pub async fn create_queue(
        &self,
        tenant: &TenantContext,
        definition: QueueDefinition,
    ) -> Result<Queue> {
        let queue = definition.into_queue(tenant.game_id.clone(), self.clock.now())?;
        self.store.insert_queue(queue.clone()).await?;

        info!(
            game_id = %tenant,
            queue = %queue.name,
            min_players = queue.min_players,
            max_players = queue.max_players,
            criteria = queue.criteria.len(),
            custom = queue.uses_custom_matchmaker(),
            "Created queue"
        );
        Ok(queue)
    }

    pub async fn get_queue(&self, tenant: &TenantContext, name: &str) -> Result<Queue> {
        self.store
            .get_queue(tenant, name)
            .await?
            .ok_or_else(|| {
                MatchmakingError::QueueNotFound {
                    queue_name: name.to_string(),
                }
                .into()
            })
    }

    pub async fn list_queues(&self, tenant: &TenantContext) -> Result<Vec<Queue>> {
        self.store.list_queues(tenant).await
    }

    /// Enabled queues across all tenants
    pub async fn enabled_queues(&self) -> Result<Vec<Queue>> {
        self.store.list_enabled_queues().await
    }

    /// Replace a queue's settings; the criteria list must be unchanged
    pub async fn update_queue(
        &self,
        tenant: &TenantContext,
        definition: QueueDefinition,
    ) -> Result<Queue> {
        definition.validate()?;
        let existing = self.get_queue(tenant, &definition.name).await?;

        if existing.criteria != definition.criteria {
            return Err(MatchmakingError::validation(format!(
                "Criteria of queue '{}' cannot change after creation",
                existing.name
            ))
            .into());
        }

        let mut updated = definition.into_queue(tenant.game_id.clone(), existing.created_at)?;
        updated.updated_at = self.clock.now();
        self.store.update_queue(updated.clone()).await?;

        debug!(game_id = %tenant, queue = %updated.name, "Updated queue");
        Ok(updated)
    }

    pub async fn set_enabled(
        &self,
        tenant: &TenantContext,
        name: &str,
        enabled: bool,
    ) -> Result<Queue> {
        let mut queue = self.get_queue(tenant, name).await?;
        queue.enabled = enabled;
        queue.updated_at = self.clock.now();
        self.store.update_queue(queue.clone()).await?;

        info!(game_id = %tenant, queue = %name, enabled, "Changed queue availability");
        Ok(queue)
    }

    /// Delete a queue that no live ticket or active match references
    pub async fn delete_queue(&self, tenant: &TenantContext, name: &str) -> Result<()> {
        self.get_queue(tenant, name).await?;

        let live_tickets = self.tickets.count_live(tenant, name).await?;
        let active_matches = self.matches.count_active(tenant, name).await?;
        if live_tickets > 0 || active_matches > 0 {
            return Err(MatchmakingError::QueueInUse {
                queue_name: name.to_string(),
            }
            .into());
        }

        self.store.delete_queue(tenant, name).await?;
        info!(game_id = %tenant, queue = %name, "Deleted queue");
        Ok(())
    }

    /// Create or update every queue in `definitions`, used for configuration seeding
    pub async fn apply_definitions(
        &self,
        tenant: &TenantContext,
        definitions: &[QueueDefinition],
    ) -> Result<usize> {
        for definition in definitions {
            match self.store.get_queue(tenant, &definition.name).await? {
                Some(_) => {
                    self.update_queue(tenant, definition.clone()).await?;
                }
                None => {
                    self.create_queue(tenant, definition.clone()).await?;
                }
            }
        }
        Ok(definitions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{error_kind, ErrorKind};
    use crate::queue::Criterion;
    use crate::storage::InMemoryStore;
    use crate::ticket::Ticket;
    use crate::types::AttributeSnapshot;
    use crate::utils::{generate_ticket_id, SystemClock};

    fn registry() -> (QueueRegistry, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let registry = QueueRegistry::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(SystemClock),
        );
        (registry, store)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (registry, _) = registry();
        let tenant = TenantContext::new("chess");

        registry
            .create_queue(&tenant, QueueDefinition::new("blitz", 2, 2))
            .await
            .unwrap();
        let queue = registry.get_queue(&tenant, "blitz").await.unwrap();
        assert_eq!(queue.max_players, 2);

        let err = registry
            .create_queue(&tenant, QueueDefinition::new("blitz", 2, 2))
            .await
            .unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::Conflict));

        let err = registry
            .get_queue(&TenantContext::new("go"), "blitz")
            .await
            .unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_invalid_definition_rejected() {
        let (registry, _) = registry();
        let err = registry
            .create_queue(&TenantContext::new("chess"), QueueDefinition::new("bad", 3, 2))
            .await
            .unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::Validation));
    }

    #[tokio::test]
    async fn test_oversized_timeouts_rejected_on_create_and_update() {
        let (registry, _) = registry();
        let tenant = TenantContext::new("chess");

        let err = registry
            .create_queue(&tenant, QueueDefinition::new("long", 2, 2).with_ticket_ttl(u64::MAX / 2))
            .await
            .unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::Validation));
        assert!(registry.list_queues(&tenant).await.unwrap().is_empty());

        let definition = QueueDefinition::new("long", 2, 2);
        registry.create_queue(&tenant, definition.clone()).await.unwrap();
        let err = registry
            .update_queue(&tenant, definition.with_match_timeout(u64::MAX))
            .await
            .unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::Validation));
    }

    #[tokio::test]
    async fn test_update_keeps_criteria_fixed() {
        let (registry, _) = registry();
        let tenant = TenantContext::new("chess");
        let definition =
            QueueDefinition::new("ranked", 2, 2).with_criteria(vec![Criterion::equal("region")]);
        registry.create_queue(&tenant, definition.clone()).await.unwrap();

        let updated = registry
            .update_queue(&tenant, definition.clone().with_ticket_ttl(600))
            .await
            .unwrap();
        assert_eq!(updated.ticket_ttl_seconds, 600);

        let err = registry
            .update_queue(&tenant, definition.with_criteria(vec![]))
            .await
            .unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::Validation));
    }

    #[tokio::test]
    async fn test_delete_refuses_while_in_use() {
        let (registry, store) = registry();
        let tenant = TenantContext::new("chess");
        let queue = registry
            .create_queue(&tenant, QueueDefinition::new("ranked", 2, 2))
            .await
            .unwrap();

        let ticket = Ticket::new(
            generate_ticket_id(),
            "chess",
            "p1",
            "ranked",
            AttributeSnapshot::new(),
            chrono::Utc::now(),
            queue.ticket_ttl(),
        );
        store.insert_ticket(ticket).await.unwrap();

        let err = registry.delete_queue(&tenant, "ranked").await.unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::InvalidState));

        registry
            .create_queue(&tenant, QueueDefinition::new("casual", 2, 2))
            .await
            .unwrap();
        registry.delete_queue(&tenant, "casual").await.unwrap();
        assert_eq!(registry.list_queues(&tenant).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_queues_not_listed_for_scheduling() {
        let (registry, _) = registry();
        let tenant = TenantContext::new("chess");
        registry
            .create_queue(&tenant, QueueDefinition::new("ranked", 2, 2))
            .await
            .unwrap();
        registry.set_enabled(&tenant, "ranked", false).await.unwrap();
        assert!(registry.enabled_queues().await.unwrap().is_empty());
    }
}
