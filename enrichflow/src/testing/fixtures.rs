//! Test fixtures: a seeded tenant scope and a fast-ticking coordinator.

use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::core::{Entity, RunFilters};
use crate::events::CollectingEventSink;
use crate::handlers::HandlerRegistry;
use crate::pipeline::{PipelineCoordinator, StartRequest};
use crate::registry::StageRegistry;
use crate::store::{InMemoryStore, PipelineStore};

/// Tenant used by [`TestWorld`].
pub const TEST_TENANT: &str = "t1";
/// Scope used by [`TestWorld`].
pub const TEST_SCOPE: &str = "s1";

/// An in-memory store seeded with entities of one tenant scope.
#[derive(Debug)]
pub struct TestWorld {
    /// The store every component writes to.
    pub store: Arc<InMemoryStore>,
    /// Collects coordinator and worker events.
    pub events: Arc<CollectingEventSink>,
}

impl Default for TestWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl TestWorld {
    /// Creates an empty world.
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            events: Arc::new(CollectingEventSink::new()),
        }
    }

    /// Config with 100ms polls and 200ms coordinator ticks.
    #[must_use]
    pub fn fast_config() -> EngineConfig {
        EngineConfig::new()
            .with_poll_interval(Duration::from_millis(100))
            .with_coordinator_interval(Duration::from_millis(200))
    }

    /// Inserts an entity.
    ///
    /// # Panics
    ///
    /// Panics if the store rejects the entity.
    pub async fn insert(&self, entity: Entity) -> Entity {
        self.store
            .upsert_entity(&entity)
            .await
            .expect("seed entity");
        entity
    }

    /// Inserts a company in the test scope.
    pub async fn company(&self, id: &str, name: &str) -> Entity {
        self.insert(Entity::company(id, TEST_TENANT, TEST_SCOPE, name)).await
    }

    /// Inserts a contact of `company_id` in the test scope.
    pub async fn contact(&self, id: &str, name: &str, company_id: &str) -> Entity {
        self.insert(Entity::contact(id, TEST_TENANT, TEST_SCOPE, name, company_id))
            .await
    }

    /// Inserts `count` companies `c00`, `c01`, ... named so that name order
    /// matches id order. Returns their ids.
    pub async fn seed_companies(&self, count: usize) -> Vec<String> {
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let id = format!("c{i:02}");
            self.company(&id, &format!("Company {i:02}")).await;
            ids.push(id);
        }
        ids
    }

    /// Inserts `count` contacts of `company_id`. Returns their ids.
    pub async fn seed_contacts(&self, company_id: &str, count: usize) -> Vec<String> {
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let id = format!("{company_id}-p{i:02}");
            self.contact(&id, &format!("{company_id} Person {i:02}"), company_id)
                .await;
            ids.push(id);
        }
        ids
    }

    /// Builds a coordinator over the built-in catalog with the fast config.
    #[must_use]
    pub fn coordinator(&self, handlers: HandlerRegistry) -> PipelineCoordinator {
        PipelineCoordinator::new(StageRegistry::builtin(), handlers, self.store.clone())
            .with_events(self.events.clone())
            .with_config(Self::fast_config())
    }

    /// A start request for the test scope.
    #[must_use]
    pub fn request(&self, stages: &[&str]) -> StartRequest {
        StartRequest::new(TEST_TENANT, TEST_SCOPE, stages.iter().copied())
    }

    /// A start request with filters.
    #[must_use]
    pub fn request_with(&self, stages: &[&str], filters: RunFilters) -> StartRequest {
        self.request(stages).with_filters(filters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seeded_world() {
        let world = TestWorld::new();
        let companies = world.seed_companies(3).await;
        let contacts = world.seed_contacts(&companies[0], 2).await;

        assert_eq!(companies, vec!["c00", "c01", "c02"]);
        let contact = world.store.get_entity(&contacts[1]).await.unwrap().unwrap();
        assert_eq!(contact.parent_id.as_deref(), Some("c00"));
        assert!(TestWorld::fast_config().validate().is_ok());
    }
}
