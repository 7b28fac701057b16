//! Definition store with read-through cache
//!
//! Published definitions are immutable, so (org, code, version) entries can
//! be cached forever. `latest_active` always goes to storage because a
//! newer version may have been published by the authoring process.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, instrument};
use uuid::Uuid;

use steward_core::{EngineError, PlaybookDefinition};
use steward_storage::Storage;

/// Loads and validates playbook definitions
pub struct DefinitionStore<S: Storage> {
    storage: Arc<S>,
    cache: DashMap<(Uuid, String, u32), Arc<PlaybookDefinition>>,
}

impl<S: Storage> DefinitionStore<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            cache: DashMap::new(),
        }
    }

    /// Validate and store a definition.
    ///
    /// Invalid definitions are rejected with every violation listed, so
    /// the authoring process can fix them in one pass.
    #[instrument(skip(self, definition), fields(code = %definition.id, version = definition.version))]
    pub async fn publish(&self, definition: PlaybookDefinition) -> Result<(), EngineError> {
        if let Err(violations) = definition.validate() {
            return Err(EngineError::Validation(violations.join("; ")));
        }

        self.storage.put_definition(&definition).await?;
        debug!("published definition");
        Ok(())
    }

    /// Exact version lookup; the version an instance bound to at start
    pub async fn get(
        &self,
        organization_id: Uuid,
        code: &str,
        version: u32,
    ) -> Result<Arc<PlaybookDefinition>, EngineError> {
        let key = (organization_id, code.to_string(), version);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }

        let definition = Arc::new(
            self.storage
                .get_definition(organization_id, code, version)
                .await?,
        );
        self.cache.insert(key, definition.clone());
        Ok(definition)
    }

    /// Highest active version, used when starting a new execution
    pub async fn latest_active(
        &self,
        organization_id: Uuid,
        code: &str,
    ) -> Result<Arc<PlaybookDefinition>, EngineError> {
        let definition = self
            .storage
            .latest_active_definition(organization_id, code)
            .await?;
        let key = (organization_id, code.to_string(), definition.version);
        let definition = Arc::new(definition);
        self.cache.insert(key, definition.clone());
        Ok(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steward_core::StepDefinition;
    use steward_storage::InMemoryStorage;

    #[tokio::test]
    async fn test_publish_rejects_invalid_definition() {
        let store = DefinitionStore::new(Arc::new(InMemoryStorage::new()));
        let definition = PlaybookDefinition::new(Uuid::now_v7(), "empty", 1);

        let err = store.publish(definition).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_get_uses_cache_and_latest_sees_new_versions() {
        let org = Uuid::now_v7();
        let store = DefinitionStore::new(Arc::new(InMemoryStorage::new()));

        let v1 = PlaybookDefinition::new(org, "onboarding", 1)
            .with_steps(vec![StepDefinition::task("review", "ops")]);
        store.publish(v1).await.unwrap();

        let loaded = store.get(org, "onboarding", 1).await.unwrap();
        assert_eq!(loaded.version, 1);

        let v2 = PlaybookDefinition::new(org, "onboarding", 2)
            .with_steps(vec![StepDefinition::task("review", "ops")]);
        store.publish(v2).await.unwrap();

        let latest = store.latest_active(org, "onboarding").await.unwrap();
        assert_eq!(latest.version, 2);

        // The old version stays pinned for running instances
        let pinned = store.get(org, "onboarding", 1).await.unwrap();
        assert_eq!(pinned.version, 1);
    }
}
