//! Branch repository
//!
//! Branches are the top level of the hierarchy; their parent is a project,
//! which is not stored. Branch deletes and undeletes cascade through sources
//! down to sinks.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{DefinitionError, EntityStore, SourceRepository};
use crate::config::DefinitionLimits;
use crate::definition::{Branch, BranchKey, ProjectId};
use crate::kv::KvStore;

/// Repository of branch definitions
#[derive(Clone)]
pub struct BranchRepository {
    store: EntityStore<Branch>,
    sources: SourceRepository,
}

impl BranchRepository {
    pub fn new(kv: Arc<dyn KvStore>, limits: &DefinitionLimits, max_attempts: u32) -> Self {
        Self {
            store: EntityStore::new(
                Arc::clone(&kv),
                max_attempts,
                limits.max_branches_per_project,
                limits.max_versions_per_entity,
            ),
            sources: SourceRepository::new(kv, limits, max_attempts),
        }
    }

    pub async fn list(&self, project_id: ProjectId) -> Result<Vec<Branch>, DefinitionError> {
        self.store.list(&project_id).await
    }

    pub async fn list_deleted(&self, project_id: ProjectId) -> Result<Vec<Branch>, DefinitionError> {
        self.store.list_deleted(&project_id).await
    }

    pub async fn get(&self, key: &BranchKey) -> Result<Branch, DefinitionError> {
        self.store.get(key).await
    }

    pub async fn get_deleted(&self, key: &BranchKey) -> Result<Branch, DefinitionError> {
        self.store.get_deleted(key).await
    }

    /// Returns the default branch of the project.
    pub async fn get_default(&self, project_id: ProjectId) -> Result<Branch, DefinitionError> {
        self.list(project_id)
            .await?
            .into_iter()
            .find(|branch| branch.is_default)
            .ok_or_else(|| DefinitionError::NotFound {
                kind: "branch".to_string(),
                id: "default".to_string(),
                parent: "project",
            })
    }

    pub async fn create(
        &self,
        now: DateTime<Utc>,
        description: &str,
        branch: &Branch,
    ) -> Result<Branch, DefinitionError> {
        self.store
            .atomic(move |mut txn| async move {
                let (created, recreated) =
                    self.store.create_in(&mut txn, now, description, branch).await?;
                if recreated {
                    self.sources
                        .undelete_with_branch(&mut txn, now, &created.key)
                        .await?;
                }
                Ok((txn, created))
            })
            .await
    }

    pub async fn update<F>(
        &self,
        now: DateTime<Utc>,
        key: &BranchKey,
        description: &str,
        update_fn: F,
    ) -> Result<Branch, DefinitionError>
    where
        F: Fn(Branch) -> Result<Branch, DefinitionError> + Send + Sync,
    {
        let update_fn = &update_fn;
        self.store
            .atomic(move |mut txn| async move {
                let updated = self
                    .store
                    .update_in(&mut txn, now, key, description, update_fn)
                    .await?;
                Ok((txn, updated))
            })
            .await
    }

    pub async fn soft_delete(
        &self,
        now: DateTime<Utc>,
        key: &BranchKey,
    ) -> Result<Branch, DefinitionError> {
        self.store
            .atomic(move |mut txn| async move {
                let deleted = self.store.soft_delete_in(&mut txn, now, key).await?;
                self.sources.delete_with_branch(&mut txn, now, key).await?;
                Ok((txn, deleted))
            })
            .await
    }

    pub async fn undelete(
        &self,
        now: DateTime<Utc>,
        key: &BranchKey,
    ) -> Result<Branch, DefinitionError> {
        self.store
            .atomic(move |mut txn| async move {
                let restored = self.store.undelete_in(&mut txn, now, key).await?;
                self.sources.undelete_with_branch(&mut txn, now, key).await?;
                Ok((txn, restored))
            })
            .await
    }

    pub async fn versions(&self, key: &BranchKey) -> Result<Vec<Branch>, DefinitionError> {
        self.store.versions(key).await
    }

    pub async fn version(&self, key: &BranchKey, number: u32) -> Result<Branch, DefinitionError> {
        self.store.version(key, number).await
    }

    pub async fn rollback(
        &self,
        now: DateTime<Utc>,
        key: &BranchKey,
        to: u32,
    ) -> Result<Branch, DefinitionError> {
        self.store
            .atomic(move |mut txn| async move {
                let updated = self.store.rollback_in(&mut txn, now, key, to).await?;
                Ok((txn, updated))
            })
            .await
    }
}
