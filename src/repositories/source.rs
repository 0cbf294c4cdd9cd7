//! Source repository
//!
//! Deleting a source deletes its active sinks with `deletedWithParent` set;
//! undeleting or recreating it restores exactly those sinks.

use std::fmt::Display;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{DefinitionError, EntityStore};
use crate::config::DefinitionLimits;
use crate::definition::{Branch, BranchKey, Sink, Source, SourceKey, SwitchableEntity};
use crate::kv::{AtomicTxn, KvStore};

/// Repository of source definitions
#[derive(Clone)]
pub struct SourceRepository {
    store: EntityStore<Source>,
    branches: EntityStore<Branch>,
    sinks: EntityStore<Sink>,
}

impl SourceRepository {
    pub fn new(kv: Arc<dyn KvStore>, limits: &DefinitionLimits, max_attempts: u32) -> Self {
        Self {
            store: EntityStore::new(
                Arc::clone(&kv),
                max_attempts,
                limits.max_sources_per_branch,
                limits.max_versions_per_entity,
            ),
            branches: EntityStore::new(
                Arc::clone(&kv),
                max_attempts,
                limits.max_branches_per_project,
                limits.max_versions_per_entity,
            ),
            sinks: EntityStore::new(
                kv,
                max_attempts,
                limits.max_sinks_per_source,
                limits.max_versions_per_entity,
            ),
        }
    }

    /// Lists active sources under a branch or project key.
    pub async fn list(&self, parent: &impl Display) -> Result<Vec<Source>, DefinitionError> {
        self.store.list(parent).await
    }

    pub async fn list_deleted(&self, parent: &impl Display) -> Result<Vec<Source>, DefinitionError> {
        self.store.list_deleted(parent).await
    }

    pub async fn get(&self, key: &SourceKey) -> Result<Source, DefinitionError> {
        self.store.get(key).await
    }

    pub async fn get_deleted(&self, key: &SourceKey) -> Result<Source, DefinitionError> {
        self.store.get_deleted(key).await
    }

    /// Creates the source in an active branch. Recreating a deleted source
    /// also restores the sinks deleted together with it.
    pub async fn create(
        &self,
        now: DateTime<Utc>,
        description: &str,
        source: &Source,
    ) -> Result<Source, DefinitionError> {
        self.store
            .atomic(move |mut txn| async move {
                self.branches
                    .exists_or_err(&mut txn, &source.key.branch_key)
                    .await?;
                let (created, recreated) =
                    self.store.create_in(&mut txn, now, description, source).await?;
                if recreated {
                    self.sinks.undelete_all_in(&mut txn, now, &created.key).await?;
                }
                Ok((txn, created))
            })
            .await
    }

    pub async fn update<F>(
        &self,
        now: DateTime<Utc>,
        key: &SourceKey,
        description: &str,
        update_fn: F,
    ) -> Result<Source, DefinitionError>
    where
        F: Fn(Source) -> Result<Source, DefinitionError> + Send + Sync,
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
        key: &SourceKey,
    ) -> Result<Source, DefinitionError> {
        self.store
            .atomic(move |mut txn| async move {
                let deleted = self.store.soft_delete_in(&mut txn, now, key).await?;
                self.sinks.soft_delete_all_in(&mut txn, now, key).await?;
                Ok((txn, deleted))
            })
            .await
    }

    pub async fn undelete(
        &self,
        now: DateTime<Utc>,
        key: &SourceKey,
    ) -> Result<Source, DefinitionError> {
        self.store
            .atomic(move |mut txn| async move {
                self.branches.exists_or_err(&mut txn, &key.branch_key).await?;
                let restored = self.store.undelete_in(&mut txn, now, key).await?;
                self.sinks.undelete_all_in(&mut txn, now, key).await?;
                Ok((txn, restored))
            })
            .await
    }

    pub async fn versions(&self, key: &SourceKey) -> Result<Vec<Source>, DefinitionError> {
        self.store.versions(key).await
    }

    pub async fn version(&self, key: &SourceKey, number: u32) -> Result<Source, DefinitionError> {
        self.store.version(key, number).await
    }

    pub async fn rollback(
        &self,
        now: DateTime<Utc>,
        key: &SourceKey,
        to: u32,
    ) -> Result<Source, DefinitionError> {
        self.store
            .atomic(move |mut txn| async move {
                let updated = self.store.rollback_in(&mut txn, now, key, to).await?;
                Ok((txn, updated))
            })
            .await
    }

    pub async fn disable(
        &self,
        now: DateTime<Utc>,
        key: &SourceKey,
        reason: &str,
    ) -> Result<Source, DefinitionError> {
        self.update(now, key, "Disabled.", |mut source| {
            source.switch_mut().disable(now, reason);
            Ok(source)
        })
        .await
    }

    pub async fn enable(&self, now: DateTime<Utc>, key: &SourceKey) -> Result<Source, DefinitionError> {
        self.update(now, key, "Enabled.", |mut source| {
            source.switch_mut().enable();
            Ok(source)
        })
        .await
    }

    /// Deletes the sources of a branch being deleted, and their sinks.
    pub(super) async fn delete_with_branch(
        &self,
        txn: &mut AtomicTxn,
        now: DateTime<Utc>,
        branch: &BranchKey,
    ) -> Result<(), DefinitionError> {
        self.store.soft_delete_all_in(txn, now, branch).await?;
        // Sinks of sources deleted earlier are already in the deleted set.
        self.sinks.soft_delete_all_in(txn, now, branch).await?;
        Ok(())
    }

    /// Restores the sources deleted with a branch, and the sinks deleted with them.
    pub(super) async fn undelete_with_branch(
        &self,
        txn: &mut AtomicTxn,
        now: DateTime<Utc>,
        branch: &BranchKey,
    ) -> Result<(), DefinitionError> {
        for source in self.store.undelete_all_in(txn, now, branch).await? {
            self.sinks.undelete_all_in(txn, now, &source.key).await?;
        }
        Ok(())
    }
}
