//! Sink repository
//!
//! Sinks live under a source. Deleting or undeleting a source cascades to
//! its sinks through [`super::SourceRepository`].

use std::fmt::Display;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{DefinitionError, EntityStore};
use crate::config::DefinitionLimits;
use crate::definition::{Sink, SinkKey, Source, SwitchableEntity};
use crate::kv::KvStore;

/// Repository of sink definitions
#[derive(Clone)]
pub struct SinkRepository {
    store: EntityStore<Sink>,
    sources: EntityStore<Source>,
}

impl SinkRepository {
    pub fn new(kv: Arc<dyn KvStore>, limits: &DefinitionLimits, max_attempts: u32) -> Self {
        Self {
            store: EntityStore::new(
                Arc::clone(&kv),
                max_attempts,
                limits.max_sinks_per_source,
                limits.max_versions_per_entity,
            ),
            sources: EntityStore::new(
                kv,
                max_attempts,
                limits.max_sources_per_branch,
                limits.max_versions_per_entity,
            ),
        }
    }

    /// Lists active sinks under a source, branch or project key.
    pub async fn list(&self, parent: &impl Display) -> Result<Vec<Sink>, DefinitionError> {
        self.store.list(parent).await
    }

    pub async fn list_deleted(&self, parent: &impl Display) -> Result<Vec<Sink>, DefinitionError> {
        self.store.list_deleted(parent).await
    }

    pub async fn get(&self, key: &SinkKey) -> Result<Sink, DefinitionError> {
        self.store.get(key).await
    }

    pub async fn get_deleted(&self, key: &SinkKey) -> Result<Sink, DefinitionError> {
        self.store.get_deleted(key).await
    }

    /// Creates the sink in an active source, recreating it if it was deleted.
    pub async fn create(
        &self,
        now: DateTime<Utc>,
        description: &str,
        sink: &Sink,
    ) -> Result<Sink, DefinitionError> {
        self.store
            .atomic(move |mut txn| async move {
                self.sources
                    .exists_or_err(&mut txn, &sink.key.source_key)
                    .await?;
                let (created, _) = self.store.create_in(&mut txn, now, description, sink).await?;
                Ok((txn, created))
            })
            .await
    }

    pub async fn update<F>(
        &self,
        now: DateTime<Utc>,
        key: &SinkKey,
        description: &str,
        update_fn: F,
    ) -> Result<Sink, DefinitionError>
    where
        F: Fn(Sink) -> Result<Sink, DefinitionError> + Send + Sync,
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

    pub async fn soft_delete(&self, now: DateTime<Utc>, key: &SinkKey) -> Result<Sink, DefinitionError> {
        self.store
            .atomic(move |mut txn| async move {
                let deleted = self.store.soft_delete_in(&mut txn, now, key).await?;
                Ok((txn, deleted))
            })
            .await
    }

    pub async fn undelete(&self, now: DateTime<Utc>, key: &SinkKey) -> Result<Sink, DefinitionError> {
        self.store
            .atomic(move |mut txn| async move {
                self.sources.exists_or_err(&mut txn, &key.source_key).await?;
                let restored = self.store.undelete_in(&mut txn, now, key).await?;
                Ok((txn, restored))
            })
            .await
    }

    pub async fn versions(&self, key: &SinkKey) -> Result<Vec<Sink>, DefinitionError> {
        self.store.versions(key).await
    }

    pub async fn version(&self, key: &SinkKey, number: u32) -> Result<Sink, DefinitionError> {
        self.store.version(key, number).await
    }

    pub async fn rollback(
        &self,
        now: DateTime<Utc>,
        key: &SinkKey,
        to: u32,
    ) -> Result<Sink, DefinitionError> {
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
        key: &SinkKey,
        reason: &str,
    ) -> Result<Sink, DefinitionError> {
        self.update(now, key, "Disabled.", |mut sink| {
            sink.switch_mut().disable(now, reason);
            Ok(sink)
        })
        .await
    }

    pub async fn enable(&self, now: DateTime<Utc>, key: &SinkKey) -> Result<Sink, DefinitionError> {
        self.update(now, key, "Enabled.", |mut sink| {
            sink.switch_mut().enable();
            Ok(sink)
        })
        .await
    }
}
