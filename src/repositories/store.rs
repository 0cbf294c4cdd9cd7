//! Generic storage core shared by the branch, source and sink repositories.
//!
//! Key layout, with `<key>` being the entity key in its string form:
//!
//! - `definition/<kind>/active/<key>`: the current record of a live entity
//! - `definition/<kind>/deleted/<key>`: the current record of a soft-deleted entity
//! - `definition/<kind>/version/<key>/<number>`: history, number zero-padded to 10 digits
//!
//! An entity is in exactly one of the active and deleted sets. The `*_in`
//! methods run inside an atomic operation; every read they make becomes part
//! of its commit condition.

use std::fmt::Display;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::DefinitionError;
use crate::definition::{DefinitionEntity, EntityKey};
use crate::kv::{AtomicTxn, KvStore, atomic, atomic::decode};

const ROOT: &str = "definition";

#[derive(Clone)]
pub struct EntityStore<E> {
    kv: Arc<dyn KvStore>,
    max_attempts: u32,
    max_children: usize,
    max_versions: usize,
    _entity: PhantomData<fn() -> E>,
}

impl<E: DefinitionEntity> EntityStore<E> {
    /// # Arguments
    /// * `max_children` - Maximum of active entities of this kind in one parent
    /// * `max_versions` - Maximum of history records of one entity
    pub fn new(
        kv: Arc<dyn KvStore>,
        max_attempts: u32,
        max_children: usize,
        max_versions: usize,
    ) -> Self {
        Self {
            kv,
            max_attempts,
            max_children,
            max_versions,
            _entity: PhantomData,
        }
    }

    pub fn active_key(key: &E::Key) -> String {
        format!("{ROOT}/{}/active/{key}", E::KIND)
    }

    pub fn deleted_key(key: &E::Key) -> String {
        format!("{ROOT}/{}/deleted/{key}", E::KIND)
    }

    pub fn version_key(key: &E::Key, number: u32) -> String {
        format!("{ROOT}/{}/version/{key}/{number:010}", E::KIND)
    }

    /// Prefix of all active entities; the watch mirrors subscribe to it.
    pub fn active_root() -> String {
        format!("{ROOT}/{}/active/", E::KIND)
    }

    /// Prefix of active entities under `parent`, which may be any ancestor key.
    pub fn active_prefix(parent: &impl Display) -> String {
        format!("{ROOT}/{}/active/{parent}/", E::KIND)
    }

    pub fn deleted_prefix(parent: &impl Display) -> String {
        format!("{ROOT}/{}/deleted/{parent}/", E::KIND)
    }

    fn versions_prefix(key: &E::Key) -> String {
        format!("{ROOT}/{}/version/{key}/", E::KIND)
    }

    /// Runs `op` as an atomic operation with the configured attempt bound.
    pub async fn atomic<T, F, Fut>(&self, op: F) -> Result<T, DefinitionError>
    where
        F: FnMut(AtomicTxn) -> Fut,
        Fut: Future<Output = Result<(AtomicTxn, T), DefinitionError>>,
    {
        atomic(&self.kv, self.max_attempts, op).await
    }

    pub async fn list(&self, parent: &impl Display) -> Result<Vec<E>, DefinitionError> {
        self.list_prefix(&Self::active_prefix(parent)).await
    }

    pub async fn list_deleted(&self, parent: &impl Display) -> Result<Vec<E>, DefinitionError> {
        self.list_prefix(&Self::deleted_prefix(parent)).await
    }

    pub async fn get(&self, key: &E::Key) -> Result<E, DefinitionError> {
        self.get_one(&Self::active_key(key))
            .await?
            .ok_or_else(|| DefinitionError::not_found::<E>(key))
    }

    pub async fn get_deleted(&self, key: &E::Key) -> Result<E, DefinitionError> {
        self.get_one(&Self::deleted_key(key))
            .await?
            .ok_or_else(|| DefinitionError::deleted_not_found::<E>(key))
    }

    /// Version history ordered by number; available for deleted entities too.
    pub async fn versions(&self, key: &E::Key) -> Result<Vec<E>, DefinitionError> {
        self.list_prefix(&Self::versions_prefix(key)).await
    }

    pub async fn version(&self, key: &E::Key, number: u32) -> Result<E, DefinitionError> {
        self.get_one(&Self::version_key(key, number))
            .await?
            .ok_or_else(|| DefinitionError::version_not_found::<E>(key, number))
    }

    async fn get_one(&self, kv_key: &str) -> Result<Option<E>, DefinitionError> {
        Ok(self
            .kv
            .get(kv_key)
            .await?
            .map(|kv| decode(&kv))
            .transpose()?)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<E>, DefinitionError> {
        let kvs = self.kv.get_prefix(prefix).await?;
        Ok(kvs.iter().map(decode).collect::<Result<_, _>>()?)
    }

    /// Fails with `NotFound` unless the entity is active.
    pub async fn exists_or_err(&self, txn: &mut AtomicTxn, key: &E::Key) -> Result<(), DefinitionError> {
        match txn.get(&Self::active_key(key)).await? {
            Some(_) => Ok(()),
            None => Err(DefinitionError::not_found::<E>(key)),
        }
    }

    pub async fn get_in(&self, txn: &mut AtomicTxn, key: &E::Key) -> Result<Option<E>, DefinitionError> {
        Ok(txn.get_json(&Self::active_key(key)).await?)
    }

    pub async fn get_deleted_in(
        &self,
        txn: &mut AtomicTxn,
        key: &E::Key,
    ) -> Result<Option<E>, DefinitionError> {
        Ok(txn.get_json(&Self::deleted_key(key)).await?)
    }

    async fn check_children_count(
        &self,
        txn: &mut AtomicTxn,
        key: &E::Key,
    ) -> Result<(), DefinitionError> {
        let count = txn.count_prefix(&Self::active_prefix(&key.parent())).await?;
        if count + 1 > self.max_children {
            return Err(DefinitionError::count_limit::<E>(self.max_children));
        }
        Ok(())
    }

    async fn check_versions_count(
        &self,
        txn: &mut AtomicTxn,
        key: &E::Key,
    ) -> Result<(), DefinitionError> {
        let count = txn.count_prefix(&Self::versions_prefix(key)).await?;
        if count + 1 > self.max_versions {
            return Err(DefinitionError::version_limit::<E>(self.max_versions));
        }
        Ok(())
    }

    /// Creates the entity, or recreates a soft-deleted one.
    ///
    /// A recreated entity continues the version numbering of the deleted
    /// record. The caller checks the parent and runs cascades.
    ///
    /// # Returns
    /// The stored entity and whether it replaced a deleted record
    pub async fn create_in(
        &self,
        txn: &mut AtomicTxn,
        now: DateTime<Utc>,
        description: &str,
        input: &E,
    ) -> Result<(E, bool), DefinitionError> {
        let key = input.key();
        self.check_children_count(txn, key).await?;
        let actual = self.get_in(txn, key).await?;
        let deleted = self.get_deleted_in(txn, key).await?;

        if actual.is_some() {
            return Err(DefinitionError::already_exists::<E>(key));
        }
        if deleted.is_some() {
            self.check_versions_count(txn, key).await?;
        }

        let mut created = input.clone();
        let recreated = match deleted {
            Some(deleted) => {
                *created.version_mut() = deleted.version().clone();
                *created.soft_delete_mut() = deleted.soft_delete().clone();
                created.soft_delete_mut().undelete(now);
                true
            }
            None => false,
        };

        created.increment_version(now, description);
        self.save_active(txn, &created, recreated)?;
        Ok((created, recreated))
    }

    /// Applies `update_fn` to the active entity and stores the result as a new version.
    pub async fn update_in<F>(
        &self,
        txn: &mut AtomicTxn,
        now: DateTime<Utc>,
        key: &E::Key,
        description: &str,
        update_fn: F,
    ) -> Result<E, DefinitionError>
    where
        F: FnOnce(E) -> Result<E, DefinitionError>,
    {
        self.check_versions_count(txn, key).await?;
        let old = self
            .get_in(txn, key)
            .await?
            .ok_or_else(|| DefinitionError::not_found::<E>(key))?;

        let mut updated = update_fn(old)?;
        updated.increment_version(now, description);
        self.save_active(txn, &updated, false)?;
        Ok(updated)
    }

    /// Moves the active entity to the deleted set; cascades are up to the caller.
    pub async fn soft_delete_in(
        &self,
        txn: &mut AtomicTxn,
        now: DateTime<Utc>,
        key: &E::Key,
    ) -> Result<E, DefinitionError> {
        let mut entity = self
            .get_in(txn, key)
            .await?
            .ok_or_else(|| DefinitionError::not_found::<E>(key))?;
        entity.soft_delete_mut().delete(now, false);
        self.save_deleted(txn, &entity)?;
        Ok(entity)
    }

    /// Deletes every active entity under `parent` as part of the parent's deletion.
    pub async fn soft_delete_all_in(
        &self,
        txn: &mut AtomicTxn,
        now: DateTime<Utc>,
        parent: &impl Display,
    ) -> Result<Vec<E>, DefinitionError> {
        let mut deleted: Vec<E> = txn.get_prefix_json(&Self::active_prefix(parent)).await?;
        for entity in &mut deleted {
            entity.soft_delete_mut().delete(now, true);
            self.save_deleted(txn, entity)?;
        }
        Ok(deleted)
    }

    /// Restores a deleted entity as a new version.
    pub async fn undelete_in(
        &self,
        txn: &mut AtomicTxn,
        now: DateTime<Utc>,
        key: &E::Key,
    ) -> Result<E, DefinitionError> {
        self.check_children_count(txn, key).await?;
        let mut entity = self
            .get_deleted_in(txn, key)
            .await?
            .ok_or_else(|| DefinitionError::deleted_not_found::<E>(key))?;
        self.check_versions_count(txn, key).await?;

        let restored = entity.version().number;
        entity.soft_delete_mut().undelete(now);
        entity.increment_version(now, format!("Undeleted to version \"{restored}\"."));
        self.save_active(txn, &entity, true)?;
        Ok(entity)
    }

    /// Restores entities under `parent` that were deleted together with it.
    ///
    /// Entities deleted on their own stay deleted. No new version is created.
    pub async fn undelete_all_in(
        &self,
        txn: &mut AtomicTxn,
        now: DateTime<Utc>,
        parent: &impl Display,
    ) -> Result<Vec<E>, DefinitionError> {
        let deleted: Vec<E> = txn.get_prefix_json(&Self::deleted_prefix(parent)).await?;
        let mut restored = Vec::new();
        for mut entity in deleted {
            if !entity.soft_delete().deleted_with_parent {
                continue;
            }
            entity.soft_delete_mut().undelete(now);
            self.save_active(txn, &entity, true)?;
            restored.push(entity);
        }
        Ok(restored)
    }

    /// Stores the content of version `to` as a new version of the active entity.
    pub async fn rollback_in(
        &self,
        txn: &mut AtomicTxn,
        now: DateTime<Utc>,
        key: &E::Key,
        to: u32,
    ) -> Result<E, DefinitionError> {
        self.check_versions_count(txn, key).await?;
        let active = self
            .get_in(txn, key)
            .await?
            .ok_or_else(|| DefinitionError::not_found::<E>(key))?;
        let target: E = txn
            .get_json(&Self::version_key(key, to))
            .await?
            .ok_or_else(|| DefinitionError::version_not_found::<E>(key, to))?;

        let mut updated = target;
        *updated.version_mut() = active.version().clone();
        *updated.soft_delete_mut() = active.soft_delete().clone();
        updated.increment_version(now, format!("Rollback to version \"{to}\"."));
        self.save_active(txn, &updated, false)?;
        Ok(updated)
    }

    /// Stages the active record and its history entry.
    fn save_active(&self, txn: &mut AtomicTxn, entity: &E, from_deleted: bool) -> Result<(), DefinitionError> {
        let key = entity.key();
        txn.put_json(Self::active_key(key), entity)?;
        txn.put_json(Self::version_key(key, entity.version().number), entity)?;
        if from_deleted {
            txn.delete(Self::deleted_key(key));
        }
        Ok(())
    }

    fn save_deleted(&self, txn: &mut AtomicTxn, entity: &E) -> Result<(), DefinitionError> {
        let key = entity.key();
        txn.delete(Self::active_key(key));
        txn.put_json(Self::deleted_key(key), entity)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Sink, SinkKey};

    #[test]
    fn test_key_layout() {
        let key: SinkKey = "123/456/my-source/my-sink".parse().unwrap();

        assert_eq!(
            EntityStore::<Sink>::active_key(&key),
            "definition/sink/active/123/456/my-source/my-sink"
        );
        assert_eq!(
            EntityStore::<Sink>::deleted_key(&key),
            "definition/sink/deleted/123/456/my-source/my-sink"
        );
        assert_eq!(
            EntityStore::<Sink>::version_key(&key, 12),
            "definition/sink/version/123/456/my-source/my-sink/0000000012"
        );
        assert_eq!(
            EntityStore::<Sink>::active_prefix(&key.source_key),
            "definition/sink/active/123/456/my-source/"
        );
    }
}
