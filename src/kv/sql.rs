//! SQL [`KvStore`] backend on SeaORM.
//!
//! `kv_entries` is authoritative, `kv_changes` is an append-only log read by
//! watchers and `kv_meta` holds the revision counter. A writing transaction
//! first bumps the counter row, which serializes writers on both Postgres
//! (row lock) and SQLite (database write lock), then evaluates its compares
//! against committed state, applies its ops and appends change rows.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, FromQueryResult, QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
    sea_query::{Alias, Expr, Func, SimpleExpr},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{
    Compare, KeyValue, KvError, KvStore, PrefixStats, Txn, TxnOp, TxnResponse, WatchEvent,
    WatchEventKind, WatchResponse, WatchStream,
};
use crate::models::{
    KvChange, KvEntry, KvMeta, kv_change, kv_entry,
    kv_meta::{self, META_ROW_ID},
};

const WATCH_BUFFER: usize = 64;
const WATCH_PAGE_SIZE: u64 = 1000;

/// Key-value store persisted in a SQL database.
#[derive(Clone)]
pub struct SqlKv {
    db: DatabaseConnection,
    poll_interval: Duration,
    retention: i64,
}

#[derive(Debug, FromQueryResult)]
struct StatsRow {
    count: i64,
    max_mod_revision: Option<i64>,
}

impl SqlKv {
    /// Creates the store on a migrated database.
    ///
    /// # Arguments
    /// * `db` - Connection pool with the `kv_*` tables
    /// * `poll_interval` - Delay between change log polls of each watcher
    /// * `retention` - Number of revisions kept in the change log
    pub fn new(db: DatabaseConnection, poll_interval: Duration, retention: i64) -> Self {
        Self {
            db,
            poll_interval,
            retention,
        }
    }

    /// Removes change log rows older than the retention window.
    ///
    /// # Returns
    /// Number of removed rows
    pub async fn compact(&self) -> Result<u64, KvError> {
        let meta = load_meta(&self.db).await?;
        let horizon = meta.revision - self.retention;
        if horizon <= meta.compacted_revision {
            return Ok(0);
        }

        let txn = self.db.begin().await?;
        let removed = KvChange::delete_many()
            .filter(kv_change::Column::Revision.lte(horizon))
            .exec(&txn)
            .await?
            .rows_affected;
        KvMeta::update_many()
            .col_expr(kv_meta::Column::CompactedRevision, Expr::value(horizon))
            .filter(kv_meta::Column::Id.eq(META_ROW_ID))
            .filter(kv_meta::Column::CompactedRevision.lt(horizon))
            .exec(&txn)
            .await?;
        txn.commit().await?;

        tracing::debug!(horizon, removed, "compacted kv change log");
        Ok(removed)
    }

    /// Runs [`SqlKv::compact`] periodically until `cancel` fires.
    pub fn spawn_compaction(
        &self,
        interval: Duration,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) {
        let store = self.clone();
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(err) = store.compact().await {
                    tracing::warn!(error = %err, "kv change log compaction failed");
                }
            }
        });
    }
}

#[async_trait]
impl KvStore for SqlKv {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, KvError> {
        Ok(load(&self.db, key).await?.map(into_key_value))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, KvError> {
        Ok(load_prefix(&self.db, prefix)
            .await?
            .into_iter()
            .map(into_key_value)
            .collect())
    }

    async fn prefix_stats(&self, prefix: &str) -> Result<PrefixStats, KvError> {
        Ok(load_stats(&self.db, prefix).await?)
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse, KvError> {
        if txn.ops.is_empty() {
            let revision = load_meta(&self.db).await?.revision;
            let succeeded = compares_hold(&self.db, &txn.compares).await?;
            return Ok(TxnResponse {
                succeeded,
                revision,
            });
        }

        let db_txn = self.db.begin().await?;

        // Taking the counter row lock first orders this transaction after every
        // writer that committed before; the compares below see their effects.
        let bumped = KvMeta::update_many()
            .col_expr(
                kv_meta::Column::Revision,
                Expr::col(kv_meta::Column::Revision).add(1),
            )
            .filter(kv_meta::Column::Id.eq(META_ROW_ID))
            .exec(&db_txn)
            .await?;
        if bumped.rows_affected != 1 {
            return Err(DbErr::RecordNotFound("kv_meta revision row".to_string()).into());
        }
        let revision = load_meta(&db_txn).await?.revision;

        if !compares_hold(&db_txn, &txn.compares).await? {
            db_txn.rollback().await?;
            return Ok(TxnResponse {
                succeeded: false,
                revision: revision - 1,
            });
        }

        for op in dedup_ops(txn.ops) {
            match op {
                TxnOp::Put { key, value } => {
                    let create_revision = match load(&db_txn, &key).await? {
                        Some(row) => {
                            let create_revision = row.create_revision;
                            let mut active: kv_entry::ActiveModel = row.into();
                            active.value = Set(value.clone());
                            active.mod_revision = Set(revision);
                            active.update(&db_txn).await?;
                            create_revision
                        }
                        None => {
                            kv_entry::ActiveModel {
                                key: Set(key.clone()),
                                value: Set(value.clone()),
                                create_revision: Set(revision),
                                mod_revision: Set(revision),
                            }
                            .insert(&db_txn)
                            .await?;
                            revision
                        }
                    };
                    kv_change::ActiveModel {
                        revision: Set(revision),
                        key: Set(key),
                        kind: Set(kv_change::KIND_PUT.to_string()),
                        value: Set(Some(value)),
                        create_revision: Set(create_revision),
                    }
                    .insert(&db_txn)
                    .await?;
                }
                TxnOp::Delete { key } => {
                    let Some(row) = load(&db_txn, &key).await? else {
                        continue;
                    };
                    KvEntry::delete_by_id(key.clone()).exec(&db_txn).await?;
                    kv_change::ActiveModel {
                        revision: Set(revision),
                        key: Set(key),
                        kind: Set(kv_change::KIND_DELETE.to_string()),
                        value: Set(None),
                        create_revision: Set(row.create_revision),
                    }
                    .insert(&db_txn)
                    .await?;
                }
            }
        }

        db_txn.commit().await?;
        Ok(TxnResponse {
            succeeded: true,
            revision,
        })
    }

    async fn revision(&self) -> Result<i64, KvError> {
        Ok(load_meta(&self.db).await?.revision)
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, KvError> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let mut watcher = SqlWatcher {
            db: self.db.clone(),
            prefix: prefix.to_string(),
            last_revision: 0,
            snapshot_revisions: HashMap::new(),
        };

        // The snapshot is taken eagerly so connection problems surface to the caller.
        let snapshot = watcher.snapshot().await?;
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            if tx.send(snapshot).await.is_err() {
                return;
            }
            loop {
                tokio::select! {
                    _ = tx.closed() => return,
                    _ = tokio::time::sleep(poll_interval) => {}
                }

                let response = match watcher.poll().await {
                    Ok(Some(response)) => response,
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::warn!(prefix = %watcher.prefix, error = %err, "kv watch poll failed");
                        continue;
                    }
                };
                if tx.send(response).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}

/// Polling state of one prefix watch.
struct SqlWatcher {
    db: DatabaseConnection,
    prefix: String,
    last_revision: i64,
    /// Mod revisions seen by the last snapshot; changes already reflected
    /// there are skipped.
    snapshot_revisions: HashMap<String, i64>,
}

impl SqlWatcher {
    async fn snapshot(&mut self) -> Result<WatchResponse, KvError> {
        // The revision is read before the entries: a change committed in
        // between is delivered again by the next poll rather than lost.
        let revision = load_meta(&self.db).await?.revision;
        let rows = load_prefix(&self.db, &self.prefix).await?;

        self.last_revision = revision;
        self.snapshot_revisions = rows
            .iter()
            .filter(|row| row.mod_revision > revision)
            .map(|row| (row.key.clone(), row.mod_revision))
            .collect();

        Ok(WatchResponse {
            revision,
            restarted: true,
            events: rows
                .into_iter()
                .map(|row| WatchEvent {
                    kind: WatchEventKind::Create,
                    kv: into_key_value(row),
                })
                .collect(),
        })
    }

    async fn poll(&mut self) -> Result<Option<WatchResponse>, KvError> {
        let meta = load_meta(&self.db).await?;
        if meta.compacted_revision > self.last_revision {
            tracing::warn!(prefix = %self.prefix, "kv change log compacted past watcher, restarting");
            return self.snapshot().await.map(Some);
        }
        if meta.revision <= self.last_revision {
            return Ok(None);
        }

        let upper = meta.revision.min(self.last_revision + WATCH_PAGE_SIZE as i64);
        let changes = KvChange::find()
            .filter(kv_change::Column::Revision.gt(self.last_revision))
            .filter(kv_change::Column::Revision.lte(upper))
            .filter(prefix_condition(kv_change::Column::Key, &self.prefix))
            .order_by_asc(kv_change::Column::Revision)
            .order_by_asc(kv_change::Column::Key)
            .all(&self.db)
            .await?;

        // Rows may have been compacted while they were read.
        if load_meta(&self.db).await?.compacted_revision > self.last_revision {
            return self.snapshot().await.map(Some);
        }

        self.last_revision = upper;
        let events: Vec<_> = changes
            .into_iter()
            .filter(|change| {
                self.snapshot_revisions
                    .get(&change.key)
                    .is_none_or(|seen| change.revision > *seen)
            })
            .map(into_watch_event)
            .collect();
        self.snapshot_revisions
            .retain(|_, seen| *seen > self.last_revision);

        if events.is_empty() {
            return Ok(None);
        }
        Ok(Some(WatchResponse {
            revision: upper,
            restarted: false,
            events,
        }))
    }
}

/// Exact, collation independent prefix match on a key column.
fn prefix_condition<C: ColumnTrait>(column: C, prefix: &str) -> SimpleExpr {
    let length = i32::try_from(prefix.chars().count()).unwrap_or(i32::MAX);
    Expr::expr(
        Func::cust(Alias::new("substr"))
            .arg(Expr::col(column))
            .arg(1)
            .arg(length),
    )
    .eq(prefix)
}

async fn load<C: ConnectionTrait>(conn: &C, key: &str) -> Result<Option<kv_entry::Model>, DbErr> {
    KvEntry::find_by_id(key.to_string()).one(conn).await
}

async fn load_prefix<C: ConnectionTrait>(
    conn: &C,
    prefix: &str,
) -> Result<Vec<kv_entry::Model>, DbErr> {
    let mut rows = KvEntry::find()
        .filter(prefix_condition(kv_entry::Column::Key, prefix))
        .all(conn)
        .await?;
    // Byte order, independent of the database collation.
    rows.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(rows)
}

async fn load_stats<C: ConnectionTrait>(conn: &C, prefix: &str) -> Result<PrefixStats, DbErr> {
    let row = KvEntry::find()
        .select_only()
        .column_as(kv_entry::Column::Key.count(), "count")
        .column_as(kv_entry::Column::ModRevision.max(), "max_mod_revision")
        .filter(prefix_condition(kv_entry::Column::Key, prefix))
        .into_model::<StatsRow>()
        .one(conn)
        .await?;

    Ok(row.map_or_else(PrefixStats::default, |row| PrefixStats {
        count: usize::try_from(row.count).unwrap_or_default(),
        max_mod_revision: row.max_mod_revision.unwrap_or(0),
    }))
}

async fn load_meta<C: ConnectionTrait>(conn: &C) -> Result<kv_meta::Model, DbErr> {
    KvMeta::find_by_id(META_ROW_ID)
        .one(conn)
        .await?
        .ok_or_else(|| DbErr::RecordNotFound("kv_meta revision row".to_string()))
}

async fn compares_hold<C: ConnectionTrait>(conn: &C, compares: &[Compare]) -> Result<bool, DbErr> {
    for compare in compares {
        let holds = match compare {
            Compare::ModRevision { key, revision } => {
                let current = load(conn, key).await?.map_or(0, |row| row.mod_revision);
                current == *revision
            }
            Compare::Prefix {
                prefix,
                count,
                max_mod_revision,
            } => {
                let stats = load_stats(conn, prefix).await?;
                stats.count == *count && stats.max_mod_revision <= *max_mod_revision
            }
        };
        if !holds {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Keeps only the last op per key; the change log holds one row per key and revision.
fn dedup_ops(ops: Vec<TxnOp>) -> Vec<TxnOp> {
    let mut seen = HashSet::new();
    let mut kept: Vec<TxnOp> = ops
        .into_iter()
        .rev()
        .filter(|op| seen.insert(op.key().to_string()))
        .collect();
    kept.reverse();
    kept
}

fn into_key_value(row: kv_entry::Model) -> KeyValue {
    KeyValue {
        key: row.key,
        value: row.value,
        create_revision: row.create_revision,
        mod_revision: row.mod_revision,
    }
}

fn into_watch_event(change: kv_change::Model) -> WatchEvent {
    let kind = if change.kind == kv_change::KIND_DELETE {
        WatchEventKind::Delete
    } else if change.create_revision == change.revision {
        WatchEventKind::Create
    } else {
        WatchEventKind::Update
    };
    WatchEvent {
        kind,
        kv: KeyValue {
            key: change.key,
            value: change.value.unwrap_or_default(),
            create_revision: change.create_revision,
            mod_revision: change.revision,
        },
    }
}
