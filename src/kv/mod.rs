//! # Revisioned key-value store
//!
//! The definition repository persists entities in an ordered key-value store
//! with store-wide revisions, compare-and-swap transactions and prefix watches.
//! [`KvStore`] is the seam; [`MemoryKv`] and [`SqlKv`] are the backends.

pub mod atomic;
pub mod memory;
pub mod sql;
pub mod watch;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use atomic::{AtomicTxn, atomic};
pub use memory::MemoryKv;
pub use sql::SqlKv;

/// A stored key with its revision metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision of the transaction that created the key.
    pub create_revision: i64,
    /// Revision of the transaction that last modified the key.
    pub mod_revision: i64,
}

/// Transaction guard evaluated atomically before the operations are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    /// The key was last modified at `revision`; `0` requires the key to be absent.
    ModRevision { key: String, revision: i64 },
    /// The prefix holds exactly `count` keys and none of them was modified after
    /// `max_mod_revision`.
    Prefix {
        prefix: String,
        count: usize,
        max_mod_revision: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl TxnOp {
    pub fn key(&self) -> &str {
        match self {
            TxnOp::Put { key, .. } | TxnOp::Delete { key } => key,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefixStats {
    pub count: usize,
    pub max_mod_revision: i64,
}

impl PrefixStats {
    pub fn of(kvs: &[KeyValue]) -> Self {
        Self {
            count: kvs.len(),
            max_mod_revision: kvs.iter().map(|kv| kv.mod_revision).max().unwrap_or(0),
        }
    }
}

/// A conditional write: `ops` are applied only if every compare holds.
#[derive(Debug, Clone, Default)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub ops: Vec<TxnOp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnResponse {
    pub succeeded: bool,
    /// Store revision after the transaction.
    pub revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Create,
    Update,
    Delete,
}

/// One change of a watched key. Delete events carry an empty value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub kv: KeyValue,
}

/// A batch of changes delivered to a watcher.
///
/// When `restarted` is set the batch is a full snapshot of the prefix and the
/// consumer must drop everything it derived from earlier batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchResponse {
    pub revision: i64,
    pub restarted: bool,
    pub events: Vec<WatchEvent>,
}

/// Receiving half of a prefix watch. Dropping it stops the watch.
pub type WatchStream = mpsc::Receiver<WatchResponse>;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv store database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("cannot encode value of key \"{key}\": {source}")]
    Encode {
        key: String,
        source: serde_json::Error,
    },
    #[error("cannot decode value of key \"{key}\": {source}")]
    Decode {
        key: String,
        source: serde_json::Error,
    },
    #[error("atomic operation did not succeed after {attempts} attempts due to concurrent writes")]
    TooManyConflicts { attempts: u32 },
    #[error("watch of prefix \"{prefix}\" closed before the initial snapshot")]
    WatchClosed { prefix: String },
}

/// Ordered, revisioned key-value store.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, KvError>;

    /// All keys starting with `prefix`, ordered by key.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, KvError>;

    /// Applies the transaction if all compares hold.
    async fn txn(&self, txn: Txn) -> Result<TxnResponse, KvError>;

    /// Number of keys under `prefix` and the highest mod revision among them.
    async fn prefix_stats(&self, prefix: &str) -> Result<PrefixStats, KvError> {
        let kvs = self.get_prefix(prefix).await?;
        Ok(PrefixStats::of(&kvs))
    }

    /// Current store revision.
    async fn revision(&self) -> Result<i64, KvError>;

    /// Watches keys under `prefix`; the first response is a full snapshot.
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, KvError>;
}

/// Smallest key greater than every key starting with `prefix`, `None` if unbounded.
pub fn prefix_end(prefix: &str) -> Option<String> {
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(last) = bytes.pop() {
        if last < 0xff {
            bytes.push(last + 1);
            return String::from_utf8(bytes).ok();
        }
    }
    None
}

/// Evaluates a compare against the current state of the prefix or key.
pub(crate) fn compare_holds<'a, I>(compare: &Compare, matching: I) -> bool
where
    I: IntoIterator<Item = &'a KeyValue>,
{
    match compare {
        Compare::ModRevision { revision, .. } => {
            let current = matching.into_iter().next().map_or(0, |kv| kv.mod_revision);
            current == *revision
        }
        Compare::Prefix {
            count,
            max_mod_revision,
            ..
        } => {
            let mut seen = 0;
            for kv in matching {
                if kv.mod_revision > *max_mod_revision {
                    return false;
                }
                seen += 1;
            }
            seen == *count
        }
    }
}

pub(crate) fn event_kind(kv: &KeyValue) -> WatchEventKind {
    if kv.create_revision == kv.mod_revision {
        WatchEventKind::Create
    } else {
        WatchEventKind::Update
    }
}
