//! In-process [`KvStore`] backend.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use super::{
    Compare, KeyValue, KvError, KvStore, Txn, TxnOp, TxnResponse, WatchEvent, WatchEventKind,
    WatchResponse, WatchStream, compare_holds, event_kind, prefix_end,
};

const CHANGES_CAPACITY: usize = 1024;
const WATCH_BUFFER: usize = 64;

/// Linearizable in-memory store: a single mutex orders all transactions.
#[derive(Clone)]
pub struct MemoryKv {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    changes: broadcast::Sender<Arc<Batch>>,
}

#[derive(Default)]
struct State {
    revision: i64,
    entries: BTreeMap<String, KeyValue>,
}

struct Batch {
    revision: i64,
    events: Vec<WatchEvent>,
}

impl MemoryKv {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGES_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changes,
            }),
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribes to changes and takes a snapshot under the same lock, so no
    /// batch is missed or delivered twice.
    fn snapshot(&self, prefix: &str) -> (broadcast::Receiver<Arc<Batch>>, WatchResponse) {
        let state = self.lock();
        let receiver = self.changes.subscribe();
        let events = state
            .range(prefix)
            .map(|kv| WatchEvent {
                kind: WatchEventKind::Create,
                kv: kv.clone(),
            })
            .collect();
        (
            receiver,
            WatchResponse {
                revision: state.revision,
                restarted: true,
                events,
            },
        )
    }
}

impl State {
    fn range<'a>(&'a self, prefix: &str) -> impl Iterator<Item = &'a KeyValue> + use<'a> {
        let upper = match prefix_end(prefix) {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        self.entries
            .range::<String, _>((Bound::Included(prefix.to_string()), upper))
            .map(|(_, kv)| kv)
    }

    fn holds(&self, compare: &Compare) -> bool {
        match compare {
            Compare::ModRevision { key, .. } => compare_holds(compare, self.entries.get(key)),
            Compare::Prefix { prefix, .. } => compare_holds(compare, self.range(prefix)),
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, KvError> {
        Ok(self.inner.lock().entries.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, KvError> {
        Ok(self.inner.lock().range(prefix).cloned().collect())
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse, KvError> {
        let mut state = self.inner.lock();

        if !txn.compares.iter().all(|c| state.holds(c)) {
            return Ok(TxnResponse {
                succeeded: false,
                revision: state.revision,
            });
        }
        if txn.ops.is_empty() {
            return Ok(TxnResponse {
                succeeded: true,
                revision: state.revision,
            });
        }

        let revision = state.revision + 1;
        let mut events = Vec::with_capacity(txn.ops.len());
        for op in txn.ops {
            match op {
                TxnOp::Put { key, value } => {
                    let create_revision = state
                        .entries
                        .get(&key)
                        .map_or(revision, |kv| kv.create_revision);
                    let kv = KeyValue {
                        key: key.clone(),
                        value,
                        create_revision,
                        mod_revision: revision,
                    };
                    events.push(WatchEvent {
                        kind: event_kind(&kv),
                        kv: kv.clone(),
                    });
                    state.entries.insert(key, kv);
                }
                TxnOp::Delete { key } => {
                    if let Some(prev) = state.entries.remove(&key) {
                        events.push(WatchEvent {
                            kind: WatchEventKind::Delete,
                            kv: KeyValue {
                                key,
                                value: Vec::new(),
                                create_revision: prev.create_revision,
                                mod_revision: revision,
                            },
                        });
                    }
                }
            }
        }
        state.revision = revision;

        // Sent under the lock so batches reach watchers in revision order.
        // No subscribers is not an error.
        let _ = self.inner.changes.send(Arc::new(Batch { revision, events }));

        Ok(TxnResponse {
            succeeded: true,
            revision,
        })
    }

    async fn revision(&self) -> Result<i64, KvError> {
        Ok(self.inner.lock().revision)
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, KvError> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let inner = Arc::clone(&self.inner);
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            let (mut changes, snapshot) = inner.snapshot(&prefix);
            let mut last_revision = snapshot.revision;
            if tx.send(snapshot).await.is_err() {
                return;
            }

            loop {
                let received = tokio::select! {
                    _ = tx.closed() => return,
                    received = changes.recv() => received,
                };

                let response = match received {
                    Ok(batch) => {
                        if batch.revision <= last_revision {
                            continue;
                        }
                        last_revision = batch.revision;
                        let events: Vec<_> = batch
                            .events
                            .iter()
                            .filter(|e| e.kv.key.starts_with(&prefix))
                            .cloned()
                            .collect();
                        if events.is_empty() {
                            continue;
                        }
                        WatchResponse {
                            revision: batch.revision,
                            restarted: false,
                            events,
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(prefix = %prefix, skipped, "watcher lagged, restarting from snapshot");
                        let (receiver, snapshot) = inner.snapshot(&prefix);
                        changes = receiver;
                        last_revision = snapshot.revision;
                        snapshot
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };

                if tx.send(response).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}
