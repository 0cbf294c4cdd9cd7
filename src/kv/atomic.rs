//! Optimistic-concurrency atomic operations.
//!
//! An operation reads through an [`AtomicTxn`], which records the revision of
//! everything it observed, and stages writes on the same handle. [`atomic`]
//! commits the staged writes as one transaction conditioned on those
//! observations. When another writer got in between, the whole operation,
//! reads and validations included, runs again.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Serialize, de::DeserializeOwned};

use super::{Compare, KeyValue, KvError, KvStore, PrefixStats, Txn, TxnOp};

/// Read-tracking handle of one attempt of an atomic operation.
pub struct AtomicTxn {
    kv: Arc<dyn KvStore>,
    compares: Vec<Compare>,
    ops: Vec<TxnOp>,
}

impl AtomicTxn {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            compares: Vec::new(),
            ops: Vec::new(),
        }
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<KeyValue>, KvError> {
        let kv = self.kv.get(key).await?;
        self.compares.push(Compare::ModRevision {
            key: key.to_string(),
            revision: kv.as_ref().map_or(0, |kv| kv.mod_revision),
        });
        Ok(kv)
    }

    pub async fn get_prefix(&mut self, prefix: &str) -> Result<Vec<KeyValue>, KvError> {
        let kvs = self.kv.get_prefix(prefix).await?;
        self.track_prefix(prefix, PrefixStats::of(&kvs));
        Ok(kvs)
    }

    /// Counts keys under `prefix`; the count is part of the commit condition.
    pub async fn count_prefix(&mut self, prefix: &str) -> Result<usize, KvError> {
        let stats = self.kv.prefix_stats(prefix).await?;
        self.track_prefix(prefix, stats);
        Ok(stats.count)
    }

    pub async fn get_json<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>, KvError> {
        self.get(key).await?.map(|kv| decode(&kv)).transpose()
    }

    pub async fn get_prefix_json<T: DeserializeOwned>(
        &mut self,
        prefix: &str,
    ) -> Result<Vec<T>, KvError> {
        self.get_prefix(prefix).await?.iter().map(decode).collect()
    }

    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.ops.push(TxnOp::Put {
            key: key.into(),
            value,
        });
    }

    pub fn put_json<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<(), KvError> {
        let key = key.into();
        let value = serde_json::to_vec(value).map_err(|source| KvError::Encode {
            key: key.clone(),
            source,
        })?;
        self.put(key, value);
        Ok(())
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.push(TxnOp::Delete { key: key.into() });
    }

    /// Writes staged so far.
    pub fn ops(&self) -> &[TxnOp] {
        &self.ops
    }

    fn track_prefix(&mut self, prefix: &str, stats: PrefixStats) {
        self.compares.push(Compare::Prefix {
            prefix: prefix.to_string(),
            count: stats.count,
            max_mod_revision: stats.max_mod_revision,
        });
    }

    /// Returns `false` when a tracked read changed since it was made.
    async fn commit(self) -> Result<bool, KvError> {
        let response = self
            .kv
            .txn(Txn {
                compares: self.compares,
                ops: self.ops,
            })
            .await?;
        Ok(response.succeeded)
    }
}

/// Decodes a JSON value stored under `kv.key`.
pub fn decode<T: DeserializeOwned>(kv: &KeyValue) -> Result<T, KvError> {
    serde_json::from_slice(&kv.value).map_err(|source| KvError::Decode {
        key: kv.key.clone(),
        source,
    })
}

/// Runs `op` until its writes commit without conflict, at most `max_attempts` times.
///
/// The closure receives a fresh [`AtomicTxn`] per attempt and hands it back
/// together with its result. Errors returned by the closure end the loop.
pub async fn atomic<T, E, F, Fut>(
    kv: &Arc<dyn KvStore>,
    max_attempts: u32,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(AtomicTxn) -> Fut,
    Fut: Future<Output = Result<(AtomicTxn, T), E>>,
    E: From<KvError>,
{
    for attempt in 1..=max_attempts {
        let (txn, output) = op(AtomicTxn::new(Arc::clone(kv))).await?;
        if txn.commit().await? {
            return Ok(output);
        }

        metrics::counter!("stream_atomic_conflicts_total").increment(1);
        tracing::debug!(attempt, "atomic operation conflicted with a concurrent write, retrying");

        if attempt < max_attempts {
            let pause = {
                let mut rng = rand::thread_rng();
                Duration::from_millis(rng.gen_range(1..=5) * u64::from(attempt.min(10)))
            };
            tokio::time::sleep(pause).await;
        }
    }

    Err(KvError::TooManyConflicts {
        attempts: max_attempts,
    }
    .into())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::kv::MemoryKv;

    #[tokio::test]
    async fn conflicting_writer_triggers_retry() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let attempts = AtomicU32::new(0);

        let result: Result<usize, KvError> = atomic(&kv, 5, |mut txn| {
            let attempts = &attempts;
            let kv = &kv;
            async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let count = txn.count_prefix("items/").await?;

                if attempt == 1 {
                    // Another writer sneaks in between the read and the write.
                    kv.txn(Txn {
                        compares: vec![],
                        ops: vec![TxnOp::Put {
                            key: "items/intruder".to_string(),
                            value: b"1".to_vec(),
                        }],
                    })
                    .await?;
                }

                txn.put(format!("items/{attempt}"), b"1".to_vec());
                Ok((txn, count))
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1, "second attempt observes the intruder");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let keys: Vec<_> = kv
            .get_prefix("items/")
            .await
            .unwrap()
            .into_iter()
            .map(|kv| kv.key)
            .collect();
        assert_eq!(keys, vec!["items/2", "items/intruder"]);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let kv_ref = &kv;

        let result: Result<(), KvError> = atomic(&kv, 3, |mut txn| async move {
            txn.get("key").await?;
            kv_ref
                .txn(Txn {
                    compares: vec![],
                    ops: vec![TxnOp::Put {
                        key: "key".to_string(),
                        value: Vec::new(),
                    }],
                })
                .await?;
            txn.put("other", Vec::new());
            Ok((txn, ()))
        })
        .await;

        assert!(matches!(
            result,
            Err(KvError::TooManyConflicts { attempts: 3 })
        ));
        assert!(kv.get("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn closure_error_stops_without_commit() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());

        let result: Result<(), KvError> = atomic(&kv, 3, |mut txn| async move {
            txn.put("never", Vec::new());
            if !txn.ops().is_empty() {
                return Err(KvError::TooManyConflicts { attempts: 0 });
            }
            Ok((txn, ()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(kv.revision().await.unwrap(), 0);
    }
}
