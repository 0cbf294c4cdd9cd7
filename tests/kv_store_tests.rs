//! SQL key-value store: revisions, conditional transactions and watches.

mod test_utils;

use std::time::Duration;

use stream_ingest::kv::{Compare, KvStore, PrefixStats, SqlKv, Txn, TxnOp, WatchEventKind};
use test_utils::*;

fn put(key: &str, value: &str) -> TxnOp {
    TxnOp::Put {
        key: key.to_string(),
        value: value.as_bytes().to_vec(),
    }
}

fn delete(key: &str) -> TxnOp {
    TxnOp::Delete { key: key.to_string() }
}

async fn write(kv: &SqlKv, ops: Vec<TxnOp>) -> i64 {
    let response = kv.txn(Txn { compares: vec![], ops }).await.unwrap();
    assert!(response.succeeded);
    response.revision
}

#[tokio::test]
async fn test_revisions_and_mod_revision_compare() {
    let kv = sql_kv(1000).await.unwrap();
    assert_eq!(kv.revision().await.unwrap(), 0);

    assert_eq!(write(&kv, vec![put("k", "v1")]).await, 1);

    // The key exists, so "absent" does not hold.
    let response = kv
        .txn(Txn {
            compares: vec![Compare::ModRevision {
                key: "k".to_string(),
                revision: 0,
            }],
            ops: vec![put("k", "lost")],
        })
        .await
        .unwrap();
    assert!(!response.succeeded);
    assert_eq!(response.revision, 1);

    let response = kv
        .txn(Txn {
            compares: vec![Compare::ModRevision {
                key: "k".to_string(),
                revision: 1,
            }],
            ops: vec![put("k", "v2")],
        })
        .await
        .unwrap();
    assert!(response.succeeded);
    assert_eq!(response.revision, 2);

    let stored = kv.get("k").await.unwrap().unwrap();
    assert_eq!(stored.value, b"v2");
    assert_eq!(stored.create_revision, 1);
    assert_eq!(stored.mod_revision, 2);
}

#[tokio::test]
async fn test_prefix_compare_and_listing() {
    let kv = sql_kv(1000).await.unwrap();
    write(&kv, vec![put("p/b", "1"), put("p/a", "1"), put("q/a", "1")]).await;

    let keys: Vec<_> = kv
        .get_prefix("p/")
        .await
        .unwrap()
        .into_iter()
        .map(|kv| kv.key)
        .collect();
    assert_eq!(keys, vec!["p/a", "p/b"]);

    let stats = kv.prefix_stats("p/").await.unwrap();
    assert_eq!(
        stats,
        PrefixStats {
            count: 2,
            max_mod_revision: 1
        }
    );

    write(&kv, vec![put("p/a", "2")]).await;
    let stale = kv
        .txn(Txn {
            compares: vec![Compare::Prefix {
                prefix: "p/".to_string(),
                count: stats.count,
                max_mod_revision: stats.max_mod_revision,
            }],
            ops: vec![put("p/c", "1")],
        })
        .await
        .unwrap();
    assert!(!stale.succeeded);
    assert!(kv.get("p/c").await.unwrap().is_none());

    // Deleting a key is a change of the prefix too.
    let stats = kv.prefix_stats("p/").await.unwrap();
    write(&kv, vec![delete("p/b")]).await;
    let stale = kv
        .txn(Txn {
            compares: vec![Compare::Prefix {
                prefix: "p/".to_string(),
                count: stats.count,
                max_mod_revision: stats.max_mod_revision,
            }],
            ops: vec![put("p/c", "1")],
        })
        .await
        .unwrap();
    assert!(!stale.succeeded);
}

#[tokio::test]
async fn test_prefix_does_not_match_like_wildcards() {
    let kv = sql_kv(1000).await.unwrap();
    write(&kv, vec![put("a_b/1", "1"), put("axb/1", "1"), put("a%/1", "1")]).await;

    let keys: Vec<_> = kv
        .get_prefix("a_b/")
        .await
        .unwrap()
        .into_iter()
        .map(|kv| kv.key)
        .collect();
    assert_eq!(keys, vec!["a_b/1"]);
    assert_eq!(kv.get_prefix("a%").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_watch_streams_changes_after_snapshot() {
    let kv = sql_kv(1000).await.unwrap();
    write(&kv, vec![put("w/a", "1"), put("other", "1")]).await;

    let mut stream = kv.watch_prefix("w/").await.unwrap();
    let snapshot = stream.recv().await.unwrap();
    assert!(snapshot.restarted);
    assert_eq!(snapshot.events.len(), 1);
    assert_eq!(snapshot.events[0].kind, WatchEventKind::Create);

    write(&kv, vec![put("w/a", "2"), put("w/b", "1"), delete("other")]).await;
    let batch = stream.recv().await.unwrap();
    assert!(!batch.restarted);
    let events: Vec<_> = batch
        .events
        .iter()
        .map(|event| (event.kind, event.kv.key.as_str()))
        .collect();
    assert_eq!(
        events,
        vec![(WatchEventKind::Update, "w/a"), (WatchEventKind::Create, "w/b")]
    );
    assert_eq!(batch.events[0].kv.value, b"2");

    write(&kv, vec![delete("w/a")]).await;
    let batch = stream.recv().await.unwrap();
    assert_eq!(batch.events[0].kind, WatchEventKind::Delete);
    assert_eq!(batch.events[0].kv.key, "w/a");
}

#[tokio::test]
async fn test_compaction_restarts_lagging_watchers() {
    let db = setup_test_db().await.unwrap();
    let kv = SqlKv::new(db, Duration::from_millis(300), 1);
    write(&kv, vec![put("w/a", "1")]).await;

    let mut stream = kv.watch_prefix("w/").await.unwrap();
    stream.recv().await.unwrap();

    write(&kv, vec![put("w/b", "1")]).await;
    write(&kv, vec![delete("w/a")]).await;
    write(&kv, vec![put("w/c", "1")]).await;
    assert_eq!(kv.compact().await.unwrap(), 3);
    assert_eq!(kv.compact().await.unwrap(), 0);

    let restarted = tokio::time::timeout(Duration::from_secs(5), stream.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(restarted.restarted);
    let keys: Vec<_> = restarted.events.iter().map(|event| event.kv.key.as_str()).collect();
    assert_eq!(keys, vec!["w/b", "w/c"]);
}
