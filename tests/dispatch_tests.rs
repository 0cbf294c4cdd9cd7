//! Source resolution and sink fan-out through the dispatcher and router.

mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use stream_ingest::definition::SourceId;
use stream_ingest::source::DispatchError;
use test_utils::*;

fn github() -> SourceId {
    SourceId::new("github").unwrap()
}

#[tokio::test]
async fn test_record_reaches_matching_sources_in_all_branches() {
    let kv = memory_kv();
    let repo = repository(&kv);
    let now = start_time();
    for branch in [1, 2, 3] {
        create_branch(&repo, now, branch).await;
    }
    create_source(&repo, now, source_key(1, "github"), "secret").await;
    create_source(&repo, now, source_key(2, "github"), "secret").await;
    create_source(&repo, now, source_key(3, "github"), "other-secret").await;
    create_sink(&repo, now, sink_key(1, "github", "a"), "test").await;
    create_sink(&repo, now, sink_key(2, "github", "b"), "test").await;
    create_sink(&repo, now, sink_key(3, "github", "c"), "test").await;

    let opener = TestOpener::new();
    let state = start_state(kv, &opener).await;

    let result = state
        .dispatcher
        .dispatch(project(), &github(), "secret", record("{\"n\":1}"))
        .await
        .unwrap();

    assert_eq!(result.status_code, StatusCode::OK);
    assert_eq!(result.message, "Successfully written to 2/2 sinks.");
    let branches: Vec<_> = result.sources.iter().map(|source| source.branch_id.get()).collect();
    assert_eq!(branches, vec![1, 2]);
    assert_eq!(opener.written_to(&sink_key(1, "github", "a")).len(), 1);
    assert_eq!(opener.written_to(&sink_key(2, "github", "b")).len(), 1);
    assert!(opener.written_to(&sink_key(3, "github", "c")).is_empty());

    state.shutdown().await;
}

#[tokio::test]
async fn test_unknown_or_disabled_source() {
    let kv = memory_kv();
    let repo = repository(&kv);
    let now = start_time();
    create_branch(&repo, now, 1).await;
    create_branch(&repo, now, 2).await;
    create_source(&repo, now, source_key(1, "github"), "secret").await;
    create_source(&repo, now, source_key(2, "github"), "secret").await;
    create_source(&repo, now, source_key(1, "off"), "secret").await;
    repo.sources.disable(now, &source_key(1, "off"), "maintenance").await.unwrap();
    repo.sources.disable(now, &source_key(2, "github"), "maintenance").await.unwrap();

    let opener = TestOpener::new();
    let state = start_state(kv, &opener).await;

    let err = state
        .dispatcher
        .dispatch(project(), &github(), "wrong", record("{}"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NoSourceFound));

    let err = state
        .dispatcher
        .dispatch(project(), &SourceId::new("off").unwrap(), "secret", record("{}"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::SourceDisabled));

    // Only the enabled branch is dispatched to.
    let result = state
        .dispatcher
        .dispatch(project(), &github(), "secret", record("{}"))
        .await
        .unwrap();
    assert_eq!(result.sources.len(), 1);
    assert_eq!(result.sources[0].branch_id.get(), 1);
    assert_eq!(result.message, "No enabled sink found.");

    state.shutdown().await;
}

#[tokio::test]
async fn test_partial_failure_and_disabled_sink() {
    let kv = memory_kv();
    let repo = repository(&kv);
    let now = start_time();
    create_branch(&repo, now, 1).await;
    create_source(&repo, now, source_key(1, "github"), "secret").await;
    create_sink(&repo, now, sink_key(1, "github", "good"), "test").await;
    create_sink(&repo, now, sink_key(1, "github", "bad"), "test").await;
    create_sink(&repo, now, sink_key(1, "github", "off"), "test").await;
    repo.sinks
        .disable(now, &sink_key(1, "github", "off"), "maintenance")
        .await
        .unwrap();

    let opener = TestOpener::new();
    opener.fail_writes_of("bad");
    let state = start_state(kv, &opener).await;

    let result = state
        .dispatcher
        .dispatch(project(), &github(), "secret", record("{}"))
        .await
        .unwrap();

    assert_eq!(result.status_code, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(result.error.as_deref(), Some("stream.in.writeFailed"));
    assert_eq!(result.message, "Written to 1/2 sinks.");
    assert_eq!(result.failed_sinks, 1);

    let sinks = &result.sources[0].sinks;
    assert_eq!(sinks.len(), 2);
    assert_eq!(sinks[0].sink_id.as_str(), "bad");
    assert_eq!(sinks[0].error.as_deref(), Some("stream.in.writeError"));
    assert_eq!(sinks[0].message, "Some write error.");
    assert_eq!(sinks[1].sink_id.as_str(), "good");
    assert_eq!(sinks[1].status_code, StatusCode::OK);

    state.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_open_pipeline_once() {
    let kv = memory_kv();
    let repo = repository(&kv);
    let now = start_time();
    create_branch(&repo, now, 1).await;
    create_source(&repo, now, source_key(1, "github"), "secret").await;
    create_sink(&repo, now, sink_key(1, "github", "out"), "test").await;

    let opener = Arc::new(TestOpener {
        open_delay: Some(Duration::from_millis(20)),
        ..TestOpener::default()
    });
    let state = start_state(kv, &opener).await;

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let dispatcher = Arc::clone(&state.dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .dispatch(project(), &github(), "secret", record("{}"))
                    .await
            })
        })
        .collect();
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status_code, StatusCode::OK);
    }

    assert_eq!(opener.opens(), 1);
    assert_eq!(opener.written_to(&sink_key(1, "github", "out")).len(), 20);
    assert_eq!(state.dispatcher.router().pipelines_count(), 1);

    state.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_after_backoff_open_pipeline_once() {
    let kv = memory_kv();
    let repo = repository(&kv);
    let now = start_time();
    create_branch(&repo, now, 1).await;
    create_source(&repo, now, source_key(1, "github"), "secret").await;
    let key = sink_key(1, "github", "out");
    create_sink(&repo, now, key.clone(), "test").await;

    let opener = Arc::new(TestOpener {
        open_delay: Some(Duration::from_millis(20)),
        ..TestOpener::default()
    });
    opener.fail_opens_of("out");
    let clock = mock_clock();
    let state = start_state_with_clock(test_config(), kv, &opener, Arc::clone(&clock)).await;

    let result = state
        .dispatcher
        .dispatch(project(), &github(), "secret", record("{}"))
        .await
        .unwrap();
    assert_eq!(result.status_code, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(opener.opens(), 1);

    opener.failing_opens.lock().unwrap().clear();
    clock.advance(Duration::from_secs(1));

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let dispatcher = Arc::clone(&state.dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .dispatch(project(), &github(), "secret", record("{}"))
                    .await
            })
        })
        .collect();
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status_code, StatusCode::OK);
    }

    assert_eq!(opener.opens(), 2);
    assert_eq!(opener.written_to(&key).len(), 20);

    state.shutdown().await;
}

#[tokio::test]
async fn test_failed_open_is_not_retried_before_backoff() {
    let kv = memory_kv();
    let repo = repository(&kv);
    let now = start_time();
    create_branch(&repo, now, 1).await;
    create_source(&repo, now, source_key(1, "github"), "secret").await;
    create_sink(&repo, now, sink_key(1, "github", "out"), "test").await;

    let opener = TestOpener::new();
    opener.fail_opens_of("out");
    let state = start_state(kv, &opener).await;

    for _ in 0..3 {
        let result = state
            .dispatcher
            .dispatch(project(), &github(), "secret", record("{}"))
            .await
            .unwrap();
        assert_eq!(result.status_code, StatusCode::INTERNAL_SERVER_ERROR);
        let sink = &result.sources[0].sinks[0];
        assert!(
            sink.message
                .starts_with("Cannot open sink pipeline: some open error, next attempt after 2024-01-01T00:00:"),
            "{}",
            sink.message
        );
    }
    assert_eq!(opener.opens(), 1);

    state.shutdown().await;
}

#[tokio::test]
async fn test_sink_changes_close_pipelines() {
    let kv = memory_kv();
    let repo = repository(&kv);
    let now = start_time();
    create_branch(&repo, now, 1).await;
    create_source(&repo, now, source_key(1, "github"), "secret").await;
    let deleted = sink_key(1, "github", "deleted");
    let disabled = sink_key(1, "github", "disabled");
    let renamed = sink_key(1, "github", "renamed");
    for key in [&deleted, &disabled, &renamed] {
        create_sink(&repo, now, key.clone(), "test").await;
    }

    let opener = TestOpener::new();
    let state = start_state(Arc::clone(&kv), &opener).await;
    let router = Arc::clone(state.dispatcher.router());

    state
        .dispatcher
        .dispatch(project(), &github(), "secret", record("{}"))
        .await
        .unwrap();
    assert_eq!(router.pipelines_count(), 3);

    repo.sinks.soft_delete(now, &deleted).await.unwrap();
    repo.sinks.disable(now, &disabled, "maintenance").await.unwrap();
    repo.sinks
        .update(now, &renamed, "Sink updated.", |mut sink| {
            sink.name = "Renamed".to_string();
            Ok(sink)
        })
        .await
        .unwrap();

    // The test pipelines follow modifications, so the renamed sink stays open.
    assert!(eventually(|| router.pipelines_count() == 1).await);
    let mut reasons = opener.close_reasons();
    reasons.sort();
    assert_eq!(
        reasons,
        vec![
            (deleted.to_string(), "sink deleted".to_string()),
            (disabled.to_string(), "sink updated".to_string()),
        ]
    );

    // Re-enabling opens a new pipeline on the next record.
    repo.sinks.enable(now, &disabled).await.unwrap();
    assert!(eventually(|| router.collection().sink(&disabled).is_some_and(|sink| sink.enabled)).await);
    state
        .dispatcher
        .dispatch(project(), &github(), "secret", record("{}"))
        .await
        .unwrap();
    assert_eq!(opener.opens(), 4);

    state.shutdown().await;
}

#[tokio::test]
async fn test_modification_reopens_pipelines_that_ask_for_it() {
    let kv = memory_kv();
    let repo = repository(&kv);
    let now = start_time();
    create_branch(&repo, now, 1).await;
    create_source(&repo, now, source_key(1, "github"), "secret").await;
    let key = sink_key(1, "github", "out");
    create_sink(&repo, now, key.clone(), "test").await;

    let opener = Arc::new(TestOpener {
        reopen_on_modification: true,
        ..TestOpener::default()
    });
    let state = start_state(Arc::clone(&kv), &opener).await;
    let router = Arc::clone(state.dispatcher.router());

    state
        .dispatcher
        .dispatch(project(), &github(), "secret", record("{}"))
        .await
        .unwrap();
    repo.sinks
        .update(now, &key, "Sink updated.", |mut sink| {
            sink.config = serde_json::json!({"path": "other"});
            Ok(sink)
        })
        .await
        .unwrap();

    assert!(eventually(|| router.pipelines_count() == 0).await);
    assert_eq!(opener.close_reasons(), vec![(key.to_string(), "sink updated".to_string())]);

    state.shutdown().await;
}

#[tokio::test]
async fn test_records_during_a_slow_close_reach_the_reopened_pipeline() {
    let kv = memory_kv();
    let repo = repository(&kv);
    let now = start_time();
    create_branch(&repo, now, 1).await;
    create_source(&repo, now, source_key(1, "github"), "secret").await;
    let key = sink_key(1, "github", "out");
    create_sink(&repo, now, key.clone(), "test").await;

    let opener = Arc::new(TestOpener {
        reopen_on_modification: true,
        close_delay: Some(Duration::from_millis(500)),
        ..TestOpener::default()
    });
    let state = start_state(Arc::clone(&kv), &opener).await;

    state
        .dispatcher
        .dispatch(project(), &github(), "secret", record("{\"n\":1}"))
        .await
        .unwrap();
    repo.sinks
        .update(now, &key, "Sink updated.", |mut sink| {
            sink.config = serde_json::json!({"path": "other"});
            Ok(sink)
        })
        .await
        .unwrap();
    assert!(eventually(|| opener.closes_started() == 1).await);

    let result = state
        .dispatcher
        .dispatch(project(), &github(), "secret", record("{\"n\":2}"))
        .await
        .unwrap();
    assert_eq!(result.status_code, StatusCode::OK, "{:?}", result.sources);

    // The new pipeline was opened only after the old one finished closing.
    assert_eq!(opener.close_reasons(), vec![(key.to_string(), "sink updated".to_string())]);
    assert_eq!(opener.opens(), 2);
    assert_eq!(opener.written_to(&key).len(), 2);

    state.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_pipelines_and_rejects_records() {
    let kv = memory_kv();
    let repo = repository(&kv);
    let now = start_time();
    create_branch(&repo, now, 1).await;
    create_source(&repo, now, source_key(1, "github"), "secret").await;
    let key = sink_key(1, "github", "out");
    create_sink(&repo, now, key.clone(), "test").await;

    let opener = TestOpener::new();
    let state = start_state(kv, &opener).await;
    state
        .dispatcher
        .dispatch(project(), &github(), "secret", record("{}"))
        .await
        .unwrap();

    state.shutdown().await;

    assert_eq!(opener.close_reasons(), vec![(key.to_string(), "shutdown".to_string())]);
    let err = state
        .dispatcher
        .dispatch(project(), &github(), "secret", record("{}"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Shutdown));
}
