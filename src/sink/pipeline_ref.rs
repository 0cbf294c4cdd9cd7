//! Lazily opened, retrying handle to the pipeline of one sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use axum::http::StatusCode;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::{RwLock, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::pipeline::{PipelineError, PipelineOpener, Record, RecordStatus, SinkPipeline, UnregisterFn};
use crate::clock::Clock;
use crate::definition::SinkKey;
use crate::error::ServiceError;

/// Open failure kept to answer writes until the next attempt is due.
#[derive(Debug, Clone)]
struct OpenError {
    status: StatusCode,
    name: String,
    message: String,
}

impl OpenError {
    fn to_error(&self) -> PipelineError {
        PipelineError::Status {
            status: self.status,
            name: self.name.clone(),
            message: self.message.clone(),
        }
    }
}

enum State {
    Closed {
        last_error: Option<OpenError>,
        retry_after: Option<DateTime<Utc>>,
        backoff: Backoff,
    },
    Open {
        pipeline: Box<dyn SinkPipeline>,
    },
}

impl State {
    fn closed() -> Self {
        Self::Closed {
            last_error: None,
            retry_after: None,
            backoff: Backoff::new(),
        }
    }
}

pub struct PipelineRef {
    sink_key: SinkKey,
    sink_type: String,
    opener: Arc<dyn PipelineOpener>,
    clock: Arc<dyn Clock>,
    on_unregister: UnregisterFn,
    state: RwLock<State>,
    closed: AtomicBool,
    /// Cancelled once `close` has fully finished.
    close_done: CancellationToken,
    /// Reference this one replaces; its close must finish before the first open.
    predecessor: Option<Weak<PipelineRef>>,
}

impl PipelineRef {
    /// Creates a closed reference; nothing is opened until the first write.
    ///
    /// `on_unregister` is invoked once, when the reference is closed, and is
    /// also handed to the pipeline so it can unregister itself.
    pub fn new(
        sink_key: SinkKey,
        sink_type: String,
        opener: Arc<dyn PipelineOpener>,
        clock: Arc<dyn Clock>,
        on_unregister: UnregisterFn,
    ) -> Self {
        Self {
            sink_key,
            sink_type,
            opener,
            clock,
            on_unregister,
            state: RwLock::new(State::closed()),
            closed: AtomicBool::new(false),
            close_done: CancellationToken::new(),
            predecessor: None,
        }
    }

    /// Makes the first open wait until `predecessor` is closed.
    pub fn after(mut self, predecessor: &Arc<PipelineRef>) -> Self {
        self.predecessor = Some(Arc::downgrade(predecessor));
        self
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn sink_key(&self) -> &SinkKey {
        &self.sink_key
    }

    pub fn sink_type(&self) -> &str {
        &self.sink_type
    }

    /// Whether the pipeline is open and asks to be replaced on sink modification.
    pub async fn reopen_on_sink_modification(&self) -> bool {
        match &*self.state.read().await {
            State::Open { pipeline } => pipeline.reopen_on_sink_modification(),
            State::Closed { .. } => false,
        }
    }

    pub async fn write_record(&self, record: &Record) -> Result<RecordStatus, PipelineError> {
        self.try_write_record(record)
            .await
            .unwrap_or_else(|| Err(self.closed_error()))
    }

    /// Like [`write_record`](Self::write_record), but returns `None` when the
    /// reference was closed before the record reached a pipeline.
    pub async fn try_write_record(&self, record: &Record) -> Option<Result<RecordStatus, PipelineError>> {
        {
            let state = self.state.read().await;
            if let State::Open { pipeline } = &*state {
                return Some(pipeline.write_record(record).await);
            }
        }

        let mut state = self.state.write().await;
        if self.is_closed() {
            return None;
        }
        if let Err(err) = self.ensure_opened(&mut state).await {
            return Some(Err(err));
        }

        // Other writers may proceed while this record is written.
        let state = state.downgrade();
        match &*state {
            State::Open { pipeline } => Some(pipeline.write_record(record).await),
            State::Closed { .. } => None,
        }
    }

    /// Opens the pipeline unless it is open or the backoff delay has not elapsed.
    async fn ensure_opened(&self, state: &mut RwLockWriteGuard<'_, State>) -> Result<(), PipelineError> {
        let State::Closed {
            last_error,
            retry_after,
            backoff,
        } = &mut **state
        else {
            return Ok(());
        };

        if let Some(predecessor) = self.predecessor.as_ref().and_then(Weak::upgrade) {
            predecessor.close_done.cancelled().await;
        }

        let now = self.clock.now();
        if let (Some(error), Some(retry_after)) = (last_error.as_ref(), retry_after.as_ref())
            && now < *retry_after
        {
            return Err(error.to_error());
        }

        match self
            .opener
            .open_sink_pipeline(&self.sink_key, &self.sink_type, Arc::clone(&self.on_unregister))
            .await
        {
            Ok(pipeline) => {
                metrics::counter!("stream_pipeline_open_total", "outcome" => "success").increment(1);
                tracing::info!(
                    project.id = %self.sink_key.source_key.project_id(),
                    branch.id = %self.sink_key.source_key.branch_id(),
                    source.id = %self.sink_key.source_key.source_id,
                    sink.id = %self.sink_key.sink_id,
                    "opened sink pipeline"
                );
                **state = State::Open { pipeline };
                Ok(())
            }
            Err(err) => {
                metrics::counter!("stream_pipeline_open_total", "outcome" => "failure").increment(1);
                let delay = backoff.next_delay();
                let next_attempt = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
                let error = OpenError {
                    status: err.status_code(),
                    name: err.error_name(),
                    message: format!(
                        "cannot open sink pipeline: {err}, next attempt after {}",
                        next_attempt.to_rfc3339_opts(SecondsFormat::Secs, true)
                    ),
                };
                tracing::warn!(sink.key = %self.sink_key, error = %error.message, "sink pipeline open failed");
                *last_error = Some(error.clone());
                *retry_after = Some(next_attempt);
                Err(error.to_error())
            }
        }
    }

    /// Closes the pipeline and unregisters the reference. Calls after the first are no-ops.
    pub async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Waits for in-flight writes holding the read lock.
        let previous = std::mem::replace(&mut *self.state.write().await, State::closed());
        if let State::Open { pipeline } = previous {
            pipeline.close(reason).await;
            tracing::info!(
                project.id = %self.sink_key.source_key.project_id(),
                branch.id = %self.sink_key.source_key.branch_id(),
                source.id = %self.sink_key.source_key.source_id,
                sink.id = %self.sink_key.sink_id,
                "closed sink pipeline: {reason}"
            );
        }

        (self.on_unregister)();
        self.close_done.cancel();
    }

    fn closed_error(&self) -> PipelineError {
        PipelineError::status(
            StatusCode::SERVICE_UNAVAILABLE,
            "pipelineClosed",
            format!("sink pipeline \"{}\" is closed", self.sink_key),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::http::HeaderMap;
    use bytes::Bytes;

    use super::*;
    use crate::clock::MockClock;

    struct NopPipeline;

    #[async_trait]
    impl SinkPipeline for NopPipeline {
        fn reopen_on_sink_modification(&self) -> bool {
            false
        }

        async fn write_record(&self, _record: &Record) -> Result<RecordStatus, PipelineError> {
            Ok(RecordStatus::Processed)
        }

        async fn close(&self, _reason: &str) {}
    }

    #[derive(Default)]
    struct FlakyOpener {
        fail: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PipelineOpener for FlakyOpener {
        async fn open_sink_pipeline(
            &self,
            _sink_key: &SinkKey,
            _sink_type: &str,
            _on_unregister: UnregisterFn,
        ) -> Result<Box<dyn SinkPipeline>, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(anyhow::anyhow!("volume unavailable").into());
            }
            Ok(Box::new(NopPipeline))
        }
    }

    fn record() -> Record {
        Record {
            received_at: Utc::now(),
            client_ip: None,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"{}"),
        }
    }

    fn pipeline_ref(opener: Arc<FlakyOpener>, clock: Arc<MockClock>, unregistered: Arc<AtomicUsize>) -> PipelineRef {
        PipelineRef::new(
            "1/2/src/out".parse().unwrap(),
            "test".to_string(),
            opener,
            clock,
            Arc::new(move || {
                unregistered.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[tokio::test]
    async fn test_failed_open_is_cached_until_retry_after() {
        let start: DateTime<Utc> = "2024-01-01T00:00:00Z".parse().unwrap();
        let clock = MockClock::new(start);
        let opener = Arc::new(FlakyOpener::default());
        opener.fail.store(true, Ordering::SeqCst);
        let pipeline = pipeline_ref(Arc::clone(&opener), Arc::clone(&clock), Arc::default());

        let err = pipeline.write_record(&record()).await.unwrap_err();
        assert!(
            err.to_string()
                .starts_with("cannot open sink pipeline: volume unavailable, next attempt after 2024-01-01T00:00:00"),
            "{err}"
        );
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        // Still blocked by the backoff.
        let cached = pipeline.write_record(&record()).await.unwrap_err();
        assert_eq!(cached.to_string(), err.to_string());
        assert_eq!(opener.calls.load(Ordering::SeqCst), 1);

        opener.fail.store(false, Ordering::SeqCst);
        clock.advance(Duration::from_secs(1));
        assert_eq!(pipeline.write_record(&record()).await.unwrap(), RecordStatus::Processed);
        assert_eq!(pipeline.write_record(&record()).await.unwrap(), RecordStatus::Processed);
        assert_eq!(opener.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let clock = MockClock::new(Utc::now());
        let opener = Arc::new(FlakyOpener::default());
        let unregistered = Arc::new(AtomicUsize::new(0));
        let pipeline = pipeline_ref(opener, clock, Arc::clone(&unregistered));

        pipeline.write_record(&record()).await.unwrap();
        pipeline.close("sink deleted").await;
        pipeline.close("shutdown").await;

        assert_eq!(unregistered.load(Ordering::SeqCst), 1);
        let err = pipeline.write_record(&record()).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_replacement_opens_after_the_closed_reference() {
        let clock = MockClock::new(Utc::now());
        let opener = Arc::new(FlakyOpener::default());
        let old = Arc::new(pipeline_ref(Arc::clone(&opener), Arc::clone(&clock), Arc::default()));

        old.write_record(&record()).await.unwrap();
        old.close("sink updated").await;
        assert!(old.is_closed());
        assert!(old.try_write_record(&record()).await.is_none());

        let replacement = pipeline_ref(Arc::clone(&opener), clock, Arc::default()).after(&old);
        assert_eq!(replacement.write_record(&record()).await.unwrap(), RecordStatus::Processed);
        assert_eq!(opener.calls.load(Ordering::SeqCst), 2);
    }
}
