//! Test utilities shared by the integration tests.
//!
//! Provides migrated in-memory SQLite stores, a fixed clock, definition
//! fixtures and a scriptable pipeline opener.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use stream_ingest::clock::{Clock, MockClock};
use stream_ingest::config::{AppConfig, KvBackend};
use stream_ingest::definition::{Branch, BranchKey, ProjectId, Sink, SinkKey, Source, SourceKey};
use stream_ingest::kv::{KvStore, MemoryKv, SqlKv};
use stream_ingest::repositories::DefinitionRepository;
use stream_ingest::server::AppState;
use stream_ingest::sink::{
    PipelineError, PipelineOpener, PipelineRegistry, Record, RecordStatus, SinkPipeline, UnregisterFn,
};

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// SQL store polling fast enough for tests.
pub async fn sql_kv(retention: i64) -> Result<SqlKv> {
    let db = setup_test_db().await?;
    Ok(SqlKv::new(db, Duration::from_millis(10), retention))
}

pub fn memory_kv() -> Arc<dyn KvStore> {
    Arc::new(MemoryKv::new())
}

pub fn start_time() -> DateTime<Utc> {
    "2024-01-01T00:00:00Z".parse().unwrap()
}

pub fn mock_clock() -> Arc<MockClock> {
    MockClock::new(start_time())
}

/// Test profile configuration on the memory backend, without operator tokens.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig {
        profile: "test".to_string(),
        max_body_size: 1024,
        ..AppConfig::default()
    };
    config.kv.backend = KvBackend::Memory;
    config
}

pub fn repository(kv: &Arc<dyn KvStore>) -> DefinitionRepository {
    let config = test_config();
    DefinitionRepository::new(Arc::clone(kv), &config.limits, config.kv.max_atomic_attempts)
}

pub fn project() -> ProjectId {
    ProjectId::new(123).unwrap()
}

pub fn branch_key(branch_id: u64) -> BranchKey {
    format!("{}/{branch_id}", project()).parse().unwrap()
}

pub fn source_key(branch_id: u64, source_id: &str) -> SourceKey {
    format!("{}/{source_id}", branch_key(branch_id)).parse().unwrap()
}

pub fn sink_key(branch_id: u64, source_id: &str, sink_id: &str) -> SinkKey {
    format!("{}/{sink_id}", source_key(branch_id, source_id)).parse().unwrap()
}

pub async fn create_branch(repo: &DefinitionRepository, now: DateTime<Utc>, branch_id: u64) -> Branch {
    repo.branches
        .create(now, "Branch created.", &Branch::new(branch_key(branch_id), branch_id == 1))
        .await
        .unwrap()
}

/// Creates an HTTP source with a fixed secret.
pub async fn create_source(
    repo: &DefinitionRepository,
    now: DateTime<Utc>,
    key: SourceKey,
    secret: &str,
) -> Source {
    let mut source = Source::new_http(key, "My Source");
    if let Some(http) = source.http.as_mut() {
        http.secret = secret.to_string();
    }
    repo.sources.create(now, "Source created.", &source).await.unwrap()
}

pub async fn create_sink(repo: &DefinitionRepository, now: DateTime<Utc>, key: SinkKey, sink_type: &str) -> Sink {
    repo.sinks
        .create(now, "Sink created.", &Sink::new(key, sink_type, "My Sink"))
        .await
        .unwrap()
}

pub fn record(body: &'static str) -> Record {
    Record {
        received_at: start_time(),
        client_ip: Some("10.0.0.1".parse().unwrap()),
        headers: HeaderMap::new(),
        body: Bytes::from_static(body.as_bytes()),
    }
}

/// Polls `condition` until it holds or a second passes.
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Opener of in-memory pipelines with scripted failures.
///
/// Every opened pipeline stores the bodies it received. Writes to sinks listed
/// in `failing_sinks` fail with a 500; opens of sinks in `failing_opens` fail.
#[derive(Default)]
pub struct TestOpener {
    pub opens: AtomicUsize,
    pub failing_sinks: Mutex<HashSet<String>>,
    pub failing_opens: Mutex<HashSet<String>>,
    pub reopen_on_modification: bool,
    /// Optional delay of every open, to widen race windows.
    pub open_delay: Option<Duration>,
    /// Optional delay of every close, like a pipeline flushing on close.
    pub close_delay: Option<Duration>,
    pub closes_started: Arc<AtomicUsize>,
    pub written: Arc<Mutex<HashMap<String, Vec<Bytes>>>>,
    pub closed: Arc<Mutex<Vec<(String, String)>>>,
}

impl TestOpener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_writes_of(&self, sink_id: &str) {
        self.failing_sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sink_id.to_string());
    }

    pub fn fail_opens_of(&self, sink_id: &str) {
        self.failing_opens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sink_id.to_string());
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn written_to(&self, sink_key: &SinkKey) -> Vec<Bytes> {
        self.written
            .lock()
            .unwrap()
            .get(&sink_key.to_string())
            .cloned()
            .unwrap_or_default()
    }

    pub fn closes_started(&self) -> usize {
        self.closes_started.load(Ordering::SeqCst)
    }

    pub fn close_reasons(&self) -> Vec<(String, String)> {
        self.closed.lock().unwrap().clone()
    }

    /// Registry resolving the `test` sink type to this opener.
    pub fn registry(self: &Arc<Self>) -> PipelineRegistry {
        let mut registry = PipelineRegistry::new();
        registry.register("test", Arc::clone(self) as Arc<dyn PipelineOpener>);
        registry
    }
}

#[async_trait]
impl PipelineOpener for TestOpener {
    async fn open_sink_pipeline(
        &self,
        sink_key: &SinkKey,
        _sink_type: &str,
        _on_unregister: UnregisterFn,
    ) -> Result<Box<dyn SinkPipeline>, PipelineError> {
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        self.opens.fetch_add(1, Ordering::SeqCst);

        let sink_id = sink_key.sink_id.to_string();
        if self.failing_opens.lock().unwrap().contains(&sink_id) {
            return Err(anyhow::anyhow!("some open error").into());
        }
        let fail_writes = self.failing_sinks.lock().unwrap().contains(&sink_id);
        Ok(Box::new(TestPipeline {
            sink_key: sink_key.to_string(),
            fail_writes,
            reopen_on_modification: self.reopen_on_modification,
            close_delay: self.close_delay,
            closes_started: Arc::clone(&self.closes_started),
            written: Arc::clone(&self.written),
            closed: Arc::clone(&self.closed),
        }))
    }
}

struct TestPipeline {
    sink_key: String,
    fail_writes: bool,
    reopen_on_modification: bool,
    close_delay: Option<Duration>,
    closes_started: Arc<AtomicUsize>,
    written: Arc<Mutex<HashMap<String, Vec<Bytes>>>>,
    closed: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl SinkPipeline for TestPipeline {
    fn reopen_on_sink_modification(&self) -> bool {
        self.reopen_on_modification
    }

    async fn write_record(&self, record: &Record) -> Result<RecordStatus, PipelineError> {
        if self.fail_writes {
            return Err(PipelineError::status(
                StatusCode::INTERNAL_SERVER_ERROR,
                "writeError",
                "some write error",
            ));
        }
        self.written
            .lock()
            .unwrap()
            .entry(self.sink_key.clone())
            .or_default()
            .push(record.body.clone());
        Ok(RecordStatus::Processed)
    }

    async fn close(&self, reason: &str) {
        self.closes_started.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.close_delay {
            tokio::time::sleep(delay).await;
        }
        self.closed
            .lock()
            .unwrap()
            .push((self.sink_key.clone(), reason.to_string()));
    }
}

/// Starts the application state on `kv` with `opener` behind the `test` sink type.
pub async fn start_state(kv: Arc<dyn KvStore>, opener: &Arc<TestOpener>) -> AppState {
    start_state_with_config(test_config(), kv, opener).await
}

pub async fn start_state_with_config(config: AppConfig, kv: Arc<dyn KvStore>, opener: &Arc<TestOpener>) -> AppState {
    start_state_with_clock(config, kv, opener, mock_clock()).await
}

/// Starts the state on a clock the test controls.
pub async fn start_state_with_clock(
    config: AppConfig,
    kv: Arc<dyn KvStore>,
    opener: &Arc<TestOpener>,
    clock: Arc<MockClock>,
) -> AppState {
    let clock: Arc<dyn Clock> = clock;
    AppState::start_with_pipelines(Arc::new(config), kv, clock, opener.registry())
        .await
        .unwrap()
}
