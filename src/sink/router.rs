//! Record router: fans a record out to every enabled sink of the matched sources.
//!
//! The router mirrors active sinks through a watch and keeps one
//! [`PipelineRef`] per sink that received a record. When a batch of changes
//! deletes, disables or modifies a sink, its pipeline is closed in the
//! background and the next record opens a new one.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use axum::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::collection::{Collection, SinkData};
use super::pipeline::{PipelineError, PipelineOpener, Record, RecordStatus, UnregisterFn};
use super::pipeline_ref::PipelineRef;
use super::result::{SinkResult, SourceResult, SourcesResult};
use crate::clock::Clock;
use crate::definition::{Sink, SinkKey, SourceKey};
use crate::error::ServiceError;
use crate::kv::{KvError, KvStore, WatchEventKind, WatchResponse, atomic::decode, watch::spawn_watch};
use crate::repositories::EntityStore;

type PipelineTable = Mutex<HashMap<SinkKey, Arc<PipelineRef>>>;

/// Lookups per record when references keep closing under the writer.
const MAX_WRITE_ATTEMPTS: usize = 3;

pub struct Router {
    collection: Arc<Collection>,
    opener: Arc<dyn PipelineOpener>,
    clock: Arc<dyn Clock>,
    pipelines: Arc<PipelineTable>,
    /// Cancelled when shutdown starts; no new writes are admitted.
    closed: CancellationToken,
    mirror_cancel: CancellationToken,
    mirror_tasks: TaskTracker,
    dispatches: TaskTracker,
    closing: TaskTracker,
}

impl Router {
    /// Starts mirroring sinks; returns once the initial snapshot is loaded.
    pub async fn start(
        kv: Arc<dyn KvStore>,
        opener: Arc<dyn PipelineOpener>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, KvError> {
        let router = Arc::new(Self {
            collection: Arc::new(Collection::new()),
            opener,
            clock,
            pipelines: Arc::new(Mutex::new(HashMap::new())),
            closed: CancellationToken::new(),
            mirror_cancel: CancellationToken::new(),
            mirror_tasks: TaskTracker::new(),
            dispatches: TaskTracker::new(),
            closing: TaskTracker::new(),
        });

        let root = EntityStore::<Sink>::active_root();
        let collection = Arc::clone(&router.collection);
        let weak = Arc::downgrade(&router);
        let prefix = root.clone();
        spawn_watch(
            kv,
            &root,
            router.mirror_cancel.clone(),
            &router.mirror_tasks,
            move |response| {
                let modified = apply_sink_changes(&collection, &prefix, response);
                if let Some(router) = weak.upgrade() {
                    router.close_stale_pipelines(&modified);
                }
            },
        )
        .await?;

        tracing::info!(sources = router.collection.sources_count(), "sink router started");
        Ok(router)
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    /// Number of pipeline references currently registered.
    pub fn pipelines_count(&self) -> usize {
        self.lock_pipelines().len()
    }

    fn lock_pipelines(&self) -> MutexGuard<'_, HashMap<SinkKey, Arc<PipelineRef>>> {
        self.pipelines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes the record to all enabled sinks of the sources, one task per source.
    pub async fn dispatch_to_sources(self: &Arc<Self>, keys: Vec<SourceKey>, record: Arc<Record>) -> SourcesResult {
        let handles: Vec<_> = keys
            .into_iter()
            .map(|key| {
                let router = Arc::clone(self);
                let record = Arc::clone(&record);
                let task_key = key.clone();
                let handle = self
                    .dispatches
                    .spawn(async move { router.dispatch_to_source(&task_key, record).await });
                (key, handle)
            })
            .collect();

        let mut result = SourcesResult::new();
        for (key, handle) in handles {
            let source = handle.await.unwrap_or_else(|err| {
                tracing::error!(source.key = %key, error = %err, "source dispatch task failed");
                SourceResult::internal(&key)
            });
            result.add_source(source);
        }

        let result = result.finalize();
        metrics::counter!("stream_records_dispatched_total", "status" => result.status_code.as_u16().to_string())
            .increment(1);
        result
    }

    /// Writes the record to all enabled sinks of one source, one task per sink.
    pub async fn dispatch_to_source(self: &Arc<Self>, key: &SourceKey, record: Arc<Record>) -> SourceResult {
        let mut result = SourceResult::new(key);
        let Some(source) = self.collection.source(key) else {
            return result.finalize();
        };

        let handles: Vec<_> = source
            .sinks
            .into_values()
            .filter(|sink| sink.enabled)
            .map(|sink| {
                let router = Arc::clone(self);
                let record = Arc::clone(&record);
                let sink_id = sink.sink_key.sink_id.clone();
                let handle = self
                    .dispatches
                    .spawn(async move { router.dispatch_to_sink(&sink, &record).await });
                (sink_id, handle)
            })
            .collect();

        for (sink_id, handle) in handles {
            let sink = handle.await.unwrap_or_else(|err| {
                tracing::error!(sink.id = %sink_id, error = %err, "sink dispatch task failed");
                SinkResult::internal(sink_id)
            });
            result.add_sink(sink);
        }
        result.finalize()
    }

    async fn dispatch_to_sink(&self, sink: &SinkData, record: &Record) -> SinkResult {
        let sink_id = sink.sink_key.sink_id.clone();
        let written = self.write_to_sink(sink, record).await;

        let result = match written {
            Ok(status) => SinkResult::written(sink_id, status),
            Err(err) => {
                if err.status_code() == StatusCode::INTERNAL_SERVER_ERROR {
                    tracing::error!(sink.key = %sink.sink_key, "write record error: {err}");
                }
                SinkResult::failed(sink_id, &err)
            }
        };
        metrics::counter!("stream_sink_write_total", "status_code" => result.status_code.as_u16().to_string())
            .increment(1);
        result
    }

    /// Writes through the sink's current reference. A reference closed under
    /// the writer is replaced on the next lookup, so the record waits for the
    /// old pipeline to close and goes to the new one.
    async fn write_to_sink(&self, sink: &SinkData, record: &Record) -> Result<RecordStatus, PipelineError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            if self.closed.is_cancelled() {
                return Err(PipelineError::status(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "shutdown",
                    "the service is shutting down",
                ));
            }
            if let Some(written) = self.pipeline(sink).try_write_record(record).await {
                return written;
            }
        }
        Err(PipelineError::status(
            StatusCode::SERVICE_UNAVAILABLE,
            "pipelineClosed",
            format!("sink pipeline \"{}\" is closed", sink.sink_key),
        ))
    }

    /// Returns the open reference of the sink, registering a new one if there
    /// is none or the registered one is closing.
    fn pipeline(&self, sink: &SinkData) -> Arc<PipelineRef> {
        let mut table = self.lock_pipelines();
        let previous = match table.get(&sink.sink_key) {
            Some(existing) if !existing.is_closed() => return Arc::clone(existing),
            Some(existing) => Some(Arc::clone(existing)),
            None => None,
        };

        let pipeline = Arc::new_cyclic(|this: &Weak<PipelineRef>| {
            let pipeline = PipelineRef::new(
                sink.sink_key.clone(),
                sink.sink_type.clone(),
                Arc::clone(&self.opener),
                Arc::clone(&self.clock),
                unregister_fn(Arc::downgrade(&self.pipelines), sink.sink_key.clone(), this.clone()),
            );
            match &previous {
                Some(previous) => pipeline.after(previous),
                None => pipeline,
            }
        });
        table.insert(sink.sink_key.clone(), Arc::clone(&pipeline));
        pipeline
    }

    /// Closes pipelines whose sink is gone, disabled or modified in a way the
    /// pipeline cannot follow.
    fn close_stale_pipelines(&self, modified: &HashSet<SinkKey>) {
        let pipelines: Vec<_> = self.lock_pipelines().values().cloned().collect();
        for pipeline in pipelines {
            let key = pipeline.sink_key().clone();
            let sink = self.collection.sink(&key);
            let modified = modified.contains(&key);

            self.closing.spawn(async move {
                let reason = match sink {
                    None => "sink deleted",
                    Some(sink) if !sink.enabled => "sink updated",
                    Some(sink) if modified && sink.sink_type != pipeline.sink_type() => "sink updated",
                    Some(_) if modified && pipeline.reopen_on_sink_modification().await => "sink updated",
                    Some(_) => return,
                };
                pipeline.close(reason).await;
            });
        }
    }

    /// Stops the router: rejects new writes, stops the mirror, waits for
    /// in-flight dispatches and closes all pipelines.
    pub async fn shutdown(&self) {
        self.closed.cancel();

        self.mirror_cancel.cancel();
        self.mirror_tasks.close();
        self.mirror_tasks.wait().await;

        self.dispatches.close();
        self.dispatches.wait().await;

        let pipelines: Vec<_> = self.lock_pipelines().values().cloned().collect();
        for pipeline in pipelines {
            self.closing.spawn(async move { pipeline.close("shutdown").await });
        }
        self.closing.close();
        self.closing.wait().await;
        tracing::info!("sink router stopped");
    }
}

fn unregister_fn(table: Weak<PipelineTable>, key: SinkKey, this: Weak<PipelineRef>) -> UnregisterFn {
    Arc::new(move || {
        let Some(table) = table.upgrade() else {
            return;
        };
        let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
        // A newer reference of the same sink may already be registered.
        if table
            .get(&key)
            .is_some_and(|current| Weak::ptr_eq(&Arc::downgrade(current), &this))
        {
            table.remove(&key);
        }
    })
}

/// Applies a watch batch to the collection.
///
/// # Returns
/// Keys of sinks created or updated by the batch; all keys after a restart
fn apply_sink_changes(collection: &Collection, prefix: &str, response: WatchResponse) -> HashSet<SinkKey> {
    if response.restarted {
        collection.reset();
    }

    let mut modified = HashSet::new();
    for event in response.events {
        match event.kind {
            WatchEventKind::Delete => {
                let key = event.kv.key.strip_prefix(prefix).map(SinkKey::from_str);
                match key {
                    Some(Ok(key)) => collection.delete_sink(&key),
                    _ => tracing::warn!(key = %event.kv.key, "ignoring delete of unexpected sink key"),
                }
            }
            WatchEventKind::Create | WatchEventKind::Update => match decode::<Sink>(&event.kv) {
                Ok(sink) => {
                    modified.insert(sink.key.clone());
                    collection.add_sink(SinkData::from(&sink));
                }
                Err(err) => tracing::warn!(error = %err, "ignoring undecodable sink"),
            },
        }
    }
    modified
}
