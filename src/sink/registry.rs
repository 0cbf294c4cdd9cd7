//! Pipeline registry: resolves a sink type to the opener of its pipelines.
//!
//! Built-in types:
//! - `log` writes a line per record to the tracing log
//! - `file` appends records as NDJSON to `<dir>/<project>/<branch>/<source>/<sink>.ndjson`

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use axum::http::StatusCode;
use serde::Serialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::pipeline::{
    PipelineError, PipelineOpener, Record, RecordStatus, SinkPipeline, UnregisterFn,
};
use crate::definition::SinkKey;

pub const LOG_SINK_TYPE: &str = "log";
pub const FILE_SINK_TYPE: &str = "file";

/// Opens pipelines by sink type.
#[derive(Clone, Default)]
pub struct PipelineRegistry {
    openers: HashMap<String, Arc<dyn PipelineOpener>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `log` and `file` types.
    pub fn with_builtins(file_sink_dir: impl Into<PathBuf>) -> Self {
        let mut registry = Self::new();
        registry.register(LOG_SINK_TYPE, Arc::new(LogOpener));
        registry.register(
            FILE_SINK_TYPE,
            Arc::new(FileOpener {
                dir: file_sink_dir.into(),
            }),
        );
        registry
    }

    /// Registers or replaces the opener of `sink_type`.
    pub fn register(&mut self, sink_type: impl Into<String>, opener: Arc<dyn PipelineOpener>) {
        self.openers.insert(sink_type.into(), opener);
    }

    pub fn supports(&self, sink_type: &str) -> bool {
        self.openers.contains_key(sink_type)
    }

    pub fn sink_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.openers.keys().cloned().collect();
        types.sort();
        types
    }
}

#[async_trait]
impl PipelineOpener for PipelineRegistry {
    async fn open_sink_pipeline(
        &self,
        sink_key: &SinkKey,
        sink_type: &str,
        on_unregister: UnregisterFn,
    ) -> Result<Box<dyn SinkPipeline>, PipelineError> {
        let Some(opener) = self.openers.get(sink_type) else {
            return Err(PipelineError::status(
                StatusCode::BAD_REQUEST,
                "unsupportedSinkType",
                format!("sink type \"{sink_type}\" is not supported"),
            ));
        };
        opener
            .open_sink_pipeline(sink_key, sink_type, on_unregister)
            .await
    }
}

struct LogOpener;

#[async_trait]
impl PipelineOpener for LogOpener {
    async fn open_sink_pipeline(
        &self,
        sink_key: &SinkKey,
        _sink_type: &str,
        _on_unregister: UnregisterFn,
    ) -> Result<Box<dyn SinkPipeline>, PipelineError> {
        Ok(Box::new(LogPipeline {
            sink_key: sink_key.clone(),
        }))
    }
}

struct LogPipeline {
    sink_key: SinkKey,
}

#[async_trait]
impl SinkPipeline for LogPipeline {
    fn reopen_on_sink_modification(&self) -> bool {
        false
    }

    async fn write_record(&self, record: &Record) -> Result<RecordStatus, PipelineError> {
        tracing::info!(
            sink.key = %self.sink_key,
            body.length = record.body.len(),
            client.ip = ?record.client_ip,
            "received record"
        );
        Ok(RecordStatus::Processed)
    }

    async fn close(&self, _reason: &str) {}
}

struct FileOpener {
    dir: PathBuf,
}

impl FileOpener {
    fn path(&self, sink_key: &SinkKey) -> PathBuf {
        let source_key = &sink_key.source_key;
        self.dir
            .join(source_key.project_id().to_string())
            .join(source_key.branch_id().to_string())
            .join(source_key.source_id.as_str())
            .join(format!("{}.ndjson", sink_key.sink_id))
    }
}

#[async_trait]
impl PipelineOpener for FileOpener {
    async fn open_sink_pipeline(
        &self,
        sink_key: &SinkKey,
        _sink_type: &str,
        on_unregister: UnregisterFn,
    ) -> Result<Box<dyn SinkPipeline>, PipelineError> {
        let path = self.path(sink_key);
        let file = open_append(&path)
            .await
            .with_context(|| format!("cannot open file \"{}\"", path.display()))?;

        Ok(Box::new(FilePipeline {
            file: Mutex::new(Some(file)),
            on_unregister,
        }))
    }
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    OpenOptions::new().create(true).append(true).open(path).await
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileLine<'a> {
    received_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_ip: Option<String>,
    headers: HashMap<&'a str, &'a str>,
    body: std::borrow::Cow<'a, str>,
}

struct FilePipeline {
    file: Mutex<Option<File>>,
    on_unregister: UnregisterFn,
}

#[async_trait]
impl SinkPipeline for FilePipeline {
    fn reopen_on_sink_modification(&self) -> bool {
        true
    }

    async fn write_record(&self, record: &Record) -> Result<RecordStatus, PipelineError> {
        let line = FileLine {
            received_at: record.received_at.to_rfc3339(),
            client_ip: record.client_ip.map(|ip| ip.to_string()),
            headers: record
                .headers
                .iter()
                .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)))
                .collect(),
            body: String::from_utf8_lossy(&record.body),
        };
        let mut bytes = serde_json::to_vec(&line).context("cannot encode record")?;
        bytes.push(b'\n');

        let mut file = self.file.lock().await;
        let Some(handle) = file.as_mut() else {
            return Err(anyhow::anyhow!("file pipeline is closed").into());
        };

        if let Err(err) = handle.write_all(&bytes).await {
            // A broken handle is dropped; the next record opens a new pipeline.
            *file = None;
            (self.on_unregister)();
            return Err(anyhow::Error::new(err).context("cannot write record").into());
        }
        Ok(RecordStatus::Accepted)
    }

    async fn close(&self, reason: &str) {
        if let Some(mut handle) = self.file.lock().await.take()
            && let Err(err) = handle.flush().await
        {
            tracing::warn!(reason, error = %err, "cannot flush file sink");
        }
    }
}
