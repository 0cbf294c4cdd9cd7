//! Sink pipeline interfaces.
//!
//! A pipeline is the write path of one sink. Pipelines are opened lazily by a
//! [`PipelineOpener`] on the first record routed to the sink.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::definition::SinkKey;
use crate::error::{STREAM_IN_PREFIX, ServiceError};

/// An ingested HTTP record.
#[derive(Debug, Clone)]
pub struct Record {
    pub received_at: DateTime<Utc>,
    pub client_ip: Option<IpAddr>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Outcome of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    /// The record was fully processed, 200.
    Processed,
    /// The record was accepted for later processing, 202.
    Accepted,
}

impl RecordStatus {
    pub fn status_code(self) -> StatusCode {
        match self {
            Self::Processed => StatusCode::OK,
            Self::Accepted => StatusCode::ACCEPTED,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Accepted => "accepted",
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// An error with a known HTTP status and name.
    #[error("{message}")]
    Status {
        status: StatusCode,
        name: String,
        message: String,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn status(status: StatusCode, name: &str, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            name: format!("{STREAM_IN_PREFIX}{name}"),
            message: message.into(),
        }
    }
}

impl ServiceError for PipelineError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Status { status, .. } => *status,
            Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_name(&self) -> String {
        match self {
            Self::Status { name, .. } => name.clone(),
            Self::Other(_) => format!("{STREAM_IN_PREFIX}genericError"),
        }
    }
}

/// Called by a pipeline that closed on its own; the router then forgets it.
pub type UnregisterFn = Arc<dyn Fn() + Send + Sync>;

#[async_trait]
pub trait SinkPipeline: Send + Sync {
    /// Whether a modification of the sink definition requires a new pipeline.
    fn reopen_on_sink_modification(&self) -> bool;

    async fn write_record(&self, record: &Record) -> Result<RecordStatus, PipelineError>;

    async fn close(&self, reason: &str);
}

#[async_trait]
pub trait PipelineOpener: Send + Sync {
    async fn open_sink_pipeline(
        &self,
        sink_key: &SinkKey,
        sink_type: &str,
        on_unregister: UnregisterFn,
    ) -> Result<Box<dyn SinkPipeline>, PipelineError>;
}
