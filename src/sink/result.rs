//! Aggregated results of routing one record.
//!
//! Counters are accumulated first; `finalize` derives the status code, error
//! name and message once all children are known.

use axum::http::StatusCode;
use serde::{Serialize, Serializer};
use utoipa::ToSchema;

use super::pipeline::{PipelineError, RecordStatus};
use crate::definition::{BranchId, ProjectId, SinkId, SourceId, SourceKey};
use crate::error::{STREAM_IN_PREFIX, ServiceError, as_sentence};

const NO_ENABLED_SINK: &str = "No enabled sink found.";

fn serialize_status<S: Serializer>(status: &StatusCode, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u16(status.as_u16())
}

/// Result of the whole dispatch, over all matched sources.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourcesResult {
    #[serde(serialize_with = "serialize_status")]
    #[schema(value_type = u16)]
    pub status_code: StatusCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub message: String,
    #[serde(skip)]
    pub all_sinks: usize,
    #[serde(skip)]
    pub successful_sinks: usize,
    #[serde(skip)]
    pub failed_sinks: usize,
    pub sources: Vec<SourceResult>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceResult {
    pub project_id: ProjectId,
    pub source_id: SourceId,
    pub branch_id: BranchId,
    #[serde(serialize_with = "serialize_status")]
    #[schema(value_type = u16)]
    pub status_code: StatusCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub message: String,
    #[serde(skip)]
    pub all_sinks: usize,
    #[serde(skip)]
    pub successful_sinks: usize,
    #[serde(skip)]
    pub failed_sinks: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sinks: Vec<SinkResult>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SinkResult {
    pub sink_id: SinkId,
    #[serde(serialize_with = "serialize_status")]
    #[schema(value_type = u16)]
    pub status_code: StatusCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub message: String,
}

impl SinkResult {
    pub fn written(sink_id: SinkId, status: RecordStatus) -> Self {
        Self {
            sink_id,
            status_code: status.status_code(),
            error: None,
            message: status.message().to_string(),
        }
    }

    pub fn failed(sink_id: SinkId, err: &PipelineError) -> Self {
        Self {
            sink_id,
            status_code: err.status_code(),
            error: Some(err.error_name()),
            message: as_sentence(&err.to_string()),
        }
    }

    /// The sink task itself failed, e.g. panicked.
    pub fn internal(sink_id: SinkId) -> Self {
        Self {
            sink_id,
            status_code: StatusCode::INTERNAL_SERVER_ERROR,
            error: Some(format!("{STREAM_IN_PREFIX}genericError")),
            message: "Internal server error.".to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code.is_success()
    }
}

impl SourceResult {
    pub fn new(source_key: &SourceKey) -> Self {
        Self {
            project_id: source_key.project_id(),
            source_id: source_key.source_id.clone(),
            branch_id: source_key.branch_id(),
            status_code: StatusCode::OK,
            error: None,
            message: String::new(),
            all_sinks: 0,
            successful_sinks: 0,
            failed_sinks: 0,
            sinks: Vec::new(),
        }
    }

    /// The source task itself failed; counted as one failed sink.
    pub fn internal(source_key: &SourceKey) -> Self {
        let mut result = Self::new(source_key);
        result.all_sinks = 1;
        result.failed_sinks = 1;
        result.status_code = StatusCode::INTERNAL_SERVER_ERROR;
        result.error = Some(format!("{STREAM_IN_PREFIX}genericError"));
        result.message = "Internal server error.".to_string();
        result
    }

    pub fn add_sink(&mut self, sink: SinkResult) {
        self.all_sinks += 1;
        if sink.is_success() {
            self.successful_sinks += 1;
        } else {
            self.failed_sinks += 1;
        }
        self.status_code = self.status_code.max(sink.status_code);
        self.sinks.push(sink);
    }

    pub fn finalize(mut self) -> Self {
        self.sinks.sort_by(|a, b| a.sink_id.cmp(&b.sink_id));
        (self.error, self.message) = summary(self.all_sinks, self.successful_sinks, self.failed_sinks);
        self
    }
}

impl SourcesResult {
    pub fn new() -> Self {
        Self {
            status_code: StatusCode::OK,
            error: None,
            message: String::new(),
            all_sinks: 0,
            successful_sinks: 0,
            failed_sinks: 0,
            sources: Vec::new(),
        }
    }

    pub fn add_source(&mut self, source: SourceResult) {
        self.all_sinks += source.all_sinks;
        self.successful_sinks += source.successful_sinks;
        self.failed_sinks += source.failed_sinks;
        self.status_code = self.status_code.max(source.status_code);
        self.sources.push(source);
    }

    pub fn finalize(mut self) -> Self {
        self.sources.sort_by(|a, b| {
            a.branch_id
                .cmp(&b.branch_id)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        (self.error, self.message) = summary(self.all_sinks, self.successful_sinks, self.failed_sinks);
        self
    }
}

impl Default for SourcesResult {
    fn default() -> Self {
        Self::new()
    }
}

fn summary(all: usize, successful: usize, failed: usize) -> (Option<String>, String) {
    if all == 0 {
        (None, NO_ENABLED_SINK.to_string())
    } else if failed == 0 {
        (None, format!("Successfully written to {successful}/{all} sinks."))
    } else {
        (
            Some(format!("{STREAM_IN_PREFIX}writeFailed")),
            format!("Written to {successful}/{all} sinks."),
        )
    }
}
