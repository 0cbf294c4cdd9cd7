//! Sink side of the ingestion path: pipelines, their registry and the router.

pub mod backoff;
pub mod collection;
pub mod pipeline;
pub mod pipeline_ref;
pub mod registry;
pub mod result;
pub mod router;

pub use pipeline::{PipelineError, PipelineOpener, Record, RecordStatus, SinkPipeline, UnregisterFn};
pub use registry::PipelineRegistry;
pub use result::{SinkResult, SourceResult, SourcesResult};
pub use router::Router;
