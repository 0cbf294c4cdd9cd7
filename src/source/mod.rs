//! Source side of the ingestion path: HTTP source mirror and dispatcher.

pub mod dispatcher;
pub mod mirror;

pub use dispatcher::{DispatchError, Dispatcher};
pub use mirror::{SourceData, SourceMirror};
