//! Resolves `(projectId, sourceId, secret)` to sources and hands the record
//! to the router.

use std::sync::Arc;

use axum::http::StatusCode;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::mirror::SourceMirror;
use crate::definition::{ProjectId, Source, SourceId};
use crate::error::{ApiError, STREAM_IN_PREFIX, ServiceError};
use crate::kv::{KvError, KvStore, watch::spawn_watch};
use crate::repositories::EntityStore;
use crate::sink::{Record, Router, SourcesResult};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("the service is shutting down")]
    Shutdown,
    #[error("the specified combination of projectID, sourceID and secret was not found")]
    NoSourceFound,
    #[error("the specified source is disabled in all branches")]
    SourceDisabled,
}

impl ServiceError for DispatchError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            Self::NoSourceFound | Self::SourceDisabled => StatusCode::NOT_FOUND,
        }
    }

    fn error_name(&self) -> String {
        let name = match self {
            Self::Shutdown => "shutdown",
            Self::NoSourceFound => "noSourceFound",
            Self::SourceDisabled => "disabledSource",
        };
        format!("{STREAM_IN_PREFIX}{name}")
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        ApiError::from_service_error(&err)
    }
}

pub struct Dispatcher {
    sources: Arc<SourceMirror>,
    router: Arc<Router>,
    closed: CancellationToken,
    mirror_cancel: CancellationToken,
    mirror_tasks: TaskTracker,
    requests: TaskTracker,
}

impl Dispatcher {
    /// Starts mirroring HTTP sources; returns once the initial snapshot is loaded.
    pub async fn start(kv: Arc<dyn KvStore>, router: Arc<Router>) -> Result<Arc<Self>, KvError> {
        let dispatcher = Arc::new(Self {
            sources: Arc::new(SourceMirror::new()),
            router,
            closed: CancellationToken::new(),
            mirror_cancel: CancellationToken::new(),
            mirror_tasks: TaskTracker::new(),
            requests: TaskTracker::new(),
        });

        let root = EntityStore::<Source>::active_root();
        let sources = Arc::clone(&dispatcher.sources);
        let prefix = root.clone();
        spawn_watch(
            kv,
            &root,
            dispatcher.mirror_cancel.clone(),
            &dispatcher.mirror_tasks,
            move |response| sources.apply(&prefix, response),
        )
        .await?;

        tracing::info!(sources = dispatcher.sources.len(), "source dispatcher started");
        Ok(dispatcher)
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub async fn dispatch(
        &self,
        project_id: ProjectId,
        source_id: &SourceId,
        secret: &str,
        record: Record,
    ) -> Result<SourcesResult, DispatchError> {
        // Taken before the check so shutdown waits for this call.
        let _request = self.requests.token();
        if self.closed.is_cancelled() {
            return Err(DispatchError::Shutdown);
        }

        let matched: Vec<_> = self
            .sources
            .matching(project_id, source_id)
            .into_iter()
            .filter(|source| bool::from(source.secret.as_bytes().ct_eq(secret.as_bytes())))
            .collect();
        if matched.is_empty() {
            return Err(DispatchError::NoSourceFound);
        }

        let enabled: Vec<_> = matched
            .into_iter()
            .filter(|source| source.enabled)
            .map(|source| source.source_key)
            .collect();
        if enabled.is_empty() {
            return Err(DispatchError::SourceDisabled);
        }

        Ok(self.router.dispatch_to_sources(enabled, Arc::new(record)).await)
    }

    /// Rejects new calls, stops the mirror and waits for in-flight calls.
    /// The router is shut down separately, after the dispatcher.
    pub async fn shutdown(&self) {
        self.closed.cancel();

        self.mirror_cancel.cancel();
        self.mirror_tasks.close();
        self.mirror_tasks.wait().await;

        self.requests.close();
        self.requests.wait().await;
        tracing::info!("source dispatcher stopped");
    }
}
