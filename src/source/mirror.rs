//! In-memory mirror of active HTTP sources, used to resolve ingestion URLs.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use crate::definition::{ProjectId, Source, SourceId, SourceKey};
use crate::kv::{WatchEventKind, WatchResponse, atomic::decode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceData {
    pub source_key: SourceKey,
    pub enabled: bool,
    pub secret: String,
}

/// Active HTTP sources ordered by `<projectId>/<sourceId>/<branchId>`, so all
/// branches of one source are adjacent.
#[derive(Debug, Default)]
pub struct SourceMirror {
    sources: RwLock<BTreeMap<String, SourceData>>,
}

fn mirror_key(key: &SourceKey) -> String {
    format!("{}/{}/{}", key.project_id(), key.source_id, key.branch_id())
}

impl SourceMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sources with the given project and source id, one per branch.
    pub fn matching(&self, project_id: ProjectId, source_id: &SourceId) -> Vec<SourceData> {
        let prefix = format!("{project_id}/{source_id}/");
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(_, source)| source.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sources.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies a watch batch of active sources stored under `prefix`.
    pub fn apply(&self, prefix: &str, response: WatchResponse) {
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        if response.restarted {
            sources.clear();
        }

        for event in response.events {
            match event.kind {
                WatchEventKind::Delete => {
                    match event.kv.key.strip_prefix(prefix).map(SourceKey::from_str) {
                        Some(Ok(key)) => {
                            sources.remove(&mirror_key(&key));
                        }
                        _ => tracing::warn!(key = %event.kv.key, "ignoring delete of unexpected source key"),
                    }
                }
                WatchEventKind::Create | WatchEventKind::Update => match decode::<Source>(&event.kv) {
                    Ok(source) => {
                        let key = mirror_key(&source.key);
                        match source.http {
                            Some(http) => {
                                sources.insert(
                                    key,
                                    SourceData {
                                        enabled: source.switch.enabled(),
                                        source_key: source.key,
                                        secret: http.secret,
                                    },
                                );
                            }
                            None => {
                                sources.remove(&key);
                            }
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "ignoring undecodable source"),
                },
            }
        }
    }
}
